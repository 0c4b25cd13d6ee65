//! 传输统计与进度上报

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 进度上报间隔
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// 进度快照
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferProgress {
    pub files_completed: u64,
    pub files_failed: u64,
    pub files_total: u64,
    pub bytes_completed: u64,
    pub bytes_total: u64,
    /// 字节/秒
    pub speed: u64,
    /// 预计剩余秒数
    pub eta: u64,
}

/// 一次传输调用的统计，由所有 worker 共享
#[derive(Debug, Default)]
pub struct TransferStats {
    pub files_completed: AtomicU64,
    pub files_failed: AtomicU64,
    pub bytes_completed: AtomicU64,
    failures: RwLock<Vec<String>>,
}

impl TransferStats {
    /// 为单个任务创建字节计数器
    pub fn job(self: &Arc<Self>, size: u64) -> JobProgress {
        JobProgress {
            stats: self.clone(),
            size,
            credited: AtomicU64::new(0),
        }
    }

    /// 记录失败的源路径
    pub async fn record_failure(&self, path: String) {
        self.files_failed.fetch_add(1, Ordering::Relaxed);
        self.failures.write().await.push(path);
    }

    /// 按路径排序的失败列表
    pub async fn failures(&self) -> Vec<String> {
        let mut failures = self.failures.read().await.clone();
        failures.sort();
        failures
    }

    pub fn snapshot(&self, files_total: u64, bytes_total: u64) -> TransferProgress {
        TransferProgress {
            files_completed: self.files_completed.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            files_total,
            bytes_completed: self.bytes_completed.load(Ordering::Relaxed),
            bytes_total,
            speed: 0,
            eta: 0,
        }
    }
}

/// 单个任务的字节计数
///
/// 累计值不超过任务声明的大小，重试时重复发送的字节不会重复计数。
pub struct JobProgress {
    stats: Arc<TransferStats>,
    size: u64,
    credited: AtomicU64,
}

impl JobProgress {
    pub fn add_bytes(&self, bytes: u64) {
        let size = self.size;
        let previous = self
            .credited
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                Some(c.saturating_add(bytes).min(size))
            })
            .unwrap_or_else(|c| c);
        let added = previous.saturating_add(bytes).min(size) - previous;
        if added > 0 {
            self.stats.bytes_completed.fetch_add(added, Ordering::Relaxed);
        }
    }

    /// 任务结束（无论成功与否）：补齐字节数并计入一个文件
    pub fn finish(&self) {
        let previous = self.credited.swap(self.size, Ordering::SeqCst);
        let remaining = self.size.saturating_sub(previous);
        if remaining > 0 {
            self.stats
                .bytes_completed
                .fetch_add(remaining, Ordering::Relaxed);
        }
        self.stats.files_completed.fetch_add(1, Ordering::Relaxed);
    }
}

/// 定时把进度快照发送到通道
pub struct ProgressReporter {
    stats: Arc<TransferStats>,
    files_total: u64,
    bytes_total: u64,
    tx: Option<mpsc::Sender<TransferProgress>>,
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    pub fn spawn(
        stats: Arc<TransferStats>,
        files_total: u64,
        bytes_total: u64,
        tx: Option<mpsc::Sender<TransferProgress>>,
    ) -> Self {
        let stop = CancellationToken::new();

        let handle = tx.clone().map(|tx| {
            let stats = stats.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                let mut last_bytes = 0u64;
                let mut last_time = Instant::now();

                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(PROGRESS_INTERVAL) => {}
                    }

                    let mut progress = stats.snapshot(files_total, bytes_total);

                    // 计算速度
                    let now = Instant::now();
                    let elapsed = now.duration_since(last_time).as_secs_f64();
                    progress.speed = if elapsed > 0.0 {
                        (progress.bytes_completed.saturating_sub(last_bytes) as f64 / elapsed)
                            as u64
                    } else {
                        0
                    };
                    last_bytes = progress.bytes_completed;
                    last_time = now;

                    // 计算 ETA
                    let remaining_bytes = bytes_total.saturating_sub(progress.bytes_completed);
                    progress.eta = if progress.speed > 0 {
                        remaining_bytes / progress.speed
                    } else {
                        0
                    };

                    // 接收方处理不过来时丢弃本次快照
                    if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(progress) {
                        debug!("进度接收方已关闭");
                        break;
                    }
                }
            })
        });

        Self {
            stats,
            files_total,
            bytes_total,
            tx,
            stop,
            handle,
        }
    }

    /// 停止定时上报并发送最终快照
    pub async fn finish(mut self) -> TransferProgress {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }

        let progress = self.stats.snapshot(self.files_total, self.bytes_total);
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(progress.clone());
        }
        progress
    }
}
