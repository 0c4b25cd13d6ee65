//! 传输引擎
//!
//! 扫描源目录，把文件映射为传输任务，小文件整体流式复制，大文件走分片上传。
//! 每个任务按配置重试，重试耗尽的源路径汇总为失败列表返回。

use super::chunk::ChunkPlan;
use super::path;
use super::progress::{JobProgress, ProgressReporter, TransferProgress, TransferStats};
use crate::config::TransferOptions;
use crate::error::{is_cancelled, StorageError};
use crate::storage::Storage;
use anyhow::{bail, Result};
use futures::stream::{self, TryStreamExt};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 单个文件的传输任务
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    pub source_path: String,
    pub destination_path: String,
    pub size: u64,
}

/// 传输报告
#[derive(Debug, Clone, Serialize)]
pub struct TransferReport {
    /// 重试耗尽的源路径，按路径排序
    pub failed: Vec<String>,
    pub files_completed: u64,
    pub files_total: u64,
    pub bytes_completed: u64,
    pub bytes_total: u64,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyMode {
    /// 单个流整体复制
    Stream,
    /// 分片上传
    Multipart,
}

/// 传输引擎
pub struct TransferEngine {
    local: Arc<dyn Storage>,
    remote: Arc<dyn Storage>,
    /// 当前运行使用的取消令牌，被取消的令牌在运行结束后替换
    cancel: Mutex<CancellationToken>,
    progress_tx: Option<mpsc::Sender<TransferProgress>>,
}

impl TransferEngine {
    pub fn new(local: Arc<dyn Storage>, remote: Arc<dyn Storage>) -> Self {
        Self {
            local,
            remote,
            cancel: Mutex::new(CancellationToken::new()),
            progress_tx: None,
        }
    }

    /// 进度快照发送到给定通道
    pub fn with_progress(mut self, tx: mpsc::Sender<TransferProgress>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    /// 当前（或下一次）运行的取消令牌
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 取消传输
    pub fn cancel(&self) {
        self.cancel_token().cancel();
    }

    /// 运行结束后换上新令牌，引擎可以继续使用
    fn reset_cancel(&self, used: &CancellationToken) {
        if used.is_cancelled() {
            let mut current = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
            if current.is_cancelled() {
                *current = CancellationToken::new();
            }
        }
    }

    /// 上传本地目录，返回失败的源路径
    pub async fn upload(
        &self,
        local_root: &str,
        remote_root: &str,
        options: &TransferOptions,
    ) -> Result<Vec<String>> {
        Ok(self
            .upload_with_report(local_root, remote_root, options)
            .await?
            .failed)
    }

    /// 下载远程目录，返回失败的源路径
    pub async fn download(
        &self,
        remote_root: &str,
        local_root: &str,
        options: &TransferOptions,
    ) -> Result<Vec<String>> {
        Ok(self
            .download_with_report(remote_root, local_root, options)
            .await?
            .failed)
    }

    pub async fn upload_with_report(
        &self,
        local_root: &str,
        remote_root: &str,
        options: &TransferOptions,
    ) -> Result<TransferReport> {
        self.run(Direction::Upload, local_root, remote_root, options)
            .await
    }

    pub async fn download_with_report(
        &self,
        remote_root: &str,
        local_root: &str,
        options: &TransferOptions,
    ) -> Result<TransferReport> {
        self.run(Direction::Download, remote_root, local_root, options)
            .await
    }

    async fn run(
        &self,
        direction: Direction,
        source_root: &str,
        dest_root: &str,
        options: &TransferOptions,
    ) -> Result<TransferReport> {
        options.validate()?;
        let cancel = self.cancel_token();
        let result = self
            .run_with(direction, source_root, dest_root, options, &cancel)
            .await;
        self.reset_cancel(&cancel);
        result
    }

    async fn run_with(
        &self,
        direction: Direction,
        source_root: &str,
        dest_root: &str,
        options: &TransferOptions,
        cancel: &CancellationToken,
    ) -> Result<TransferReport> {
        let start = Instant::now();

        let (source, dest) = match direction {
            Direction::Upload => (self.local.clone(), self.remote.clone()),
            Direction::Download => (self.remote.clone(), self.local.clone()),
        };
        let source_root = path::normalize(source_root);
        let dest_root = path::normalize(dest_root);

        info!(
            "开始{}: {} ({}) -> {} ({})",
            match direction {
                Direction::Upload => "上传",
                Direction::Download => "下载",
            },
            source_root,
            source.name(),
            dest_root,
            dest.name()
        );

        let jobs = plan_jobs(source.as_ref(), &source_root, &dest_root).await?;

        // 按大小分为两组
        let (small, large): (Vec<_>, Vec<_>) = if direction == Direction::Upload
            && options.use_multipart
        {
            jobs.into_iter()
                .partition(|job| job.size <= options.large_file_threshold)
        } else {
            (jobs, Vec::new())
        };

        let files_total = (small.len() + large.len()) as u64;
        let bytes_total: u64 = small.iter().chain(large.iter()).map(|j| j.size).sum();
        debug!(
            "扫描完成: {} 个文件 ({} 个小文件, {} 个大文件), 共 {} 字节",
            files_total,
            small.len(),
            large.len(),
            bytes_total
        );

        let stats = Arc::new(TransferStats::default());
        let reporter = ProgressReporter::spawn(
            stats.clone(),
            files_total,
            bytes_total,
            self.progress_tx.clone(),
        );

        let ctx = JobContext {
            source,
            dest,
            options: Arc::new(options.clone()),
            stats: stats.clone(),
            cancel: cancel.clone(),
            create_parents: direction == Direction::Download,
        };

        execute_parallel(&ctx, small).await;

        // 大文件逐个处理，并发限制作用在分片上
        for job in large {
            if cancel.is_cancelled() {
                break;
            }
            ctx.execute(&job, CopyMode::Multipart).await;
        }

        let last = reporter.finish().await;
        let failed = stats.failures().await;

        info!(
            "传输完成: 成功 {}, 失败 {}, {} 字节, 耗时 {:.1}s{}",
            last.files_completed.saturating_sub(last.files_failed),
            failed.len(),
            last.bytes_completed,
            start.elapsed().as_secs_f64(),
            if cancel.is_cancelled() {
                " (已取消)"
            } else {
                ""
            }
        );

        Ok(TransferReport {
            failed,
            files_completed: last.files_completed,
            files_total,
            bytes_completed: last.bytes_completed,
            bytes_total,
            duration: start.elapsed(),
        })
    }
}

/// 并行执行任务，最多 `worker_count` 个同时进行
async fn execute_parallel(ctx: &JobContext, jobs: Vec<TransferJob>) {
    let semaphore = Arc::new(Semaphore::new(ctx.options.worker_count));
    let mut handles = Vec::new();

    for job in jobs {
        // 线程池满时在这里等待，取消后不再提交新任务
        let permit = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let ctx = ctx.clone();
        let handle = tokio::spawn(async move {
            ctx.execute(&job, CopyMode::Stream).await;
            drop(permit);
        });
        handles.push(handle);
    }

    // 等待所有任务完成
    for handle in handles {
        if let Err(e) = handle.await {
            error!("传输任务异常退出: {}", e);
        }
    }
}

/// 扫描源目录并生成任务；目录和大小未知的条目不传输
async fn plan_jobs(
    source: &dyn Storage,
    source_root: &str,
    dest_root: &str,
) -> Result<Vec<TransferJob>> {
    let entries = source.scan(source_root, true).await?;

    Ok(entries
        .into_iter()
        .filter(|entry| entry.is_file())
        .filter_map(|entry| {
            let size = entry.size?;
            Some(TransferJob {
                destination_path: path::retarget(&entry.path, source_root, dest_root),
                source_path: entry.path,
                size,
            })
        })
        .collect())
}

/// worker 执行任务所需的共享状态
#[derive(Clone)]
struct JobContext {
    source: Arc<dyn Storage>,
    dest: Arc<dyn Storage>,
    options: Arc<TransferOptions>,
    stats: Arc<TransferStats>,
    cancel: CancellationToken,
    /// 下载到本地时需要先创建父目录
    create_parents: bool,
}

impl JobContext {
    /// 带重试地执行一个任务，重试耗尽时记入失败列表
    async fn execute(&self, job: &TransferJob, mode: CopyMode) {
        let progress = self.stats.job(job.size);
        let attempts = self.options.retry_count;

        for attempt in 1..=attempts {
            // 取消时丢弃正在进行的尝试，未关闭的分片上传会被中止
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(StorageError::Cancelled.into()),
                result = self.attempt(job, mode, &progress) => result,
            };

            match result {
                Ok(()) => {
                    debug!(
                        "传输成功: {} -> {} ({} 字节)",
                        job.source_path, job.destination_path, job.size
                    );
                    progress.finish();
                    return;
                }
                Err(e) if is_cancelled(&e) => {
                    warn!("传输已取消: {}", job.source_path);
                    break;
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        "传输失败，{:?} 后重试 ({}/{}): {} - {:#}",
                        self.options.retry_delay, attempt, attempts, job.source_path, e
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.options.retry_delay) => {}
                    }
                }
                Err(e) => {
                    error!(
                        "传输最终失败 (共尝试 {} 次): {} - {:#}",
                        attempts, job.source_path, e
                    );
                }
            }
        }

        self.stats.record_failure(job.source_path.clone()).await;
        progress.finish();
    }

    async fn attempt(&self, job: &TransferJob, mode: CopyMode, progress: &JobProgress) -> Result<()> {
        if self.create_parents {
            let parent = path::parent(&job.destination_path);
            if !parent.is_empty() {
                self.dest.create_dir(parent).await?;
            }
        }

        match mode {
            CopyMode::Stream => self.copy_stream(job, progress).await,
            CopyMode::Multipart => self.copy_multipart(job, progress).await,
        }
    }

    /// 按 `chunk_size` 读取并写入单个流
    async fn copy_stream(&self, job: &TransferJob, progress: &JobProgress) -> Result<()> {
        let buffer_size = usize::try_from(self.options.chunk_size).unwrap_or(usize::MAX);
        let mut reader = self.source.open_read(&job.source_path, 0).await?;
        let mut writer = self.dest.open_write(&job.destination_path).await?;

        loop {
            let data = reader.read(buffer_size).await?;
            if data.is_empty() {
                break;
            }
            let length = data.len() as u64;
            writer.write(data).await?;
            progress.add_bytes(length);
        }

        writer.close().await
    }

    /// 分片上传，同一文件最多 `worker_count` 个分片同时传输
    async fn copy_multipart(&self, job: &TransferJob, progress: &JobProgress) -> Result<()> {
        let plan = ChunkPlan::new(job.size, self.options.chunk_size, self.options.max_chunks);
        let session = self.dest.open_multipart(&job.destination_path).await?;
        debug!(
            "分片上传: {} ({} 个分片, 每片 {} 字节)",
            job.destination_path, plan.chunk_count, plan.chunk_size
        );

        let session_ref = &session;
        let written = stream::iter(plan.parts().map(Ok::<u32, anyhow::Error>))
            .try_for_each_concurrent(self.options.worker_count, move |part| async move {
                let (offset, length) = plan.range(part);
                let data = self
                    .source
                    .read_range(&job.source_path, offset, length)
                    .await?;
                if data.len() as u64 != length {
                    bail!(
                        "分片 {} 读取长度不符: 期望 {} 字节, 实际 {} 字节",
                        part,
                        length,
                        data.len()
                    );
                }
                session_ref.write(data, Some(part)).await?;
                progress.add_bytes(length);
                Ok(())
            })
            .await;

        if let Err(e) = written {
            if let Err(abort_err) = session.abort().await {
                warn!(
                    "中止分片上传失败: {} (upload_id={}) - {}",
                    session.path(),
                    session.upload_id(),
                    abort_err
                );
            }
            return Err(e);
        }

        session.close().await
    }
}
