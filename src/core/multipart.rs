//! 分片上传会话
//!
//! 一个会话对应一次分片上传：申请 upload id，接受乱序写入的分片，关闭时先向
//! 后端核对已持久化的分片数量，数量一致才按分片编号升序提交清单，否则中止上传。

use super::chunk::MAX_PART_NUMBER;
use crate::error::StorageError;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// 已上传分片记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartRecord {
    pub part_number: u32,
    pub etag: String,
}

/// 分片上传协议（由对象存储后端实现）
#[async_trait]
pub trait MultipartBackend: Send + Sync {
    /// 创建分片上传，返回 upload id
    async fn create_upload(&self, path: &str) -> Result<String>;

    /// 上传一个分片，返回完整性标签（ETag）
    async fn upload_part(
        &self,
        path: &str,
        upload_id: &str,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<String>;

    /// 列出服务端已持久化的分片编号
    async fn list_parts(&self, path: &str, upload_id: &str) -> Result<Vec<u32>>;

    /// 按清单合并分片
    async fn complete_upload(&self, path: &str, upload_id: &str, parts: &[PartRecord])
        -> Result<()>;

    /// 中止上传并释放已上传的分片
    async fn abort_upload(&self, path: &str, upload_id: &str) -> Result<()>;
}

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opened,
    Writing,
    Completing,
    Aborting,
    Closed,
}

#[derive(Debug, Default)]
struct Parts {
    /// 下一个自动分配的分片编号
    next_number: u32,
    /// 已提交的分片编号（提交时即记录，无论后端是否成功）
    submitted: BTreeSet<u32>,
    /// 后端返回了 ETag 的分片，按编号有序
    records: BTreeMap<u32, String>,
}

/// 分片上传会话
pub struct MultipartSession {
    backend: Arc<dyn MultipartBackend>,
    path: String,
    upload_id: String,
    parts: Mutex<Parts>,
    state: Mutex<SessionState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MultipartSession {
    /// 向后端申请 upload id
    pub async fn open(backend: Arc<dyn MultipartBackend>, path: &str) -> Result<Self> {
        let upload_id = backend.create_upload(path).await?;
        debug!("创建分片上传: {} (upload_id={})", path, upload_id);

        Ok(Self {
            backend,
            path: path.to_string(),
            upload_id,
            parts: Mutex::new(Parts::default()),
            state: Mutex::new(SessionState::Opened),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// 已提交的分片数量
    pub fn submitted(&self) -> u32 {
        lock(&self.parts).submitted.len() as u32
    }

    /// 写入一个分片
    ///
    /// 未指定编号时从 1 开始顺序分配；指定的编号必须在 `[1, 10000]` 内。
    /// 多个任务可以并发写入，最终顺序只由分片编号决定。
    pub async fn write(&self, data: Vec<u8>, part_number: Option<u32>) -> Result<u32> {
        {
            let mut state = lock(&self.state);
            match *state {
                SessionState::Opened | SessionState::Writing => *state = SessionState::Writing,
                _ => return Err(StorageError::InvalidState("会话已关闭，不能继续写入").into()),
            }
        }

        let number = {
            let mut parts = lock(&self.parts);
            let number = match part_number {
                None => {
                    parts.next_number += 1;
                    parts.next_number
                }
                Some(n) if (1..=MAX_PART_NUMBER).contains(&n) => n,
                Some(n) => return Err(StorageError::InvalidPartNumber(n).into()),
            };
            parts.submitted.insert(number);
            number
        };

        let etag = self
            .backend
            .upload_part(&self.path, &self.upload_id, number, data)
            .await?;

        lock(&self.parts).records.insert(number, etag);
        Ok(number)
    }

    /// 核对分片数量后提交，数量不一致则中止
    pub async fn close(&self) -> Result<()> {
        {
            let state = lock(&self.state);
            if matches!(
                *state,
                SessionState::Completing | SessionState::Aborting | SessionState::Closed
            ) {
                return Err(StorageError::InvalidState("会话已关闭").into());
            }
        }

        let acknowledged = match self.backend.list_parts(&self.path, &self.upload_id).await {
            Ok(parts) => parts.len() as u32,
            Err(e) => {
                self.abort_quietly().await;
                return Err(e);
            }
        };

        let (submitted, manifest) = {
            let parts = lock(&self.parts);
            let manifest: Vec<PartRecord> = parts
                .records
                .iter()
                .map(|(number, etag)| PartRecord {
                    part_number: *number,
                    etag: etag.clone(),
                })
                .collect();
            (parts.submitted.len() as u32, manifest)
        };

        if submitted > 0 && acknowledged == submitted && manifest.len() as u32 == submitted {
            self.set_state(SessionState::Completing);
            match self
                .backend
                .complete_upload(&self.path, &self.upload_id, &manifest)
                .await
            {
                Ok(()) => {
                    self.set_state(SessionState::Closed);
                    debug!("分片上传完成: {} ({} 个分片)", self.path, submitted);
                    Ok(())
                }
                Err(e) => {
                    self.abort_quietly().await;
                    Err(e)
                }
            }
        } else {
            let loss = loss_percent(submitted, acknowledged);
            warn!(
                "分片数量不一致，中止上传: {} (提交 {}, 确认 {}, 丢失 {}%)",
                self.path, submitted, acknowledged, loss
            );
            self.set_state(SessionState::Aborting);
            let aborted = self.backend.abort_upload(&self.path, &self.upload_id).await;
            self.set_state(SessionState::Closed);
            aborted?;
            Err(StorageError::Aborted {
                submitted,
                acknowledged,
                loss,
            }
            .into())
        }
    }

    /// 中止上传，重复调用无副作用
    pub async fn abort(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if *state == SessionState::Closed {
                return Ok(());
            }
            *state = SessionState::Aborting;
        }
        let result = self.backend.abort_upload(&self.path, &self.upload_id).await;
        self.set_state(SessionState::Closed);
        debug!("已中止分片上传: {} (upload_id={})", self.path, self.upload_id);
        result
    }

    async fn abort_quietly(&self) {
        if let Err(e) = self.abort().await {
            warn!("中止分片上传失败: {} - {}", self.path, e);
        }
    }

    fn set_state(&self, state: SessionState) {
        *lock(&self.state) = state;
    }
}

impl Drop for MultipartSession {
    fn drop(&mut self) {
        let state = *lock(&self.state);
        if state == SessionState::Closed {
            return;
        }

        // 取消或提前返回时会话未关闭，在后台中止，避免遗留未完成的上传
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let backend = self.backend.clone();
                let path = std::mem::take(&mut self.path);
                let upload_id = std::mem::take(&mut self.upload_id);
                handle.spawn(async move {
                    match backend.abort_upload(&path, &upload_id).await {
                        Ok(()) => debug!("已在后台中止未关闭的分片上传: {}", path),
                        Err(e) => warn!("后台中止分片上传失败: {} - {}", path, e),
                    }
                });
            }
            Err(_) => warn!(
                "分片上传会话未关闭且没有可用的运行时: {} (upload_id={})",
                self.path, self.upload_id
            ),
        }
    }
}

/// 丢失分片百分比（向下取整）
pub fn loss_percent(submitted: u32, acknowledged: u32) -> u32 {
    if submitted == 0 {
        return 0;
    }
    (u64::from(submitted.saturating_sub(acknowledged)) * 100 / u64::from(submitted)) as u32
}
