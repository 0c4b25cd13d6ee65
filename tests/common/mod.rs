#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bucketsync_lib::core::{MultipartBackend, MultipartSession, PartRecord};
use bucketsync_lib::storage::{Entry, MemoryStorage, ReadStream, Storage, WriteStream};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 包装 MemoryStorage，可以注入故障并记录调用情况
#[derive(Default)]
pub struct FaultyStorage {
    pub inner: MemoryStorage,
    /// 写入这些路径总是失败
    pub failing: HashSet<String>,
    /// 分片上传时服务端静默丢弃的分片编号
    pub lost_part: Option<u32>,
    /// 每次打开写入前等待，用来观察并发数
    pub open_delay: Duration,
    attempts: Mutex<HashMap<String, usize>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    completions: Arc<AtomicUsize>,
}

impl FaultyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, path: &str) -> Self {
        self.failing.insert(path.to_string());
        self
    }

    pub fn losing_part(mut self, part_number: u32) -> Self {
        self.lost_part = Some(part_number);
        self
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// 目标路径被尝试写入的次数
    pub fn attempts(&self, path: &str) -> usize {
        self.attempts.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// 分片上传成功提交的次数
    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    fn record_attempt(&self, path: &str) {
        *self.attempts.lock().unwrap().entry(path.to_string()).or_default() += 1;
    }
}

#[async_trait]
impl Storage for FaultyStorage {
    async fn scan(&self, path: &str, recursive: bool) -> Result<Vec<Entry>> {
        self.inner.scan(path, recursive).await
    }

    async fn stat(&self, path: &str) -> Result<Option<Entry>> {
        self.inner.stat(path).await
    }

    async fn open_read(&self, path: &str, offset: u64) -> Result<Box<dyn ReadStream>> {
        self.inner.open_read(path, offset).await
    }

    async fn open_write(&self, path: &str) -> Result<Box<dyn WriteStream>> {
        self.record_attempt(path);

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.open_delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(path) {
            return Err(anyhow!("injected write failure: {}", path));
        }
        self.inner.open_write(path).await
    }

    async fn open_multipart(&self, path: &str) -> Result<MultipartSession> {
        self.record_attempt(path);
        let backend = TrackingBackend {
            inner: self.inner.clone(),
            lost_part: self.lost_part,
            completions: self.completions.clone(),
        };
        MultipartSession::open(Arc::new(backend), path).await
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        self.inner.create_dir(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.inner.delete(path).await
    }

    fn name(&self) -> &str {
        "faulty"
    }
}

/// 记录提交次数，可以模拟服务端丢失分片
struct TrackingBackend {
    inner: MemoryStorage,
    lost_part: Option<u32>,
    completions: Arc<AtomicUsize>,
}

#[async_trait]
impl MultipartBackend for TrackingBackend {
    async fn create_upload(&self, path: &str) -> Result<String> {
        self.inner.create_upload(path).await
    }

    async fn upload_part(
        &self,
        path: &str,
        upload_id: &str,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<String> {
        if self.lost_part == Some(part_number) {
            // 返回成功但服务端没有保存
            return Ok(format!("lost-{}", part_number));
        }
        self.inner
            .upload_part(path, upload_id, part_number, data)
            .await
    }

    async fn list_parts(&self, path: &str, upload_id: &str) -> Result<Vec<u32>> {
        self.inner.list_parts(path, upload_id).await
    }

    async fn complete_upload(
        &self,
        path: &str,
        upload_id: &str,
        parts: &[PartRecord],
    ) -> Result<()> {
        self.inner.complete_upload(path, upload_id, parts).await?;
        self.completions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn abort_upload(&self, path: &str, upload_id: &str) -> Result<()> {
        self.inner.abort_upload(path, upload_id).await
    }
}

/// 在目录下写入文件，自动创建父目录
pub fn write_file(root: &std::path::Path, relative: &str, data: &[u8]) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, data).unwrap();
}

/// 统一分隔符后的路径字符串
pub fn slash(path: &std::path::Path) -> String {
    path.to_str().unwrap().replace('\\', "/")
}
