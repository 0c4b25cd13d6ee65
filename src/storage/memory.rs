//! 内存对象存储
//!
//! 行为与对象存储一致：路径为 `bucket/key`，目录由键前缀推导，支持分片上传。
//! 主要用于测试和演练，不需要网络。

use super::{Entry, ReadStream, Storage, WriteStream};
use crate::core::multipart::{MultipartBackend, MultipartSession, PartRecord};
use crate::error::StorageError;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone)]
struct Object {
    data: Arc<Vec<u8>>,
    modified_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PendingUpload {
    path: String,
    parts: BTreeMap<u32, (String, Vec<u8>)>,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<String, Object>,
    /// 显式创建的目录
    dirs: BTreeSet<String>,
    uploads: HashMap<String, PendingUpload>,
}

/// 内存存储，克隆后共享同一份数据
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<Inner>>,
}

fn key_of(path: &str) -> String {
    path.trim_matches('/').to_string()
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 直接写入一个对象
    pub fn put(&self, path: &str, data: impl Into<Vec<u8>>) {
        self.inner().objects.insert(
            key_of(path),
            Object {
                data: Arc::new(data.into()),
                modified_at: Utc::now(),
            },
        );
    }

    /// 读取对象内容
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.inner()
            .objects
            .get(&key_of(path))
            .map(|o| o.data.as_ref().clone())
    }

    /// 所有对象的路径
    pub fn keys(&self) -> Vec<String> {
        self.inner().objects.keys().cloned().collect()
    }

    /// 尚未完成或中止的分片上传数量
    pub fn pending_uploads(&self) -> usize {
        self.inner().uploads.len()
    }

    fn is_dir(inner: &Inner, key: &str) -> bool {
        if key.is_empty() {
            return true;
        }
        let prefix = format!("{}/", key);
        inner.dirs.contains(key)
            || inner.dirs.iter().any(|d| d.starts_with(&prefix))
            || inner.objects.keys().any(|k| k.starts_with(&prefix))
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn scan(&self, path: &str, recursive: bool) -> Result<Vec<Entry>> {
        let key = key_of(path);
        let inner = self.inner();

        if let Some(object) = inner.objects.get(&key) {
            return Ok(vec![Entry::file(
                key,
                object.data.len() as u64,
                Some(object.modified_at),
            )]);
        }
        if !Self::is_dir(&inner, &key) {
            return Err(StorageError::NotFound(path.to_string()).into());
        }

        let prefix = if key.is_empty() {
            String::new()
        } else {
            format!("{}/", key)
        };

        let mut dirs = BTreeSet::new();
        let mut entries = Vec::new();

        // 中间目录由键推导
        let note_dirs = |rest: &str, dirs: &mut BTreeSet<String>| {
            let segments: Vec<&str> = rest.split('/').collect();
            let depth = if recursive { segments.len() - 1 } else { 1 };
            for i in 1..=depth.min(segments.len() - 1) {
                dirs.insert(format!("{}{}", prefix, segments[..i].join("/")));
            }
        };

        for dir in inner.dirs.iter() {
            if let Some(rest) = dir.strip_prefix(&prefix) {
                if rest.is_empty() {
                    continue;
                }
                note_dirs(&format!("{}/", rest), &mut dirs);
            }
        }

        for (object_key, object) in inner.objects.iter() {
            let Some(rest) = object_key.strip_prefix(&prefix) else {
                continue;
            };
            if rest.is_empty() {
                continue;
            }
            if rest.contains('/') {
                note_dirs(rest, &mut dirs);
                if !recursive {
                    continue;
                }
            }
            entries.push(Entry::file(
                object_key.clone(),
                object.data.len() as u64,
                Some(object.modified_at),
            ));
        }

        entries.extend(dirs.into_iter().map(Entry::directory));
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<Option<Entry>> {
        let key = key_of(path);
        let inner = self.inner();
        if let Some(object) = inner.objects.get(&key) {
            return Ok(Some(Entry::file(
                key,
                object.data.len() as u64,
                Some(object.modified_at),
            )));
        }
        if Self::is_dir(&inner, &key) {
            return Ok(Some(Entry::directory(key)));
        }
        Ok(None)
    }

    async fn open_read(&self, path: &str, offset: u64) -> Result<Box<dyn ReadStream>> {
        let key = key_of(path);
        let inner = self.inner();
        match inner.objects.get(&key) {
            Some(object) => Ok(Box::new(MemoryReader {
                data: object.data.clone(),
                position: offset as usize,
            })),
            None if Self::is_dir(&inner, &key) => {
                Err(StorageError::IsDirectory(path.to_string()).into())
            }
            None => Err(StorageError::NotFound(path.to_string()).into()),
        }
    }

    async fn open_write(&self, path: &str) -> Result<Box<dyn WriteStream>> {
        Ok(Box::new(MemoryWriter {
            storage: self.clone(),
            path: path.to_string(),
            buffer: Vec::new(),
        }))
    }

    async fn open_multipart(&self, path: &str) -> Result<MultipartSession> {
        MultipartSession::open(Arc::new(self.clone()), path).await
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        self.inner().dirs.insert(key_of(path));
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let key = key_of(path);
        let prefix = format!("{}/", key);
        let mut inner = self.inner();
        inner.objects.remove(&key);
        inner.objects.retain(|k, _| !k.starts_with(&prefix));
        inner.dirs.retain(|d| d != &key && !d.starts_with(&prefix));
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[async_trait]
impl MultipartBackend for MemoryStorage {
    async fn create_upload(&self, path: &str) -> Result<String> {
        let upload_id = uuid::Uuid::new_v4().to_string();
        self.inner().uploads.insert(
            upload_id.clone(),
            PendingUpload {
                path: key_of(path),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _path: &str,
        upload_id: &str,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<String> {
        let etag = uuid::Uuid::new_v4().simple().to_string();
        let mut inner = self.inner();
        let upload = inner
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| anyhow!("分片上传不存在: {}", upload_id))?;
        upload.parts.insert(part_number, (etag.clone(), data));
        Ok(etag)
    }

    async fn list_parts(&self, _path: &str, upload_id: &str) -> Result<Vec<u32>> {
        let inner = self.inner();
        let upload = inner
            .uploads
            .get(upload_id)
            .ok_or_else(|| anyhow!("分片上传不存在: {}", upload_id))?;
        Ok(upload.parts.keys().copied().collect())
    }

    async fn complete_upload(
        &self,
        _path: &str,
        upload_id: &str,
        parts: &[PartRecord],
    ) -> Result<()> {
        let mut inner = self.inner();
        let upload = inner
            .uploads
            .remove(upload_id)
            .ok_or_else(|| anyhow!("分片上传不存在: {}", upload_id))?;

        let valid = parts.iter().all(|record| {
            matches!(upload.parts.get(&record.part_number), Some((etag, _)) if *etag == record.etag)
        });
        if !valid {
            // 清单无效时上传保持未完成状态
            inner.uploads.insert(upload_id.to_string(), upload);
            return Err(anyhow!("分片清单与已上传分片不匹配: {}", upload_id));
        }

        let data: Vec<u8> = parts
            .iter()
            .filter_map(|record| upload.parts.get(&record.part_number))
            .flat_map(|(_, chunk)| chunk.iter().copied())
            .collect();

        inner.objects.insert(
            upload.path,
            Object {
                data: Arc::new(data),
                modified_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn abort_upload(&self, _path: &str, upload_id: &str) -> Result<()> {
        self.inner().uploads.remove(upload_id);
        Ok(())
    }
}

struct MemoryReader {
    data: Arc<Vec<u8>>,
    position: usize,
}

#[async_trait]
impl ReadStream for MemoryReader {
    async fn read(&mut self, size: usize) -> Result<Vec<u8>> {
        let start = self.position.min(self.data.len());
        let end = start.saturating_add(size).min(self.data.len());
        self.position = end;
        Ok(self.data[start..end].to_vec())
    }
}

struct MemoryWriter {
    storage: MemoryStorage,
    path: String,
    buffer: Vec<u8>,
}

#[async_trait]
impl WriteStream for MemoryWriter {
    async fn write(&mut self, data: Vec<u8>) -> Result<()> {
        self.buffer.extend(data);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.storage.put(&this.path, this.buffer);
        Ok(())
    }
}
