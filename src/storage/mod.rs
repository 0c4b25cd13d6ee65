pub mod local;
pub mod memory;
pub mod s3;

use crate::core::multipart::MultipartSession;
use crate::core::path;
use crate::error::StorageError;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub use local::LocalStorage;
pub use memory::MemoryStorage;
pub use s3::S3Storage;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat, delete 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;
/// 存储内部复制时的缓冲大小
pub const COPY_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// 条目类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// 目录扫描得到的条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    pub name: String,
    /// 完整路径
    pub path: String,
    pub kind: EntryKind,
    /// 仅文件有大小
    pub size: Option<u64>,
    /// 仅文件有修改时间
    pub modified_at: Option<DateTime<Utc>>,
}

impl Entry {
    pub fn file(path: impl Into<String>, size: u64, modified_at: Option<DateTime<Utc>>) -> Self {
        let path = path.into();
        Self {
            name: path::file_name(&path).to_string(),
            path,
            kind: EntryKind::File,
            size: Some(size),
            modified_at,
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        let path = path.into().trim_end_matches('/').to_string();
        Self {
            name: path::file_name(&path).to_string(),
            path,
            kind: EntryKind::Directory,
            size: None,
            modified_at: None,
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// 可读流
#[async_trait]
pub trait ReadStream: Send {
    /// 读取最多 `size` 字节，返回空数据表示已到末尾
    async fn read(&mut self, size: usize) -> Result<Vec<u8>>;
}

/// 可写流，`close` 成功后数据才对外可见
#[async_trait]
pub trait WriteStream: Send {
    async fn write(&mut self, data: Vec<u8>) -> Result<()>;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// 存储抽象接口
///
/// 路径均为完整路径：本地存储是文件系统路径，对象存储是 `bucket/key`。
#[async_trait]
pub trait Storage: Send + Sync {
    /// 列出目录内容及元数据，`recursive` 为 false 时只返回直接子项
    async fn scan(&self, path: &str, recursive: bool) -> Result<Vec<Entry>>;

    /// 获取条目元数据，不存在时返回 None
    async fn stat(&self, path: &str) -> Result<Option<Entry>>;

    /// 从 `offset` 开始打开可读流
    async fn open_read(&self, path: &str, offset: u64) -> Result<Box<dyn ReadStream>>;

    /// 打开可写流
    async fn open_write(&self, path: &str) -> Result<Box<dyn WriteStream>>;

    /// 打开分片上传会话
    async fn open_multipart(&self, _path: &str) -> Result<MultipartSession> {
        Err(StorageError::Unsupported(self.name().to_string(), "分片上传").into())
    }

    /// 创建目录
    async fn create_dir(&self, path: &str) -> Result<()>;

    /// 删除文件或整个目录
    async fn delete(&self, path: &str) -> Result<()>;

    /// 读取文件的一部分
    async fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let mut reader = self.open_read(path, offset).await?;
        let mut data = Vec::with_capacity(length as usize);
        while (data.len() as u64) < length {
            let want = (length - data.len() as u64) as usize;
            let chunk = reader.read(want).await?;
            if chunk.is_empty() {
                break;
            }
            data.extend(chunk);
        }
        Ok(data)
    }

    /// 复制单个文件
    async fn copy_file(&self, from: &str, to: &str) -> Result<()> {
        stream_copy(self, from, self, to).await
    }

    /// 复制文件或目录
    async fn copy(&self, from: &str, to: &str, recursive: bool) -> Result<()> {
        let entry = self.stat(from).await?;
        match entry {
            None => Err(StorageError::NotFound(from.to_string()).into()),
            Some(e) if e.is_dir() && !recursive => {
                Err(StorageError::IsDirectory(from.to_string()).into())
            }
            Some(e) if e.is_dir() => {
                let from = from.trim_end_matches('/');
                let to = to.trim_end_matches('/');
                self.create_dir(to).await?;
                for child in self.scan(from, true).await? {
                    let target = path::retarget(&child.path, from, to);
                    if child.is_dir() {
                        self.create_dir(&target).await?;
                    } else {
                        self.copy_file(&child.path, &target).await?;
                    }
                }
                Ok(())
            }
            Some(_) => self.copy_file(from, to).await,
        }
    }

    /// 移动文件或目录
    async fn rename(&self, from: &str, to: &str, recursive: bool) -> Result<()> {
        self.copy(from, to, recursive).await?;
        self.delete(from).await
    }

    /// 删除文件或目录，删除目录需要 `recursive`
    async fn remove(&self, path: &str, recursive: bool) -> Result<()> {
        match self.stat(path).await? {
            None => Err(StorageError::NotFound(path.to_string()).into()),
            Some(e) if e.is_dir() && !recursive => {
                Err(StorageError::IsDirectory(path.to_string()).into())
            }
            Some(_) => self.delete(path).await,
        }
    }

    /// 列出目录：非递归返回名称，递归返回完整路径
    async fn list(&self, path: &str, recursive: bool) -> Result<Vec<String>> {
        let entries = self.scan(path, recursive).await?;
        Ok(entries
            .into_iter()
            .map(|e| if recursive { e.path } else { e.name })
            .collect())
    }

    /// 检查文件是否存在
    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.stat(path).await?.is_some())
    }

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 在两个存储之间流式复制单个文件
pub async fn stream_copy<S, D>(source: &S, from: &str, dest: &D, to: &str) -> Result<()>
where
    S: Storage + ?Sized,
    D: Storage + ?Sized,
{
    let mut reader = source.open_read(from, 0).await?;
    let mut writer = dest.open_write(to).await?;
    loop {
        let chunk = reader.read(COPY_BUFFER_SIZE).await?;
        if chunk.is_empty() {
            break;
        }
        writer.write(chunk).await?;
    }
    writer.close().await
}
