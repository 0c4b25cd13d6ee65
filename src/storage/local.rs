use super::{Entry, ReadStream, Storage, WriteStream};
use crate::core::path;
use crate::error::StorageError;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter};
use walkdir::WalkDir;

/// 本地文件系统存储，路径即文件系统路径
pub struct LocalStorage {
    name: String,
}

impl LocalStorage {
    pub fn new() -> Self {
        Self {
            name: "local".to_string(),
        }
    }

    fn entry_from_metadata(path: String, metadata: &std::fs::Metadata) -> Entry {
        if metadata.is_dir() {
            Entry::directory(path)
        } else {
            let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
            Entry::file(path, metadata.len(), modified)
        }
    }

    /// 把 NotFound 转换为统一的错误类型
    fn map_io(err: std::io::Error, path: &str) -> anyhow::Error {
        if err.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(path.to_string()).into()
        } else {
            err.into()
        }
    }
}

impl Default for LocalStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn scan(&self, path: &str, recursive: bool) -> Result<Vec<Entry>> {
        let metadata = fs::metadata(path).await.map_err(|e| Self::map_io(e, path))?;
        let root = path.trim_end_matches(['/', '\\']).to_string();

        // 根路径本身是文件时只返回它自己
        if !metadata.is_dir() {
            return Ok(vec![Self::entry_from_metadata(path::to_slash(&root), &metadata)]);
        }

        // 使用 spawn_blocking 避免阻塞 async runtime
        let entries = tokio::task::spawn_blocking(move || {
            let walker = WalkDir::new(&root)
                .min_depth(1)
                .max_depth(if recursive { usize::MAX } else { 1 })
                .follow_links(false);

            walker
                .into_iter()
                .filter_map(|e| e.ok())
                .filter_map(|entry| {
                    // 符号链接按目标分类和计算大小，失效的链接跳过
                    let metadata = if entry.path_is_symlink() {
                        std::fs::metadata(entry.path()).ok()?
                    } else {
                        entry.metadata().ok()?
                    };
                    let entry_path = path::to_slash(entry.path().to_str()?);
                    Some(Self::entry_from_metadata(entry_path, &metadata))
                })
                .collect::<Vec<_>>()
        })
        .await?;

        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<Option<Entry>> {
        match fs::metadata(path).await {
            Ok(metadata) => Ok(Some(Self::entry_from_metadata(
                path::to_slash(path.trim_end_matches(['/', '\\'])),
                &metadata,
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn open_read(&self, path: &str, offset: u64) -> Result<Box<dyn ReadStream>> {
        let mut file = fs::File::open(path).await.map_err(|e| Self::map_io(e, path))?;
        if file.metadata().await?.is_dir() {
            return Err(StorageError::IsDirectory(path.to_string()).into());
        }
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset)).await?;
        }
        Ok(Box::new(LocalReader { file }))
    }

    async fn open_write(&self, path: &str) -> Result<Box<dyn WriteStream>> {
        let dest = PathBuf::from(path);
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        // 先写入临时文件，关闭时原子重命名
        let temp = temp_path(&dest);
        let file = fs::File::create(&temp).await?;
        Ok(Box::new(LocalWriter {
            writer: BufWriter::new(file),
            temp,
            dest,
            closed: false,
        }))
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = Path::new(path);

        if !full_path.exists() {
            return Ok(());
        }

        if full_path.is_dir() {
            fs::remove_dir_all(full_path).await?;
        } else {
            fs::remove_file(full_path).await?;
        }

        Ok(())
    }

    async fn copy_file(&self, from: &str, to: &str) -> Result<()> {
        if let Some(parent) = Path::new(to).parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(from, to).await.map_err(|e| Self::map_io(e, from))?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str, recursive: bool) -> Result<()> {
        match self.stat(from).await? {
            None => Err(StorageError::NotFound(from.to_string()).into()),
            Some(e) if e.is_dir() && !recursive => {
                Err(StorageError::IsDirectory(from.to_string()).into())
            }
            Some(_) => {
                if let Some(parent) = Path::new(to).parent().filter(|p| !p.as_os_str().is_empty())
                {
                    fs::create_dir_all(parent).await?;
                }
                fs::rename(from, to).await?;
                Ok(())
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn temp_path(dest: &Path) -> PathBuf {
    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.{}.part", file_name, uuid::Uuid::new_v4().simple()))
}

struct LocalReader {
    file: fs::File,
}

#[async_trait]
impl ReadStream for LocalReader {
    async fn read(&mut self, size: usize) -> Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(size.min(super::COPY_BUFFER_SIZE));
        (&mut self.file)
            .take(size as u64)
            .read_to_end(&mut buffer)
            .await?;
        Ok(buffer)
    }
}

struct LocalWriter {
    writer: BufWriter<fs::File>,
    temp: PathBuf,
    dest: PathBuf,
    closed: bool,
}

#[async_trait]
impl WriteStream for LocalWriter {
    async fn write(&mut self, data: Vec<u8>) -> Result<()> {
        self.writer.write_all(&data).await?;
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        self.writer.flush().await?;
        self.writer.get_mut().sync_all().await?;
        fs::rename(&self.temp, &self.dest).await?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for LocalWriter {
    fn drop(&mut self) {
        // 未完成的写入不留下临时文件
        if !self.closed {
            let _ = std::fs::remove_file(&self.temp);
        }
    }
}
