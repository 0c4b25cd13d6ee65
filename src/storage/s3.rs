use super::{
    stream_copy, Entry, ReadStream, Storage, WriteStream, COPY_BUFFER_SIZE, IO_TIMEOUT_SECS,
    OP_TIMEOUT_SECS,
};
use crate::config::S3Config;
use crate::core::multipart::{MultipartBackend, MultipartSession, PartRecord};
use crate::core::path;
use crate::error::StorageError;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use futures::TryStreamExt;
use opendal::{layers::TimeoutLayer, Metakey, Operator};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// S3 兼容对象存储，路径格式为 `bucket/key`
///
/// 普通读写和列举走 opendal，分片上传需要 upload id 和分片列表，直接使用 aws-sdk-s3。
pub struct S3Storage {
    config: S3Config,
    /// 每个 bucket 一个 Operator
    operators: Mutex<HashMap<String, Operator>>,
    multipart: Arc<S3Multipart>,
    name: String,
}

impl S3Storage {
    pub fn new(config: &S3Config) -> Result<Self> {
        let sdk_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .endpoint_url(&config.endpoint_url)
            .credentials_provider(Credentials::new(
                &config.aws_access_key_id,
                &config.aws_secret_access_key,
                None,
                None,
                "bucketsync",
            ))
            .force_path_style(true)
            .build();

        Ok(Self {
            config: config.clone(),
            operators: Mutex::new(HashMap::new()),
            multipart: Arc::new(S3Multipart {
                client: aws_sdk_s3::Client::from_conf(sdk_config),
            }),
            name: format!("s3@{}", config.endpoint_url.trim_end_matches('/')),
        })
    }

    /// 获取（或创建）bucket 对应的 Operator
    fn operator(&self, bucket: &str) -> Result<Operator> {
        if bucket.is_empty() {
            return Err(anyhow!("远程路径缺少 bucket"));
        }

        let mut operators = self.operators.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(op) = operators.get(bucket) {
            return Ok(op.clone());
        }

        use opendal::services::S3;

        let builder = S3::default()
            .bucket(bucket)
            .region(&self.config.region)
            .endpoint(&self.config.endpoint_url)
            .access_key_id(&self.config.aws_access_key_id)
            .secret_access_key(&self.config.aws_secret_access_key);

        // 添加超时层
        let operator = Operator::new(builder)?
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
            )
            .finish();

        debug!("创建 S3 Operator: bucket={}", bucket);
        operators.insert(bucket.to_string(), operator.clone());
        Ok(operator)
    }

    fn split<'a>(&self, path: &'a str) -> Result<(Operator, &'a str, &'a str)> {
        let (bucket, key) = path::split_bucket(path);
        Ok((self.operator(bucket)?, bucket, key.trim_end_matches('/')))
    }

    fn entry_path(bucket: &str, relative: &str) -> String {
        path::join(bucket, relative.trim_end_matches('/'))
    }

    fn dir_key(key: &str) -> String {
        if key.is_empty() {
            String::new()
        } else {
            format!("{}/", key)
        }
    }

    /// 前缀下是否存在任何对象
    async fn has_children(op: &Operator, key: &str) -> Result<bool> {
        let mut lister = op.lister(&Self::dir_key(key)).await?;
        Ok(lister.try_next().await?.is_some())
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn scan(&self, path: &str, recursive: bool) -> Result<Vec<Entry>> {
        let (op, bucket, key) = self.split(path)?;

        if !key.is_empty() {
            match op.stat(key).await {
                Ok(meta) if meta.is_file() => {
                    return Ok(vec![Entry::file(
                        Self::entry_path(bucket, key),
                        meta.content_length(),
                        meta.last_modified(),
                    )]);
                }
                Ok(_) => {}
                Err(e) if e.kind() == opendal::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let dir = Self::dir_key(key);
        let mut lister = op
            .lister_with(&dir)
            .recursive(recursive)
            .metakey(Metakey::ContentLength | Metakey::LastModified | Metakey::Mode)
            .await
            .map_err(|e| -> anyhow::Error {
                if e.kind() == opendal::ErrorKind::NotFound {
                    StorageError::NotFound(path.to_string()).into()
                } else {
                    e.into()
                }
            })?;

        let mut entries = Vec::new();
        while let Some(entry) = lister.try_next().await? {
            let relative = entry.path();

            // 跳过目录自身
            if relative.is_empty() || relative == "/" || relative == dir {
                continue;
            }

            let meta = entry.metadata();
            let full_path = Self::entry_path(bucket, relative);
            if meta.is_dir() {
                entries.push(Entry::directory(full_path));
            } else {
                entries.push(Entry::file(
                    full_path,
                    meta.content_length(),
                    meta.last_modified(),
                ));
            }
        }

        if entries.is_empty() && !key.is_empty() && !Self::has_children(&op, key).await? {
            return Err(StorageError::NotFound(path.to_string()).into());
        }

        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<Option<Entry>> {
        let (op, bucket, key) = self.split(path)?;
        if key.is_empty() {
            return Ok(Some(Entry::directory(bucket)));
        }

        match op.stat(key).await {
            Ok(meta) if meta.is_file() => Ok(Some(Entry::file(
                Self::entry_path(bucket, key),
                meta.content_length(),
                meta.last_modified(),
            ))),
            Ok(_) => Ok(Some(Entry::directory(Self::entry_path(bucket, key)))),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => {
                // 没有目录占位对象时通过前缀判断
                if Self::has_children(&op, key).await? {
                    Ok(Some(Entry::directory(Self::entry_path(bucket, key))))
                } else {
                    Ok(None)
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn open_read(&self, path: &str, offset: u64) -> Result<Box<dyn ReadStream>> {
        let entry = self
            .stat(path)
            .await?
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        if entry.is_dir() {
            return Err(StorageError::IsDirectory(path.to_string()).into());
        }

        let (op, _, key) = self.split(path)?;
        Ok(Box::new(S3Reader {
            operator: op,
            key: key.to_string(),
            position: offset,
            size: entry.size.unwrap_or(0),
        }))
    }

    async fn open_write(&self, path: &str) -> Result<Box<dyn WriteStream>> {
        let (op, _, key) = self.split(path)?;
        if key.is_empty() {
            return Err(anyhow!("远程路径缺少对象键: {}", path));
        }
        let writer = op.writer_with(key).chunk(COPY_BUFFER_SIZE).await?;
        Ok(Box::new(S3Writer { writer }))
    }

    async fn open_multipart(&self, path: &str) -> Result<MultipartSession> {
        MultipartSession::open(self.multipart.clone(), path).await
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        let (op, _, key) = self.split(path)?;
        if key.is_empty() {
            return Ok(());
        }
        // S3 没有真正的目录，写入一个占位对象
        op.write(&Self::dir_key(key), Vec::<u8>::new()).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let (op, _, key) = self.split(path)?;
        if key.is_empty() {
            return Err(anyhow!("拒绝删除整个 bucket: {}", path));
        }
        // S3 删除不存在的对象不会报错
        op.delete(key).await?;
        op.remove_all(&Self::dir_key(key)).await?;
        Ok(())
    }

    async fn copy_file(&self, from: &str, to: &str) -> Result<()> {
        let (from_bucket, from_key) = path::split_bucket(from);
        let (to_bucket, to_key) = path::split_bucket(to);

        // 同一 bucket 内使用服务端复制
        if from_bucket == to_bucket {
            let op = self.operator(from_bucket)?;
            op.copy(from_key, to_key).await?;
            Ok(())
        } else {
            stream_copy(self, from, self, to).await
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

struct S3Reader {
    operator: Operator,
    key: String,
    position: u64,
    size: u64,
}

#[async_trait]
impl ReadStream for S3Reader {
    async fn read(&mut self, size: usize) -> Result<Vec<u8>> {
        if self.position >= self.size || size == 0 {
            return Ok(Vec::new());
        }
        let end = (self.position + size as u64).min(self.size);
        let data = self
            .operator
            .read_with(&self.key)
            .range(self.position..end)
            .await?;
        self.position = end;
        Ok(data.to_vec())
    }
}

struct S3Writer {
    writer: opendal::Writer,
}

#[async_trait]
impl WriteStream for S3Writer {
    async fn write(&mut self, data: Vec<u8>) -> Result<()> {
        self.writer.write(data).await?;
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        self.writer.close().await?;
        Ok(())
    }
}

/// 基于 aws-sdk-s3 的分片上传协议实现
struct S3Multipart {
    client: aws_sdk_s3::Client,
}

#[async_trait]
impl MultipartBackend for S3Multipart {
    async fn create_upload(&self, path: &str) -> Result<String> {
        let (bucket, key) = path::split_bucket(path);
        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await?;
        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("服务端未返回 upload id: {}", path))
    }

    async fn upload_part(
        &self,
        path: &str,
        upload_id: &str,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<String> {
        let (bucket, key) = path::split_bucket(path);
        let output = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .body(ByteStream::from(data))
            .send()
            .await?;
        output
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("服务端未返回分片 {} 的 ETag: {}", part_number, path))
    }

    async fn list_parts(&self, path: &str, upload_id: &str) -> Result<Vec<u32>> {
        let (bucket, key) = path::split_bucket(path);
        let mut numbers = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let output = self
                .client
                .list_parts()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .set_part_number_marker(marker.take())
                .send()
                .await?;

            numbers.extend(
                output
                    .parts()
                    .iter()
                    .filter_map(|p| p.part_number())
                    .map(|n| n as u32),
            );

            match output.next_part_number_marker() {
                Some(next) if output.is_truncated().unwrap_or(false) => {
                    marker = Some(next.to_string())
                }
                _ => break,
            }
        }

        Ok(numbers)
    }

    async fn complete_upload(
        &self,
        path: &str,
        upload_id: &str,
        parts: &[PartRecord],
    ) -> Result<()> {
        let (bucket, key) = path::split_bucket(path);
        let completed: Vec<CompletedPart> = parts
            .iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await?;
        Ok(())
    }

    async fn abort_upload(&self, path: &str, upload_id: &str) -> Result<()> {
        let (bucket, key) = path::split_bucket(path);
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await?;
        Ok(())
    }
}
