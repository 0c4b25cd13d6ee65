//! 应用配置模块

use crate::core::chunk::MAX_PART_NUMBER;
use crate::error::ConfigError;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Semaphore;

const MIB: u64 = 1024 * 1024;

fn default_region() -> String {
    "us-east-1".to_string()
}

/// S3 连接配置
#[derive(Clone, PartialEq, Eq)]
pub struct S3Config {
    pub endpoint_url: String,
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub region: String,
}

/// 配置文件的原始内容，字段全部可选以便给出明确的缺失提示
#[derive(Debug, Default, Deserialize)]
struct RawS3Config {
    endpoint_url: Option<String>,
    aws_access_key_id: Option<String>,
    aws_secret_access_key: Option<String>,
    region: Option<String>,
}

impl S3Config {
    /// 从 YAML 文件加载
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        // 空文件解析为 null
        let raw: Option<RawS3Config> = serde_yaml::from_str(content)?;
        let raw = raw.unwrap_or_default();

        let required = |value: Option<String>, field: &'static str| {
            value
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::MissingField(field))
        };

        Ok(Self {
            endpoint_url: required(raw.endpoint_url, "endpoint_url")?,
            aws_access_key_id: required(raw.aws_access_key_id, "aws_access_key_id")?,
            aws_secret_access_key: required(raw.aws_secret_access_key, "aws_secret_access_key")?,
            region: raw
                .region
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(default_region),
        })
    }
}

// 日志里不能出现密钥
impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint_url", &self.endpoint_url)
            .field("aws_access_key_id", &self.aws_access_key_id)
            .field("aws_secret_access_key", &"***")
            .field("region", &self.region)
            .finish()
    }
}

/// 传输参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOptions {
    /// 最大并发传输数
    pub worker_count: usize,
    /// 每个文件最多尝试的次数
    pub retry_count: u32,
    /// 两次尝试之间的等待时间
    pub retry_delay: Duration,
    /// 分块大小（字节），下载时也是读缓冲大小
    pub chunk_size: u64,
    /// 大文件阈值（字节），超过此大小的文件使用分片上传
    pub large_file_threshold: u64,
    /// 单个文件的最大分片数
    pub max_chunks: u32,
    /// 上传时是否启用分片上传
    pub use_multipart: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            worker_count: 16,
            retry_count: 3,
            retry_delay: Duration::from_secs(3),
            chunk_size: 16 * MIB,
            large_file_threshold: 128 * MIB,
            max_chunks: 999,
            use_multipart: false,
        }
    }
}

impl TransferOptions {
    /// 在任何传输开始前检查参数
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 || self.worker_count > Semaphore::MAX_PERMITS {
            return Err(ConfigError::InvalidOption(format!(
                "worker 数量必须在 1 到 {} 之间，实际为 {}",
                Semaphore::MAX_PERMITS,
                self.worker_count
            )));
        }
        if self.retry_count == 0 {
            return Err(ConfigError::InvalidOption("重试次数必须大于 0".into()));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::InvalidOption("分块大小必须大于 0".into()));
        }
        if self.max_chunks == 0 || self.max_chunks > MAX_PART_NUMBER {
            return Err(ConfigError::InvalidOption(format!(
                "最大分片数必须在 1 到 {} 之间，实际为 {}",
                MAX_PART_NUMBER, self.max_chunks
            )));
        }
        Ok(())
    }
}
