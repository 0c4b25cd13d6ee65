//! 错误分类
//!
//! 存储层和引擎内部统一使用 `anyhow::Error` 传递错误，需要区分语义的场景
//! 通过 `downcast_ref` 识别下面这些类型。

use thiserror::Error;

/// 存储与传输错误
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("文件或目录不存在: '{0}'")]
    NotFound(String),

    #[error("'{0}' 是目录，但未启用递归模式")]
    IsDirectory(String),

    #[error("分片编号必须在 1 到 10000 之间，实际为 {0}")]
    InvalidPartNumber(u32),

    #[error("分片上传会话状态错误: {0}")]
    InvalidState(&'static str),

    /// 分片数量核对失败，分片上传已中止
    #[error("写入已中止: 提交 {submitted} 个分片, 服务端确认 {acknowledged} 个, 丢失 {loss}%")]
    Aborted {
        submitted: u32,
        acknowledged: u32,
        loss: u32,
    },

    #[error("{0} 不支持该操作: {1}")]
    Unsupported(String, &'static str),

    #[error("操作已取消")]
    Cancelled,
}

/// 配置错误，在任何传输开始前抛出
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("配置文件缺少必填字段 '{0}'")]
    MissingField(&'static str),

    #[error("无效的传输参数: {0}")]
    InvalidOption(String),

    #[error("读取配置文件 {path} 失败: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("解析配置文件失败: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// 判断错误是否为"不存在"
pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<StorageError>(),
        Some(StorageError::NotFound(_))
    ) || matches!(
        err.downcast_ref::<std::io::Error>(),
        Some(e) if e.kind() == std::io::ErrorKind::NotFound
    )
}

/// 判断错误是否由取消引起
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<StorageError>(), Some(StorageError::Cancelled))
}
