//! 命令行入口

use crate::config::{S3Config, TransferOptions};
use crate::core::{TransferEngine, TransferProgress};
use crate::logging::LogConfig;
use crate::storage::{LocalStorage, S3Storage};
use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// 在本地目录树和 S3 兼容存储之间批量传输文件
#[derive(Parser, Debug)]
#[command(name = "bucketsync", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别: error, warn, info, debug, trace
    #[arg(long = "log_level", global = true, default_value = "info")]
    pub log_level: String,

    /// 日志文件目录，未设置时只输出到控制台
    #[arg(long = "log_dir", global = true)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 上传本地目录到 S3
    Upload(UploadArgs),
    /// 从 S3 下载到本地目录
    Download(CommonArgs),
}

#[derive(Args, Debug)]
pub struct CommonArgs {
    /// 本地目录
    #[arg(long = "local_path")]
    pub local_path: String,

    /// 远程路径，格式为 bucket/prefix 或 s3://bucket/prefix
    #[arg(long = "s3_path")]
    pub s3_path: String,

    /// S3 配置文件（YAML）
    #[arg(long = "config_path")]
    pub config_path: PathBuf,

    /// 最大并发传输数
    #[arg(long = "workers", default_value_t = 16)]
    pub workers: usize,

    /// 每个文件最多尝试的次数
    #[arg(long = "retries", default_value_t = 3)]
    pub retries: u32,

    /// 重试间隔（秒）
    #[arg(long = "retry_delay", default_value_t = 3)]
    pub retry_delay: u64,

    /// 分块大小（字节）
    #[arg(long = "chunk_size", default_value_t = 16 * 1024 * 1024)]
    pub chunk_size: u64,
}

#[derive(Args, Debug)]
pub struct UploadArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// 大文件使用分片上传
    #[arg(long = "multipart")]
    pub multipart: bool,

    /// 大文件阈值（字节）
    #[arg(long = "large_file_size", default_value_t = 128 * 1024 * 1024)]
    pub large_file_size: u64,

    /// 单个文件的最大分片数
    #[arg(long = "max_chunks", default_value_t = 999)]
    pub max_chunks: u32,
}

impl CommonArgs {
    fn options(&self) -> TransferOptions {
        TransferOptions {
            worker_count: self.workers,
            retry_count: self.retries,
            retry_delay: Duration::from_secs(self.retry_delay),
            chunk_size: self.chunk_size,
            ..Default::default()
        }
    }

    fn engine(&self) -> Result<TransferEngine> {
        let config = S3Config::load(&self.config_path)?;
        info!("使用 S3 配置: {:?}", config);
        let remote = S3Storage::new(&config)?;
        Ok(TransferEngine::new(
            Arc::new(LocalStorage::new()),
            Arc::new(remote),
        ))
    }
}

impl UploadArgs {
    fn options(&self) -> TransferOptions {
        TransferOptions {
            large_file_threshold: self.large_file_size,
            max_chunks: self.max_chunks,
            use_multipart: self.multipart,
            ..self.common.options()
        }
    }
}

impl Cli {
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level.clone(),
            log_dir: self.log_dir.clone(),
            ..Default::default()
        }
    }
}

/// 执行命令，返回传输失败的源路径
pub async fn run(cli: Cli) -> Result<Vec<String>> {
    match cli.command {
        Commands::Upload(args) => {
            let options = args.options();
            options.validate()?;
            let engine = with_progress_log(args.common.engine()?);
            watch_ctrl_c(&engine);
            engine
                .upload(&args.common.local_path, &args.common.s3_path, &options)
                .await
        }
        Commands::Download(args) => {
            let options = args.options();
            options.validate()?;
            let engine = with_progress_log(args.engine()?);
            watch_ctrl_c(&engine);
            engine
                .download(&args.s3_path, &args.local_path, &options)
                .await
        }
    }
}

/// Ctrl-C 取消正在进行的传输
fn watch_ctrl_c(engine: &TransferEngine) {
    let token = engine.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，正在取消传输...");
            token.cancel();
        }
    });
}

/// 进度快照输出为日志
fn with_progress_log(engine: TransferEngine) -> TransferEngine {
    let (tx, mut rx) = mpsc::channel::<TransferProgress>(16);
    tokio::spawn(async move {
        while let Some(p) = rx.recv().await {
            info!(
                "进度: {}/{} 个文件, {}/{} 字节, {} 字节/秒, 剩余约 {}s",
                p.files_completed, p.files_total, p.bytes_completed, p.bytes_total, p.speed, p.eta
            );
        }
    });
    engine.with_progress(tx)
}
