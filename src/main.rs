use bucketsync_lib::cli::{run, Cli};
use bucketsync_lib::logging::init_logging;
use clap::Parser;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // guard 持有到进程结束，保证文件日志写完
    let _guard = init_logging(&cli.log_config());

    match run(cli).await {
        Ok(failed) => {
            // 有失败文件时退出码仍为 0
            let list = serde_json::to_string(&failed).unwrap_or_else(|_| format!("{:?}", failed));
            println!("Error files: {}", list);
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
