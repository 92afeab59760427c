use anyhow::{Context, Result};
use clap::Parser;
use resumable_uploader::{
    logging, uploader::FolderScanner, AppConfig, UploadEngine, UploadEvent, UploadFile,
};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// 分片断点续传上传工具
#[derive(Parser, Debug)]
#[command(name = "resumable-uploader")]
#[command(version, about)]
struct Args {
    /// 配置文件路径
    #[arg(
        short,
        long,
        env = "RESUMABLE_UPLOADER_CONFIG",
        default_value = "config/app.toml"
    )]
    config: PathBuf,

    /// 待上传的文件或文件夹（文件夹递归扫描）
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

/// 收集待上传文件，文件夹递归扫描
async fn collect_files(paths: &[PathBuf]) -> Result<Vec<UploadFile>> {
    let scanner = FolderScanner::new();
    let mut files = Vec::new();

    for path in paths {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("无法访问: {}", path.display()))?;

        if metadata.is_dir() {
            for scanned in scanner.scan(path)? {
                files.push(scanned.to_upload_file().await?);
            }
        } else {
            files.push(UploadFile::from_path(path).await?);
        }
    }

    Ok(files)
}

/// 输出事件日志，队列排空时返回 (成功, 失败, 取消)
fn log_event(event: &UploadEvent) -> Option<(usize, usize, usize)> {
    match event {
        UploadEvent::FileAdded {
            file_name,
            total_chunks,
            ..
        } => info!("已加入队列: {} ({} 个分片)", file_name, total_chunks),
        UploadEvent::FileRejected {
            file_name, reason, ..
        } => warn!("已拒绝: {} ({})", file_name, reason),
        UploadEvent::Progress {
            file_id, progress, ..
        } => info!("[{}] 进度 {:.1}%", file_id, progress * 100.0),
        UploadEvent::ChunkRetried {
            file_id,
            chunk_index,
            attempt,
            cause,
        } => warn!(
            "[{}] 分片 #{} 第 {} 次重试: {}",
            file_id, chunk_index, attempt, cause
        ),
        UploadEvent::FileSuccess {
            file_name,
            server_file_name,
            ..
        } => info!("上传成功: {} -> {}", file_name, server_file_name),
        UploadEvent::FileError {
            file_name, error, ..
        } => error!("上传失败: {} ({})", file_name, error),
        UploadEvent::QueueDrained {
            succeeded,
            failed,
            cancelled,
        } => return Some((*succeeded, *failed, *cancelled)),
        _ => {}
    }
    None
}

async fn run(config_path: &Path, paths: Vec<PathBuf>) -> Result<()> {
    let config = AppConfig::load_from_file(config_path).await?;
    let _log_guard = logging::init_logging(&config.log);

    info!("Resumable Uploader v{} 启动中...", env!("CARGO_PKG_VERSION"));
    info!("上传地址: {}", config.upload.target);

    let files = collect_files(&paths).await?;
    let engine = UploadEngine::new(config.upload).context("创建上传引擎失败")?;
    let mut events = engine.subscribe();

    let rejected = engine
        .add_files(files)
        .into_iter()
        .filter(|r| matches!(r, Err(e) if e.is_rejection()))
        .count();
    engine.start();

    let summary = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if let Some(summary) = log_event(&event) {
                        break Some(summary);
                    }
                }
                None => break None,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("收到 Ctrl+C，取消上传...");
                break None;
            }
        }
    };

    engine.shutdown();

    match summary {
        Some((succeeded, failed, cancelled)) => {
            info!(
                "上传结束: 成功 {}, 失败 {}, 取消 {}, 拒绝 {}",
                succeeded, failed, cancelled, rejected
            );
            if failed > 0 || rejected > 0 {
                anyhow::bail!("{} 个文件上传失败, {} 个文件被拒绝", failed, rejected);
            }
            Ok(())
        }
        None => anyhow::bail!("上传被中断"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    run(&args.config, args.paths).await
}
