//! 日志系统配置
//!
//! 控制台输出 + 可选的文件持久化。日志文件按启动时间命名、按大小滚动，
//! 启动时清理超过保留天数的旧文件

use crate::config::LogConfig;
use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀
pub const LOG_FILE_PREFIX: &str = "resumable-uploader";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 日志文件名
///
/// - 首个文件: `resumable-uploader.YYYY-MM-DD-HHMMSS.log`
/// - 滚动文件: `resumable-uploader.YYYY-MM-DD-HHMMSS_N.log`
fn log_file_name(start_timestamp: &str, index: u32) -> String {
    if index == 0 {
        format!("{}.{}.log", LOG_FILE_PREFIX, start_timestamp)
    } else {
        format!("{}.{}_{}.log", LOG_FILE_PREFIX, start_timestamp, index)
    }
}

/// 从日志文件名中解析日期，不是本程序的日志文件时返回 None
fn parse_log_date(filename: &str) -> Option<NaiveDate> {
    let stem = filename
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_prefix('.')?
        .strip_suffix(".log")?;
    let date = stem.get(..10)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// 按大小滚动的日志文件
struct RollingFile {
    log_dir: PathBuf,
    start_timestamp: String,
    index: u32,
    max_file_size: u64,
    written: u64,
    file: File,
}

impl RollingFile {
    fn open(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        let start_timestamp = Local::now().format("%Y-%m-%d-%H%M%S").to_string();
        let file = open_append(&log_dir.join(log_file_name(&start_timestamp, 0)))?;
        Ok(Self {
            log_dir,
            start_timestamp,
            index: 0,
            max_file_size,
            written: 0,
            file,
        })
    }

    fn current_path(&self) -> PathBuf {
        self.log_dir
            .join(log_file_name(&self.start_timestamp, self.index))
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.index += 1;
        self.file = open_append(&self.current_path())?;
        self.written = 0;
        Ok(())
    }

    fn write_data(&mut self, buf: &[u8]) -> io::Result<usize> {
        // 空文件不滚动，单条超大日志也能写入
        if self.written > 0 && self.written + buf.len() as u64 > self.max_file_size {
            self.rotate()?;
        }
        let written = self.file.write(buf)?;
        self.written += written as u64;
        Ok(written)
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// 日志文件写入器
///
/// 实现了 Write trait，可以交给 `tracing_appender::non_blocking`
#[derive(Clone)]
pub struct RollingLogWriter {
    inner: Arc<Mutex<RollingFile>>,
}

impl RollingLogWriter {
    pub fn new(log_dir: impl Into<PathBuf>, max_file_size: u64) -> io::Result<Self> {
        let file = RollingFile::open(log_dir.into(), max_file_size)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(file)),
        })
    }

    /// 当前写入的文件路径
    pub fn current_path(&self) -> PathBuf {
        self.inner.lock().current_path()
    }
}

impl Write for RollingLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write_data(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().file.flush()
    }
}

/// 日志系统守卫
///
/// 必须保持存活，否则文件写入线程会终止，尚未落盘的日志会丢失
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// 文件日志无法创建时回退到仅控制台输出
///
/// # 参数
/// * `config` - 日志配置
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_ansi(true);

    let writer = if config.enabled {
        match fs::create_dir_all(&config.log_dir)
            .and_then(|_| RollingLogWriter::new(&config.log_dir, config.max_file_size))
        {
            Ok(writer) => Some(writer),
            Err(e) => {
                eprintln!(
                    "创建日志文件失败: {}, 错误: {}，回退到仅控制台输出",
                    config.log_dir.display(),
                    e
                );
                None
            }
        }
    } else {
        None
    };

    let Some(writer) = writer else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
        info!("日志系统初始化完成（仅控制台输出）");
        return LogGuard { _file_guard: None };
    };

    let (non_blocking, file_guard) = tracing_appender::non_blocking(writer);
    let file_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!(
        "日志系统初始化完成: 目录={}, 保留天数={}, 级别={}, 单文件最大={:.1}MB",
        config.log_dir.display(),
        config.retention_days,
        config.level,
        config.max_file_size as f64 / 1024.0 / 1024.0
    );

    cleanup_old_logs(&config.log_dir, config.retention_days, Local::now().date_naive());

    LogGuard {
        _file_guard: Some(file_guard),
    }
}

/// 清理过期日志文件，返回删除数量
///
/// 只处理本程序命名的日志文件，其他文件保持不动
pub fn cleanup_old_logs(log_dir: &Path, retention_days: u32, today: NaiveDate) -> usize {
    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("读取日志目录失败: {}, 错误: {}", log_dir.display(), e);
            return 0;
        }
    };

    let retention = chrono::Duration::days(retention_days as i64);
    let mut deleted = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(file_date) = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(parse_log_date)
        else {
            continue;
        };

        if today.signed_duration_since(file_date) <= retention {
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => {
                deleted += 1;
                debug!("已删除过期日志文件: {}", path.display());
            }
            Err(e) => warn!("删除过期日志文件失败: {}, 错误: {}", path.display(), e),
        }
    }

    if deleted > 0 {
        info!("已清理 {} 个过期日志文件", deleted);
    }
    deleted
}
