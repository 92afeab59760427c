// 配置管理模块

use crate::error::{UploadError, UploadResult};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传配置
    pub upload: UploadConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    false
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// HTTP 方法（探测请求和上传请求共用）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    #[serde(alias = "GET")]
    Get,
    #[serde(alias = "POST")]
    Post,
    #[serde(alias = "PUT")]
    Put,
}

impl HttpMethod {
    pub fn as_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
        }
    }
}

/// 分片请求体格式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadMethod {
    /// multipart/form-data：分片数据 + 协议字段放在表单中
    Multipart,
    /// application/octet-stream：原始分片数据，协议字段放在查询串中
    Octet,
}

/// 上传配置
///
/// 未识别的字段直接拒绝（`deny_unknown_fields`），避免拼写错误的选项被静默忽略
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadConfig {
    /// 上传地址
    pub target: String,
    /// 分片大小（字节）
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// 全局最大并发分片数
    #[serde(default = "default_simultaneous_uploads")]
    pub simultaneous_uploads: usize,
    /// 最大活跃文件数（None 表示不限制）
    #[serde(default)]
    pub max_files: Option<usize>,
    /// 单文件大小上限（字节）
    #[serde(default)]
    pub max_file_size: Option<u64>,
    /// 允许的文件类型（扩展名如 "jpg"，或 MIME 如 "image/*"），为空表示不限制
    #[serde(default)]
    pub file_type: Vec<String>,
    /// 探测请求的 HTTP 方法
    #[serde(default = "default_test_method")]
    pub test_method: HttpMethod,
    /// 是否在上传前探测分片是否已存在（断点续传）
    #[serde(default)]
    pub test_chunks: bool,
    /// 附加请求头
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// 附加查询参数
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    /// 分片数据在表单中的字段名
    #[serde(default = "default_file_parameter_name")]
    pub file_parameter_name: String,
    /// 分片请求体格式
    #[serde(default = "default_upload_method")]
    pub upload_method: UploadMethod,
    /// 上传请求的 HTTP 方法
    #[serde(default = "default_http_method")]
    pub http_method: HttpMethod,
    /// 单分片最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 首次重试的退避延迟（毫秒，之后指数增长），0 表示立即重试
    #[serde(default = "default_chunk_retry_interval_ms")]
    pub chunk_retry_interval_ms: u64,
    /// 单次请求超时（毫秒），0 表示不设超时
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// 服务器返回这些状态码时视为不可重试
    #[serde(default = "default_permanent_errors")]
    pub permanent_errors: Vec<u16>,
    /// 从成功响应 JSON 中提取服务器文件名的字段
    #[serde(default)]
    pub file_name_field: Option<String>,
    /// 进度事件节流间隔（毫秒）
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// 添加文件后是否自动开始上传
    #[serde(default)]
    pub auto_start: bool,
}

fn default_chunk_size() -> u64 {
    1024 * 1024
}

fn default_simultaneous_uploads() -> usize {
    1
}

fn default_test_method() -> HttpMethod {
    HttpMethod::Post
}

fn default_file_parameter_name() -> String {
    "file".to_string()
}

fn default_upload_method() -> UploadMethod {
    UploadMethod::Multipart
}

fn default_http_method() -> HttpMethod {
    HttpMethod::Post
}

fn default_max_retries() -> u32 {
    3
}

fn default_chunk_retry_interval_ms() -> u64 {
    100
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

fn default_permanent_errors() -> Vec<u16> {
    vec![400, 401, 403, 404, 409, 413, 415, 422]
}

fn default_progress_interval_ms() -> u64 {
    200
}

impl UploadConfig {
    /// 使用默认选项创建指定上传地址的配置
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            chunk_size: default_chunk_size(),
            simultaneous_uploads: default_simultaneous_uploads(),
            max_files: None,
            max_file_size: None,
            file_type: Vec::new(),
            test_method: default_test_method(),
            test_chunks: false,
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            file_parameter_name: default_file_parameter_name(),
            upload_method: default_upload_method(),
            http_method: default_http_method(),
            max_retries: default_max_retries(),
            chunk_retry_interval_ms: default_chunk_retry_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            permanent_errors: default_permanent_errors(),
            file_name_field: None,
            progress_interval_ms: default_progress_interval_ms(),
            auto_start: false,
        }
    }

    /// 校验配置，构造引擎前调用
    pub fn validate(&self) -> UploadResult<()> {
        if self.target.trim().is_empty() {
            return Err(UploadError::InvalidConfig("target 不能为空".to_string()));
        }
        reqwest::Url::parse(&self.target).map_err(|e| {
            UploadError::InvalidConfig(format!("target 不是有效的 URL: {} ({})", self.target, e))
        })?;
        if self.chunk_size == 0 {
            return Err(UploadError::InvalidConfig(
                "chunk_size 必须大于 0".to_string(),
            ));
        }
        if self.simultaneous_uploads == 0 {
            return Err(UploadError::InvalidConfig(
                "simultaneous_uploads 必须大于 0".to_string(),
            ));
        }
        if self.max_files == Some(0) {
            return Err(UploadError::InvalidConfig(
                "max_files 必须大于 0".to_string(),
            ));
        }
        if self.file_parameter_name.trim().is_empty() {
            return Err(UploadError::InvalidConfig(
                "file_parameter_name 不能为空".to_string(),
            ));
        }
        if self.http_method == HttpMethod::Get {
            return Err(UploadError::InvalidConfig(
                "http_method 只能是 post 或 put".to_string(),
            ));
        }
        Ok(())
    }
}

impl AppConfig {
    /// 从 TOML 文本解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content).context("Failed to parse config file")?;
        config
            .upload
            .validate()
            .context("配置文件中的上传配置验证失败")?;
        Ok(config)
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = Self::from_toml_str(&content)?;
        tracing::info!("配置文件加载成功: {}", path.display());
        Ok(config)
    }
}
