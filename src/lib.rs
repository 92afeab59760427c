// Resumable Uploader Library
// 分片断点续传上传引擎核心库

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 上传事件模块
pub mod events;

// 日志系统
pub mod logging;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use config::{AppConfig, HttpMethod, LogConfig, UploadConfig, UploadMethod};
pub use error::{UploadError, UploadErrorKind, UploadResult};
pub use events::{EventBus, ProgressThrottler, UploadEvent};
pub use uploader::{
    ChunkOutcome, ChunkPlanner, ChunkRequest, ChunkTransport, FolderScanner, HttpChunkTransport,
    IdentifierGenerator, SessionSnapshot, SessionStatus, UploadEngine, UploadFile, UploadSession,
};
