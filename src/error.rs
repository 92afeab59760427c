// 上传错误类型
//
// 分为三类：
// - 构造期错误（InvalidConfig）：引擎无法启动
// - 单文件拒绝（FileTypeRejected / FileTooLarge / TooManyFiles / DuplicateFile）：
//   通过事件上报，引擎继续接收其他文件
// - 传输错误（RetryableTransportFailure / FatalTransportFailure）：
//   可重试错误只在重试耗尽后才会暴露给调用方
// - 调用错误（SessionNotFound / EngineShutdown）

use serde::{Deserialize, Serialize};

/// 上传引擎错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    /// 配置无效（构造期）
    #[error("配置无效: {0}")]
    InvalidConfig(String),

    /// 文件类型不在允许列表中
    #[error("文件类型不允许: {file_name}")]
    FileTypeRejected { file_name: String },

    /// 文件超过大小上限
    #[error("文件过大: {file_name} ({size} > {max_size} bytes)")]
    FileTooLarge {
        file_name: String,
        size: u64,
        max_size: u64,
    },

    /// 活跃文件数已达上限
    #[error("文件数量已达上限: {max_files}")]
    TooManyFiles { file_name: String, max_files: usize },

    /// 相同标识的文件已在上传队列中
    #[error("文件已在上传队列中: {file_id}")]
    DuplicateFile { file_id: String },

    /// 可重试的传输错误（超时、5xx 等）
    #[error("可重试的传输错误: {0}")]
    RetryableTransportFailure(String),

    /// 不可重试的传输错误（服务器拒绝、重试耗尽）
    #[error("传输失败: {0}")]
    FatalTransportFailure(String),

    /// 会话不存在
    #[error("上传会话不存在: {0}")]
    SessionNotFound(String),

    /// 引擎已关闭
    #[error("上传引擎已关闭")]
    EngineShutdown,
}

impl UploadError {
    /// 错误分类名称（用于事件和日志）
    pub fn kind(&self) -> UploadErrorKind {
        match self {
            UploadError::InvalidConfig(_) => UploadErrorKind::InvalidConfig,
            UploadError::FileTypeRejected { .. } => UploadErrorKind::FileTypeRejected,
            UploadError::FileTooLarge { .. } => UploadErrorKind::FileTooLarge,
            UploadError::TooManyFiles { .. } => UploadErrorKind::TooManyFiles,
            UploadError::DuplicateFile { .. } => UploadErrorKind::DuplicateFile,
            UploadError::RetryableTransportFailure(_) => UploadErrorKind::RetryableTransport,
            UploadError::FatalTransportFailure(_) => UploadErrorKind::FatalTransport,
            UploadError::SessionNotFound(_) => UploadErrorKind::SessionNotFound,
            UploadError::EngineShutdown => UploadErrorKind::EngineShutdown,
        }
    }

    /// 是否为单文件拒绝（引擎继续运行）
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            UploadError::FileTypeRejected { .. }
                | UploadError::FileTooLarge { .. }
                | UploadError::TooManyFiles { .. }
                | UploadError::DuplicateFile { .. }
        )
    }
}

/// 错误分类（可序列化，随事件发布）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UploadErrorKind {
    InvalidConfig,
    FileTypeRejected,
    FileTooLarge,
    TooManyFiles,
    DuplicateFile,
    RetryableTransport,
    FatalTransport,
    SessionNotFound,
    EngineShutdown,
}

pub type UploadResult<T> = std::result::Result<T, UploadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_classification() {
        assert!(UploadError::FileTypeRejected {
            file_name: "a.exe".to_string()
        }
        .is_rejection());
        assert!(UploadError::DuplicateFile {
            file_id: "1-abc".to_string()
        }
        .is_rejection());
        assert!(!UploadError::InvalidConfig("chunk_size".to_string()).is_rejection());
        assert!(!UploadError::FatalTransportFailure("415".to_string()).is_rejection());
        assert!(!UploadError::EngineShutdown.is_rejection());
    }

    #[test]
    fn test_error_kind_serialization() {
        let kind = UploadError::TooManyFiles {
            file_name: "b.txt".to_string(),
            max_files: 1,
        }
        .kind();
        assert_eq!(serde_json::to_string(&kind).unwrap(), "\"too_many_files\"");
    }
}
