//! 上传事件类型定义
//!
//! 引擎和会话的状态变化都以事件形式发布给外部观察者（界面层等）

use crate::error::UploadErrorKind;
use serde::{Deserialize, Serialize};

/// 上传事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 文件已加入上传队列
    FileAdded {
        file_id: String,
        file_name: String,
        size: u64,
        total_chunks: usize,
    },
    /// 文件被拒绝（类型、大小、数量、重复）
    FileRejected {
        /// 重复文件时为已有会话的标识
        file_id: Option<String>,
        file_name: String,
        kind: UploadErrorKind,
        reason: String,
    },
    /// 进度更新（节流）
    Progress {
        file_id: String,
        /// 取值 [0, 1]
        progress: f64,
        completed_chunks: usize,
        total_chunks: usize,
        uploaded_bytes: u64,
        total_size: u64,
    },
    /// 分片重新排队
    ChunkRetried {
        file_id: String,
        chunk_index: usize,
        attempt: u32,
        cause: String,
    },
    /// 文件上传完成
    FileSuccess {
        file_id: String,
        file_name: String,
        /// 服务器分配的文件名（配置的响应字段，缺省为原始响应）
        server_file_name: String,
        server_response: String,
        completed_at: i64,
    },
    /// 文件上传失败
    FileError {
        file_id: String,
        file_name: String,
        kind: UploadErrorKind,
        error: String,
    },
    /// 文件暂停
    FilePaused { file_id: String },
    /// 文件恢复
    FileResumed { file_id: String },
    /// 会话已取消
    SessionCancelled { file_id: String },
    /// 会话已移除
    FileRemoved { file_id: String },
    /// 所有会话都已结束，没有在途分片
    QueueDrained {
        succeeded: usize,
        failed: usize,
        cancelled: usize,
    },
}

impl UploadEvent {
    /// 获取文件标识（队列事件没有）
    pub fn file_id(&self) -> Option<&str> {
        match self {
            UploadEvent::FileAdded { file_id, .. }
            | UploadEvent::Progress { file_id, .. }
            | UploadEvent::ChunkRetried { file_id, .. }
            | UploadEvent::FileSuccess { file_id, .. }
            | UploadEvent::FileError { file_id, .. }
            | UploadEvent::FilePaused { file_id }
            | UploadEvent::FileResumed { file_id }
            | UploadEvent::SessionCancelled { file_id }
            | UploadEvent::FileRemoved { file_id } => Some(file_id),
            UploadEvent::FileRejected { file_id, .. } => file_id.as_deref(),
            UploadEvent::QueueDrained { .. } => None,
        }
    }

    /// 获取事件类型名称
    pub fn event_type_name(&self) -> &'static str {
        match self {
            UploadEvent::FileAdded { .. } => "file_added",
            UploadEvent::FileRejected { .. } => "file_rejected",
            UploadEvent::Progress { .. } => "progress",
            UploadEvent::ChunkRetried { .. } => "chunk_retried",
            UploadEvent::FileSuccess { .. } => "file_success",
            UploadEvent::FileError { .. } => "file_error",
            UploadEvent::FilePaused { .. } => "file_paused",
            UploadEvent::FileResumed { .. } => "file_resumed",
            UploadEvent::SessionCancelled { .. } => "session_cancelled",
            UploadEvent::FileRemoved { .. } => "file_removed",
            UploadEvent::QueueDrained { .. } => "queue_drained",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = UploadEvent::Progress {
            file_id: "10-abc".to_string(),
            progress: 0.5,
            completed_chunks: 1,
            total_chunks: 2,
            uploaded_bytes: 5,
            total_size: 10,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "progress");
        assert_eq!(json["file_id"], "10-abc");
        assert_eq!(json["progress"], 0.5);
    }

    #[test]
    fn test_event_accessors() {
        let drained = UploadEvent::QueueDrained {
            succeeded: 1,
            failed: 0,
            cancelled: 0,
        };
        assert_eq!(drained.file_id(), None);
        assert_eq!(drained.event_type_name(), "queue_drained");

        let rejected = UploadEvent::FileRejected {
            file_id: Some("1-x".to_string()),
            file_name: "x".to_string(),
            kind: UploadErrorKind::DuplicateFile,
            reason: "duplicate".to_string(),
        };
        assert_eq!(rejected.file_id(), Some("1-x"));
    }
}
