// 单文件上传会话
//
// 会话独占其分片状态，维护：
// - 聚合状态机（Queued / Uploading / Paused / Success / Error / Cancelled）
// - 待调度分片队列（重试的分片排到队尾）
// - 进度（已成功分片数 / 总分片数），被节流的进度记为待发布，由引擎补发

use crate::error::UploadError;
use crate::events::ProgressThrottler;
use crate::uploader::{ChunkStatus, UploadChunk, UploadFile};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;

/// 会话聚合状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// 等待调度
    Queued,
    /// 上传中
    Uploading,
    /// 已暂停（在途分片会继续完成，但不再调度新分片）
    Paused,
    /// 已完成
    Success,
    /// 失败
    Error,
    /// 已取消
    Cancelled,
}

impl SessionStatus {
    /// 是否为终态
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Success | SessionStatus::Error | SessionStatus::Cancelled
        )
    }
}

/// 可重试失败后的处理决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 重新排队，`attempt` 为第几次重试
    Retry { attempt: u32 },
    /// 重试次数耗尽，会话进入 Error
    Exhausted,
}

/// 分片派发信息
#[derive(Debug, Clone)]
pub struct DispatchedChunk {
    pub index: usize,
    pub range: Range<u64>,
}

/// 上传会话
#[derive(Debug)]
pub struct UploadSession {
    /// 文件标识
    file_id: String,
    /// 文件描述（与在途传输任务共享）
    file: Arc<UploadFile>,
    /// 所有分片（按索引排列）
    chunks: Vec<UploadChunk>,
    /// 聚合状态
    status: SessionStatus,
    /// 待调度分片索引
    pending: VecDeque<usize>,
    /// 是否已经派发过分片
    dispatched: bool,
    /// 最后完成分片的服务器响应
    server_response: Option<String>,
    /// 失败原因
    error: Option<UploadError>,
    /// 创建时间 (Unix timestamp)
    created_at: i64,
    /// 完成时间 (Unix timestamp)
    completed_at: Option<i64>,
    /// 进度事件节流器
    progress_throttler: ProgressThrottler,
    /// 有被节流、尚未发布的进度
    progress_pending: bool,
    /// 已登记延迟补发
    progress_flush_scheduled: bool,
}

impl UploadSession {
    pub fn new(file_id: String, file: UploadFile, chunks: Vec<UploadChunk>) -> Self {
        let pending = chunks.iter().map(|c| c.index).collect();
        Self {
            file_id,
            file: Arc::new(file),
            chunks,
            status: SessionStatus::Queued,
            pending,
            dispatched: false,
            server_response: None,
            error: None,
            created_at: chrono::Utc::now().timestamp(),
            completed_at: None,
            progress_throttler: ProgressThrottler::default(),
            progress_pending: false,
            progress_flush_scheduled: false,
        }
    }

    /// 设置进度事件节流间隔
    pub fn set_progress_interval(&mut self, interval_ms: u64) {
        self.progress_throttler = ProgressThrottler::with_millis(interval_ms);
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn file(&self) -> &Arc<UploadFile> {
        &self.file
    }

    pub fn chunks(&self) -> &[UploadChunk] {
        &self.chunks
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn server_response(&self) -> Option<&str> {
        self.server_response.as_deref()
    }

    pub fn error(&self) -> Option<&UploadError> {
        self.error.as_ref()
    }

    pub fn total_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// 已成功的分片数
    pub fn completed_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_success()).count()
    }

    /// 已上传字节数
    pub fn uploaded_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| c.is_success())
            .map(|c| c.size())
            .sum()
    }

    /// 上传进度，取值 [0, 1]
    pub fn progress(&self) -> f64 {
        if self.chunks.is_empty() {
            return 0.0;
        }
        self.completed_chunks() as f64 / self.chunks.len() as f64
    }

    /// 是否全部分片完成
    pub fn is_completed(&self) -> bool {
        self.chunks.iter().all(|c| c.is_success())
    }

    /// 是否可以派发新分片
    pub fn can_dispatch(&self) -> bool {
        matches!(self.status, SessionStatus::Queued | SessionStatus::Uploading)
            && !self.pending.is_empty()
    }

    /// 取出下一个待上传分片并标记为上传中
    pub fn take_next_chunk(&mut self) -> Option<DispatchedChunk> {
        if !matches!(self.status, SessionStatus::Queued | SessionStatus::Uploading) {
            return None;
        }

        while let Some(index) = self.pending.pop_front() {
            let chunk = &mut self.chunks[index];
            if chunk.status != ChunkStatus::Pending {
                continue;
            }
            chunk.status = ChunkStatus::Uploading;
            self.status = SessionStatus::Uploading;
            self.dispatched = true;
            return Some(DispatchedChunk {
                index,
                range: chunk.range.clone(),
            });
        }
        None
    }

    /// 分片上传成功
    ///
    /// 返回 true 表示会话因此进入 Success
    pub fn on_chunk_success(&mut self, index: usize, response: String) -> bool {
        if self.is_terminal() {
            return false;
        }
        let Some(chunk) = self.chunks.get_mut(index) else {
            return false;
        };
        if chunk.status != ChunkStatus::Uploading {
            return false;
        }

        chunk.status = ChunkStatus::Success;
        self.server_response = Some(response);

        if self.is_completed() {
            self.status = SessionStatus::Success;
            self.completed_at = Some(chrono::Utc::now().timestamp());
            true
        } else {
            false
        }
    }

    /// 分片遇到可重试错误
    ///
    /// 分片进入 Failed；未超出 `max_retries` 时由调用方通过 `requeue_chunk` 重新排队
    pub fn on_chunk_retryable(&mut self, index: usize, cause: &str, max_retries: u32) -> RetryDecision {
        let Some(chunk) = self.chunks.get_mut(index) else {
            return RetryDecision::Exhausted;
        };
        chunk.status = ChunkStatus::Failed;
        chunk.retries += 1;

        if chunk.retries > max_retries {
            self.fail(UploadError::RetryableTransportFailure(format!(
                "分片 #{} 重试 {} 次后仍失败: {}",
                index, max_retries, cause
            )));
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry {
                attempt: chunk.retries,
            }
        }
    }

    /// 重试：Failed 分片回到 Pending，排到队尾
    ///
    /// 会话已终止时不做任何事，返回 false
    pub fn requeue_chunk(&mut self, index: usize) -> bool {
        if self.is_terminal() {
            return false;
        }
        match self.chunks.get_mut(index) {
            Some(chunk) if chunk.status == ChunkStatus::Failed => {
                chunk.status = ChunkStatus::Pending;
                self.pending.push_back(index);
                true
            }
            _ => false,
        }
    }

    /// 分片遇到不可重试错误，会话进入 Error
    pub fn on_chunk_fatal(&mut self, index: usize, cause: &str) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.status = ChunkStatus::Failed;
        }
        self.fail(UploadError::FatalTransportFailure(format!(
            "分片 #{} 上传失败: {}",
            index, cause
        )));
    }

    /// 标记会话失败
    pub fn fail(&mut self, error: UploadError) {
        if self.is_terminal() {
            return;
        }
        self.status = SessionStatus::Error;
        self.error = Some(error);
        self.pending.clear();
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }

    /// 暂停：不再派发新分片
    pub fn pause(&mut self) -> bool {
        if matches!(self.status, SessionStatus::Queued | SessionStatus::Uploading) {
            self.status = SessionStatus::Paused;
            true
        } else {
            false
        }
    }

    /// 恢复：未派发过分片的回到 Queued
    pub fn resume(&mut self) -> bool {
        if self.status != SessionStatus::Paused {
            return false;
        }
        self.status = if self.dispatched {
            SessionStatus::Uploading
        } else {
            SessionStatus::Queued
        };
        true
    }

    /// 取消：立即进入终态，在途分片的结果到达后会被丢弃
    pub fn cancel(&mut self) -> bool {
        if self.status == SessionStatus::Cancelled {
            return false;
        }
        self.status = SessionStatus::Cancelled;
        self.pending.clear();
        self.completed_at = Some(chrono::Utc::now().timestamp());
        true
    }

    /// 记录一次进度变化
    ///
    /// 返回 true 表示应立即发布；被节流时记为待发布并返回 false
    pub fn record_progress(&mut self) -> bool {
        if self.progress_throttler.should_emit() {
            self.progress_pending = false;
            true
        } else {
            self.progress_pending = true;
            false
        }
    }

    /// 强制发布进度事件（完成时），清除待发布标记
    pub fn force_emit_progress(&mut self) {
        self.progress_pending = false;
        self.progress_throttler.force_emit();
    }

    /// 取出待发布的进度，返回 true 表示调用方需要发布当前进度
    pub fn take_pending_progress(&mut self) -> bool {
        if !self.progress_pending {
            return false;
        }
        self.force_emit_progress();
        true
    }

    /// 登记一次延迟补发，返回补发等待时间；已有登记时返回 None
    pub fn schedule_progress_flush(&mut self) -> Option<std::time::Duration> {
        if !self.progress_pending || self.progress_flush_scheduled {
            return None;
        }
        self.progress_flush_scheduled = true;
        Some(self.progress_throttler.interval())
    }

    /// 延迟补发到期
    ///
    /// 返回 true 表示调用方需要发布当前进度
    pub fn on_progress_flush(&mut self) -> bool {
        self.progress_flush_scheduled = false;
        !self.is_terminal() && self.take_pending_progress()
    }

    /// 生成会话快照
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            file_id: self.file_id.clone(),
            file_name: self.file.name.clone(),
            relative_path: self.file.relative_path.clone(),
            size: self.file.size,
            status: self.status,
            total_chunks: self.total_chunks(),
            completed_chunks: self.completed_chunks(),
            uploaded_bytes: self.uploaded_bytes(),
            progress: self.progress(),
            retries: self.chunks.iter().map(|c| c.retries).sum(),
            error: self.error.as_ref().map(ToString::to_string),
            server_response: self.server_response.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// 会话快照（对外只读视图）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub file_id: String,
    pub file_name: String,
    pub relative_path: String,
    pub size: u64,
    pub status: SessionStatus,
    pub total_chunks: usize,
    pub completed_chunks: usize,
    pub uploaded_bytes: u64,
    pub progress: f64,
    pub retries: u32,
    pub error: Option<String>,
    pub server_response: Option<String>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}
