// 上传引擎
//
// 核心功能：
// 1. 接收文件：类型、大小、重复、数量校验后创建上传会话
// 2. 全局调度：所有会话共享 simultaneous_uploads 个并发槽位
// 3. 错误处理：可重试错误按指数退避重新排队，重试耗尽或不可重试错误使会话失败
// 4. 事件发布：状态变化通过事件总线通知订阅者
//
// 并发模型：
// - 全部可变状态在一把锁内（SchedulerState）
// - 分片传输在 tokio 任务中并发执行，完成后重新加锁更新状态并补充派发
// - 事件在锁内发布，同一文件的事件顺序与状态变化顺序一致
// - 被节流的进度在节流间隔结束时补发，暂停、失败、取消前也会先补发
// - shutdown 通过 CancellationToken 中止在途传输

use crate::config::UploadConfig;
use crate::error::{UploadError, UploadResult};
use crate::events::{EventBus, UploadEvent};
use crate::uploader::identity::IdentifierGenerator;
use crate::uploader::scheduler::{calculate_backoff_delay, Dispatch, SchedulerState};
use crate::uploader::transport::{ChunkOutcome, ChunkRequest, ChunkTransport, HttpChunkTransport};
use crate::uploader::{
    ChunkPlanner, RetryDecision, SessionSnapshot, SessionStatus, UploadFile, UploadSession,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 上传引擎
///
/// 可以廉价克隆，所有克隆共享同一个队列。调度依赖 tokio 运行时，
/// `start` 之后的调用需要在运行时上下文中进行
#[derive(Clone)]
pub struct UploadEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    /// 上传配置
    config: UploadConfig,
    /// 分片规划器
    planner: ChunkPlanner,
    /// 分片传输
    transport: Arc<dyn ChunkTransport>,
    /// 调度状态
    state: Mutex<SchedulerState>,
    /// 事件总线
    events: EventBus,
    /// 取消令牌
    cancel_token: CancellationToken,
}

impl std::fmt::Debug for UploadEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("UploadEngine")
            .field("target", &self.inner.config.target)
            .field("sessions", &state.len())
            .field("active_transports", &state.active_transports())
            .field("subscribers", &self.inner.events.subscriber_count())
            .finish()
    }
}

impl UploadEngine {
    /// 使用 HTTP 传输创建引擎
    pub fn new(config: UploadConfig) -> UploadResult<Self> {
        config.validate()?;
        let transport = Arc::new(HttpChunkTransport::new(&config)?);
        Self::with_parts(config, transport, None)
    }

    /// 使用 HTTP 传输和自定义文件标识生成器创建引擎
    pub fn with_identifier(config: UploadConfig, identifier: IdentifierGenerator) -> UploadResult<Self> {
        config.validate()?;
        let transport = Arc::new(HttpChunkTransport::new(&config)?);
        Self::with_parts(config, transport, Some(identifier))
    }

    /// 使用指定的传输实现创建引擎
    ///
    /// # 参数
    /// * `config` - 上传配置（构造时校验）
    /// * `transport` - 分片传输实现
    /// * `identifier` - 自定义文件标识生成器，None 使用默认策略
    pub fn with_parts(
        config: UploadConfig,
        transport: Arc<dyn ChunkTransport>,
        identifier: Option<IdentifierGenerator>,
    ) -> UploadResult<Self> {
        config.validate()?;

        let planner = match identifier {
            Some(identifier) => ChunkPlanner::with_identifier(identifier),
            None => ChunkPlanner::new(),
        };

        info!(
            "创建上传引擎: target={}, 分片大小={} bytes, 并发={}",
            config.target, config.chunk_size, config.simultaneous_uploads
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                state: Mutex::new(SchedulerState::new(config.simultaneous_uploads)),
                config,
                planner,
                transport,
                events: EventBus::new(),
                cancel_token: CancellationToken::new(),
            }),
        })
    }

    /// 当前配置
    pub fn config(&self) -> &UploadConfig {
        &self.inner.config
    }

    /// 订阅上传事件
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<UploadEvent> {
        self.inner.events.subscribe()
    }

    /// 添加文件
    ///
    /// 依次校验文件类型、大小、重复、数量上限。被拒绝时既返回错误，
    /// 也发布 `FileRejected` 事件，引擎继续接收其他文件。
    /// 引擎关闭后返回 `EngineShutdown`
    pub fn add_file(&self, file: UploadFile) -> UploadResult<String> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.is_shutdown() {
            warn!("引擎已关闭，拒绝添加文件: {}", file.name);
            return Err(UploadError::EngineShutdown);
        }

        let file_id = inner.planner.file_id(&file);
        if let Err(e) = inner.check_file(&state, &file, &file_id) {
            warn!("拒绝文件: {} ({})", file.name, e);
            inner.events.publish(UploadEvent::FileRejected {
                file_id: matches!(e, UploadError::DuplicateFile { .. }).then(|| file_id.clone()),
                file_name: file.name.clone(),
                kind: e.kind(),
                reason: e.to_string(),
            });
            return Err(e);
        }

        let mut session = inner.planner.plan(file, inner.config.chunk_size)?;
        session.set_progress_interval(inner.config.progress_interval_ms);

        let event = UploadEvent::FileAdded {
            file_id: file_id.clone(),
            file_name: session.file().name.clone(),
            size: session.file().size,
            total_chunks: session.total_chunks(),
        };
        info!(
            "添加文件: {} (id={}, 大小={} bytes, 分片数={})",
            session.file().name,
            file_id,
            session.file().size,
            session.total_chunks()
        );
        state.insert(session);
        inner.events.publish(event);

        if inner.config.auto_start && !state.is_started() {
            state.mark_started();
        }
        if state.is_started() {
            inner.pump(&mut state);
        }

        Ok(file_id)
    }

    /// 批量添加文件，逐个返回结果
    pub fn add_files(&self, files: impl IntoIterator<Item = UploadFile>) -> Vec<UploadResult<String>> {
        files.into_iter().map(|file| self.add_file(file)).collect()
    }

    /// 开始上传（暂停状态下等同于恢复）
    pub fn start(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.is_shutdown() {
            warn!("引擎已关闭，忽略开始请求");
            return;
        }

        state.mark_started();
        if state.is_paused() {
            for file_id in state.resume_all() {
                inner.events.publish(UploadEvent::FileResumed { file_id });
            }
        }
        info!("开始上传: {} 个文件", state.non_terminal_count());
        inner.pump(&mut state);
    }

    /// 全局暂停：不再派发新分片，在途分片继续完成
    pub fn pause(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.is_shutdown() || state.is_paused() {
            return;
        }

        let paused = state.pause_all();
        info!("暂停上传: {} 个文件", paused.len());
        for file_id in paused {
            if let Some(event) = state.get_mut(&file_id).and_then(pending_progress_event) {
                inner.events.publish(event);
            }
            inner.events.publish(UploadEvent::FilePaused { file_id });
        }
    }

    /// 全局恢复
    pub fn resume(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.is_shutdown() || !state.is_paused() {
            return;
        }

        let resumed = state.resume_all();
        info!("恢复上传: {} 个文件", resumed.len());
        for file_id in resumed {
            inner.events.publish(UploadEvent::FileResumed { file_id });
        }
        inner.pump(&mut state);
    }

    /// 取消所有未结束的会话
    pub fn cancel(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let cancelled = inner.cancel_all(&mut state);
        info!("取消上传: {} 个文件", cancelled);
        inner.pump(&mut state);
    }

    /// 暂停单个文件
    pub fn pause_file(&self, file_id: &str) -> UploadResult<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let session = state
            .get_mut(file_id)
            .ok_or_else(|| UploadError::SessionNotFound(file_id.to_string()))?;

        if session.pause() {
            info!("暂停文件: {}", file_id);
            if let Some(event) = pending_progress_event(session) {
                inner.events.publish(event);
            }
            inner.events.publish(UploadEvent::FilePaused {
                file_id: file_id.to_string(),
            });
        }
        Ok(())
    }

    /// 恢复单个文件
    pub fn resume_file(&self, file_id: &str) -> UploadResult<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let session = state
            .get_mut(file_id)
            .ok_or_else(|| UploadError::SessionNotFound(file_id.to_string()))?;

        if session.resume() {
            info!("恢复文件: {}", file_id);
            inner.events.publish(UploadEvent::FileResumed {
                file_id: file_id.to_string(),
            });
            state.reset_drained();
            inner.pump(&mut state);
        }
        Ok(())
    }

    /// 取消单个文件，在途分片的结果到达后丢弃
    pub fn cancel_file(&self, file_id: &str) -> UploadResult<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let session = state
            .get_mut(file_id)
            .ok_or_else(|| UploadError::SessionNotFound(file_id.to_string()))?;

        if session.status() == SessionStatus::Cancelled {
            return Ok(());
        }
        if let Some(event) = pending_progress_event(session) {
            inner.events.publish(event);
        }
        if session.cancel() {
            info!("取消文件: {}", file_id);
            inner.events.publish(UploadEvent::SessionCancelled {
                file_id: file_id.to_string(),
            });
            inner.pump(&mut state);
        }
        Ok(())
    }

    /// 移除会话，返回移除前的快照
    pub fn remove_file(&self, file_id: &str) -> UploadResult<SessionSnapshot> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let session = state
            .remove(file_id)
            .ok_or_else(|| UploadError::SessionNotFound(file_id.to_string()))?;

        info!("移除文件: {} ({:?})", file_id, session.status());
        inner.events.publish(UploadEvent::FileRemoved {
            file_id: file_id.to_string(),
        });
        inner.pump(&mut state);
        Ok(session.snapshot())
    }

    /// 关闭引擎
    ///
    /// 取消所有会话，中止在途传输，释放所有订阅
    pub fn shutdown(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.is_shutdown() {
            return;
        }

        state.mark_shutdown();
        let cancelled = inner.cancel_all(&mut state);
        inner.cancel_token.cancel();
        inner.events.close();
        info!(
            "上传引擎已关闭: 取消 {} 个文件, 中止 {} 个在途分片",
            cancelled,
            state.active_transports()
        );
    }

    /// 会话失败的原因，会话不存在或未失败时返回 None
    pub fn last_error(&self, file_id: &str) -> Option<UploadError> {
        self.inner.state.lock().get(file_id)?.error().cloned()
    }

    /// 获取会话快照
    pub fn session(&self, file_id: &str) -> Option<SessionSnapshot> {
        self.inner.state.lock().get(file_id).map(UploadSession::snapshot)
    }

    /// 所有会话快照（按加入顺序）
    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        self.inner
            .state
            .lock()
            .sessions()
            .map(UploadSession::snapshot)
            .collect()
    }

    /// 总体进度，按文件大小加权，取值 [0, 1]
    ///
    /// 已取消的会话不计入
    pub fn progress(&self) -> f64 {
        let state = self.inner.state.lock();
        let (uploaded, total) = state
            .sessions()
            .filter(|s| s.status() != SessionStatus::Cancelled)
            .fold((0.0, 0u64), |(uploaded, total), s| {
                (uploaded + s.progress() * s.file().size as f64, total + s.file().size)
            });

        if total == 0 {
            0.0
        } else {
            (uploaded / total as f64).clamp(0.0, 1.0)
        }
    }

    /// 是否有分片正在传输
    pub fn is_uploading(&self) -> bool {
        self.inner.state.lock().active_transports() > 0
    }

    /// 在途分片数
    pub fn active_transports(&self) -> usize {
        self.inner.state.lock().active_transports()
    }
}

impl EngineInner {
    /// 添加文件前的校验
    fn check_file(&self, state: &SchedulerState, file: &UploadFile, file_id: &str) -> UploadResult<()> {
        if !file.matches_file_type(&self.config.file_type) {
            return Err(UploadError::FileTypeRejected {
                file_name: file.name.clone(),
            });
        }

        if let Some(max_size) = self.config.max_file_size {
            if file.size > max_size {
                return Err(UploadError::FileTooLarge {
                    file_name: file.name.clone(),
                    size: file.size,
                    max_size,
                });
            }
        }

        // 已终止的同标识会话会被替换
        if let Some(existing) = state.get(file_id) {
            if !existing.is_terminal() {
                return Err(UploadError::DuplicateFile {
                    file_id: file_id.to_string(),
                });
            }
        }

        if let Some(max_files) = self.config.max_files {
            if state.non_terminal_count() >= max_files {
                return Err(UploadError::TooManyFiles {
                    file_name: file.name.clone(),
                    max_files,
                });
            }
        }

        Ok(())
    }

    /// 取消所有未结束的会话，返回取消数量
    fn cancel_all(&self, state: &mut SchedulerState) -> usize {
        let mut cancelled = 0;
        for file_id in state.file_ids() {
            let Some(session) = state.get_mut(&file_id) else {
                continue;
            };
            if session.is_terminal() {
                continue;
            }
            if let Some(event) = pending_progress_event(session) {
                self.events.publish(event);
            }
            if session.cancel() {
                cancelled += 1;
                self.events
                    .publish(UploadEvent::SessionCancelled { file_id });
            }
        }
        cancelled
    }

    /// 调度：填满空闲槽位，队列排空时发布事件
    ///
    /// 只在持有状态锁时调用，自身不会重入
    fn pump(self: &Arc<Self>, state: &mut SchedulerState) {
        while let Some(dispatch) = state.next_dispatch() {
            debug!(
                "[{}] 派发分片 #{} (范围: {}-{}, 在途: {})",
                dispatch.file_id,
                dispatch.chunk.index,
                dispatch.chunk.range.start,
                dispatch.chunk.range.end,
                state.active_transports()
            );
            self.spawn_transport(dispatch);
        }

        if let Some(summary) = state.check_drained() {
            info!(
                "上传队列已排空: 成功 {}, 失败 {}, 取消 {}",
                summary.succeeded, summary.failed, summary.cancelled
            );
            self.events.publish(UploadEvent::QueueDrained {
                succeeded: summary.succeeded,
                failed: summary.failed,
                cancelled: summary.cancelled,
            });
        }
    }

    fn chunk_request(&self, dispatch: &Dispatch) -> ChunkRequest {
        ChunkRequest {
            file_id: dispatch.file_id.clone(),
            file: Arc::clone(&dispatch.file),
            chunk_index: dispatch.chunk.index,
            range: dispatch.chunk.range.clone(),
            total_chunks: dispatch.total_chunks,
            chunk_size: self.config.chunk_size,
            endpoint: self.config.target.clone(),
            headers: self.config.headers.clone(),
            query: self.config.query.clone(),
        }
    }

    fn spawn_transport(self: &Arc<Self>, dispatch: Dispatch) {
        let request = self.chunk_request(&dispatch);
        let inner = Arc::clone(self);
        let token = self.cancel_token.clone();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = token.cancelled() => None,
                outcome = inner.transport.send(&request) => Some(outcome),
            };
            inner.on_chunk_complete(dispatch, outcome);
        });
    }

    /// 分片传输完成回调
    ///
    /// `outcome` 为 None 表示传输被 shutdown 中止
    fn on_chunk_complete(self: &Arc<Self>, dispatch: Dispatch, outcome: Option<ChunkOutcome>) {
        let mut state = self.state.lock();
        state.release_slot();

        let Some(outcome) = outcome else {
            debug!(
                "[{}] 分片 #{} 传输已中止",
                dispatch.file_id, dispatch.chunk.index
            );
            return;
        };

        let index = dispatch.chunk.index;
        let mut retry_attempt = None;
        let mut progress_flush = None;
        let events = match state.get_generation_mut(&dispatch.file_id, dispatch.generation) {
            Some(session) if !session.is_terminal() => match outcome {
                ChunkOutcome::Success(response) => {
                    let completed = session.on_chunk_success(index, response);
                    debug!(
                        "[{}] 分片 #{} 上传成功 ({}/{})",
                        dispatch.file_id,
                        index,
                        session.completed_chunks(),
                        session.total_chunks()
                    );
                    if completed {
                        session.force_emit_progress();
                        info!("文件上传完成: {} (id={})", session.file().name, dispatch.file_id);
                        vec![
                            progress_event(session),
                            success_event(session, self.config.file_name_field.as_deref()),
                        ]
                    } else if session.record_progress() {
                        vec![progress_event(session)]
                    } else {
                        progress_flush = session.schedule_progress_flush();
                        Vec::new()
                    }
                }
                ChunkOutcome::Retryable(cause) => {
                    match session.on_chunk_retryable(index, &cause, self.config.max_retries) {
                        RetryDecision::Retry { attempt } => {
                            warn!(
                                "[{}] 分片 #{} 上传失败，重新排队 ({}/{}): {}",
                                dispatch.file_id, index, attempt, self.config.max_retries, cause
                            );
                            retry_attempt = Some(attempt);
                            vec![UploadEvent::ChunkRetried {
                                file_id: dispatch.file_id.clone(),
                                chunk_index: index,
                                attempt,
                                cause,
                            }]
                        }
                        RetryDecision::Exhausted => {
                            error!(
                                "[{}] 分片 #{} 重试次数耗尽: {}",
                                dispatch.file_id, index, cause
                            );
                            failure_events(session)
                        }
                    }
                }
                ChunkOutcome::Fatal(cause) => {
                    error!(
                        "[{}] 分片 #{} 上传失败（不可重试）: {}",
                        dispatch.file_id, index, cause
                    );
                    session.on_chunk_fatal(index, &cause);
                    failure_events(session)
                }
            },
            _ => {
                debug!(
                    "[{}] 会话已结束或已移除，丢弃分片 #{} 的结果",
                    dispatch.file_id, index
                );
                Vec::new()
            }
        };

        for event in events {
            self.events.publish(event);
        }

        if let Some(attempt) = retry_attempt {
            self.schedule_retry(&mut state, &dispatch, attempt);
        }
        if let Some(delay) = progress_flush {
            self.schedule_progress_flush(&dispatch, delay);
        }
        self.pump(&mut state);
    }

    /// 节流间隔结束后补发被节流的进度
    fn schedule_progress_flush(self: &Arc<Self>, dispatch: &Dispatch, delay: Duration) {
        let inner = Arc::clone(self);
        let token = self.cancel_token.clone();
        let file_id = dispatch.file_id.clone();
        let generation = dispatch.generation;

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let mut state = inner.state.lock();
            let Some(session) = state.get_generation_mut(&file_id, generation) else {
                return;
            };
            if session.on_progress_flush() {
                debug!("[{}] 补发节流期间的进度: {:.3}", file_id, session.progress());
                inner.events.publish(progress_event(session));
            }
        });
    }

    /// 退避后把失败的分片放回队尾
    fn schedule_retry(self: &Arc<Self>, state: &mut SchedulerState, dispatch: &Dispatch, attempt: u32) {
        let delay_ms = calculate_backoff_delay(self.config.chunk_retry_interval_ms, attempt);
        let index = dispatch.chunk.index;

        if delay_ms == 0 {
            if let Some(session) = state.get_generation_mut(&dispatch.file_id, dispatch.generation) {
                session.requeue_chunk(index);
            }
            return;
        }

        let inner = Arc::clone(self);
        let token = self.cancel_token.clone();
        let file_id = dispatch.file_id.clone();
        let generation = dispatch.generation;

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
            }

            let mut state = inner.state.lock();
            if let Some(session) = state.get_generation_mut(&file_id, generation) {
                session.requeue_chunk(index);
            }
            inner.pump(&mut state);
        });
    }
}

fn progress_event(session: &UploadSession) -> UploadEvent {
    UploadEvent::Progress {
        file_id: session.file_id().to_string(),
        progress: session.progress(),
        completed_chunks: session.completed_chunks(),
        total_chunks: session.total_chunks(),
        uploaded_bytes: session.uploaded_bytes(),
        total_size: session.file().size,
    }
}

fn success_event(session: &UploadSession, file_name_field: Option<&str>) -> UploadEvent {
    let response = session.server_response().unwrap_or_default().to_string();
    UploadEvent::FileSuccess {
        file_id: session.file_id().to_string(),
        file_name: session.file().name.clone(),
        server_file_name: server_file_name(&response, file_name_field),
        server_response: response,
        completed_at: session.snapshot().completed_at.unwrap_or_default(),
    }
}

/// 取出被节流的进度事件
fn pending_progress_event(session: &mut UploadSession) -> Option<UploadEvent> {
    session
        .take_pending_progress()
        .then(|| progress_event(session))
}

/// 会话失败时的事件：先补发被节流的进度，再发布失败事件
fn failure_events(session: &mut UploadSession) -> Vec<UploadEvent> {
    let mut events: Vec<UploadEvent> = pending_progress_event(session).into_iter().collect();
    if let Some(error) = session.error() {
        events.push(UploadEvent::FileError {
            file_id: session.file_id().to_string(),
            file_name: session.file().name.clone(),
            kind: error.kind(),
            error: error.to_string(),
        });
    }
    events
}

/// 从成功响应中提取服务器文件名
///
/// 配置了字段且响应是包含该字符串字段的 JSON 时取字段值，否则取原始响应
pub fn server_file_name(response: &str, field: Option<&str>) -> String {
    field
        .and_then(|field| {
            serde_json::from_str::<serde_json::Value>(response)
                .ok()?
                .get(field)?
                .as_str()
                .map(str::to_string)
        })
        .unwrap_or_else(|| response.to_string())
}
