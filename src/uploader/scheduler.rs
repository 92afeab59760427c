// 上传调度状态
//
// 引擎的全部可变状态都在这里，由引擎的一把锁保护：
// - 会话按加入顺序排列（FIFO，不做优先级重排）
// - 全局在途分片数不超过 simultaneous_uploads
// - 暂停时不派发新分片，在途分片继续完成
//
// 调度本身只做选择，不发起网络请求；派发和完成回调由引擎负责

use crate::uploader::{DispatchedChunk, SessionStatus, UploadFile, UploadSession};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// 最大退避延迟（毫秒）
pub const MAX_BACKOFF_MS: u64 = 5000;

/// 计算指数退避延迟
///
/// # 参数
/// * `initial_ms` - 首次重试的延迟，0 表示不等待
/// * `attempt` - 第几次重试（从 1 开始）
pub fn calculate_backoff_delay(initial_ms: u64, attempt: u32) -> u64 {
    if initial_ms == 0 {
        return 0;
    }
    let exponent = attempt.saturating_sub(1).min(16);
    initial_ms
        .saturating_mul(2u64.pow(exponent))
        .min(MAX_BACKOFF_MS.max(initial_ms))
}

/// 会话槽位
///
/// `generation` 区分同一标识先后创建的会话，旧会话的迟到结果据此丢弃；
/// `reported` 表示结果已计入某一轮排空统计
#[derive(Debug)]
pub struct SessionSlot {
    pub generation: u64,
    pub session: UploadSession,
    pub reported: bool,
}

/// 一次派发
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub file_id: String,
    pub generation: u64,
    pub file: Arc<UploadFile>,
    pub total_chunks: usize,
    pub chunk: DispatchedChunk,
}

/// 队列排空时的统计（只包含上一轮排空之后结束的会话）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// 调度状态
#[derive(Debug)]
pub struct SchedulerState {
    /// 会话加入顺序
    order: Vec<String>,
    /// 会话表
    slots: HashMap<String, SessionSlot>,
    /// 下一个会话代号
    next_generation: u64,
    /// 全局最大并发分片数
    limit: usize,
    /// 在途分片数
    active_transports: usize,
    /// 是否已经开始
    started: bool,
    /// 全局暂停
    paused: bool,
    /// 被全局暂停的会话（恢复时只恢复这些）
    paused_by_engine: HashSet<String>,
    /// 本轮是否已经发布过排空事件
    drained: bool,
    /// 引擎已关闭
    shutdown: bool,
}

impl SchedulerState {
    pub fn new(limit: usize) -> Self {
        Self {
            order: Vec::new(),
            slots: HashMap::new(),
            next_generation: 0,
            limit,
            active_transports: 0,
            started: false,
            paused: false,
            paused_by_engine: HashSet::new(),
            drained: false,
            shutdown: false,
        }
    }

    /// 加入会话，返回会话代号
    ///
    /// 已存在同标识的会话时会被替换（调用方负责判断是否允许替换）
    pub fn insert(&mut self, session: UploadSession) -> u64 {
        let file_id = session.file_id().to_string();
        if self.slots.contains_key(&file_id) {
            self.order.retain(|id| id != &file_id);
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        self.order.push(file_id.clone());
        self.paused_by_engine.remove(&file_id);
        self.slots.insert(
            file_id,
            SessionSlot {
                generation,
                session,
                reported: false,
            },
        );
        self.drained = false;
        generation
    }

    /// 移除会话
    pub fn remove(&mut self, file_id: &str) -> Option<UploadSession> {
        let slot = self.slots.remove(file_id)?;
        self.order.retain(|id| id != file_id);
        self.paused_by_engine.remove(file_id);
        Some(slot.session)
    }

    pub fn get(&self, file_id: &str) -> Option<&UploadSession> {
        self.slots.get(file_id).map(|slot| &slot.session)
    }

    pub fn get_mut(&mut self, file_id: &str) -> Option<&mut UploadSession> {
        self.slots.get_mut(file_id).map(|slot| &mut slot.session)
    }

    /// 按代号查找会话，代号不符（会话已被替换或移除）时返回 None
    pub fn get_generation_mut(&mut self, file_id: &str, generation: u64) -> Option<&mut UploadSession> {
        self.slots
            .get_mut(file_id)
            .filter(|slot| slot.generation == generation)
            .map(|slot| &mut slot.session)
    }

    /// 按加入顺序遍历会话
    pub fn sessions(&self) -> impl Iterator<Item = &UploadSession> {
        self.order
            .iter()
            .filter_map(|id| self.slots.get(id).map(|slot| &slot.session))
    }

    /// 会话标识（按加入顺序）
    pub fn file_ids(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// 未终止的会话数
    pub fn non_terminal_count(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| !slot.session.is_terminal())
            .count()
    }

    pub fn active_transports(&self) -> usize {
        self.active_transports
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    pub fn mark_started(&mut self) {
        self.started = true;
        self.drained = false;
    }

    pub fn mark_shutdown(&mut self) {
        self.shutdown = true;
    }

    /// 全局暂停，返回被暂停的会话
    pub fn pause_all(&mut self) -> Vec<String> {
        self.paused = true;
        let mut paused = Vec::new();
        for id in &self.order {
            if let Some(slot) = self.slots.get_mut(id) {
                if slot.session.status() == SessionStatus::Uploading && slot.session.pause() {
                    self.paused_by_engine.insert(id.clone());
                    paused.push(id.clone());
                }
            }
        }
        paused
    }

    /// 全局恢复，只恢复被全局暂停的会话，返回被恢复的会话
    pub fn resume_all(&mut self) -> Vec<String> {
        self.paused = false;
        self.drained = false;
        let mut resumed = Vec::new();
        for id in &self.order {
            if !self.paused_by_engine.contains(id) {
                continue;
            }
            if let Some(slot) = self.slots.get_mut(id) {
                if slot.session.resume() {
                    resumed.push(id.clone());
                }
            }
        }
        self.paused_by_engine.clear();
        resumed
    }

    /// 单文件恢复后需要重新检查排空
    pub fn reset_drained(&mut self) {
        self.drained = false;
    }

    /// 是否还有空闲槽位可以派发
    pub fn has_capacity(&self) -> bool {
        self.started && !self.paused && !self.shutdown && self.active_transports < self.limit
    }

    /// 选出下一个要派发的分片并占用一个槽位
    ///
    /// 按会话加入顺序，再按会话内的待上传队列
    pub fn next_dispatch(&mut self) -> Option<Dispatch> {
        if !self.has_capacity() {
            return None;
        }

        for id in &self.order {
            let Some(slot) = self.slots.get_mut(id) else {
                continue;
            };
            if !slot.session.can_dispatch() {
                continue;
            }
            if let Some(chunk) = slot.session.take_next_chunk() {
                self.active_transports += 1;
                return Some(Dispatch {
                    file_id: id.clone(),
                    generation: slot.generation,
                    file: Arc::clone(slot.session.file()),
                    total_chunks: slot.session.total_chunks(),
                    chunk,
                });
            }
        }
        None
    }

    /// 释放一个槽位
    pub fn release_slot(&mut self) {
        self.active_transports = self.active_transports.saturating_sub(1);
    }

    /// 检查队列是否排空
    ///
    /// 已开始、没有在途分片、所有会话都已终止时返回本轮统计，每轮只返回一次
    pub fn check_drained(&mut self) -> Option<DrainSummary> {
        if !self.started || self.drained || self.active_transports > 0 {
            return None;
        }
        if self.non_terminal_count() > 0 {
            return None;
        }

        self.drained = true;
        let mut summary = DrainSummary {
            succeeded: 0,
            failed: 0,
            cancelled: 0,
        };
        for slot in self.slots.values_mut().filter(|slot| !slot.reported) {
            slot.reported = true;
            match slot.session.status() {
                SessionStatus::Success => summary.succeeded += 1,
                SessionStatus::Error => summary.failed += 1,
                SessionStatus::Cancelled => summary.cancelled += 1,
                _ => {}
            }
        }
        Some(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::{ChunkPlanner, UploadFile};

    fn session(name: &str, size: usize, chunk_size: u64) -> UploadSession {
        let file = UploadFile::from_bytes(name, vec![7u8; size], 1);
        ChunkPlanner::new().plan(file, chunk_size).unwrap()
    }

    fn drain_dispatches(state: &mut SchedulerState) -> Vec<(String, usize)> {
        let mut out = Vec::new();
        while let Some(d) = state.next_dispatch() {
            out.push((d.file_id, d.chunk.index));
        }
        out
    }

    #[test]
    fn test_calculate_backoff_delay() {
        assert_eq!(calculate_backoff_delay(100, 1), 100);
        assert_eq!(calculate_backoff_delay(100, 2), 200);
        assert_eq!(calculate_backoff_delay(100, 3), 400);
        assert_eq!(calculate_backoff_delay(100, 10), MAX_BACKOFF_MS);
        assert_eq!(calculate_backoff_delay(100, u32::MAX), MAX_BACKOFF_MS);
        assert_eq!(calculate_backoff_delay(0, 5), 0);
    }

    #[test]
    fn test_no_dispatch_before_start() {
        let mut state = SchedulerState::new(3);
        state.insert(session("a.bin", 3000, 1000));
        assert!(state.next_dispatch().is_none());

        state.mark_started();
        assert_eq!(drain_dispatches(&mut state).len(), 3);
    }

    #[test]
    fn test_limit_and_fifo_order() {
        let mut state = SchedulerState::new(2);
        let a = state.insert(session("a.bin", 2500, 1000));
        state.insert(session("b.bin", 1000, 1000));
        state.mark_started();

        let first = drain_dispatches(&mut state);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].1, 0);
        assert_eq!(first[1].1, 1);
        assert_eq!(state.active_transports(), 2);

        // 完成一个分片后才能派发第三个
        let a_id = first[0].0.clone();
        state
            .get_generation_mut(&a_id, a)
            .unwrap()
            .on_chunk_success(0, "ok".to_string());
        state.release_slot();

        let next = drain_dispatches(&mut state);
        assert_eq!(next, vec![(a_id, 2)]);

        // a 派发完后轮到 b
        state.release_slot();
        let next = drain_dispatches(&mut state);
        assert_eq!(next.len(), 1);
        assert_ne!(next[0].0, first[0].0);
    }

    #[test]
    fn test_pause_all_and_resume_all() {
        let mut state = SchedulerState::new(1);
        state.insert(session("a.bin", 2000, 1000));
        state.insert(session("b.bin", 2000, 1000));
        state.mark_started();
        let dispatched = drain_dispatches(&mut state);
        assert_eq!(dispatched.len(), 1);

        // 只有上传中的 a 被暂停，b 仍是 Queued
        let paused = state.pause_all();
        assert_eq!(paused, vec![dispatched[0].0.clone()]);
        state.release_slot();
        assert!(state.next_dispatch().is_none());

        let resumed = state.resume_all();
        assert_eq!(resumed, paused);
        assert_eq!(drain_dispatches(&mut state), vec![(dispatched[0].0.clone(), 1)]);
    }

    #[test]
    fn test_generation_guards_replaced_session() {
        let mut state = SchedulerState::new(1);
        let old = state.insert(session("a.bin", 1000, 1000));
        let id = state.file_ids()[0].clone();
        state.get_mut(&id).unwrap().cancel();

        let new = state.insert(session("a.bin", 1000, 1000));
        assert_ne!(old, new);
        assert_eq!(state.len(), 1);
        assert!(state.get_generation_mut(&id, old).is_none());
        assert!(state.get_generation_mut(&id, new).is_some());
    }

    #[test]
    fn test_check_drained_once() {
        let mut state = SchedulerState::new(2);
        state.insert(session("a.bin", 1000, 1000));
        state.insert(session("b.bin", 1000, 1000));
        assert!(state.check_drained().is_none());

        state.mark_started();
        let dispatched = drain_dispatches(&mut state);
        assert!(state.check_drained().is_none());

        state
            .get_mut(&dispatched[0].0)
            .unwrap()
            .on_chunk_success(0, "ok".to_string());
        state.get_mut(&dispatched[1].0).unwrap().cancel();
        state.release_slot();
        assert!(state.check_drained().is_none());
        state.release_slot();

        assert_eq!(
            state.check_drained(),
            Some(DrainSummary {
                succeeded: 1,
                failed: 0,
                cancelled: 1
            })
        );
        assert!(state.check_drained().is_none());

        // 下一轮不重复统计上一轮的会话
        state.insert(session("c.bin", 1000, 1000));
        let dispatched = drain_dispatches(&mut state);
        state
            .get_mut(&dispatched[0].0)
            .unwrap()
            .on_chunk_fatal(0, "HTTP 415");
        state.release_slot();
        assert_eq!(
            state.check_drained(),
            Some(DrainSummary {
                succeeded: 0,
                failed: 1,
                cancelled: 0
            })
        );
    }

    #[test]
    fn test_empty_queue_drains_after_start() {
        let mut state = SchedulerState::new(1);
        assert!(state.is_empty());
        state.mark_started();
        assert!(state.check_drained().is_some());
    }
}
