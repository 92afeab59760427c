//! 进度事件节流器
//!
//! 用于控制进度事件的发布频率，避免分片快速完成时产生事件风暴

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

/// 尚未发布过事件
const NEVER_EMITTED: u64 = u64::MAX;

/// 进度事件节流器
///
/// 典型用法：每次更新进度时调用 `should_emit()`，返回 true 时才发布事件；
/// 被节流的更新由调用方在间隔结束后补发，补发和完成时调用 `force_emit()`
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 计时起点
    origin: Instant,
    /// 上次发布事件的时间（相对 origin 的纳秒）
    last_emit_nanos: AtomicU64,
    /// 节流间隔（纳秒）
    interval_nanos: u64,
}

impl ProgressThrottler {
    /// 创建新的节流器
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_emit_nanos: AtomicU64::new(NEVER_EMITTED),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    /// 使用指定毫秒间隔创建节流器
    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 检查是否应该发布事件
    ///
    /// 第一次调用总是返回 true；之后距离上次发布超过节流间隔才返回 true
    pub fn should_emit(&self) -> bool {
        let now = self.now_nanos();
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        let due = last == NEVER_EMITTED || now.saturating_sub(last) >= self.interval_nanos;
        if !due {
            return false;
        }

        // 被其他线程抢先更新时本次不发布
        self.last_emit_nanos
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// 强制发布（用于补发和最后一次更新），重新开始计时
    pub fn force_emit(&self) -> bool {
        self.last_emit_nanos.store(self.now_nanos(), Ordering::Relaxed);
        true
    }

    /// 节流间隔
    pub fn interval(&self) -> Duration {
        Duration::from_nanos(self.interval_nanos)
    }

    fn now_nanos(&self) -> u64 {
        // 避免与 NEVER_EMITTED 冲突
        (self.origin.elapsed().as_nanos() as u64).min(NEVER_EMITTED - 1)
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}
