//! 事件总线
//!
//! 每个订阅者拥有独立的无界 channel，事件不会因订阅者消费慢而丢失；
//! 发布方在同一把锁内按状态变化顺序发布，同一文件的事件保持有序

use crate::events::UploadEvent;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// 事件总线
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<UploadEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 订阅事件
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<UploadEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// 发布事件，顺带清理已关闭的订阅者
    pub fn publish(&self, event: UploadEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        debug!(
            "发布事件: {} (file_id={:?}, 订阅者={})",
            event.event_type_name(),
            event.file_id(),
            subscribers.len()
        );
    }

    /// 当前订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// 释放所有订阅（订阅端随后收到 channel 关闭）
    pub fn close(&self) {
        self.subscribers.lock().clear();
    }
}
