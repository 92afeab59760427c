//! 事件模块
//!
//! - `types.rs`: 上传事件类型
//! - `bus.rs`: 事件总线（观察者注册表）
//! - `throttle.rs`: 进度事件节流

mod bus;
mod throttle;
mod types;

pub use bus::*;
pub use throttle::*;
pub use types::*;
