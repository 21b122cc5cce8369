//! 告警投递 - 统一管理所有告警目标
//!
//! # 设计目标
//! 1. 统一接口：所有目标实现 `AlertDestination` trait
//! 2. 目标解耦：每个目标独立投递、独立重试，互不影响
//! 3. 按模式路由：`AlertDispatcher` 根据 `ALERT_MODE` 选择目标，审计日志总是附加
//!
//! # 使用示例
//! ```ignore
//! use chat_sentinel::notification::{AlertDispatcher, LocalFileDestination, RetryPolicy};
//!
//! let mut dispatcher = AlertDispatcher::new(RetryPolicy::default(), metrics);
//! dispatcher.register(Arc::new(LocalFileDestination::new("alerts.jsonl")));
//! let report = dispatcher.dispatch(AlertMode::Dm, &format_alert(&record)).await;
//! ```

pub mod channel;
pub mod channels;
pub mod dispatcher;
pub mod formatter;

pub use channel::{AlertDestination, AlertKind, AlertMessage, DestinationKind, SendResult};
pub use channels::{BotApiDestination, LocalFileDestination, PlatformDmDestination};
pub use dispatcher::{AlertDispatcher, DestinationOutcome, DispatchReport, RetryPolicy};
pub use formatter::{format_alert, format_anomaly, format_digest};
