//! 具体告警目标实现

pub mod bot_api;
pub mod local_file;
pub mod platform_dm;

pub use bot_api::BotApiDestination;
pub use local_file::{AuditRecord, LocalFileDestination};
pub use platform_dm::PlatformDmDestination;
