//! Chat Sentinel - 监视聊天账号，为消息评分并对重要消息告警

pub mod admission;
pub mod anomaly;
pub mod broker;
pub mod config;
pub mod digest;
pub mod error;
pub mod ipc;
pub mod metrics;
pub mod model;
pub mod notification;
pub mod pipeline;
pub mod scoring;
pub mod session;
pub mod store;
pub mod stream;
pub mod worker;

pub use admission::{Admission, RateLimiter};
pub use anomaly::{AnomalyDetector, AnomalyFlag, AnomalyMetric};
pub use broker::{Broker, EntryId, FileBroker, MemoryBroker, StreamEntry};
pub use config::{ActiveConfig, ConfigHandle, ConfigReloadWatcher, RuntimeConfig, Settings};
pub use digest::{Digest, DigestPeriod, DigestScheduler};
pub use error::{Result, SentinelError};
pub use ipc::{AuthState, AuthStatus, IpcGateway, IpcRequest, IpcResponse};
pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics, TracingMetrics};
pub use model::{FeedbackRecord, IncomingMessage, MessageKey, MessageRecord};
pub use pipeline::{Pipeline, ProcessOutcome};
pub use scoring::{ScoreBreakdown, ScoringEngine};
pub use session::{SessionHandle, SessionOwner};
pub use store::{InsertOutcome, MessageStore};
pub use stream::{BatchReport, MessageHandler, StreamConsumer};
