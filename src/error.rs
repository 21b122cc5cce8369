//! 错误分类 - 各组件共享的领域错误

use thiserror::Error;

/// 领域错误
///
/// 认证类错误只通过 IPC 响应上报，不跨进程抛出；
/// 配置与投递错误只记录日志，不会中断消息摄取。
#[derive(Debug, Error)]
pub enum SentinelError {
    /// 没有可用凭据，需要通过 IPC 完成认证
    #[error("authorization required")]
    AuthRequired,

    /// 认证步骤被平台拒绝（验证码错误、过期等）
    #[error("auth step rejected: {0}")]
    AuthRejected(String),

    /// 连接中断（可重试）
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Session Owner 已退出，命令无法送达
    #[error("session owner stopped")]
    SessionClosed,

    /// 持久化失败（会话或消息存储）
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// 单个目标投递失败
    #[error("delivery to {destination} failed: {reason}")]
    DeliveryFailure { destination: String, reason: String },

    /// 配置重载被拒绝，沿用旧配置
    #[error("config reload rejected: {0}")]
    ReloadFailure(String),

    /// IPC 请求方等待超时
    #[error("request {request_id} timed out")]
    Timeout { request_id: String },

    #[error("broker error: {0}")]
    Broker(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SentinelError {
    /// 是否为可重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        match self {
            SentinelError::ConnectionLost(_) | SentinelError::Timeout { .. } => true,
            SentinelError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SentinelError>;
