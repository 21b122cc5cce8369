//! 平台客户端抽象 - Session Owner 独占的连接接口

use crate::error::Result;
use crate::model::IncomingMessage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::store::SessionState;

/// 连接结果
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectOutcome {
    /// 凭据有效，已授权
    Authorized { account: String },
    /// 已连接但需要完成认证
    NeedsAuth,
}

/// 认证步骤（通过 IPC 委托提交）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AuthStep {
    Phone(String),
    Code(String),
    Password(String),
}

impl AuthStep {
    pub fn name(&self) -> &'static str {
        match self {
            AuthStep::Phone(_) => "phone",
            AuthStep::Code(_) => "code",
            AuthStep::Password(_) => "password",
        }
    }

    /// 由 CLI 参数构造
    pub fn parse(kind: &str, value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        match kind {
            "phone" => Some(AuthStep::Phone(value)),
            "code" => Some(AuthStep::Code(value)),
            "password" => Some(AuthStep::Password(value)),
            _ => None,
        }
    }
}

/// 认证进度
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AuthProgress {
    CodeRequired,
    PasswordRequired,
    Authorized { account: String },
}

/// 会话列表项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dialog {
    pub chat_id: i64,
    pub title: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub unread: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: i64,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_id: i64,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub is_bot: bool,
}

/// 平台连接
///
/// 只有 Session Owner 持有实现；其他组件通过 `SessionHandle` 或 IPC 间接访问。
#[async_trait]
pub trait PlatformClient: Send {
    /// 用已保存的会话（如有）建立或恢复连接
    async fn connect(&mut self, saved: Option<&SessionState>) -> Result<ConnectOutcome>;

    /// 提交一个认证步骤；验证码错误等返回 `AuthRejected`
    async fn submit_auth_step(&mut self, step: &AuthStep) -> Result<AuthProgress>;

    /// 导出当前会话，未授权时返回 None
    async fn export_session(&mut self) -> Result<Option<String>>;

    /// 拉取新消息
    async fn fetch_updates(&mut self) -> Result<Vec<IncomingMessage>>;

    async fn fetch_dialogs(&mut self) -> Result<Vec<Dialog>>;

    async fn fetch_participants(&mut self, chat_id: i64) -> Result<Vec<Participant>>;

    async fn fetch_user(&mut self, user_id: i64) -> Result<UserInfo>;

    async fn send_message(&mut self, target: &str, text: &str) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;
}
