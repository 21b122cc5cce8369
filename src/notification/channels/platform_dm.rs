//! 私信目标 - 通过 Session Owner 用账号自身发送私信

use async_trait::async_trait;

use crate::error::Result;
use crate::notification::channel::{AlertDestination, AlertMessage, DestinationKind, SendResult};
use crate::session::SessionHandle;

/// 会话私信目标
///
/// 不直接持有平台连接，所有写操作经由 `SessionHandle` 交给 Session Owner。
pub struct PlatformDmDestination {
    session: SessionHandle,
    target: String,
}

impl PlatformDmDestination {
    pub fn new(session: SessionHandle, target: impl Into<String>) -> Self {
        Self {
            session,
            target: target.into(),
        }
    }
}

#[async_trait]
impl AlertDestination for PlatformDmDestination {
    fn name(&self) -> &str {
        "dm"
    }

    fn kind(&self) -> DestinationKind {
        DestinationKind::Dm
    }

    async fn send(&self, message: &AlertMessage) -> Result<SendResult> {
        self.session
            .send_message(self.target.clone(), message.text())
            .await?;
        Ok(SendResult::Sent)
    }
}
