//! Bot API 目标 - 通过 Bot HTTP 接口把告警发到频道

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::DeliverySettings;
use crate::error::{Result, SentinelError};
use crate::notification::channel::{AlertDestination, AlertMessage, DestinationKind, SendResult};

/// 单条消息的长度上限（字符）
const MAX_MESSAGE_CHARS: usize = 4096;

/// sendMessage 请求体
#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    disable_web_page_preview: bool,
}

/// Bot API 响应
#[derive(Debug, Deserialize)]
struct BotApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Bot API 频道目标
#[derive(Debug)]
pub struct BotApiDestination {
    client: Client,
    base_url: String,
    token: String,
    chat_id: String,
}

impl BotApiDestination {
    /// 需要 bot token 和告警频道都已配置
    pub fn new(settings: &DeliverySettings) -> Result<Self> {
        let token = settings
            .bot_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SentinelError::Config("bot_token is required for channel alerts".to_string()))?;
        let chat_id = settings
            .alert_channel
            .clone()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| SentinelError::Config("alert_channel is required for channel alerts".to_string()))?;

        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;

        Ok(Self {
            client,
            base_url: settings.bot_api_url.trim_end_matches('/').to_string(),
            token,
            chat_id,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/bot{}/sendMessage", self.base_url, self.token)
    }
}

#[async_trait]
impl AlertDestination for BotApiDestination {
    fn name(&self) -> &str {
        "channel"
    }

    fn kind(&self) -> DestinationKind {
        DestinationKind::Channel
    }

    async fn send(&self, message: &AlertMessage) -> Result<SendResult> {
        let text: String = message.text().chars().take(MAX_MESSAGE_CHARS).collect();
        let payload = SendMessageRequest {
            chat_id: &self.chat_id,
            text: &text,
            disable_web_page_preview: true,
        };

        let response = self.client.post(self.endpoint()).json(&payload).send().await?;
        let status = response.status();

        // 限流和服务端错误可以重试
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(SentinelError::ConnectionLost(format!("bot API returned {}", status)));
        }

        let body: BotApiResponse = response.json().await?;
        if body.ok {
            debug!(destination = "channel", chat = %self.chat_id, "Alert sent via bot API");
            Ok(SendResult::Sent)
        } else {
            Ok(SendResult::Failed(
                body.description
                    .unwrap_or_else(|| format!("bot API returned {}", status)),
            ))
        }
    }
}
