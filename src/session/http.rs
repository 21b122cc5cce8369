//! HTTP 平台客户端 - 通过本地网关访问聊天平台
//!
//! 网关负责平台协议本身，这里只做 JSON 请求与错误分类：
//! - 连接失败、5xx → `ConnectionLost`（可重试）
//! - 401 / 认证类错误 → `AuthRejected`

use super::platform::{
    AuthProgress, AuthStep, ConnectOutcome, Dialog, Participant, PlatformClient, UserInfo,
};
use super::store::SessionState;
use crate::error::{Result, SentinelError};
use crate::model::IncomingMessage;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct ConnectResponse {
    authorized: bool,
    #[serde(default)]
    account: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExportResponse {
    #[serde(default)]
    session: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    #[serde(default)]
    messages: Vec<IncomingMessage>,
    #[serde(default)]
    next_offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    target: &'a str,
    text: &'a str,
}

/// 基于 HTTP 网关的平台客户端
pub struct HttpPlatform {
    client: Client,
    base_url: String,
    /// 已确认的更新偏移
    offset: Option<i64>,
}

impl HttpPlatform {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            offset: None,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(classify_transport)?;
        decode(response).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(classify_transport)?;
        decode(response).await
    }
}

fn classify_transport(e: reqwest::Error) -> SentinelError {
    if e.is_connect() || e.is_timeout() {
        SentinelError::ConnectionLost(e.to_string())
    } else {
        SentinelError::Http(e)
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let reason = response
        .json::<ErrorBody>()
        .await
        .ok()
        .and_then(|b| b.error)
        .unwrap_or_else(|| status.to_string());
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SentinelError::AuthRejected(reason),
        StatusCode::BAD_REQUEST => SentinelError::AuthRejected(reason),
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            SentinelError::ConnectionLost(reason)
        }
        _ => SentinelError::ConnectionLost(format!("gateway returned {}: {}", status, reason)),
    })
}

#[async_trait]
impl PlatformClient for HttpPlatform {
    async fn connect(&mut self, saved: Option<&SessionState>) -> Result<ConnectOutcome> {
        let body = serde_json::json!({ "session": saved.map(|s| s.blob.as_str()) });
        let response: ConnectResponse = self.post("/session/connect", &body).await?;
        debug!(authorized = response.authorized, "Gateway connect completed");
        Ok(match (response.authorized, response.account) {
            (true, Some(account)) => ConnectOutcome::Authorized { account },
            (true, None) => ConnectOutcome::Authorized {
                account: "unknown".to_string(),
            },
            (false, _) => ConnectOutcome::NeedsAuth,
        })
    }

    async fn submit_auth_step(&mut self, step: &AuthStep) -> Result<AuthProgress> {
        self.post("/auth/step", step).await
    }

    async fn export_session(&mut self) -> Result<Option<String>> {
        let response: ExportResponse = self.post("/session/export", &serde_json::json!({})).await?;
        Ok(response.session)
    }

    async fn fetch_updates(&mut self) -> Result<Vec<IncomingMessage>> {
        let path = match self.offset {
            Some(offset) => format!("/updates?offset={}", offset),
            None => "/updates".to_string(),
        };
        let response: UpdatesResponse = self.get(&path).await?;
        if let Some(next) = response.next_offset {
            self.offset = Some(next);
        }
        Ok(response.messages)
    }

    async fn fetch_dialogs(&mut self) -> Result<Vec<Dialog>> {
        self.get("/dialogs").await
    }

    async fn fetch_participants(&mut self, chat_id: i64) -> Result<Vec<Participant>> {
        self.get(&format!("/chats/{}/participants", chat_id)).await
    }

    async fn fetch_user(&mut self, user_id: i64) -> Result<UserInfo> {
        self.get(&format!("/users/{}", user_id)).await
    }

    async fn send_message(&mut self, target: &str, text: &str) -> Result<()> {
        let _: serde_json::Value = self.post("/messages", &SendRequest { target, text }).await?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let _: serde_json::Value = self
            .post("/session/disconnect", &serde_json::json!({}))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joining() {
        let platform = HttpPlatform::new("http://127.0.0.1:8787/", Duration::from_secs(1)).unwrap();
        assert_eq!(platform.url("/dialogs"), "http://127.0.0.1:8787/dialogs");
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_transient() {
        // 端口 9 (discard) 通常没有监听
        let mut platform = HttpPlatform::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let err = platform.connect(None).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_updates_response_defaults() {
        let parsed: UpdatesResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.messages.is_empty());
        assert!(parsed.next_offset.is_none());
    }
}
