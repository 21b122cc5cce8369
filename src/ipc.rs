//! IPC 网关 - 展示进程与 Worker 之间的请求/响应通道
//!
//! 所有数据都放在共享 Broker 中：
//! - `ipc:queue:<topic>`：按主题排队的请求
//! - `ipc:pending:<id>`：请求方仍在等待的标记（与请求同 TTL）
//! - `ipc:response:<id>`：响应，只写一次，短 TTL
//! - `ipc:status`：授权/连接状态
//!
//! 请求方超时后删除 pending 标记，迟到的响应直接丢弃。

use crate::broker::Broker;
use crate::config::IpcSettings;
use crate::error::{Result, SentinelError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

pub mod topics {
    /// 凭据委托队列
    pub const AUTH: &str = "auth";
    pub const DIALOGS: &str = "dialogs";
    pub const PARTICIPANTS: &str = "participants";
    pub const USER: &str = "user";
    pub const FEEDBACK: &str = "feedback";
}

const STATUS_KEY: &str = "ipc:status";

fn queue_key(topic: &str) -> String {
    format!("ipc:queue:{}", topic)
}

fn pending_key(id: &str) -> String {
    format!("ipc:pending:{}", id)
}

fn response_key(id: &str) -> String {
    format!("ipc:response:{}", id)
}

/// 排队中的请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcRequest {
    pub id: String,
    pub topic: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// 请求的响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcResponse {
    pub ok: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IpcResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: Value::Null,
            error: Some(message.into()),
        }
    }
}

/// 授权状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Connecting,
    AuthRequired,
    CodeRequired,
    PasswordRequired,
    Authorized,
    Disconnected,
}

impl AuthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthState::Connecting => "connecting",
            AuthState::AuthRequired => "auth_required",
            AuthState::CodeRequired => "code_required",
            AuthState::PasswordRequired => "password_required",
            AuthState::Authorized => "authorized",
            AuthState::Disconnected => "disconnected",
        }
    }
}

/// 状态快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthStatus {
    pub state: AuthState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    /// 最近一次认证被拒绝的原因
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl AuthStatus {
    pub fn new(state: AuthState) -> Self {
        Self {
            state,
            account: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// IPC 网关
#[derive(Clone)]
pub struct IpcGateway {
    broker: Arc<dyn Broker>,
    request_ttl: Duration,
    response_ttl: Duration,
    poll_interval: Duration,
}

impl IpcGateway {
    pub fn new(broker: Arc<dyn Broker>, settings: &IpcSettings) -> Self {
        Self {
            broker,
            request_ttl: Duration::from_secs(settings.request_ttl_secs.max(1)),
            response_ttl: Duration::from_secs(settings.response_ttl_secs.max(1)),
            poll_interval: Duration::from_millis(settings.poll_interval_ms.max(10)),
        }
    }

    /// 提交请求，返回请求 ID
    pub fn submit(&self, topic: &str, payload: Value) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(self.request_ttl)
                .map_err(|e| SentinelError::Config(e.to_string()))?;
        let request = IpcRequest {
            id: id.clone(),
            topic: topic.to_string(),
            payload,
            created_at: now,
            expires_at,
        };

        self.broker
            .set(&pending_key(&id), Value::Bool(true), Some(self.request_ttl))?;
        self.broker
            .push(&queue_key(topic), serde_json::to_value(&request)?)?;
        debug!(request_id = %id, topic, "IPC request submitted");
        Ok(id)
    }

    /// 轮询等待响应；超时后撤销 pending 标记
    pub async fn await_response(&self, request_id: &str, timeout: Duration) -> Result<IpcResponse> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(value) = self.broker.get(&response_key(request_id))? {
                self.broker.delete(&response_key(request_id))?;
                self.broker.delete(&pending_key(request_id))?;
                return Ok(serde_json::from_value(value)?);
            }
            if tokio::time::Instant::now() >= deadline {
                self.broker.delete(&pending_key(request_id))?;
                return Err(SentinelError::Timeout {
                    request_id: request_id.to_string(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// 提交并等待
    pub async fn request(&self, topic: &str, payload: Value, timeout: Duration) -> Result<IpcResponse> {
        let id = self.submit(topic, payload)?;
        self.await_response(&id, timeout).await
    }

    /// 取出下一个未过期、请求方仍在等待的请求
    pub fn next_request(&self, topic: &str) -> Result<Option<IpcRequest>> {
        let now = Utc::now();
        while let Some(value) = self.broker.pop(&queue_key(topic))? {
            let request: IpcRequest = match serde_json::from_value(value) {
                Ok(r) => r,
                Err(e) => {
                    warn!(topic, error = %e, "Dropping malformed IPC request");
                    continue;
                }
            };
            if request.expires_at <= now {
                debug!(request_id = %request.id, topic, "Skipping expired IPC request");
                continue;
            }
            if self.broker.get(&pending_key(&request.id))?.is_none() {
                debug!(request_id = %request.id, topic, "Requester gone, skipping");
                continue;
            }
            return Ok(Some(request));
        }
        Ok(None)
    }

    /// 写入响应；请求方已放弃时丢弃并返回 false
    pub fn respond(&self, request_id: &str, response: &IpcResponse) -> Result<bool> {
        if self.broker.get(&pending_key(request_id))?.is_none() {
            debug!(request_id, "Discarding late IPC response");
            return Ok(false);
        }
        let written = self.broker.set_nx(
            &response_key(request_id),
            serde_json::to_value(response)?,
            Some(self.response_ttl),
        )?;
        if !written {
            warn!(request_id, "IPC response already written");
        }
        Ok(written)
    }

    pub fn publish_status(&self, status: &AuthStatus) -> Result<()> {
        self.broker
            .set(STATUS_KEY, serde_json::to_value(status)?, None)
    }

    pub fn read_status(&self) -> Result<Option<AuthStatus>> {
        match self.broker.get(STATUS_KEY)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use serde_json::json;

    fn gateway() -> IpcGateway {
        let settings = IpcSettings {
            request_ttl_secs: 60,
            response_ttl_secs: 30,
            poll_interval_ms: 10,
        };
        IpcGateway::new(Arc::new(MemoryBroker::new()), &settings)
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let ipc = gateway();
        let id = ipc.submit(topics::DIALOGS, json!({})).unwrap();

        let request = ipc.next_request(topics::DIALOGS).unwrap().unwrap();
        assert_eq!(request.id, id);
        assert!(ipc.respond(&id, &IpcResponse::ok(json!([1, 2]))).unwrap());

        let response = ipc
            .await_response(&id, Duration::from_millis(200))
            .await
            .unwrap();
        assert!(response.ok);
        assert_eq!(response.data, json!([1, 2]));
    }

    #[tokio::test]
    async fn test_timeout_then_late_response_is_discarded() {
        let ipc = gateway();
        let id = ipc.submit(topics::PARTICIPANTS, json!({"chat_id": 1})).unwrap();

        let err = ipc
            .await_response(&id, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, SentinelError::Timeout { .. }));

        // 服务端不会再取到这个请求，迟到的响应被丢弃
        assert!(ipc.next_request(topics::PARTICIPANTS).unwrap().is_none());
        assert!(!ipc.respond(&id, &IpcResponse::ok(json!(null))).unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_requests_do_not_cross() {
        let ipc = gateway();
        let a = ipc.submit(topics::USER, json!({"user_id": 1})).unwrap();
        let b = ipc.submit(topics::USER, json!({"user_id": 2})).unwrap();

        while let Some(request) = ipc.next_request(topics::USER).unwrap() {
            let user = request.payload["user_id"].clone();
            ipc.respond(&request.id, &IpcResponse::ok(user)).unwrap();
        }

        let rb = ipc.await_response(&b, Duration::from_millis(100)).await.unwrap();
        let ra = ipc.await_response(&a, Duration::from_millis(100)).await.unwrap();
        assert_eq!(ra.data, json!(1));
        assert_eq!(rb.data, json!(2));
    }

    #[test]
    fn test_response_written_once() {
        let ipc = gateway();
        let id = ipc.submit(topics::AUTH, json!({})).unwrap();
        assert!(ipc.respond(&id, &IpcResponse::ok(json!(1))).unwrap());
        assert!(!ipc.respond(&id, &IpcResponse::ok(json!(2))).unwrap());
    }

    #[test]
    fn test_status_roundtrip() {
        let ipc = gateway();
        assert!(ipc.read_status().unwrap().is_none());
        let mut status = AuthStatus::new(AuthState::AuthRequired);
        status.last_error = Some("PHONE_CODE_INVALID".to_string());
        ipc.publish_status(&status).unwrap();
        let read = ipc.read_status().unwrap().unwrap();
        assert_eq!(read.state, AuthState::AuthRequired);
        assert_eq!(read.last_error.as_deref(), Some("PHONE_CODE_INVALID"));
    }
}
