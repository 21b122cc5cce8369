//! Session Owner - 平台连接与凭据的唯一持有者
//!
//! 以单个 task 运行，负责：
//! - 连接/重连（瞬时错误指数退避）
//! - 通过 IPC 的 auth 队列接受凭据步骤
//! - 定期持久化会话，并在任何断开路径之前再持久化一次
//! - 服务特权读取请求（带处理超时）
//! - 把新消息写入摄取流（写入失败的部分留在缓冲区，下一轮重试）
//!
//! 其他组件只能通过 `SessionHandle` 发送命令，不存在共享的连接句柄。

use super::platform::{AuthProgress, AuthStep, ConnectOutcome, Dialog, Participant, PlatformClient};
use super::store::{CredentialStore, SessionState};
use crate::broker::Broker;
use crate::config::SessionSettings;
use crate::error::{Result, SentinelError};
use crate::ipc::{topics, AuthState, AuthStatus, IpcGateway, IpcRequest, IpcResponse};
use crate::metrics::MetricsSink;
use crate::model::IncomingMessage;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 每次轮询每个主题最多处理的请求数
const MAX_REQUESTS_PER_POLL: usize = 16;

/// 发给 Session Owner 的命令
#[derive(Debug)]
pub enum SessionCommand {
    Persist {
        reply: oneshot::Sender<Result<()>>,
    },
    FetchDialogs {
        reply: oneshot::Sender<Result<Vec<Dialog>>>,
    },
    FetchParticipants {
        chat_id: i64,
        reply: oneshot::Sender<Result<Vec<Participant>>>,
    },
    SendMessage {
        target: String,
        text: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Session Owner 的命令句柄（可克隆）
#[derive(Clone, Debug)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// 创建句柄与对应的命令接收端
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SessionCommand>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> SessionCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SentinelError::SessionClosed)?;
        rx.await.map_err(|_| SentinelError::SessionClosed)?
    }

    pub async fn persist(&self) -> Result<()> {
        self.call(|reply| SessionCommand::Persist { reply }).await
    }

    pub async fn fetch_dialogs(&self) -> Result<Vec<Dialog>> {
        self.call(|reply| SessionCommand::FetchDialogs { reply }).await
    }

    pub async fn fetch_participants(&self, chat_id: i64) -> Result<Vec<Participant>> {
        self.call(|reply| SessionCommand::FetchParticipants { chat_id, reply })
            .await
    }

    pub async fn send_message(&self, target: String, text: String) -> Result<()> {
        self.call(|reply| SessionCommand::SendMessage {
            target,
            text,
            reply,
        })
        .await
    }
}

#[derive(Deserialize)]
struct ParticipantsRequest {
    chat_id: i64,
}

#[derive(Deserialize)]
struct UserRequest {
    user_id: i64,
}

/// Session Owner
pub struct SessionOwner {
    client: Box<dyn PlatformClient>,
    credentials: CredentialStore,
    ipc: IpcGateway,
    broker: Arc<dyn Broker>,
    stream: String,
    settings: SessionSettings,
    metrics: Arc<dyn MetricsSink>,
    status: AuthStatus,
    connected: bool,
    /// 已从平台拉取但尚未写入流的消息
    backlog: VecDeque<IncomingMessage>,
}

impl SessionOwner {
    pub fn new(
        client: Box<dyn PlatformClient>,
        credentials: CredentialStore,
        ipc: IpcGateway,
        broker: Arc<dyn Broker>,
        stream: impl Into<String>,
        settings: SessionSettings,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            client,
            credentials,
            ipc,
            broker,
            stream: stream.into(),
            settings,
            metrics,
            status: AuthStatus::new(AuthState::Disconnected),
            connected: false,
            backlog: VecDeque::new(),
        }
    }

    fn authorized(&self) -> bool {
        self.connected && self.status.state == AuthState::Authorized
    }

    fn set_state(&mut self, state: AuthState) {
        self.status.state = state;
        self.status.updated_at = Utc::now();
        if let Err(e) = self.ipc.publish_status(&self.status) {
            warn!(error = %e, state = state.as_str(), "Failed to publish session status");
        }
        self.metrics.gauge(
            "session_authorized",
            &[],
            if state == AuthState::Authorized { 1.0 } else { 0.0 },
        );
        self.metrics
            .gauge("session_connected", &[], if self.connected { 1.0 } else { 0.0 });
    }

    /// 运行直到取消；退出前总会先持久化再断开
    pub async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>, cancel: CancellationToken) {
        if let Err(e) = self.connect(&cancel).await {
            warn!(error = %e, "Initial connect did not complete");
        }

        let persist_every = self.settings.persist_interval();
        let mut persist_tick =
            tokio::time::interval_at(tokio::time::Instant::now() + persist_every, persist_every);
        let mut ipc_tick =
            tokio::time::interval(Duration::from_millis(self.settings.ipc_poll_ms.max(10)));
        let mut update_tick =
            tokio::time::interval(Duration::from_secs(self.settings.update_poll_secs.max(1)));
        for ticker in [&mut persist_tick, &mut ipc_tick, &mut update_tick] {
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(command) = commands.recv() => self.handle_command(command).await,
                _ = persist_tick.tick() => {
                    if self.authorized() {
                        let _ = self.persist().await;
                    }
                }
                _ = ipc_tick.tick() => self.serve_ipc().await,
                _ = update_tick.tick() => {
                    self.flush_backlog();
                    if !self.connected {
                        if let Err(e) = self.connect(&cancel).await {
                            debug!(error = %e, "Reconnect attempt failed");
                        }
                    } else if self.authorized() {
                        self.pump_updates().await;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// 加载凭据并连接
    pub async fn connect(&mut self, cancel: &CancellationToken) -> Result<()> {
        let saved = match self.credentials.load() {
            Ok(saved) => saved,
            Err(e) => {
                warn!(error = %e, "Stored session unreadable, starting without it");
                None
            }
        };
        self.set_state(AuthState::Connecting);

        let attempts = self.settings.reconnect_attempts.max(1);
        let mut backoff = Duration::from_millis(self.settings.reconnect_backoff_ms.max(1));
        for attempt in 1..=attempts {
            match self.client.connect(saved.as_ref()).await {
                Ok(ConnectOutcome::Authorized { account }) => {
                    info!(account = %account, "Session authorized");
                    self.connected = true;
                    self.status.account = Some(account);
                    self.status.last_error = None;
                    self.set_state(AuthState::Authorized);
                    return Ok(());
                }
                Ok(ConnectOutcome::NeedsAuth) => {
                    self.connected = true;
                    warn!("No valid session, waiting for credentials over IPC");
                    self.set_state(AuthState::AuthRequired);
                    return Err(SentinelError::AuthRequired);
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(attempt, wait_ms = backoff.as_millis() as u64, error = %e, "Connect failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(SentinelError::ConnectionLost("cancelled during connect".to_string()));
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
                Err(e) => {
                    error!(attempt, error = %e, "Connect failed");
                    self.connected = false;
                    self.set_state(AuthState::Disconnected);
                    return Err(e);
                }
            }
        }
        Err(SentinelError::ConnectionLost("connect attempts exhausted".to_string()))
    }

    /// 处理一个认证步骤，结果只通过响应和状态上报
    pub async fn submit_auth_step(&mut self, step: &AuthStep) -> IpcResponse {
        if !self.connected {
            return IpcResponse::error("not connected to platform");
        }
        let timeout = self.settings.request_timeout();
        match tokio::time::timeout(timeout, self.client.submit_auth_step(step)).await {
            Ok(Ok(AuthProgress::Authorized { account })) => {
                info!(account = %account, step = step.name(), "Authorization completed");
                self.status.account = Some(account.clone());
                self.status.last_error = None;
                self.set_state(AuthState::Authorized);
                let _ = self.persist().await;
                IpcResponse::ok(json!({"state": "authorized", "account": account}))
            }
            Ok(Ok(AuthProgress::CodeRequired)) => {
                self.status.last_error = None;
                self.set_state(AuthState::CodeRequired);
                IpcResponse::ok(json!({"state": "code_required"}))
            }
            Ok(Ok(AuthProgress::PasswordRequired)) => {
                self.status.last_error = None;
                self.set_state(AuthState::PasswordRequired);
                IpcResponse::ok(json!({"state": "password_required"}))
            }
            Ok(Err(SentinelError::AuthRejected(reason))) => {
                warn!(step = step.name(), reason = %reason, "Auth step rejected");
                self.status.last_error = Some(reason.clone());
                let state = self.status.state;
                self.set_state(state);
                IpcResponse::error(reason)
            }
            Ok(Err(e)) => {
                warn!(step = step.name(), error = %e, "Auth step failed");
                IpcResponse::error(e.to_string())
            }
            Err(_) => IpcResponse::error(format!("{} step timed out", step.name())),
        }
    }

    /// 导出并保存会话；失败只记录，不影响调用方流程
    pub async fn persist(&mut self) -> Result<()> {
        let result = async {
            match self.client.export_session().await? {
                Some(blob) => {
                    let state = SessionState {
                        blob,
                        account: self.status.account.clone(),
                        saved_at: Utc::now(),
                    };
                    self.credentials.save(&state)
                }
                None => Ok(()),
            }
        }
        .await
        .map_err(|e| match e {
            SentinelError::PersistenceFailure(_) => e,
            other => SentinelError::PersistenceFailure(other.to_string()),
        });

        match &result {
            Ok(()) => debug!(path = %self.credentials.path().display(), "Session persisted"),
            Err(e) => error!(error = %e, "Session persist failed"),
        }
        result
    }

    async fn shutdown(&mut self) {
        info!("Session owner shutting down");
        self.flush_backlog();
        if !self.backlog.is_empty() {
            error!(count = self.backlog.len(), stream = %self.stream, "Dropping updates that could not be appended");
        }
        // 断开前必须先持久化
        let _ = self.persist().await;
        if self.connected {
            if let Err(e) = self.client.disconnect().await {
                warn!(error = %e, "Disconnect failed");
            }
        }
        self.connected = false;
        self.set_state(AuthState::Disconnected);
    }

    fn require_authorized(&self) -> Result<()> {
        if self.authorized() {
            Ok(())
        } else {
            Err(SentinelError::AuthRequired)
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Persist { reply } => {
                let _ = reply.send(self.persist().await);
            }
            SessionCommand::FetchDialogs { reply } => {
                let result = match self.require_authorized() {
                    Ok(()) => {
                        let timeout = self.settings.request_timeout();
                        run_timed("dialogs", timeout, self.client.fetch_dialogs()).await
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            SessionCommand::FetchParticipants { chat_id, reply } => {
                let result = match self.require_authorized() {
                    Ok(()) => {
                        let timeout = self.settings.request_timeout();
                        run_timed("participants", timeout, self.client.fetch_participants(chat_id)).await
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            SessionCommand::SendMessage {
                target,
                text,
                reply,
            } => {
                let result = match self.require_authorized() {
                    Ok(()) => {
                        let timeout = self.settings.request_timeout();
                        run_timed("send_message", timeout, self.client.send_message(&target, &text))
                            .await
                    }
                    Err(e) => Err(e),
                };
                if let Err(e) = &result {
                    if e.is_transient() {
                        self.mark_connection_lost(e);
                    }
                }
                let _ = reply.send(result);
            }
        }
    }

    fn mark_connection_lost(&mut self, e: &SentinelError) {
        if matches!(e, SentinelError::ConnectionLost(_)) && self.connected {
            warn!(error = %e, "Platform connection lost");
            self.connected = false;
            self.set_state(AuthState::Disconnected);
        }
    }

    /// 服务所有 IPC 主题（feedback 由 Worker 处理）
    async fn serve_ipc(&mut self) {
        for topic in [topics::AUTH, topics::DIALOGS, topics::PARTICIPANTS, topics::USER] {
            for _ in 0..MAX_REQUESTS_PER_POLL {
                let request = match self.ipc.next_request(topic) {
                    Ok(Some(request)) => request,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(topic, error = %e, "Failed to read IPC queue");
                        break;
                    }
                };
                let response = self.handle_request(&request).await;
                match self.ipc.respond(&request.id, &response) {
                    Ok(true) => debug!(request_id = %request.id, topic, ok = response.ok, "IPC request served"),
                    Ok(false) => {}
                    Err(e) => warn!(request_id = %request.id, error = %e, "Failed to write IPC response"),
                }
            }
        }
    }

    async fn handle_request(&mut self, request: &IpcRequest) -> IpcResponse {
        if request.topic == topics::AUTH {
            return match serde_json::from_value::<AuthStep>(request.payload.clone()) {
                Ok(step) => self.submit_auth_step(&step).await,
                Err(e) => IpcResponse::error(format!("invalid auth step: {}", e)),
            };
        }

        if let Err(e) = self.require_authorized() {
            return IpcResponse::error(e.to_string());
        }

        let timeout = self.settings.request_timeout();
        let id = request.id.as_str();
        let result = match request.topic.as_str() {
            topics::DIALOGS => run_timed(id, timeout, self.client.fetch_dialogs())
                .await
                .and_then(to_json),
            topics::PARTICIPANTS => {
                match serde_json::from_value::<ParticipantsRequest>(request.payload.clone()) {
                    Ok(req) => run_timed(id, timeout, self.client.fetch_participants(req.chat_id))
                        .await
                        .and_then(to_json),
                    Err(e) => Err(SentinelError::Json(e)),
                }
            }
            topics::USER => match serde_json::from_value::<UserRequest>(request.payload.clone()) {
                Ok(req) => run_timed(id, timeout, self.client.fetch_user(req.user_id))
                    .await
                    .and_then(to_json),
                Err(e) => Err(SentinelError::Json(e)),
            },
            other => Err(SentinelError::Config(format!("unknown topic {}", other))),
        };

        match result {
            Ok(data) => IpcResponse::ok(data),
            Err(e) => {
                warn!(request_id = %request.id, topic = %request.topic, error = %e, "Privileged request failed");
                self.mark_connection_lost(&e);
                IpcResponse::error(e.to_string())
            }
        }
    }

    /// 拉取新消息写入摄取流
    ///
    /// 平台侧的 offset 在拉取时就已前移，所以写入失败的消息留在缓冲区，
    /// 缓冲区清空之前不再拉取。
    async fn pump_updates(&mut self) {
        if !self.backlog.is_empty() {
            return;
        }
        let timeout = self.settings.request_timeout();
        let updates = match run_timed("updates", timeout, self.client.fetch_updates()).await {
            Ok(updates) => updates,
            Err(e) => {
                warn!(error = %e, "Fetching updates failed");
                self.mark_connection_lost(&e);
                return;
            }
        };
        if updates.is_empty() {
            return;
        }
        self.backlog.extend(updates);
        self.flush_backlog();
    }

    /// 按顺序写入缓冲的消息，遇到写入失败即停止，返回写入数量
    fn flush_backlog(&mut self) -> u64 {
        let mut appended = 0u64;
        while let Some(message) = self.backlog.front() {
            let payload = match serde_json::to_value(message) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(chat_id = message.chat_id, msg_id = message.msg_id, error = %e, "Unserializable update");
                    self.backlog.pop_front();
                    continue;
                }
            };
            match self.broker.append(&self.stream, payload) {
                Ok(_) => {
                    self.backlog.pop_front();
                    appended += 1;
                }
                Err(e) => {
                    error!(
                        stream = %self.stream,
                        pending = self.backlog.len(),
                        error = %e,
                        "Failed to append update to stream, will retry"
                    );
                    break;
                }
            }
        }
        if appended > 0 {
            self.metrics.counter("messages_ingested_total", &[], appended);
            debug!(count = appended, pending = self.backlog.len(), "Updates appended to stream");
        }
        appended
    }
}

async fn run_timed<T>(
    name: &str,
    timeout: Duration,
    op: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, op)
        .await
        .map_err(|_| SentinelError::Timeout {
            request_id: name.to_string(),
        })?
}

fn to_json<T: serde::Serialize>(value: T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}
