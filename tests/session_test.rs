//! Session Owner 测试：凭据委托、持久化顺序、更新泵与 IPC

use async_trait::async_trait;
use chat_sentinel::config::{IpcSettings, SessionSettings};
use chat_sentinel::ipc::topics;
use chat_sentinel::session::{
    AuthProgress, AuthStep, ConnectOutcome, CredentialStore, Dialog, Participant, PlatformClient,
    SessionHandle, SessionOwner, SessionState, UserInfo,
};
use chat_sentinel::{
    AuthState, Broker, EntryId, IncomingMessage, InMemoryMetrics, IpcGateway, MemoryBroker, Result,
    SentinelError, StreamEntry,
};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

const STREAM: &str = "test:messages";

#[derive(Clone, Default)]
struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn push(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    fn events(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

struct MockPlatform {
    journal: Journal,
    authorized: bool,
    updates: Vec<IncomingMessage>,
    /// 前 N 次 connect 返回连接错误
    connect_failures: u32,
    /// 前 N 次 send_message 返回连接错误
    send_failures: u32,
    fail_export: bool,
}

impl MockPlatform {
    fn new(journal: Journal, authorized: bool) -> Self {
        Self {
            journal,
            authorized,
            updates: Vec::new(),
            connect_failures: 0,
            send_failures: 0,
            fail_export: false,
        }
    }
}

#[async_trait]
impl PlatformClient for MockPlatform {
    async fn connect(&mut self, saved: Option<&SessionState>) -> Result<ConnectOutcome> {
        self.journal.push("connect");
        if self.connect_failures > 0 {
            self.connect_failures -= 1;
            return Err(SentinelError::ConnectionLost("gateway unreachable".to_string()));
        }
        if self.authorized || saved.is_some() {
            self.authorized = true;
            Ok(ConnectOutcome::Authorized {
                account: "+100".to_string(),
            })
        } else {
            Ok(ConnectOutcome::NeedsAuth)
        }
    }

    async fn submit_auth_step(&mut self, step: &AuthStep) -> Result<AuthProgress> {
        self.journal.push(format!("auth:{}", step.name()));
        match step {
            AuthStep::Phone(_) => Ok(AuthProgress::CodeRequired),
            AuthStep::Code(code) if code == "12345" => {
                self.authorized = true;
                Ok(AuthProgress::Authorized {
                    account: "+100".to_string(),
                })
            }
            AuthStep::Code(_) => Err(SentinelError::AuthRejected("PHONE_CODE_INVALID".to_string())),
            AuthStep::Password(_) => Err(SentinelError::AuthRejected("PASSWORD_HASH_INVALID".to_string())),
        }
    }

    async fn export_session(&mut self) -> Result<Option<String>> {
        self.journal.push("export");
        if self.fail_export {
            return Err(SentinelError::PersistenceFailure("disk full".to_string()));
        }
        Ok(self.authorized.then(|| "session-blob".to_string()))
    }

    async fn fetch_updates(&mut self) -> Result<Vec<IncomingMessage>> {
        Ok(std::mem::take(&mut self.updates))
    }

    async fn fetch_dialogs(&mut self) -> Result<Vec<Dialog>> {
        Ok(vec![Dialog {
            chat_id: 1,
            title: "General".to_string(),
            kind: "group".to_string(),
            unread: 3,
        }])
    }

    async fn fetch_participants(&mut self, chat_id: i64) -> Result<Vec<Participant>> {
        Ok(vec![Participant {
            user_id: chat_id * 10,
            display_name: "Ada".to_string(),
            username: None,
        }])
    }

    async fn fetch_user(&mut self, user_id: i64) -> Result<UserInfo> {
        Ok(UserInfo {
            user_id,
            display_name: "Ada".to_string(),
            username: Some("ada".to_string()),
            is_bot: false,
        })
    }

    async fn send_message(&mut self, target: &str, _text: &str) -> Result<()> {
        self.journal.push(format!("send:{}", target));
        if self.send_failures > 0 {
            self.send_failures -= 1;
            return Err(SentinelError::ConnectionLost("socket closed".to_string()));
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.journal.push("disconnect");
        Ok(())
    }
}

fn session_settings() -> SessionSettings {
    SessionSettings {
        persist_interval_secs: 3600,
        request_timeout_secs: 2,
        update_poll_secs: 1,
        ipc_poll_ms: 10,
        reconnect_attempts: 1,
        ..Default::default()
    }
}

fn gateway(broker: Arc<dyn Broker>) -> IpcGateway {
    IpcGateway::new(
        broker,
        &IpcSettings {
            request_ttl_secs: 30,
            response_ttl_secs: 30,
            poll_interval_ms: 10,
        },
    )
}

struct Running {
    ipc: IpcGateway,
    broker: Arc<dyn Broker>,
    handle: SessionHandle,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

fn spawn_owner(platform: MockPlatform, credentials: CredentialStore) -> Running {
    spawn_owner_with(platform, credentials, session_settings(), Arc::new(MemoryBroker::new()))
}

fn spawn_owner_with(
    platform: MockPlatform,
    credentials: CredentialStore,
    settings: SessionSettings,
    broker: Arc<dyn Broker>,
) -> Running {
    let ipc = gateway(broker.clone());
    let owner = SessionOwner::new(
        Box::new(platform),
        credentials,
        ipc.clone(),
        broker.clone(),
        STREAM,
        settings,
        Arc::new(InMemoryMetrics::new()),
    );
    let (handle, commands) = SessionHandle::channel(8);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(owner.run(commands, cancel.clone()));
    Running {
        ipc,
        broker,
        handle,
        cancel,
        task,
    }
}

fn update(msg_id: i64) -> IncomingMessage {
    IncomingMessage {
        chat_id: 5,
        msg_id,
        sender_id: 1,
        chat_title: None,
        text: "hello".to_string(),
        reactions: 0,
        reply_count: 0,
        received_at: Utc::now(),
    }
}

async fn wait_for_len(broker: &dyn Broker, expected: usize) -> usize {
    let mut len = 0;
    for _ in 0..300 {
        len = broker.len(STREAM).unwrap();
        if len == expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    len
}

async fn wait_for_state(ipc: &IpcGateway, state: AuthState) {
    for _ in 0..200 {
        if ipc.read_status().unwrap().map(|s| s.state) == Some(state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session never reached {:?}", state);
}

#[tokio::test]
async fn test_shutdown_persists_before_disconnect() {
    let dir = tempdir().unwrap();
    let journal = Journal::default();
    let credentials = CredentialStore::open(dir.path().join("session.json")).unwrap();
    let running = spawn_owner(MockPlatform::new(journal.clone(), true), credentials);

    wait_for_state(&running.ipc, AuthState::Authorized).await;
    running.cancel.cancel();
    running.task.await.unwrap();

    let events = journal.events();
    let export = events.iter().position(|e| e == "export").expect("persist ran");
    let disconnect = events.iter().position(|e| e == "disconnect").expect("disconnect ran");
    assert!(export < disconnect);

    // 锁随 owner 释放，可以重新打开
    let store = CredentialStore::open(dir.path().join("session.json")).unwrap();
    assert_eq!(store.load().unwrap().unwrap().blob, "session-blob");
    assert_eq!(
        running.ipc.read_status().unwrap().unwrap().state,
        AuthState::Disconnected
    );
}

#[tokio::test]
async fn test_auth_delegated_over_ipc() {
    let dir = tempdir().unwrap();
    let journal = Journal::default();
    let credentials = CredentialStore::open(dir.path().join("session.json")).unwrap();
    let running = spawn_owner(MockPlatform::new(journal.clone(), false), credentials);
    wait_for_state(&running.ipc, AuthState::AuthRequired).await;

    let timeout = Duration::from_secs(2);
    let phone = running
        .ipc
        .request(topics::AUTH, json!({"kind": "phone", "value": "+100"}), timeout)
        .await
        .unwrap();
    assert!(phone.ok);
    assert_eq!(phone.data["state"], "code_required");

    let wrong = running
        .ipc
        .request(topics::AUTH, json!({"kind": "code", "value": "00000"}), timeout)
        .await
        .unwrap();
    assert!(!wrong.ok);
    let status = running.ipc.read_status().unwrap().unwrap();
    assert_eq!(status.state, AuthState::CodeRequired);
    assert_eq!(status.last_error.as_deref(), Some("PHONE_CODE_INVALID"));

    let right = running
        .ipc
        .request(topics::AUTH, json!({"kind": "code", "value": "12345"}), timeout)
        .await
        .unwrap();
    assert!(right.ok);
    assert_eq!(right.data["account"], "+100");
    assert_eq!(
        running.ipc.read_status().unwrap().unwrap().state,
        AuthState::Authorized
    );
    // 授权成功后立即持久化
    assert!(journal.events().contains(&"export".to_string()));

    running.cancel.cancel();
    running.task.await.unwrap();
}

#[tokio::test]
async fn test_privileged_reads_require_authorization() {
    let dir = tempdir().unwrap();
    let credentials = CredentialStore::open(dir.path().join("session.json")).unwrap();
    let running = spawn_owner(MockPlatform::new(Journal::default(), false), credentials);
    wait_for_state(&running.ipc, AuthState::AuthRequired).await;

    let response = running
        .ipc
        .request(topics::DIALOGS, json!({}), Duration::from_secs(2))
        .await
        .unwrap();
    assert!(!response.ok);
    assert!(running.handle.fetch_dialogs().await.is_err());

    running.cancel.cancel();
    running.task.await.unwrap();
}

#[tokio::test]
async fn test_privileged_reads_and_commands_when_authorized() {
    let dir = tempdir().unwrap();
    let journal = Journal::default();
    let credentials = CredentialStore::open(dir.path().join("session.json")).unwrap();
    let running = spawn_owner(MockPlatform::new(journal.clone(), true), credentials);
    wait_for_state(&running.ipc, AuthState::Authorized).await;

    let timeout = Duration::from_secs(2);
    let dialogs = running
        .ipc
        .request(topics::DIALOGS, json!({}), timeout)
        .await
        .unwrap();
    assert!(dialogs.ok);
    assert_eq!(dialogs.data[0]["title"], "General");

    let participants = running
        .ipc
        .request(topics::PARTICIPANTS, json!({"chat_id": 4}), timeout)
        .await
        .unwrap();
    assert_eq!(participants.data[0]["user_id"], 40);

    let user = running
        .ipc
        .request(topics::USER, json!({"user_id": 9}), timeout)
        .await
        .unwrap();
    assert_eq!(user.data["username"], "ada");

    running
        .handle
        .send_message("me".to_string(), "hello".to_string())
        .await
        .unwrap();
    assert!(journal.events().contains(&"send:me".to_string()));

    running.cancel.cancel();
    running.task.await.unwrap();
}

#[tokio::test]
async fn test_updates_are_pumped_into_stream() {
    let dir = tempdir().unwrap();
    let credentials = CredentialStore::open(dir.path().join("session.json")).unwrap();
    let mut platform = MockPlatform::new(Journal::default(), true);
    platform.updates = (1..=2)
        .map(update)
        .collect();
    let running = spawn_owner(platform, credentials);

    assert_eq!(wait_for_len(running.broker.as_ref(), 2).await, 2);

    running.cancel.cancel();
    running.task.await.unwrap();
}

#[test]
fn test_second_credential_store_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("session.json");
    let _first = CredentialStore::open(&path).unwrap();
    let err = CredentialStore::open(&path).unwrap_err();
    assert!(matches!(err, SentinelError::PersistenceFailure(_)));
}

/// 第 `fail_on` 次 append 失败，其余操作转发给内存 Broker
struct FlakyAppendBroker {
    inner: MemoryBroker,
    appends: Mutex<u32>,
    fail_on: u32,
}

impl Broker for FlakyAppendBroker {
    fn append(&self, stream: &str, payload: Value) -> Result<EntryId> {
        let n = {
            let mut appends = self.appends.lock();
            *appends += 1;
            *appends
        };
        if n == self.fail_on {
            return Err(SentinelError::Broker("append rejected".to_string()));
        }
        self.inner.append(stream, payload)
    }

    fn create_group(&self, stream: &str, group: &str) -> Result<bool> {
        self.inner.create_group(stream, group)
    }

    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        self.inner.read_group(stream, group, consumer, count)
    }

    fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        self.inner.claim_idle(stream, group, consumer, min_idle, count)
    }

    fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<usize> {
        self.inner.ack(stream, group, ids)
    }

    fn depth(&self, stream: &str, group: &str) -> Result<usize> {
        self.inner.depth(stream, group)
    }

    fn len(&self, stream: &str) -> Result<usize> {
        self.inner.len(stream)
    }

    fn trim(&self, stream: &str, max_len: usize) -> Result<usize> {
        self.inner.trim(stream, max_len)
    }

    fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        self.inner.set(key, value, ttl)
    }

    fn set_nx(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        self.inner.set_nx(key, value, ttl)
    }

    fn get(&self, key: &str) -> Result<Option<Value>> {
        self.inner.get(key)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(key)
    }

    fn push(&self, queue: &str, value: Value) -> Result<()> {
        self.inner.push(queue, value)
    }

    fn pop(&self, queue: &str) -> Result<Option<Value>> {
        self.inner.pop(queue)
    }
}

#[tokio::test]
async fn test_failed_append_keeps_remaining_updates() {
    let dir = tempdir().unwrap();
    let credentials = CredentialStore::open(dir.path().join("session.json")).unwrap();
    let mut platform = MockPlatform::new(Journal::default(), true);
    platform.updates = (1..=3).map(update).collect();
    let broker = Arc::new(FlakyAppendBroker {
        inner: MemoryBroker::new(),
        appends: Mutex::new(0),
        fail_on: 2,
    });
    let running = spawn_owner_with(platform, credentials, session_settings(), broker);

    // 第一轮写入 1 条，剩余 2 条在下一轮补写
    assert_eq!(wait_for_len(running.broker.as_ref(), 3).await, 3);
    running.broker.create_group(STREAM, "check").unwrap();
    let entries = running.broker.read_group(STREAM, "check", "c", 10).unwrap();
    let ids: Vec<i64> = entries
        .iter()
        .map(|e| e.payload["msg_id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);

    running.cancel.cancel();
    running.task.await.unwrap();
}

#[tokio::test]
async fn test_connect_retries_and_reconnects_after_connection_lost() {
    let dir = tempdir().unwrap();
    let journal = Journal::default();
    let credentials = CredentialStore::open(dir.path().join("session.json")).unwrap();
    let mut platform = MockPlatform::new(journal.clone(), true);
    platform.connect_failures = 2;
    platform.send_failures = 1;
    let settings = SessionSettings {
        reconnect_attempts: 3,
        reconnect_backoff_ms: 10,
        ..session_settings()
    };
    let running = spawn_owner_with(platform, credentials, settings, Arc::new(MemoryBroker::new()));

    // 两次瞬时失败后第三次成功
    wait_for_state(&running.ipc, AuthState::Authorized).await;
    let connects = |events: &[String]| events.iter().filter(|e| *e == "connect").count();
    assert_eq!(connects(&journal.events()), 3);

    let err = running
        .handle
        .send_message("me".to_string(), "hello".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, SentinelError::ConnectionLost(_)));

    // 下一次更新轮询时重连
    wait_for_state(&running.ipc, AuthState::Authorized).await;
    assert_eq!(connects(&journal.events()), 4);
    running
        .handle
        .send_message("me".to_string(), "again".to_string())
        .await
        .unwrap();

    running.cancel.cancel();
    running.task.await.unwrap();
}

#[tokio::test]
async fn test_failed_persist_still_disconnects() {
    let dir = tempdir().unwrap();
    let journal = Journal::default();
    let credentials = CredentialStore::open(dir.path().join("session.json")).unwrap();
    let mut platform = MockPlatform::new(journal.clone(), true);
    platform.fail_export = true;
    let running = spawn_owner(platform, credentials);

    wait_for_state(&running.ipc, AuthState::Authorized).await;
    running.cancel.cancel();
    running.task.await.unwrap();

    let events = journal.events();
    let export = events.iter().position(|e| e == "export").expect("persist attempted");
    let disconnect = events.iter().position(|e| e == "disconnect").expect("disconnect ran");
    assert!(export < disconnect);
    assert_eq!(
        running.ipc.read_status().unwrap().unwrap().state,
        AuthState::Disconnected
    );
    let store = CredentialStore::open(dir.path().join("session.json")).unwrap();
    assert!(store.load().unwrap().is_none());
}
