//! Worker - 组装所有组件并运行到收到退出信号
//!
//! 任务划分：
//! - Session Owner（独立 task，持有连接与凭据）
//! - 配置重载、摘要调度、反馈服务、定期维护（各自独立 task）
//! - 流消费循环（当前 task）
//!
//! 后台任务与消费循环共享一个 `CancellationToken`。Session Owner 使用单独的 token，
//! 在消费循环和后台任务都结束后才取消，正在投递的告警仍能通过会话发出。
//! 最后等待 Session Owner 完成持久化和断开。

use crate::admission::RateLimiter;
use crate::anomaly::AnomalyDetector;
use crate::broker::{Broker, FileBroker};
use crate::config::{ConfigReloadWatcher, Settings};
use crate::digest::DigestScheduler;
use crate::ipc::{topics, IpcGateway, IpcResponse};
use crate::metrics::{MetricsSink, TracingMetrics};
use crate::model::FeedbackRecord;
use crate::notification::{
    AlertDispatcher, BotApiDestination, LocalFileDestination, PlatformDmDestination, RetryPolicy,
};
use crate::pipeline::Pipeline;
use crate::scoring::{Embedder, EmbeddingClient, ScoringEngine};
use crate::session::{CredentialStore, HttpPlatform, SessionHandle, SessionOwner};
use crate::store::MessageStore;
use crate::stream::StreamConsumer;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 摘要调度检查间隔
const DIGEST_TICK: Duration = Duration::from_secs(30);
/// 每轮最多处理的反馈请求数
const MAX_FEEDBACK_PER_POLL: usize = 32;

/// 运行选项
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    /// 只打印告警，不实际发送
    pub dry_run: bool,
}

/// 等待 Ctrl-C 或 SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// 运行 Worker，直到 `cancel` 被取消
pub async fn run(settings: Settings, options: WorkerOptions, cancel: CancellationToken) -> Result<()> {
    std::fs::create_dir_all(&settings.data_dir)
        .with_context(|| format!("cannot create {}", settings.data_dir.display()))?;

    let metrics: Arc<dyn MetricsSink> = Arc::new(TracingMetrics);
    let broker: Arc<dyn Broker> = Arc::new(
        FileBroker::open(settings.broker_dir()).context("cannot open broker state")?,
    );

    // 必须在启动任何任务之前加入消费组
    let consumer = StreamConsumer::join(broker.clone(), settings.stream.clone(), metrics.clone())
        .context("cannot join consumer group")?;

    let embedder: Option<Arc<dyn Embedder>> = if settings.embeddings.enabled {
        let client = EmbeddingClient::new(settings.embeddings.clone())
            .context("cannot create embedding client")?;
        Some(Arc::new(client))
    } else {
        None
    };

    let watcher = Arc::new(
        ConfigReloadWatcher::start(
            settings.rules_path(),
            settings.reload_marker_path(),
            embedder.clone(),
            metrics.clone(),
        )
        .await
        .context("initial rules could not be loaded")?,
    );
    let config = watcher.handle();

    let store = Arc::new(
        MessageStore::open(settings.store_path()).context("cannot open message store")?,
    );
    let ipc = IpcGateway::new(broker.clone(), &settings.ipc);

    // Session Owner
    let credentials =
        CredentialStore::open(settings.session_path()).context("cannot open session store")?;
    let platform = HttpPlatform::new(
        settings.session.gateway_url.clone(),
        settings.session.request_timeout(),
    )
    .context("cannot create platform client")?;
    let (session, commands) = SessionHandle::channel(64);
    let owner = SessionOwner::new(
        Box::new(platform),
        credentials,
        ipc.clone(),
        broker.clone(),
        settings.stream.name.clone(),
        settings.session.clone(),
        metrics.clone(),
    );
    let session_cancel = CancellationToken::new();
    let session_task = tokio::spawn(owner.run(commands, session_cancel.clone()));

    let dispatcher = Arc::new(build_dispatcher(&settings, session, metrics.clone(), options.dry_run));
    info!(
        destinations = ?dispatcher.destination_names(),
        dry_run = options.dry_run,
        "Alert dispatcher ready"
    );

    let limiter = Arc::new(RateLimiter::new());
    let anomalies = Arc::new(AnomalyDetector::default());

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    {
        let watcher = watcher.clone();
        let cancel = cancel.clone();
        let interval = Duration::from_secs(settings.reload_poll_secs.max(1));
        tasks.push(tokio::spawn(async move { watcher.run(interval, cancel).await }));
    }

    {
        let scheduler = DigestScheduler::new(
            store.clone(),
            dispatcher.clone(),
            config.clone(),
            metrics.clone(),
            Utc::now(),
        );
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move { scheduler.run(DIGEST_TICK, cancel).await }));
    }

    tasks.push(tokio::spawn(serve_feedback(
        ipc.clone(),
        store.clone(),
        Duration::from_millis(settings.session.ipc_poll_ms.max(10)),
        cancel.clone(),
    )));

    tasks.push(tokio::spawn(maintenance(
        Maintenance {
            limiter: limiter.clone(),
            anomalies: anomalies.clone(),
            store: store.clone(),
            broker: broker.clone(),
            stream: settings.stream.name.clone(),
            max_len: settings.stream.max_len,
            retention_days: settings.retention_days,
        },
        Duration::from_secs(settings.maintenance_interval_secs.max(1)),
        cancel.clone(),
    )));

    let pipeline = Pipeline::new(
        config,
        ScoringEngine::new(embedder),
        limiter,
        anomalies,
        store,
        dispatcher,
        metrics,
    );

    info!(consumer = consumer.consumer_name(), "Worker started");
    consumer.run(&pipeline, cancel.clone()).await;

    // 消费循环只会在取消后返回
    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task failed");
        }
    }
    session_cancel.cancel();
    if let Err(e) = session_task.await {
        error!(error = %e, "Session owner task failed");
    }
    info!("Worker stopped");
    Ok(())
}

fn build_dispatcher(
    settings: &Settings,
    session: SessionHandle,
    metrics: Arc<dyn MetricsSink>,
    dry_run: bool,
) -> AlertDispatcher {
    let delivery = &settings.delivery;
    let mut dispatcher =
        AlertDispatcher::new(RetryPolicy::from_settings(delivery), metrics).with_dry_run(dry_run);

    dispatcher.register(Arc::new(PlatformDmDestination::new(
        session,
        delivery.dm_target.clone(),
    )));

    match BotApiDestination::new(delivery) {
        Ok(bot) => dispatcher.register(Arc::new(bot)),
        Err(e) => debug!(error = %e, "Channel destination not configured"),
    }

    if delivery.audit_log {
        dispatcher.register(Arc::new(LocalFileDestination::new(settings.audit_log_path())));
    }
    dispatcher
}

#[derive(Debug, Deserialize)]
struct FeedbackPayload {
    chat_id: i64,
    msg_id: i64,
    label: String,
}

/// 处理一轮反馈请求，返回处理数量
pub fn serve_feedback_once(ipc: &IpcGateway, store: &MessageStore) -> usize {
    let mut handled = 0;
    while handled < MAX_FEEDBACK_PER_POLL {
        let request = match ipc.next_request(topics::FEEDBACK) {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read feedback queue");
                break;
            }
        };
        handled += 1;

        let response = match serde_json::from_value::<FeedbackPayload>(request.payload) {
            Ok(payload) if !payload.label.trim().is_empty() => {
                let feedback = FeedbackRecord {
                    chat_id: payload.chat_id,
                    msg_id: payload.msg_id,
                    label: payload.label.trim().to_string(),
                    created_at: Utc::now(),
                };
                match store.add_feedback(feedback) {
                    Ok(()) => IpcResponse::ok(serde_json::Value::Bool(true)),
                    Err(e) => {
                        error!(request_id = %request.id, error = %e, "Failed to store feedback");
                        IpcResponse::error(e.to_string())
                    }
                }
            }
            Ok(_) => IpcResponse::error("feedback label is empty"),
            Err(e) => IpcResponse::error(format!("invalid feedback payload: {}", e)),
        };
        if let Err(e) = ipc.respond(&request.id, &response) {
            warn!(request_id = %request.id, error = %e, "Failed to write feedback response");
        }
    }
    handled
}

async fn serve_feedback(
    ipc: IpcGateway,
    store: Arc<MessageStore>,
    poll: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                serve_feedback_once(&ipc, &store);
            }
        }
    }
}

struct Maintenance {
    limiter: Arc<RateLimiter>,
    anomalies: Arc<AnomalyDetector>,
    store: Arc<MessageStore>,
    broker: Arc<dyn Broker>,
    stream: String,
    max_len: usize,
    retention_days: i64,
}

impl Maintenance {
    fn run_once(&self) {
        let now = Utc::now();
        let limiter_channels = self.limiter.trim(now);
        let anomaly_channels = self.anomalies.trim(now);

        let compacted = if self.retention_days > 0 {
            match self
                .store
                .compact(now - chrono::Duration::days(self.retention_days))
            {
                Ok(removed) => removed,
                Err(e) => {
                    error!(error = %e, "Store compaction failed");
                    0
                }
            }
        } else {
            0
        };

        let trimmed = match self.broker.trim(&self.stream, self.max_len) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Stream trim failed");
                0
            }
        };

        debug!(
            limiter_channels,
            anomaly_channels, compacted, trimmed, "Maintenance pass done"
        );
    }
}

async fn maintenance(task: Maintenance, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => task.run_once(),
        }
    }
}
