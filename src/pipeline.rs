//! 消息处理流水线 - 去重、评分、准入、存储、投递、异常统计
//!
//! 每条消息按顺序经过上述步骤。存储写入在投递之前完成，
//! 崩溃后重放时依靠 `dedupe_hash` 判断是否需要继续投递，已告警的消息不会再发。
//! 一条消息从评分到异常统计只使用开始处理时取到的同一份配置快照。
//!
//! 限流名额在写入存储之前占用。写入失败时条目会被重放并再次占用名额；
//! 限流器只在内存中，进程重启后重新计数。

use crate::admission::{Admission, RateLimiter};
use crate::anomaly::AnomalyDetector;
use crate::config::{ActiveConfig, ConfigHandle};
use crate::error::{Result, SentinelError};
use crate::metrics::MetricsSink;
use crate::model::{IncomingMessage, MessageRecord};
use crate::notification::{format_alert, format_anomaly, AlertDispatcher};
use crate::scoring::ScoringEngine;
use crate::store::{InsertOutcome, MessageStore};
use crate::stream::MessageHandler;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 单条消息的处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// 已处理过（已告警、已限流或已记录投递失败）
    Duplicate,
    /// 已记录，分数未达告警线
    Recorded { score: f64 },
    /// 达到告警线但被限流
    RateLimited { score: f64 },
    /// 至少一个目标确认送达
    Alerted { score: f64 },
    /// 没有目标确认送达
    NotDelivered { score: f64, failed: Vec<String> },
}

impl ProcessOutcome {
    pub fn is_alerted(&self) -> bool {
        matches!(self, ProcessOutcome::Alerted { .. })
    }
}

/// 流水线依赖的组件
pub struct Pipeline {
    config: Arc<ConfigHandle>,
    engine: ScoringEngine,
    limiter: Arc<RateLimiter>,
    anomalies: Arc<AnomalyDetector>,
    store: Arc<MessageStore>,
    dispatcher: Arc<AlertDispatcher>,
    metrics: Arc<dyn MetricsSink>,
}

impl Pipeline {
    pub fn new(
        config: Arc<ConfigHandle>,
        engine: ScoringEngine,
        limiter: Arc<RateLimiter>,
        anomalies: Arc<AnomalyDetector>,
        store: Arc<MessageStore>,
        dispatcher: Arc<AlertDispatcher>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            config,
            engine,
            limiter,
            anomalies,
            store,
            dispatcher,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    /// 处理一条消息
    pub async fn process(&self, message: IncomingMessage) -> Result<ProcessOutcome> {
        let snapshot = self.config.snapshot();

        let existing = self
            .store
            .get(&message.key())
            .or_else(|| self.store.find_by_hash(&message.dedupe_hash()));
        if let Some(record) = existing {
            let rule = snapshot.matcher.evaluate(&snapshot.runtime, &message);
            let resumable = !record.alerted
                && !record.rate_limited
                && record.delivery_failures.is_empty()
                && record.score > 0.0
                && record.score >= rule.min_alert_score;
            if !resumable {
                debug!(key = %record.key(), "Duplicate message, skipping");
                return Ok(ProcessOutcome::Duplicate);
            }
            info!(key = %record.key(), score = record.score, "Resuming interrupted alert delivery");
            let outcome = self.deliver(&snapshot, &record).await?;
            self.observe(&snapshot, &message, record.score, outcome.is_alerted())
                .await;
            return Ok(outcome);
        }

        let embedding = self.engine.embed_message(&snapshot, &message).await;
        let breakdown = self.engine.score(&snapshot, &message, embedding.as_deref());
        self.metrics.counter("messages_scored_total", &[], 1);
        self.metrics.histogram("score", &[], breakdown.score);

        let now = Utc::now();
        let mut record =
            MessageRecord::from_scored(&message, breakdown.score, breakdown.matched.clone(), now);

        let admissible = breakdown.is_admissible();
        if admissible {
            match self
                .limiter
                .try_admit(message.chat_id, breakdown.rate_limit_per_hour, now)
            {
                Admission::Admitted { used, limit } => {
                    debug!(chat_id = message.chat_id, used, limit, "Alert admitted");
                }
                Admission::RateLimited { limit, retry_after } => {
                    let channel = message.chat_id.to_string();
                    info!(
                        chat_id = message.chat_id,
                        limit,
                        retry_after_secs = retry_after.map(|d| d.num_seconds()),
                        "Alert rate limited"
                    );
                    self.metrics
                        .counter("rate_limited_total", &[("channel", channel.as_str())], 1);
                    record.rate_limited = true;
                }
            }
        }

        if let InsertOutcome::Duplicate(_) = self.store.insert(record.clone())? {
            // 并发重放时另一条处理已写入
            return Ok(ProcessOutcome::Duplicate);
        }

        let outcome = if !admissible {
            ProcessOutcome::Recorded {
                score: breakdown.score,
            }
        } else if record.rate_limited {
            ProcessOutcome::RateLimited {
                score: breakdown.score,
            }
        } else {
            self.deliver(&snapshot, &record).await?
        };

        self.observe(&snapshot, &message, breakdown.score, outcome.is_alerted())
            .await;
        Ok(outcome)
    }

    /// 投递并更新记录
    ///
    /// 进程退出导致没有送达时返回 `SessionClosed`，不写失败记录，
    /// 条目保持未 ack，重放时走续投路径。
    async fn deliver(&self, snapshot: &ActiveConfig, record: &MessageRecord) -> Result<ProcessOutcome> {
        let mode = snapshot.runtime.alerts.mode;
        let report = self.dispatcher.dispatch(mode, &format_alert(record)).await;
        let key = record.key();

        if !report.delivered() && report.interrupted() {
            warn!(key = %key, "Alert delivery interrupted by shutdown, leaving entry for replay");
            return Err(SentinelError::SessionClosed);
        }

        for failure in report.failures() {
            warn!(key = %key, error = %failure, "Alert destination failed");
        }
        let failed = report.failed_destinations();
        for destination in &failed {
            self.store.record_delivery_failure(&key, destination)?;
        }

        if report.delivered() {
            self.store.mark_alerted(&key)?;
            info!(key = %key, score = record.score, "Alert delivered");
            Ok(ProcessOutcome::Alerted {
                score: record.score,
            })
        } else {
            Ok(ProcessOutcome::NotDelivered {
                score: record.score,
                failed,
            })
        }
    }

    async fn observe(
        &self,
        snapshot: &ActiveConfig,
        message: &IncomingMessage,
        score: f64,
        alerted: bool,
    ) {
        let settings = &snapshot.runtime.anomaly;
        let flags = self.anomalies.observe(
            message.chat_id,
            score,
            alerted,
            message.received_at,
            settings,
        );
        for flag in flags {
            let channel = flag.channel_id.to_string();
            warn!(
                chat_id = flag.channel_id,
                metric = flag.metric.as_str(),
                value = flag.value,
                threshold = flag.threshold,
                "Anomaly detected"
            );
            self.metrics.counter(
                "anomaly_flags_total",
                &[("channel", channel.as_str()), ("metric", flag.metric.as_str())],
                1,
            );
            if settings.notify {
                let report = self
                    .dispatcher
                    .dispatch(snapshot.runtime.alerts.mode, &format_anomaly(&flag))
                    .await;
                if !report.delivered() {
                    warn!(chat_id = flag.channel_id, "Anomaly notification was not delivered");
                }
            }
        }
    }
}

#[async_trait]
impl MessageHandler for Pipeline {
    async fn handle(&self, message: IncomingMessage) -> Result<()> {
        let key = message.key();
        let outcome = self.process(message).await?;
        debug!(key = %key, outcome = ?outcome, "Message processed");
        Ok(())
    }
}
