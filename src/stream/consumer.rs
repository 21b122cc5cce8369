//! 流消费者 - 以消费组方式读取摄取流
//!
//! 每批先回收空闲过久的 pending 条目（不论原消费者），再读取新条目。
//! 处理成功后才 ack（至少一次）；单条失败留在 pending 等待回收，
//! 投递次数达到上限或无法解析的条目记入死信后 ack，不会卡住整批。
//! Session Owner 已退出时停止本批，剩余条目不计入死信。

use crate::broker::{Broker, EntryId, StreamEntry};
use crate::config::StreamSettings;
use crate::error::{Result, SentinelError};
use crate::metrics::MetricsSink;
use crate::model::IncomingMessage;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 单条消息的处理器
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: IncomingMessage) -> Result<()>;
}

/// 一批的处理结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub read: usize,
    pub processed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub acked: usize,
    /// 因取消未处理、留给回收的条目
    pub deferred: usize,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.claimed + self.read
    }
}

/// 流消费者
pub struct StreamConsumer {
    broker: Arc<dyn Broker>,
    settings: StreamSettings,
    consumer: String,
    metrics: Arc<dyn MetricsSink>,
}

impl StreamConsumer {
    /// 加入消费组（不存在时从流起点创建）
    pub fn join(
        broker: Arc<dyn Broker>,
        settings: StreamSettings,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        let consumer = settings.consumer_name();
        let created = broker.create_group(&settings.name, &settings.group)?;
        info!(
            stream = %settings.name,
            group = %settings.group,
            consumer = %consumer,
            created,
            "Joined consumer group"
        );
        Ok(Self {
            broker,
            settings,
            consumer,
            metrics,
        })
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer
    }

    pub fn dead_letter_queue(&self) -> String {
        format!("{}:dead", self.settings.name)
    }

    /// 回收空闲条目，再补足新条目
    pub fn claim_batch(&self) -> Result<(Vec<StreamEntry>, usize)> {
        let s = &self.settings;
        let mut entries = self.broker.claim_idle(
            &s.name,
            &s.group,
            &self.consumer,
            Duration::from_secs(s.min_idle_secs),
            s.batch_size,
        )?;
        let claimed = entries.len();
        if claimed > 0 {
            debug!(count = claimed, consumer = %self.consumer, "Reclaimed idle entries");
        }
        let remaining = s.batch_size.saturating_sub(claimed);
        if remaining > 0 {
            entries.extend(
                self.broker
                    .read_group(&s.name, &s.group, &self.consumer, remaining)?,
            );
        }
        Ok((entries, claimed))
    }

    pub fn ack(&self, ids: &[EntryId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.broker.ack(&self.settings.name, &self.settings.group, ids)
    }

    fn dead_letter(&self, entry: &StreamEntry, reason: &str) {
        let record = json!({
            "id": entry.id.0,
            "payload": entry.payload,
            "deliveries": entry.deliveries,
            "reason": reason,
            "at": Utc::now(),
        });
        if let Err(e) = self.broker.push(&self.dead_letter_queue(), record) {
            error!(entry = %entry.id, error = %e, "Failed to write dead letter");
        }
        self.metrics.counter("dead_letters_total", &[], 1);
    }

    /// 处理一批；取消时停止处理并先提交已完成条目的 ack
    pub async fn process_batch(
        &self,
        handler: &dyn MessageHandler,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let (entries, claimed) = self.claim_batch()?;
        let mut report = BatchReport {
            claimed,
            read: entries.len() - claimed,
            ..Default::default()
        };
        let mut done = Vec::with_capacity(entries.len());

        for (index, entry) in entries.iter().enumerate() {
            if cancel.is_cancelled() {
                report.deferred = entries.len() - index;
                break;
            }

            let message: IncomingMessage = match serde_json::from_value(entry.payload.clone()) {
                Ok(message) => message,
                Err(e) => {
                    warn!(entry = %entry.id, error = %e, "Unparsable stream entry");
                    self.dead_letter(entry, &format!("unparsable: {}", e));
                    report.dead_lettered += 1;
                    done.push(entry.id);
                    continue;
                }
            };

            match handler.handle(message).await {
                Ok(()) => {
                    report.processed += 1;
                    done.push(entry.id);
                }
                Err(SentinelError::SessionClosed) => {
                    // 退出中，剩余条目留给重启后回收
                    warn!(entry = %entry.id, "Session closed mid-batch, leaving entries pending");
                    report.deferred = entries.len() - index;
                    break;
                }
                Err(e) if entry.deliveries >= self.settings.max_deliveries => {
                    error!(
                        entry = %entry.id,
                        deliveries = entry.deliveries,
                        error = %e,
                        "Entry exceeded max deliveries, dead-lettering"
                    );
                    self.dead_letter(entry, &e.to_string());
                    report.dead_lettered += 1;
                    done.push(entry.id);
                }
                Err(e) => {
                    warn!(
                        entry = %entry.id,
                        deliveries = entry.deliveries,
                        error = %e,
                        "Entry failed, leaving pending for reclaim"
                    );
                    report.failed += 1;
                }
            }
        }

        report.acked = self.ack(&done)?;
        self.report_depth();
        Ok(report)
    }

    fn report_depth(&self) {
        match self.broker.depth(&self.settings.name, &self.settings.group) {
            Ok(depth) => self.metrics.gauge("stream_depth", &[], depth as f64),
            Err(e) => debug!(error = %e, "Failed to read stream depth"),
        }
    }

    /// 循环处理直到取消。空批次时按 poll 间隔等待
    pub async fn run(&self, handler: &dyn MessageHandler, cancel: CancellationToken) {
        let poll = Duration::from_millis(self.settings.poll_interval_ms.max(10));
        let mut consecutive_errors = 0u32;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.process_batch(handler, &cancel).await {
                Ok(report) => {
                    consecutive_errors = 0;
                    if report.total() > 0 {
                        debug!(
                            processed = report.processed,
                            failed = report.failed,
                            dead = report.dead_lettered,
                            "Batch done"
                        );
                    }
                    if report.total() == 0 || report.failed == report.total() {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(poll) => {}
                        }
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    let wait = poll * consecutive_errors.min(10);
                    error!(error = %e, consecutive_errors, "Stream read failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
        info!(consumer = %self.consumer, "Stream consumer stopped");
    }

    /// 裁剪流长度
    pub fn trim(&self) -> Result<usize> {
        self.broker.trim(&self.settings.name, self.settings.max_len)
    }
}
