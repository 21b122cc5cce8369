//! 摘要调度 - 按小时/按天汇总分数最高的消息
//!
//! 每个周期在边界（整点 / UTC 零点）之后触发一次，
//! 汇总刚结束的完整周期。没有可选消息时不发送。
//! 没有目标确认送达时，下一次检查会重试同一周期。

use crate::config::ConfigHandle;
use crate::metrics::MetricsSink;
use crate::model::MessageRecord;
use crate::notification::{format_digest, AlertDispatcher};
use crate::store::MessageStore;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 摘要周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestPeriod {
    Hourly,
    Daily,
}

impl DigestPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestPeriod::Hourly => "hourly",
            DigestPeriod::Daily => "daily",
        }
    }

    pub fn length(&self) -> Duration {
        match self {
            DigestPeriod::Hourly => Duration::hours(1),
            DigestPeriod::Daily => Duration::days(1),
        }
    }

    /// `at` 所在周期的起点
    pub fn floor(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let size = self.length().num_seconds();
        let secs = at.timestamp();
        DateTime::<Utc>::from_timestamp(secs - secs.rem_euclid(size), 0).unwrap_or(at)
    }
}

/// 一份摘要
#[derive(Debug, Clone, PartialEq)]
pub struct Digest {
    pub period: DigestPeriod,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub entries: Vec<MessageRecord>,
    /// 周期内可入选（score > 0）的总数
    pub eligible: usize,
}

/// 选出分数最高的 N 条
///
/// 分数降序，同分时先收到的在前，再按 (chat_id, msg_id) 保证确定性。
/// 只有 score > 0 的记录可入选，被限流的记录同样可以入选。
pub fn select_top(records: Vec<MessageRecord>, top_n: usize) -> Vec<MessageRecord> {
    let mut eligible: Vec<MessageRecord> = records.into_iter().filter(|r| r.score > 0.0).collect();
    eligible.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.received_at.cmp(&b.received_at))
            .then_with(|| a.key().cmp(&b.key()))
    });
    eligible.truncate(top_n);
    eligible
}

/// 摘要调度器
pub struct DigestScheduler {
    store: Arc<MessageStore>,
    dispatcher: Arc<AlertDispatcher>,
    config: Arc<ConfigHandle>,
    metrics: Arc<dyn MetricsSink>,
    last_run: Mutex<HashMap<DigestPeriod, DateTime<Utc>>>,
}

impl DigestScheduler {
    /// `started_at` 之前的周期不会补发
    pub fn new(
        store: Arc<MessageStore>,
        dispatcher: Arc<AlertDispatcher>,
        config: Arc<ConfigHandle>,
        metrics: Arc<dyn MetricsSink>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let last_run = [DigestPeriod::Hourly, DigestPeriod::Daily]
            .into_iter()
            .map(|p| (p, started_at))
            .collect();
        Self {
            store,
            dispatcher,
            config,
            metrics,
            last_run: Mutex::new(last_run),
        }
    }

    /// 构建 `[start, end)` 区间的摘要，无可选消息时返回 None
    pub fn build(
        &self,
        period: DigestPeriod,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        top_n: usize,
    ) -> Option<Digest> {
        let records = self.store.between(start, end);
        let eligible = records.iter().filter(|r| r.score > 0.0).count();
        if eligible == 0 {
            return None;
        }
        Some(Digest {
            period,
            start,
            end,
            entries: select_top(records, top_n),
            eligible,
        })
    }

    /// 检查各周期是否到期，到期则发送。返回本次发送的摘要
    pub async fn run_due(&self, now: DateTime<Utc>) -> Vec<Digest> {
        let snapshot = self.config.snapshot();
        let settings = &snapshot.runtime.digest;
        let mode = snapshot.runtime.alerts.mode;

        let mut sent = Vec::new();
        for (period, enabled) in [
            (DigestPeriod::Hourly, settings.hourly),
            (DigestPeriod::Daily, settings.daily),
        ] {
            let boundary = period.floor(now);
            let due = {
                let mut last_run = self.last_run.lock();
                let last = last_run.entry(period).or_insert(now);
                period.floor(*last) < boundary
            };
            if !due {
                continue;
            }
            if !enabled {
                self.mark_run(period, now);
                continue;
            }

            let start = boundary - period.length();
            let Some(digest) = self.build(period, start, boundary, settings.top_n) else {
                debug!(period = period.as_str(), "No eligible messages, skipping digest");
                self.mark_run(period, now);
                continue;
            };

            let report = self.dispatcher.dispatch(mode, &format_digest(&digest)).await;
            if report.delivered() {
                info!(
                    period = period.as_str(),
                    entries = digest.entries.len(),
                    eligible = digest.eligible,
                    "Digest sent"
                );
                self.metrics
                    .counter("digests_sent_total", &[("period", period.as_str())], 1);
                self.mark_run(period, now);
                sent.push(digest);
            } else {
                // 不更新 last_run，下一次检查重试同一周期
                warn!(
                    period = period.as_str(),
                    failed = ?report.failed_destinations(),
                    "Digest was not delivered, will retry"
                );
            }
        }
        sent
    }

    fn mark_run(&self, period: DigestPeriod, at: DateTime<Utc>) {
        self.last_run.lock().insert(period, at);
    }

    /// 按 `tick` 间隔检查，直到取消
    pub async fn run(&self, tick: std::time::Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Digest scheduler stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.run_due(Utc::now()).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ActiveConfig, RuntimeConfig};
    use crate::error::Result;
    use crate::metrics::{InMemoryMetrics, NoopMetrics};
    use crate::model::IncomingMessage;
    use crate::notification::{
        AlertDestination, AlertMessage, DestinationKind, RetryPolicy, SendResult,
    };
    use async_trait::async_trait;
    use chrono::TimeZone;

    fn record(msg_id: i64, score: f64, received_at: DateTime<Utc>) -> MessageRecord {
        let msg = IncomingMessage {
            chat_id: 1,
            msg_id,
            sender_id: 1,
            chat_title: None,
            text: format!("message {}", msg_id),
            reactions: 0,
            reply_count: 0,
            received_at,
        };
        MessageRecord::from_scored(&msg, score, vec![], received_at)
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_select_top_by_score() {
        let records = vec![
            record(1, 5.0, at(10, 0)),
            record(2, 3.0, at(10, 1)),
            record(3, 8.0, at(10, 2)),
            record(4, 1.0, at(10, 3)),
        ];
        let top: Vec<f64> = select_top(records, 2).iter().map(|r| r.score).collect();
        assert_eq!(top, vec![8.0, 5.0]);
    }

    #[test]
    fn test_select_top_ties_prefer_earliest() {
        let records = vec![
            record(1, 4.0, at(10, 30)),
            record(2, 4.0, at(10, 5)),
            record(3, 0.0, at(10, 0)),
        ];
        let top = select_top(records, 5);
        assert_eq!(top.iter().map(|r| r.msg_id).collect::<Vec<_>>(), vec![2, 1]);
    }

    #[test]
    fn test_period_floor() {
        assert_eq!(DigestPeriod::Hourly.floor(at(10, 42)), at(10, 0));
        assert_eq!(DigestPeriod::Daily.floor(at(10, 42)), at(0, 0));
    }

    struct CountingDestination(parking_lot::Mutex<Vec<AlertMessage>>);

    /// 前 N 次发送返回不可重试的失败
    struct FailingFirst {
        remaining: parking_lot::Mutex<u32>,
        sent: parking_lot::Mutex<u32>,
    }

    #[async_trait]
    impl AlertDestination for FailingFirst {
        fn name(&self) -> &str {
            "dm"
        }
        fn kind(&self) -> DestinationKind {
            DestinationKind::Dm
        }
        async fn send(&self, _message: &AlertMessage) -> Result<SendResult> {
            let mut remaining = self.remaining.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(SendResult::Failed("peer flood".to_string()));
            }
            *self.sent.lock() += 1;
            Ok(SendResult::Sent)
        }
    }

    #[async_trait]
    impl AlertDestination for CountingDestination {
        fn name(&self) -> &str {
            "dm"
        }
        fn kind(&self) -> DestinationKind {
            DestinationKind::Dm
        }
        async fn send(&self, message: &AlertMessage) -> Result<SendResult> {
            self.0.lock().push(message.clone());
            Ok(SendResult::Sent)
        }
    }

    fn scheduler(
        store: Arc<MessageStore>,
        dest: Arc<CountingDestination>,
        runtime: RuntimeConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> DigestScheduler {
        let mut dispatcher = AlertDispatcher::new(RetryPolicy::default(), Arc::new(NoopMetrics));
        dispatcher.register(dest);
        DigestScheduler::new(
            store,
            Arc::new(dispatcher),
            Arc::new(ConfigHandle::new(ActiveConfig::new(runtime, vec![], 1))),
            metrics,
            at(10, 15),
        )
    }

    #[tokio::test]
    async fn test_hourly_digest_fires_once_per_boundary() {
        let store = Arc::new(MessageStore::in_memory());
        store.insert(record(1, 2.0, at(10, 20))).unwrap();
        store.insert(record(2, 6.0, at(10, 40))).unwrap();
        store.insert(record(3, 9.0, at(11, 5))).unwrap();

        let mut runtime = RuntimeConfig::default();
        runtime.digest.hourly = true;
        runtime.digest.daily = false;
        let dest = Arc::new(CountingDestination(Default::default()));
        let metrics = Arc::new(InMemoryMetrics::new());
        let scheduler = scheduler(store, dest.clone(), runtime, metrics.clone());

        assert!(scheduler.run_due(at(10, 50)).await.is_empty());
        let sent = scheduler.run_due(at(11, 1)).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].start, at(10, 0));
        assert_eq!(
            sent[0].entries.iter().map(|r| r.msg_id).collect::<Vec<_>>(),
            vec![2, 1]
        );
        assert!(scheduler.run_due(at(11, 30)).await.is_empty());
        assert_eq!(dest.0.lock().len(), 1);
        assert_eq!(metrics.counter_value("digests_sent_total{period=hourly}"), 1);
    }

    #[tokio::test]
    async fn test_empty_period_sends_nothing() {
        let store = Arc::new(MessageStore::in_memory());
        store.insert(record(1, 0.0, at(10, 20))).unwrap();
        let mut runtime = RuntimeConfig::default();
        runtime.digest.hourly = true;
        let dest = Arc::new(CountingDestination(Default::default()));
        let scheduler = scheduler(store, dest.clone(), runtime, Arc::new(NoopMetrics));

        assert!(scheduler.run_due(at(11, 1)).await.is_empty());
        assert!(dest.0.lock().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_period_is_skipped() {
        let store = Arc::new(MessageStore::in_memory());
        store.insert(record(1, 3.0, at(10, 20))).unwrap();
        let runtime = RuntimeConfig::default(); // hourly 默认关闭
        let dest = Arc::new(CountingDestination(Default::default()));
        let scheduler = scheduler(store, dest.clone(), runtime, Arc::new(NoopMetrics));

        assert!(scheduler.run_due(at(11, 1)).await.is_empty());
        assert!(dest.0.lock().is_empty());
    }

    #[tokio::test]
    async fn test_undelivered_digest_is_retried() {
        let store = Arc::new(MessageStore::in_memory());
        store.insert(record(1, 3.0, at(10, 20))).unwrap();
        let mut runtime = RuntimeConfig::default();
        runtime.digest.hourly = true;
        runtime.digest.daily = false;
        let dest = Arc::new(FailingFirst {
            remaining: parking_lot::Mutex::new(1),
            sent: parking_lot::Mutex::new(0),
        });
        let mut dispatcher = AlertDispatcher::new(RetryPolicy::default(), Arc::new(NoopMetrics));
        dispatcher.register(dest.clone());
        let scheduler = DigestScheduler::new(
            store,
            Arc::new(dispatcher),
            Arc::new(ConfigHandle::new(ActiveConfig::new(runtime, vec![], 1))),
            Arc::new(NoopMetrics),
            at(10, 15),
        );

        assert!(scheduler.run_due(at(11, 1)).await.is_empty());
        let sent = scheduler.run_due(at(11, 2)).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].start, at(10, 0));
        assert!(scheduler.run_due(at(11, 3)).await.is_empty());
        assert_eq!(*dest.sent.lock(), 1);
    }
}
