//! 告警分发器 - 按 ALERT_MODE 选择目标并并发投递
//!
//! 每个目标独立重试（指数退避，次数有上限），
//! 一个目标失败不会阻塞或掩盖另一个目标的结果。

use super::channel::{AlertDestination, AlertMessage, DestinationKind, SendResult};
use crate::config::{AlertMode, DeliverySettings};
use crate::error::SentinelError;
use crate::metrics::{MetricsSink, NoopMetrics};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &DeliverySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms.max(settings.initial_backoff_ms)),
        }
    }

    /// 第 `attempt` 次重试前的等待时间（从 0 开始）
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// 单个目标的投递结果
#[derive(Debug, Clone, PartialEq)]
pub struct DestinationOutcome {
    pub destination: String,
    pub kind: DestinationKind,
    pub result: SendResult,
    pub attempts: u32,
}

/// 一次分发的汇总
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    pub outcomes: Vec<DestinationOutcome>,
}

impl DispatchReport {
    /// 是否至少有一个真实目标确认送达（审计日志不算）
    pub fn delivered(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| o.kind != DestinationKind::Audit && o.result == SendResult::Sent)
    }

    /// 最终失败的目标
    pub fn failures(&self) -> Vec<SentinelError> {
        self.outcomes
            .iter()
            .filter_map(|o| match &o.result {
                SendResult::Failed(reason) => Some(SentinelError::DeliveryFailure {
                    destination: o.destination.clone(),
                    reason: reason.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// 是否有真实目标因进程退出而未发送
    pub fn interrupted(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| o.kind != DestinationKind::Audit && matches!(o.result, SendResult::Interrupted(_)))
    }

    pub fn failed_destinations(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.result, SendResult::Failed(_)))
            .map(|o| o.destination.clone())
            .collect()
    }
}

/// 告警分发器
pub struct AlertDispatcher {
    destinations: Vec<Arc<dyn AlertDestination>>,
    retry: RetryPolicy,
    metrics: Arc<dyn MetricsSink>,
    dry_run: bool,
}

impl Default for AlertDispatcher {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), Arc::new(NoopMetrics))
    }
}

impl AlertDispatcher {
    pub fn new(retry: RetryPolicy, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            destinations: Vec::new(),
            retry,
            metrics,
            dry_run: false,
        }
    }

    /// 设置 dry-run 模式
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// 注册目标
    pub fn register(&mut self, destination: Arc<dyn AlertDestination>) {
        info!(destination = destination.name(), "Registering alert destination");
        self.destinations.push(destination);
    }

    pub fn destination_names(&self) -> Vec<&str> {
        self.destinations.iter().map(|d| d.name()).collect()
    }

    fn selected(&self, mode: AlertMode) -> Vec<Arc<dyn AlertDestination>> {
        self.destinations
            .iter()
            .filter(|d| match (d.kind(), mode) {
                (DestinationKind::Audit, _) => true,
                (DestinationKind::Dm, AlertMode::Dm | AlertMode::Both) => true,
                (DestinationKind::Channel, AlertMode::Channel | AlertMode::Both) => true,
                _ => false,
            })
            .cloned()
            .collect()
    }

    /// 投递到当前模式选中的所有目标
    pub async fn dispatch(&self, mode: AlertMode, message: &AlertMessage) -> DispatchReport {
        let targets = self.selected(mode);
        if !targets.iter().any(|d| d.kind() != DestinationKind::Audit) {
            warn!(mode = mode.as_str(), "No alert destination configured for mode");
        }

        if self.dry_run {
            let outcomes = targets
                .iter()
                .map(|d| {
                    info!(destination = d.name(), title = %message.title, "[DRY-RUN] Would send alert");
                    DestinationOutcome {
                        destination: d.name().to_string(),
                        kind: d.kind(),
                        result: SendResult::Skipped("dry-run".to_string()),
                        attempts: 0,
                    }
                })
                .collect();
            return DispatchReport { outcomes };
        }

        let message = Arc::new(message.clone());
        let mut tasks = JoinSet::new();
        for (index, destination) in targets.iter().cloned().enumerate() {
            let message = message.clone();
            let retry = self.retry;
            tasks.spawn(async move { (index, send_with_retry(destination, &message, retry).await) });
        }

        let mut outcomes: Vec<Option<DestinationOutcome>> = vec![None; targets.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => error!(error = %e, "Alert delivery task panicked"),
            }
        }

        let outcomes: Vec<DestinationOutcome> = outcomes
            .into_iter()
            .zip(targets.iter())
            .map(|(outcome, destination)| {
                outcome.unwrap_or_else(|| DestinationOutcome {
                    destination: destination.name().to_string(),
                    kind: destination.kind(),
                    result: SendResult::Failed("delivery task aborted".to_string()),
                    attempts: 0,
                })
            })
            .collect();

        for outcome in &outcomes {
            let labels = [("destination", outcome.destination.as_str())];
            match &outcome.result {
                SendResult::Sent => {
                    self.metrics.counter("alerts_sent_total", &labels, 1);
                }
                SendResult::Skipped(reason) => {
                    debug!(destination = %outcome.destination, reason = %reason, "Alert skipped");
                }
                SendResult::Interrupted(reason) => {
                    warn!(destination = %outcome.destination, reason = %reason, "Alert delivery interrupted");
                }
                SendResult::Failed(reason) => {
                    let err = SentinelError::DeliveryFailure {
                        destination: outcome.destination.clone(),
                        reason: reason.clone(),
                    };
                    error!(
                        kind = message.kind.as_str(),
                        key = ?message.key,
                        attempts = outcome.attempts,
                        error = %err,
                        "Alert delivery failed"
                    );
                    self.metrics.counter("alerts_failed_total", &labels, 1);
                }
            }
        }

        DispatchReport { outcomes }
    }
}

async fn send_with_retry(
    destination: Arc<dyn AlertDestination>,
    message: &AlertMessage,
    retry: RetryPolicy,
) -> DestinationOutcome {
    let mut attempts = 0;
    let result = loop {
        attempts += 1;
        match destination.send(message).await {
            Ok(result) => break result,
            Err(SentinelError::SessionClosed) => {
                break SendResult::Interrupted(SentinelError::SessionClosed.to_string())
            }
            Err(e) if attempts > retry.max_retries => break SendResult::Failed(e.to_string()),
            Err(e) => {
                let wait = retry.backoff(attempts - 1);
                warn!(
                    destination = destination.name(),
                    attempt = attempts,
                    wait_ms = wait.as_millis() as u64,
                    error = %e,
                    "Alert send failed, retrying"
                );
                tokio::time::sleep(wait).await;
            }
        }
    };

    DestinationOutcome {
        destination: destination.name().to_string(),
        kind: destination.kind(),
        result,
        attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::metrics::InMemoryMetrics;
    use crate::notification::channel::AlertKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// 前 `fail_first` 次返回错误的 mock 目标
    struct MockDestination {
        name: String,
        kind: DestinationKind,
        fail_first: u32,
        permanent: bool,
        calls: AtomicU32,
    }

    impl MockDestination {
        fn new(name: &str, kind: DestinationKind, fail_first: u32) -> Self {
            Self {
                name: name.to_string(),
                kind,
                fail_first,
                permanent: false,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AlertDestination for MockDestination {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> DestinationKind {
            self.kind
        }

        async fn send(&self, _message: &AlertMessage) -> Result<SendResult> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.permanent {
                return Ok(SendResult::Failed("chat not found".to_string()));
            }
            if n < self.fail_first {
                return Err(SentinelError::ConnectionLost("reset".to_string()));
            }
            Ok(SendResult::Sent)
        }
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    fn message() -> AlertMessage {
        AlertMessage::new(AlertKind::Message, "t", "b")
    }

    #[test]
    fn test_backoff_is_bounded() {
        let retry = RetryPolicy {
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(retry.backoff(0), Duration::from_millis(100));
        assert_eq!(retry.backoff(1), Duration::from_millis(200));
        assert_eq!(retry.backoff(5), Duration::from_millis(500));
        assert_eq!(retry.backoff(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_mode_selects_destinations() {
        let dm = Arc::new(MockDestination::new("dm", DestinationKind::Dm, 0));
        let channel = Arc::new(MockDestination::new("channel", DestinationKind::Channel, 0));
        let audit = Arc::new(MockDestination::new("local_file", DestinationKind::Audit, 0));
        let mut dispatcher = AlertDispatcher::new(fast_retry(0), Arc::new(NoopMetrics));
        dispatcher.register(dm.clone());
        dispatcher.register(channel.clone());
        dispatcher.register(audit.clone());

        let report = dispatcher.dispatch(AlertMode::Dm, &message()).await;
        assert!(report.delivered());
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!((dm.calls(), channel.calls(), audit.calls()), (1, 0, 1));

        dispatcher.dispatch(AlertMode::Both, &message()).await;
        assert_eq!((dm.calls(), channel.calls(), audit.calls()), (2, 1, 2));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let dm = Arc::new(MockDestination::new("dm", DestinationKind::Dm, 2));
        let mut dispatcher = AlertDispatcher::new(fast_retry(3), Arc::new(NoopMetrics));
        dispatcher.register(dm.clone());

        let report = dispatcher.dispatch(AlertMode::Dm, &message()).await;
        assert!(report.delivered());
        assert_eq!(report.outcomes[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_mask_other() {
        let dm = Arc::new(MockDestination::new("dm", DestinationKind::Dm, u32::MAX));
        let channel = Arc::new(MockDestination::new("channel", DestinationKind::Channel, 0));
        let metrics = Arc::new(InMemoryMetrics::new());
        let mut dispatcher = AlertDispatcher::new(fast_retry(2), metrics.clone());
        dispatcher.register(dm.clone());
        dispatcher.register(channel.clone());

        let report = dispatcher.dispatch(AlertMode::Both, &message()).await;
        assert!(report.delivered());
        assert_eq!(dm.calls(), 3);
        assert_eq!(report.failed_destinations(), vec!["dm"]);
        assert!(matches!(
            report.failures()[0],
            SentinelError::DeliveryFailure { .. }
        ));
        assert_eq!(metrics.counter_value("alerts_failed_total{destination=dm}"), 1);
        assert_eq!(metrics.counter_value("alerts_sent_total{destination=channel}"), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let mut dest = MockDestination::new("channel", DestinationKind::Channel, 0);
        dest.permanent = true;
        let dest = Arc::new(dest);
        let mut dispatcher = AlertDispatcher::new(fast_retry(5), Arc::new(NoopMetrics));
        dispatcher.register(dest.clone());

        let report = dispatcher.dispatch(AlertMode::Channel, &message()).await;
        assert!(!report.delivered());
        assert_eq!(dest.calls(), 1);
    }

    #[tokio::test]
    async fn test_audit_alone_is_not_delivery() {
        let audit = Arc::new(MockDestination::new("local_file", DestinationKind::Audit, 0));
        let mut dispatcher = AlertDispatcher::new(fast_retry(0), Arc::new(NoopMetrics));
        dispatcher.register(audit);
        let report = dispatcher.dispatch(AlertMode::Dm, &message()).await;
        assert!(!report.delivered());
        assert!(report.failures().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_sends_nothing() {
        let dm = Arc::new(MockDestination::new("dm", DestinationKind::Dm, 0));
        let mut dispatcher =
            AlertDispatcher::new(fast_retry(0), Arc::new(NoopMetrics)).with_dry_run(true);
        dispatcher.register(dm.clone());
        let report = dispatcher.dispatch(AlertMode::Dm, &message()).await;
        assert!(!report.delivered());
        assert_eq!(dm.calls(), 0);
    }
}
