//! 指标接口 - 组件只依赖 `MetricsSink`，不绑定具体导出器

use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::trace;

/// 指标标签
pub type Labels<'a> = &'a [(&'a str, &'a str)];

/// 指标接收端
pub trait MetricsSink: Send + Sync {
    fn counter(&self, name: &str, labels: Labels<'_>, delta: u64);
    fn gauge(&self, name: &str, labels: Labels<'_>, value: f64);
    fn histogram(&self, name: &str, labels: Labels<'_>, value: f64);
}

/// 丢弃所有指标
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn counter(&self, _name: &str, _labels: Labels<'_>, _delta: u64) {}
    fn gauge(&self, _name: &str, _labels: Labels<'_>, _value: f64) {}
    fn histogram(&self, _name: &str, _labels: Labels<'_>, _value: f64) {}
}

/// 以 trace 日志输出指标（RUST_LOG=chat_sentinel::metrics=trace）
#[derive(Debug, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn counter(&self, name: &str, labels: Labels<'_>, delta: u64) {
        trace!(metric = name, labels = ?labels, delta, "counter");
    }

    fn gauge(&self, name: &str, labels: Labels<'_>, value: f64) {
        trace!(metric = name, labels = ?labels, value, "gauge");
    }

    fn histogram(&self, name: &str, labels: Labels<'_>, value: f64) {
        trace!(metric = name, labels = ?labels, value, "histogram");
    }
}

/// 内存指标，供测试和状态查询使用
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    inner: Mutex<MetricValues>,
}

#[derive(Debug, Default, Clone)]
pub struct MetricValues {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
    pub histograms: BTreeMap<String, Vec<f64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricValues {
        self.inner.lock().clone()
    }

    pub fn counter_value(&self, key: &str) -> u64 {
        self.inner.lock().counters.get(key).copied().unwrap_or(0)
    }

    pub fn gauge_value(&self, key: &str) -> Option<f64> {
        self.inner.lock().gauges.get(key).copied()
    }
}

/// 指标键：`name{k=v,...}`
pub fn metric_key(name: &str, labels: Labels<'_>) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let parts: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!("{}{{{}}}", name, parts.join(","))
}

impl MetricsSink for InMemoryMetrics {
    fn counter(&self, name: &str, labels: Labels<'_>, delta: u64) {
        *self
            .inner
            .lock()
            .counters
            .entry(metric_key(name, labels))
            .or_insert(0) += delta;
    }

    fn gauge(&self, name: &str, labels: Labels<'_>, value: f64) {
        self.inner
            .lock()
            .gauges
            .insert(metric_key(name, labels), value);
    }

    fn histogram(&self, name: &str, labels: Labels<'_>, value: f64) {
        self.inner
            .lock()
            .histograms
            .entry(metric_key(name, labels))
            .or_default()
            .push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_key_format() {
        assert_eq!(metric_key("alerts_sent_total", &[]), "alerts_sent_total");
        assert_eq!(
            metric_key("alerts_sent_total", &[("destination", "dm")]),
            "alerts_sent_total{destination=dm}"
        );
    }

    #[test]
    fn test_in_memory_counters_accumulate() {
        let metrics = InMemoryMetrics::new();
        metrics.counter("messages_ingested_total", &[], 1);
        metrics.counter("messages_ingested_total", &[], 2);
        metrics.gauge("stream_depth", &[], 4.0);
        metrics.histogram("score", &[], 1.5);

        assert_eq!(metrics.counter_value("messages_ingested_total"), 3);
        assert_eq!(metrics.gauge_value("stream_depth"), Some(4.0));
        assert_eq!(metrics.snapshot().histograms["score"], vec![1.5]);
    }
}
