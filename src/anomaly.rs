//! 异常检测 - 每个频道按小时分桶的滚动统计
//!
//! 每条评分后的消息计入当前桶，随后用三个指标与历史桶比较：
//! - 消息量（volume）
//! - 平均重要度（score_sum / volume）
//! - 告警率（alerts / volume）
//!
//! stddev 模式下当前值超过 `mean + k * stddev` 即标记，
//! fixed 模式直接与配置常量比较。每个指标在同一桶内最多标记一次。

use crate::config::{AnomalyMode, AnomalySettings};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// 检测指标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyMetric {
    Volume,
    AvgImportance,
    AlertRate,
}

impl AnomalyMetric {
    pub const ALL: [AnomalyMetric; 3] = [
        AnomalyMetric::Volume,
        AnomalyMetric::AvgImportance,
        AnomalyMetric::AlertRate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyMetric::Volume => "volume",
            AnomalyMetric::AvgImportance => "avg_importance",
            AnomalyMetric::AlertRate => "alert_rate",
        }
    }

    fn index(&self) -> usize {
        match self {
            AnomalyMetric::Volume => 0,
            AnomalyMetric::AvgImportance => 1,
            AnomalyMetric::AlertRate => 2,
        }
    }
}

/// 一次异常标记
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyFlag {
    pub channel_id: i64,
    pub metric: AnomalyMetric,
    pub value: f64,
    pub threshold: f64,
    pub bucket_start: DateTime<Utc>,
}

/// 单个时间桶
#[derive(Debug, Clone)]
struct Bucket {
    start: DateTime<Utc>,
    volume: u64,
    alerts: u64,
    score_sum: f64,
    score_sumsq: f64,
    /// 按 `AnomalyMetric::index` 记录本桶是否已标记
    flagged: [bool; 3],
}

impl Bucket {
    fn empty(start: DateTime<Utc>) -> Self {
        Self {
            start,
            volume: 0,
            alerts: 0,
            score_sum: 0.0,
            score_sumsq: 0.0,
            flagged: [false; 3],
        }
    }

    /// 指标值；空桶没有平均重要度和告警率
    fn value(&self, metric: AnomalyMetric) -> Option<f64> {
        match metric {
            AnomalyMetric::Volume => Some(self.volume as f64),
            _ if self.volume == 0 => None,
            AnomalyMetric::AvgImportance => Some(self.score_sum / self.volume as f64),
            AnomalyMetric::AlertRate => Some(self.alerts as f64 / self.volume as f64),
        }
    }
}

/// 对外暴露的桶统计
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketStats {
    pub start: DateTime<Utc>,
    pub volume: u64,
    pub alerts: u64,
    pub avg_importance: f64,
    pub score_stddev: f64,
}

impl From<&Bucket> for BucketStats {
    fn from(bucket: &Bucket) -> Self {
        let (avg, std) = if bucket.volume == 0 {
            (0.0, 0.0)
        } else {
            let n = bucket.volume as f64;
            let mean = bucket.score_sum / n;
            let var = (bucket.score_sumsq / n - mean * mean).max(0.0);
            (mean, var.sqrt())
        };
        Self {
            start: bucket.start,
            volume: bucket.volume,
            alerts: bucket.alerts,
            avg_importance: avg,
            score_stddev: std,
        }
    }
}

/// 单频道的桶序列，最后一个为当前桶
#[derive(Debug, Default)]
struct ChannelStats {
    buckets: VecDeque<Bucket>,
}

/// 异常检测器
pub struct AnomalyDetector {
    bucket: Duration,
    history: usize,
    channels: Mutex<HashMap<i64, Arc<Mutex<ChannelStats>>>>,
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(Duration::hours(1), 24)
    }
}

impl AnomalyDetector {
    pub fn new(bucket: Duration, history: usize) -> Self {
        Self {
            bucket,
            history: history.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn bucket_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let size = self.bucket.num_seconds().max(1);
        let secs = at.timestamp();
        DateTime::<Utc>::from_timestamp(secs - secs.rem_euclid(size), 0).unwrap_or(at)
    }

    fn channel(&self, channel_id: i64) -> Arc<Mutex<ChannelStats>> {
        self.channels
            .lock()
            .entry(channel_id)
            .or_default()
            .clone()
    }

    /// 记录一条评分后的消息，返回新产生的异常标记
    pub fn observe(
        &self,
        channel_id: i64,
        score: f64,
        alerted: bool,
        at: DateTime<Utc>,
        settings: &AnomalySettings,
    ) -> Vec<AnomalyFlag> {
        let start = self.bucket_start(at);
        let stats = self.channel(channel_id);
        let mut stats = stats.lock();

        let current_start = stats.buckets.back().map(|b| b.start);
        match current_start {
            Some(current) if start < current => {
                // 迟到的消息只计入历史桶，不触发检测
                if let Some(bucket) = stats.buckets.iter_mut().find(|b| b.start == start) {
                    record(bucket, score, alerted);
                }
                return Vec::new();
            }
            Some(current) if start > current => {
                let horizon = start - self.bucket * self.history as i32;
                let mut next = current + self.bucket;
                if next < horizon {
                    // 间隔超过历史窗口，旧桶全部过期
                    stats.buckets.clear();
                    next = horizon;
                }
                while next < start {
                    stats.buckets.push_back(Bucket::empty(next));
                    next += self.bucket;
                }
                stats.buckets.push_back(Bucket::empty(start));
            }
            Some(_) => {}
            None => stats.buckets.push_back(Bucket::empty(start)),
        }
        while stats.buckets.len() > self.history + 1 {
            stats.buckets.pop_front();
        }

        let Some((current, history)) = split_current(&mut stats.buckets) else {
            return Vec::new();
        };
        record(current, score, alerted);

        let mut flags = Vec::new();
        for metric in AnomalyMetric::ALL {
            if current.flagged[metric.index()] {
                continue;
            }
            let Some(value) = current.value(metric) else {
                continue;
            };
            let threshold = match settings.mode {
                AnomalyMode::Stddev => {
                    let values: Vec<f64> = history.iter().filter_map(|b| b.value(metric)).collect();
                    if values.len() < settings.min_history.max(1) {
                        continue;
                    }
                    let (mean, std) = mean_stddev(&values);
                    if !exceeds_stddev(value, mean, std, settings.multiplier) {
                        continue;
                    }
                    mean + settings.multiplier * std
                }
                AnomalyMode::Fixed => {
                    let limit = match metric {
                        AnomalyMetric::Volume => settings.fixed.volume,
                        AnomalyMetric::AvgImportance => settings.fixed.avg_importance,
                        AnomalyMetric::AlertRate => settings.fixed.alert_rate,
                    };
                    match limit {
                        Some(limit) if value > limit => limit,
                        _ => continue,
                    }
                }
            };
            current.flagged[metric.index()] = true;
            flags.push(AnomalyFlag {
                channel_id,
                metric,
                value,
                threshold,
                bucket_start: current.start,
            });
        }
        flags
    }

    /// 丢弃超出历史范围的桶，返回移除的频道数
    pub fn trim(&self, now: DateTime<Utc>) -> usize {
        let horizon = self.bucket_start(now) - self.bucket * self.history as i32;
        let mut channels = self.channels.lock();
        let before = channels.len();
        channels.retain(|_, stats| {
            let mut stats = stats.lock();
            while stats.buckets.front().is_some_and(|b| b.start < horizon) {
                stats.buckets.pop_front();
            }
            !stats.buckets.is_empty()
        });
        before - channels.len()
    }

    /// 频道的桶统计（从旧到新）
    pub fn summary(&self, channel_id: i64) -> Vec<BucketStats> {
        let Some(stats) = self.channels.lock().get(&channel_id).cloned() else {
            return Vec::new();
        };
        let stats = stats.lock();
        stats.buckets.iter().map(BucketStats::from).collect()
    }
}

fn record(bucket: &mut Bucket, score: f64, alerted: bool) {
    bucket.volume += 1;
    if alerted {
        bucket.alerts += 1;
    }
    bucket.score_sum += score;
    bucket.score_sumsq += score * score;
}

fn split_current(buckets: &mut VecDeque<Bucket>) -> Option<(&mut Bucket, &[Bucket])> {
    let slice = buckets.make_contiguous();
    let (current, history) = slice.split_last_mut()?;
    Some((current, history))
}

/// 均值与总体标准差
pub fn mean_stddev(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// 当前值是否超过 `mean + k * std`
pub fn exceeds_stddev(value: f64, mean: f64, std: f64, k: f64) -> bool {
    value > mean + k * std
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FixedThresholds;
    use chrono::TimeZone;

    fn hour(h: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::hours(h)
    }

    fn feed(detector: &AnomalyDetector, at: DateTime<Utc>, n: usize, settings: &AnomalySettings) -> Vec<AnomalyFlag> {
        (0..n)
            .flat_map(|_| detector.observe(1, 1.0, false, at, settings))
            .collect()
    }

    #[test]
    fn test_exceeds_stddev_threshold() {
        assert!(exceeds_stddev(15.0, 10.0, 2.0, 2.0));
        assert!(!exceeds_stddev(13.0, 10.0, 2.0, 2.0));
        assert!(!exceeds_stddev(14.0, 10.0, 2.0, 2.0));
    }

    #[test]
    fn test_population_stddev() {
        let (mean, std) = mean_stddev(&[8.0, 12.0, 8.0, 12.0]);
        assert_eq!(mean, 10.0);
        assert_eq!(std, 2.0);
    }

    #[test]
    fn test_volume_spike_flagged_once_per_bucket() {
        let detector = AnomalyDetector::default();
        let settings = AnomalySettings::default();
        // 历史：8, 12, 8, 12 -> mean 10, std 2, 阈值 14
        for (h, n) in [(0, 8), (1, 12), (2, 8), (3, 12)] {
            assert!(feed(&detector, hour(h) + Duration::minutes(5), n, &settings).is_empty());
        }
        let flags = feed(&detector, hour(4) + Duration::minutes(5), 20, &settings);
        let volume: Vec<_> = flags
            .iter()
            .filter(|f| f.metric == AnomalyMetric::Volume)
            .collect();
        assert_eq!(volume.len(), 1);
        assert_eq!(volume[0].value, 15.0);
        assert_eq!(volume[0].threshold, 14.0);
        assert_eq!(volume[0].bucket_start, hour(4));
    }

    #[test]
    fn test_insufficient_history_never_flags() {
        let detector = AnomalyDetector::default();
        let settings = AnomalySettings::default();
        feed(&detector, hour(0), 1, &settings);
        feed(&detector, hour(1), 1, &settings);
        assert!(feed(&detector, hour(2), 50, &settings).is_empty());
    }

    #[test]
    fn test_fixed_mode_compares_constants() {
        let detector = AnomalyDetector::default();
        let settings = AnomalySettings {
            mode: AnomalyMode::Fixed,
            fixed: FixedThresholds {
                volume: Some(3.0),
                avg_importance: None,
                alert_rate: Some(0.5),
            },
            ..Default::default()
        };
        assert!(detector.observe(1, 1.0, false, hour(0), &settings).is_empty());
        assert!(detector.observe(1, 1.0, false, hour(0), &settings).is_empty());
        assert!(detector.observe(1, 1.0, false, hour(0), &settings).is_empty());
        let flags = detector.observe(1, 1.0, false, hour(0), &settings);
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].metric, AnomalyMetric::Volume);

        // 新桶中第一条即告警 -> 告警率 1.0 > 0.5
        let flags = detector.observe(1, 1.0, true, hour(1), &settings);
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].metric, AnomalyMetric::AlertRate);
    }

    #[test]
    fn test_gaps_are_filled_and_history_bounded() {
        let detector = AnomalyDetector::new(Duration::hours(1), 4);
        let settings = AnomalySettings::default();
        detector.observe(1, 2.0, false, hour(0), &settings);
        detector.observe(1, 2.0, false, hour(3), &settings);
        let summary = detector.summary(1);
        assert_eq!(summary.len(), 4);
        assert_eq!(summary[1].volume, 0);

        detector.observe(1, 2.0, false, hour(10), &settings);
        assert_eq!(detector.summary(1).len(), 5);
    }

    #[test]
    fn test_long_silence_fills_only_history() {
        let detector = AnomalyDetector::new(Duration::hours(1), 4);
        let settings = AnomalySettings::default();
        detector.observe(1, 2.0, false, hour(0), &settings);
        // 约十万年的空档，只补历史窗口内的空桶
        let far = hour(24 * 365 * 100_000);
        detector.observe(1, 2.0, false, far, &settings);
        let summary = detector.summary(1);
        assert_eq!(summary.len(), 5);
        assert_eq!(summary[0].start, far - Duration::hours(4));
        assert!(summary[..4].iter().all(|b| b.volume == 0));
        assert_eq!(summary[4].volume, 1);
    }

    #[test]
    fn test_late_message_does_not_flag() {
        let detector = AnomalyDetector::default();
        let settings = AnomalySettings::default();
        detector.observe(1, 2.0, false, hour(5), &settings);
        assert!(detector.observe(1, 4.0, false, hour(2), &settings).is_empty());
        assert_eq!(detector.summary(1).len(), 1);
    }

    #[test]
    fn test_trim_drops_stale_channels() {
        let detector = AnomalyDetector::default();
        let settings = AnomalySettings::default();
        detector.observe(1, 1.0, false, hour(0), &settings);
        detector.observe(2, 1.0, false, hour(30), &settings);
        assert_eq!(detector.trim(hour(30)), 1);
        assert!(detector.summary(1).is_empty());
        assert_eq!(detector.summary(2).len(), 1);
    }
}
