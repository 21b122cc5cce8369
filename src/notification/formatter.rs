//! 告警格式化 - 将消息记录、摘要和异常转换为可读文本
//!
//! 格式原则：首行给出频道与分数，随后是命中信号和截断后的原文。

use super::channel::{AlertKind, AlertMessage};
use crate::anomaly::{AnomalyFlag, AnomalyMetric};
use crate::digest::Digest;
use crate::model::MessageRecord;

/// 正文预览的最大字符数
const PREVIEW_CHARS: usize = 280;
/// 摘要中每条的预览字符数
const DIGEST_PREVIEW_CHARS: usize = 80;

/// 单条重要消息告警
pub fn format_alert(record: &MessageRecord) -> AlertMessage {
    let title = format!(
        "⚡ {} · score {:.1}",
        record.channel_label(),
        record.score
    );

    let mut lines = Vec::new();
    if !record.matched.is_empty() {
        lines.push(format!("Signals: {}", record.matched.join(", ")));
    }
    lines.push(format!("From: {}", record.sender_id));
    if !record.text.trim().is_empty() {
        lines.push(String::new());
        lines.push(truncate_chars(record.text.trim(), PREVIEW_CHARS));
    }
    lines.push(String::new());
    lines.push(format!("ref {}", record.key()));

    AlertMessage::new(AlertKind::Message, title, lines.join("\n"))
        .with_key(record.key())
        .with_score(record.score)
}

/// 周期摘要
pub fn format_digest(digest: &Digest) -> AlertMessage {
    let title = format!(
        "📋 {} digest · {} – {} UTC",
        digest.period.as_str(),
        digest.start.format("%m-%d %H:%M"),
        digest.end.format("%m-%d %H:%M")
    );

    let mut lines: Vec<String> = digest
        .entries
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let marker = if r.alerted {
                " ✓"
            } else if r.rate_limited {
                " (rate limited)"
            } else {
                ""
            };
            format!(
                "{}. [{:.1}] {}: {}{}",
                i + 1,
                r.score,
                r.channel_label(),
                truncate_chars(&single_line(&r.text), DIGEST_PREVIEW_CHARS),
                marker
            )
        })
        .collect();
    if digest.eligible > digest.entries.len() {
        lines.push(format!(
            "… and {} more",
            digest.eligible - digest.entries.len()
        ));
    }

    let top = digest.entries.first().map(|r| r.score).unwrap_or(0.0);
    AlertMessage::new(AlertKind::Digest, title, lines.join("\n")).with_score(top)
}

/// 异常告警
pub fn format_anomaly(flag: &AnomalyFlag) -> AlertMessage {
    let metric = match flag.metric {
        AnomalyMetric::Volume => "message volume",
        AnomalyMetric::AvgImportance => "average importance",
        AnomalyMetric::AlertRate => "alert rate",
    };
    let title = format!("📈 Unusual {} in {}", metric, flag.channel_id);
    let body = format!(
        "Current {:.2} exceeds threshold {:.2} (bucket since {} UTC)",
        flag.value,
        flag.threshold,
        flag.bucket_start.format("%Y-%m-%d %H:%M")
    );
    AlertMessage::new(AlertKind::Anomaly, title, body)
}

/// 按字符截断，超出时追加省略号
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let kept: String = s.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{}…", kept)
}

fn single_line(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
