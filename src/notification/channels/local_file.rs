//! 本地文件目标 - 将所有告警追加到 JSONL 审计日志

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::Result;
use crate::model::MessageKey;
use crate::notification::channel::{
    AlertDestination, AlertKind, AlertMessage, DestinationKind, SendResult,
};

/// 审计日志中的一行
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub ts: DateTime<Utc>,
    pub kind: AlertKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<MessageKey>,
    pub score: f64,
    pub title: String,
    /// 截断后的正文
    pub summary: String,
}

/// 本地审计日志目标
pub struct LocalFileDestination {
    path: PathBuf,
}

impl LocalFileDestination {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, record: &AuditRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.lock_exclusive()?;
        let written = writeln!(file, "{}", serde_json::to_string(record)?);
        file.unlock()?;
        written?;
        Ok(())
    }
}

#[async_trait]
impl AlertDestination for LocalFileDestination {
    fn name(&self) -> &str {
        "local_file"
    }

    fn kind(&self) -> DestinationKind {
        DestinationKind::Audit
    }

    async fn send(&self, message: &AlertMessage) -> Result<SendResult> {
        let record = AuditRecord {
            ts: Utc::now(),
            kind: message.kind,
            key: message.key,
            score: message.score,
            title: message.title.clone(),
            summary: truncate_summary(&message.body, 200),
        };

        match self.append(&record) {
            Ok(()) => {
                debug!(destination = "local_file", key = ?message.key, "Alert recorded to audit log");
                Ok(SendResult::Sent)
            }
            Err(e) => {
                warn!(destination = "local_file", error = %e, "Failed to write audit log");
                Ok(SendResult::Failed(e.to_string()))
            }
        }
    }
}

/// 截断摘要到指定字符数
fn truncate_summary(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_appends_jsonl_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alerts.jsonl");
        let dest = LocalFileDestination::new(&path);
        let msg = AlertMessage::new(AlertKind::Message, "title", "body")
            .with_key(MessageKey { chat_id: 1, msg_id: 2 });

        assert_eq!(dest.send(&msg).await.unwrap(), SendResult::Sent);
        assert_eq!(dest.send(&msg).await.unwrap(), SendResult::Sent);

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<AuditRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].key, Some(MessageKey { chat_id: 1, msg_id: 2 }));
    }

    #[test]
    fn test_truncate_summary() {
        assert_eq!(truncate_summary("short", 10), "short");
        assert_eq!(truncate_summary("this is a long message", 10), "this is...");
    }
}
