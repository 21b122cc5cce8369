//! 消息模型 - 流中的原始消息与评分后的消息记录

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

/// 平台推送的原始消息（写入摄取流的 payload）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub chat_id: i64,
    pub msg_id: i64,
    pub sender_id: i64,
    #[serde(default)]
    pub chat_title: Option<String>,
    #[serde(default)]
    pub text: String,
    /// 反应总数
    #[serde(default)]
    pub reactions: u32,
    #[serde(default)]
    pub reply_count: u32,
    pub received_at: DateTime<Utc>,
}

impl IncomingMessage {
    pub fn key(&self) -> MessageKey {
        MessageKey {
            chat_id: self.chat_id,
            msg_id: self.msg_id,
        }
    }

    pub fn dedupe_hash(&self) -> String {
        dedupe_hash(self.chat_id, self.msg_id, &self.text)
    }
}

/// 消息唯一键 (chat_id, msg_id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageKey {
    pub chat_id: i64,
    pub msg_id: i64,
}

impl std::fmt::Display for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.chat_id, self.msg_id)
    }
}

/// 评分后的消息记录
///
/// 评分后不可变，只有 `alerted` 可以从 false 变为 true，
/// `delivery_failures` 只追加。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub chat_id: i64,
    pub msg_id: i64,
    pub sender_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_title: Option<String>,
    pub text: String,
    pub reactions: u32,
    pub reply_count: u32,
    pub received_at: DateTime<Utc>,
    pub score: f64,
    pub alerted: bool,
    pub dedupe_hash: String,
    /// 因限流未告警（仍可进入摘要）
    #[serde(default)]
    pub rate_limited: bool,
    /// 命中的信号，用于告警文本
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matched: Vec<String>,
    /// 投递失败的目标
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delivery_failures: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn from_scored(
        message: &IncomingMessage,
        score: f64,
        matched: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            chat_id: message.chat_id,
            msg_id: message.msg_id,
            sender_id: message.sender_id,
            chat_title: message.chat_title.clone(),
            text: message.text.clone(),
            reactions: message.reactions,
            reply_count: message.reply_count,
            received_at: message.received_at,
            score,
            alerted: false,
            dedupe_hash: message.dedupe_hash(),
            rate_limited: false,
            matched,
            delivery_failures: Vec::new(),
            created_at: now,
        }
    }

    pub fn key(&self) -> MessageKey {
        MessageKey {
            chat_id: self.chat_id,
            msg_id: self.msg_id,
        }
    }

    /// 告警/摘要中显示的频道名
    pub fn channel_label(&self) -> String {
        self.chat_title
            .clone()
            .unwrap_or_else(|| self.chat_id.to_string())
    }
}

/// 用户反馈标签
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub chat_id: i64,
    pub msg_id: i64,
    /// 如 "up" / "down"
    pub label: String,
    pub created_at: DateTime<Utc>,
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("valid whitespace regex"))
}

/// 生成稳定的去重指纹
///
/// 文本先压缩空白再参与哈希，平台重发时的空白差异不影响结果。
pub fn dedupe_hash(chat_id: i64, msg_id: i64, text: &str) -> String {
    let normalized = whitespace_re().replace_all(text.trim(), " ");
    let mut hasher = Sha256::new();
    hasher.update(chat_id.to_be_bytes());
    hasher.update(msg_id.to_be_bytes());
    hasher.update(normalized.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
