//! 告警目标 trait 定义

use crate::error::Result;
use crate::model::MessageKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// 告警种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// 单条重要消息
    Message,
    /// 周期摘要
    Digest,
    /// 频道统计异常
    Anomaly,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Message => "message",
            AlertKind::Digest => "digest",
            AlertKind::Anomaly => "anomaly",
        }
    }
}

/// 待投递的告警
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMessage {
    pub kind: AlertKind,
    /// 对应的消息（摘要和异常告警没有）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<MessageKey>,
    pub title: String,
    /// 已格式化的正文
    pub body: String,
    #[serde(default)]
    pub score: f64,
}

impl AlertMessage {
    pub fn new(kind: AlertKind, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            kind,
            key: None,
            title: title.into(),
            body: body.into(),
            score: 0.0,
        }
    }

    pub fn with_key(mut self, key: MessageKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }

    /// 标题与正文合并后的纯文本
    pub fn text(&self) -> String {
        if self.title.is_empty() {
            self.body.clone()
        } else {
            format!("{}\n\n{}", self.title, self.body)
        }
    }
}

/// 目标类别，决定 `ALERT_MODE` 下是否选中
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationKind {
    /// 通过会话私信
    Dm,
    /// 通过 Bot 发到频道
    Channel,
    /// 本地审计日志，总是附加，不算投递确认
    Audit,
}

/// 发送结果
#[derive(Debug, Clone, PartialEq)]
pub enum SendResult {
    /// 发送成功
    Sent,
    /// 跳过（目标未配置等）
    Skipped(String),
    /// 发送失败
    Failed(String),
    /// 进程正在退出，本次未发送，不计为失败
    Interrupted(String),
}

/// 告警目标 trait
#[async_trait]
pub trait AlertDestination: Send + Sync {
    /// 目标名称（用于日志、指标和 `delivery_failures`）
    fn name(&self) -> &str;

    fn kind(&self) -> DestinationKind;

    /// 发送一次。`Err` 视为可重试，`Ok(Failed)` 视为不可重试
    async fn send(&self, message: &AlertMessage) -> Result<SendResult>;
}
