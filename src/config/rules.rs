//! 可热更新的运行时配置（rules.json）
//!
//! 包含频道规则、兴趣主题、告警模式、摘要、异常检测和评分权重。
//! 每次重载都整体替换，不做原地修改。

use crate::error::{Result, SentinelError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::Path;

/// 告警投递模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AlertMode {
    /// 通过会话私信（发给自己的收藏夹等）
    #[default]
    Dm,
    /// 通过 Bot 发到告警频道
    Channel,
    Both,
}

impl AlertMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertMode::Dm => "dm",
            AlertMode::Channel => "channel",
            AlertMode::Both => "both",
        }
    }
}

impl std::str::FromStr for AlertMode {
    type Err = SentinelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "dm" => Ok(AlertMode::Dm),
            "channel" => Ok(AlertMode::Channel),
            "both" => Ok(AlertMode::Both),
            other => Err(SentinelError::Config(format!("unknown alert mode: {}", other))),
        }
    }
}

/// 频道规则
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRule {
    pub channel_id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub vip_senders: BTreeSet<i64>,
    /// 有序关键词集合（加载时转小写并去重）
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub reaction_threshold: Option<u32>,
    #[serde(default)]
    pub reply_threshold: Option<u32>,
    #[serde(default)]
    pub rate_limit_per_hour: Option<u32>,
    #[serde(default)]
    pub min_alert_score: Option<f64>,
}

impl ChannelRule {
    /// 没有配置规则的频道使用的默认规则：无 VIP、无关键词、沿用全局阈值
    pub fn permissive(channel_id: i64) -> Self {
        Self {
            channel_id,
            name: String::new(),
            vip_senders: BTreeSet::new(),
            keywords: Vec::new(),
            reaction_threshold: None,
            reply_threshold: None,
            rate_limit_per_hour: None,
            min_alert_score: None,
        }
    }

    fn normalize(&mut self) {
        let mut seen = HashSet::new();
        self.keywords = self
            .keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty() && seen.insert(k.clone()))
            .collect();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertSettings {
    pub mode: AlertMode,
    /// 全局告警最低分
    pub min_score: f64,
    /// 全局每小时告警上限
    pub rate_limit_per_hour: u32,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            mode: AlertMode::Dm,
            min_score: 1.0,
            rate_limit_per_hour: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DigestSettings {
    pub hourly: bool,
    pub daily: bool,
    pub top_n: usize,
}

impl Default for DigestSettings {
    fn default() -> Self {
        Self {
            hourly: false,
            daily: true,
            top_n: 10,
        }
    }
}

/// 异常检测模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyMode {
    #[default]
    Stddev,
    Fixed,
}

/// 固定阈值（None 表示不检查）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FixedThresholds {
    pub volume: Option<f64>,
    pub avg_importance: Option<f64>,
    pub alert_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalySettings {
    pub mode: AnomalyMode,
    pub multiplier: f64,
    /// stddev 模式下至少需要的历史桶数
    pub min_history: usize,
    pub fixed: FixedThresholds,
    /// 检测到异常时是否发送告警
    pub notify: bool,
}

impl Default for AnomalySettings {
    fn default() -> Self {
        Self {
            mode: AnomalyMode::Stddev,
            multiplier: 2.0,
            min_history: 3,
            fixed: FixedThresholds::default(),
            notify: false,
        }
    }
}

/// 评分权重
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub vip: f64,
    /// 每个命中关键词的权重
    pub keyword: f64,
    pub reactions: f64,
    pub replies: f64,
    pub semantic: f64,
    /// 语义相似度阈值（低于阈值记 0）
    pub similarity_threshold: f64,
    pub max_score: f64,
    /// 全局反应数阈值
    pub reaction_threshold: u32,
    /// 全局回复数阈值
    pub reply_threshold: u32,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            vip: 1.0,
            keyword: 0.8,
            reactions: 0.5,
            replies: 0.5,
            semantic: 2.0,
            similarity_threshold: 0.42,
            max_score: 10.0,
            reaction_threshold: 10,
            reply_threshold: 5,
        }
    }
}

/// rules.json 的完整内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    pub channels: Vec<ChannelRule>,
    /// 兴趣主题文本
    pub interests: Vec<String>,
    pub alerts: AlertSettings,
    pub digest: DigestSettings,
    pub anomaly: AnomalySettings,
    pub scoring: ScoringWeights,
}

impl RuntimeConfig {
    /// 读取并校验 rules.json；文件不存在时返回默认配置
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = fs::read_to_string(path)?;
            serde_json::from_str::<RuntimeConfig>(&content)
                .map_err(|e| SentinelError::Config(format!("{}: {}", path.display(), e)))?
        } else {
            RuntimeConfig::default()
        };

        if let Ok(mode) = std::env::var("ALERT_MODE") {
            config.alerts.mode = mode.parse()?;
        }

        config.normalize();
        config.validate()?;
        Ok(config)
    }

    pub fn normalize(&mut self) {
        for rule in &mut self.channels {
            rule.normalize();
        }
        self.interests = self
            .interests
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
    }

    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for rule in &self.channels {
            if !ids.insert(rule.channel_id) {
                return Err(SentinelError::Config(format!(
                    "duplicate rule for channel {}",
                    rule.channel_id
                )));
            }
            if rule.min_alert_score.is_some_and(|s| !s.is_finite()) {
                return Err(SentinelError::Config(format!(
                    "channel {} has a non-finite min_alert_score",
                    rule.channel_id
                )));
            }
        }

        let w = &self.scoring;
        let weights = [w.vip, w.keyword, w.reactions, w.replies, w.semantic];
        if weights.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(SentinelError::Config(
                "scoring weights must be finite and non-negative".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&w.similarity_threshold) {
            return Err(SentinelError::Config(
                "similarity_threshold must be in [0, 1)".to_string(),
            ));
        }
        if !w.max_score.is_finite() || w.max_score <= 0.0 {
            return Err(SentinelError::Config("max_score must be positive".to_string()));
        }
        if !self.anomaly.multiplier.is_finite() || self.anomaly.multiplier <= 0.0 {
            return Err(SentinelError::Config(
                "anomaly multiplier must be positive".to_string(),
            ));
        }
        if self.digest.top_n == 0 {
            return Err(SentinelError::Config("digest top_n must be at least 1".to_string()));
        }
        Ok(())
    }
}
