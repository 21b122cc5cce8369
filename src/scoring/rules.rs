//! 规则匹配 - 按频道规则计算启发式信号

use crate::config::{ChannelRule, RuntimeConfig, ScoringWeights};
use crate::model::IncomingMessage;
use std::collections::HashMap;

/// 单条消息的规则命中情况
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub channel_id: i64,
    pub vip: bool,
    /// 命中的关键词（按规则中的顺序）
    pub keyword_hits: Vec<String>,
    pub reactions_hit: bool,
    pub replies_hit: bool,
    pub reaction_threshold: u32,
    pub reply_threshold: u32,
    /// 该频道生效的每小时告警上限
    pub rate_limit_per_hour: u32,
    pub min_alert_score: f64,
}

/// 规则匹配器，随配置快照一起构建，构建后只读
#[derive(Debug, Clone, Default)]
pub struct RuleMatcher {
    rules: HashMap<i64, ChannelRule>,
}

impl RuleMatcher {
    pub fn new(config: &RuntimeConfig) -> Self {
        let rules = config
            .channels
            .iter()
            .map(|r| (r.channel_id, r.clone()))
            .collect();
        Self { rules }
    }

    pub fn rule_for(&self, channel_id: i64) -> Option<&ChannelRule> {
        self.rules.get(&channel_id)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// 匹配消息；没有规则的频道使用默认宽松规则
    pub fn evaluate(&self, config: &RuntimeConfig, message: &IncomingMessage) -> RuleMatch {
        let permissive;
        let rule = match self.rules.get(&message.chat_id) {
            Some(rule) => rule,
            None => {
                permissive = ChannelRule::permissive(message.chat_id);
                &permissive
            }
        };
        evaluate_rule(rule, &config.scoring, config.alerts.rate_limit_per_hour, config.alerts.min_score, message)
    }
}

fn evaluate_rule(
    rule: &ChannelRule,
    weights: &ScoringWeights,
    default_rate_limit: u32,
    default_min_score: f64,
    message: &IncomingMessage,
) -> RuleMatch {
    let reaction_threshold = rule.reaction_threshold.unwrap_or(weights.reaction_threshold);
    let reply_threshold = rule.reply_threshold.unwrap_or(weights.reply_threshold);

    let keyword_hits = if message.text.trim().is_empty() {
        Vec::new()
    } else {
        let lowered = message.text.to_lowercase();
        rule.keywords
            .iter()
            .filter(|k| lowered.contains(k.as_str()))
            .cloned()
            .collect()
    };

    RuleMatch {
        channel_id: message.chat_id,
        vip: rule.vip_senders.contains(&message.sender_id),
        keyword_hits,
        // 阈值为 0 视为未启用
        reactions_hit: reaction_threshold > 0 && message.reactions >= reaction_threshold,
        replies_hit: reply_threshold > 0 && message.reply_count >= reply_threshold,
        reaction_threshold,
        reply_threshold,
        rate_limit_per_hour: rule.rate_limit_per_hour.unwrap_or(default_rate_limit),
        min_alert_score: rule.min_alert_score.unwrap_or(default_min_score),
    }
}
