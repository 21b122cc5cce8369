//! 评分引擎 - 启发式信号与语义相似度合成单一重要度分数
//!
//! 合成规则：`score = clamp(启发式加权和 + 语义项, 0, max_score)`
//! - VIP 发送者：`vip`（二值）
//! - 关键词：命中数 × `keyword`
//! - 反应/回复达到阈值：`reactions` / `replies`（二值）
//! - 语义项：与最近兴趣主题的余弦相似度 `sim`，
//!   低于阈值 `t` 记 0，否则 `(sim - t) / (1 - t) × semantic`
//!
//! 评分本身是纯函数，同一输入与配置总是得到相同结果。

use super::embedding::{cosine_similarity, Embedder};
use crate::config::reload::{ActiveConfig, InterestTopic};
use crate::model::IncomingMessage;
use std::sync::Arc;
use tracing::warn;

/// 评分明细
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreBreakdown {
    pub score: f64,
    pub heuristic: f64,
    pub semantic: f64,
    /// 最近的兴趣主题及相似度
    pub nearest_topic: Option<(String, f32)>,
    /// 命中信号（用于告警文本）
    pub matched: Vec<String>,
    pub rate_limit_per_hour: u32,
    pub min_alert_score: f64,
}

impl ScoreBreakdown {
    /// 是否达到告警分数线
    pub fn is_admissible(&self) -> bool {
        self.score > 0.0 && self.score >= self.min_alert_score
    }
}

/// 评分引擎
#[derive(Clone, Default)]
pub struct ScoringEngine {
    embedder: Option<Arc<dyn Embedder>>,
}

impl ScoringEngine {
    pub fn new(embedder: Option<Arc<dyn Embedder>>) -> Self {
        Self { embedder }
    }

    pub fn embeddings_enabled(&self) -> bool {
        self.embedder.is_some()
    }

    /// 计算消息向量；未启用、无主题或空文本时返回 None，失败只记日志
    pub async fn embed_message(
        &self,
        snapshot: &ActiveConfig,
        message: &IncomingMessage,
    ) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        if snapshot.topics.is_empty() || message.text.trim().is_empty() {
            return None;
        }
        match embedder.embed(&[message.text.clone()]).await {
            Ok(mut vectors) => vectors.pop(),
            Err(e) => {
                warn!(
                    chat_id = message.chat_id,
                    msg_id = message.msg_id,
                    error = %e,
                    "Message embedding failed, scoring without semantic term"
                );
                None
            }
        }
    }

    /// 对消息评分
    pub fn score(
        &self,
        snapshot: &ActiveConfig,
        message: &IncomingMessage,
        embedding: Option<&[f32]>,
    ) -> ScoreBreakdown {
        let config = &snapshot.runtime;
        let weights = &config.scoring;
        let rule_match = snapshot.matcher.evaluate(config, message);

        let mut matched = Vec::new();
        let mut heuristic = 0.0;

        if rule_match.vip {
            heuristic += weights.vip;
            matched.push("vip".to_string());
        }
        if !rule_match.keyword_hits.is_empty() {
            heuristic += rule_match.keyword_hits.len() as f64 * weights.keyword;
            matched.extend(rule_match.keyword_hits.iter().map(|k| format!("keyword:{}", k)));
        }
        if rule_match.reactions_hit {
            heuristic += weights.reactions;
            matched.push(format!("reactions>={}", rule_match.reaction_threshold));
        }
        if rule_match.replies_hit {
            heuristic += weights.replies;
            matched.push(format!("replies>={}", rule_match.reply_threshold));
        }

        let nearest_topic = match embedding {
            Some(vector) if !message.text.trim().is_empty() => nearest_topic(&snapshot.topics, vector),
            _ => None,
        };
        let semantic = nearest_topic
            .as_ref()
            .map(|(_, sim)| semantic_term(*sim as f64, weights.similarity_threshold, weights.semantic))
            .unwrap_or(0.0);
        if semantic > 0.0 {
            if let Some((topic, sim)) = &nearest_topic {
                matched.push(format!("topic:{} ({:.2})", topic, sim));
            }
        }

        ScoreBreakdown {
            score: (heuristic + semantic).clamp(0.0, weights.max_score),
            heuristic,
            semantic,
            nearest_topic,
            matched,
            rate_limit_per_hour: rule_match.rate_limit_per_hour,
            min_alert_score: rule_match.min_alert_score,
        }
    }
}

/// 找出与消息向量最相似的主题
pub fn nearest_topic(topics: &[InterestTopic], vector: &[f32]) -> Option<(String, f32)> {
    topics
        .iter()
        .map(|t| (t.text.clone(), cosine_similarity(&t.embedding, vector)))
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

/// 相似度相对阈值的缩放
pub fn semantic_term(similarity: f64, threshold: f64, weight: f64) -> f64 {
    if similarity < threshold || threshold >= 1.0 {
        return 0.0;
    }
    ((similarity - threshold) / (1.0 - threshold)).clamp(0.0, 1.0) * weight
}
