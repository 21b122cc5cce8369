//! 评分 - 规则匹配、语义相似度与分数合成

pub mod embedding;
pub mod engine;
pub mod rules;

pub use embedding::{cosine_similarity, Embedder, EmbeddingClient};
pub use engine::{ScoreBreakdown, ScoringEngine};
pub use rules::{RuleMatch, RuleMatcher};
