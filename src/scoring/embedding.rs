//! Embedding 模块 - 计算消息与兴趣主题的语义相似度
//!
//! 使用 OpenAI 兼容的 `/embeddings` 接口。主题向量在配置加载时预计算，
//! 消息向量在评分前按条计算。

use crate::config::EmbeddingSettings;
use crate::error::{Result, SentinelError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Embedding API 请求体
#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    encoding_format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<u32>,
}

/// Embedding API 响应体
#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// 文本向量化
#[async_trait]
pub trait Embedder: Send + Sync {
    /// 批量计算向量，返回顺序与输入一致
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embedding 客户端
pub struct EmbeddingClient {
    client: reqwest::Client,
    settings: EmbeddingSettings,
}

impl EmbeddingClient {
    pub fn new(settings: EmbeddingSettings) -> Result<Self> {
        if settings.api_key.is_empty() {
            return Err(SentinelError::Config(
                "embeddings enabled but no API key configured".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()?;
        Ok(Self { client, settings })
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    /// 自动分批，每批最多 10 条
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        const BATCH_SIZE: usize = 10;
        let mut all = Vec::with_capacity(texts.len());

        for chunk in texts.chunks(BATCH_SIZE) {
            let request = EmbeddingRequest {
                model: &self.settings.model,
                input: chunk,
                encoding_format: "float",
                dimensions: self.settings.dimensions,
            };

            let response = self
                .client
                .post(format!(
                    "{}/embeddings",
                    self.settings.base_url.trim_end_matches('/')
                ))
                .bearer_auth(&self.settings.api_key)
                .json(&request)
                .send()
                .await?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(SentinelError::ConnectionLost(format!(
                    "embedding API returned {}: {}",
                    status, body
                )));
            }

            let mut result: EmbeddingResponse = response.json().await?;
            result.data.sort_by_key(|d| d.index);
            all.extend(result.data.into_iter().map(|d| d.embedding));
        }

        if all.len() != texts.len() {
            return Err(SentinelError::ConnectionLost(format!(
                "embedding API returned {} vectors for {} inputs",
                all.len(),
                texts.len()
            )));
        }
        Ok(all)
    }
}

/// 计算两个向量的余弦相似度
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}
