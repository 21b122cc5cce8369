//! 静态配置（settings.json）- 启动时加载，运行期间不变

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 摄取流配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub name: String,
    pub group: String,
    /// 消费者名称，为空时使用 `worker-<pid>`
    pub consumer: String,
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    /// pending 超过该时长即可被任何消费者回收
    pub min_idle_secs: u64,
    /// 超过该投递次数的条目转入死信
    pub max_deliveries: u32,
    pub max_len: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            name: "sentinel:messages".to_string(),
            group: "sentinel-workers".to_string(),
            consumer: String::new(),
            batch_size: 50,
            poll_interval_ms: 500,
            min_idle_secs: 300,
            max_deliveries: 5,
            max_len: 10_000,
        }
    }
}

impl StreamSettings {
    pub fn consumer_name(&self) -> String {
        if self.consumer.is_empty() {
            format!("worker-{}", std::process::id())
        } else {
            self.consumer.clone()
        }
    }
}

/// Session Owner 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// 平台网关地址
    pub gateway_url: String,
    pub persist_interval_secs: u64,
    /// 特权读取的处理超时
    pub request_timeout_secs: u64,
    pub update_poll_secs: u64,
    pub ipc_poll_ms: u64,
    pub reconnect_attempts: u32,
    pub reconnect_backoff_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            gateway_url: "http://127.0.0.1:8787".to_string(),
            persist_interval_secs: 60,
            request_timeout_secs: 15,
            update_poll_secs: 2,
            ipc_poll_ms: 500,
            reconnect_attempts: 5,
            reconnect_backoff_ms: 500,
        }
    }
}

impl SessionSettings {
    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.persist_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcSettings {
    pub request_ttl_secs: u64,
    pub response_ttl_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for IpcSettings {
    fn default() -> Self {
        Self {
            request_ttl_secs: 120,
            response_ttl_secs: 30,
            poll_interval_ms: 200,
        }
    }
}

/// 告警投递配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    /// 私信目标（"me" 表示收藏夹）
    pub dm_target: String,
    pub bot_api_url: String,
    /// Bot token，建议通过 SENTINEL_BOT_TOKEN 提供
    #[serde(skip_serializing)]
    pub bot_token: Option<String>,
    /// 告警频道 ID 或 @username
    pub alert_channel: Option<String>,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// 额外写入本地 alerts.jsonl
    pub audit_log: bool,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            dm_target: "me".to_string(),
            bot_api_url: "https://api.telegram.org".to_string(),
            bot_token: None,
            alert_channel: None,
            max_retries: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            audit_log: true,
        }
    }
}

/// 语义向量配置（OpenAI 兼容 embeddings 接口）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub enabled: bool,
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub model: String,
    pub dimensions: Option<u32>,
    pub timeout_ms: u64,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "text-embedding-3-small".to_string(),
            dimensions: None,
            timeout_ms: 2_000,
        }
    }
}

/// 全部静态配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(skip)]
    pub data_dir: PathBuf,
    pub stream: StreamSettings,
    pub session: SessionSettings,
    pub ipc: IpcSettings,
    pub delivery: DeliverySettings,
    pub embeddings: EmbeddingSettings,
    /// 消息记录保留天数
    pub retention_days: i64,
    pub reload_poll_secs: u64,
    /// 统计裁剪、存储压缩等维护任务的间隔
    pub maintenance_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            stream: StreamSettings::default(),
            session: SessionSettings::default(),
            ipc: IpcSettings::default(),
            delivery: DeliverySettings::default(),
            embeddings: EmbeddingSettings::default(),
            retention_days: 30,
            reload_poll_secs: 5,
            maintenance_interval_secs: 300,
        }
    }
}

/// 默认数据目录 ~/.config/chat-sentinel
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("chat-sentinel")
}

impl Settings {
    /// 从数据目录加载 settings.json，并应用环境变量覆盖
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("settings.json");
        let mut settings = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("cannot read {}", path.display()))?;
            serde_json::from_str::<Settings>(&content)
                .with_context(|| format!("cannot parse {}", path.display()))?
        } else {
            Settings::default()
        };
        settings.data_dir = data_dir.to_path_buf();
        settings.apply_env();
        Ok(settings)
    }

    fn apply_env(&mut self) {
        if let Ok(token) = std::env::var("SENTINEL_BOT_TOKEN") {
            if !token.is_empty() {
                self.delivery.bot_token = Some(token);
            }
        }
        if let Ok(key) = std::env::var("SENTINEL_EMBEDDING_API_KEY") {
            self.embeddings.api_key = key;
        }
        if let Ok(url) = std::env::var("SENTINEL_GATEWAY_URL") {
            self.session.gateway_url = url.trim_end_matches('/').to_string();
        }
    }

    pub fn rules_path(&self) -> PathBuf {
        self.data_dir.join("rules.json")
    }

    pub fn reload_marker_path(&self) -> PathBuf {
        self.data_dir.join("reload")
    }

    pub fn session_path(&self) -> PathBuf {
        self.data_dir.join("session.json")
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("messages.jsonl")
    }

    pub fn broker_dir(&self) -> PathBuf {
        self.data_dir.join("broker")
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.data_dir.join("alerts.jsonl")
    }
}
