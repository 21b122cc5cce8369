//! 配置 - 静态 settings.json、可热更新的 rules.json 与重载监视

pub mod reload;
pub mod rules;
pub mod settings;

pub use reload::{ActiveConfig, ConfigHandle, ConfigReloadWatcher, InterestTopic};
pub use rules::{
    AlertMode, AlertSettings, AnomalyMode, AnomalySettings, ChannelRule, DigestSettings,
    FixedThresholds, RuntimeConfig, ScoringWeights,
};
pub use settings::{
    default_data_dir, DeliverySettings, EmbeddingSettings, IpcSettings, SessionSettings,
    Settings, StreamSettings,
};
