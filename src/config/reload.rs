//! 配置热更新 - 轮询 rules.json 与 reload 标记文件
//!
//! 新配置完整加载、向量化、校验通过后才整体替换；
//! 任何一步失败都保留旧快照，摄取不受影响。

use super::rules::RuntimeConfig;
use crate::error::{Result, SentinelError};
use crate::metrics::MetricsSink;
use crate::scoring::{Embedder, RuleMatcher};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// 已向量化的兴趣主题
#[derive(Debug, Clone, PartialEq)]
pub struct InterestTopic {
    pub text: String,
    pub embedding: Vec<f32>,
}

/// 一份完整的配置快照（规则 + 主题 + 各项设置）
#[derive(Debug, Clone)]
pub struct ActiveConfig {
    pub runtime: RuntimeConfig,
    pub matcher: RuleMatcher,
    pub topics: Vec<InterestTopic>,
    pub version: u64,
    pub loaded_at: DateTime<Utc>,
}

impl ActiveConfig {
    pub fn new(runtime: RuntimeConfig, topics: Vec<InterestTopic>, version: u64) -> Self {
        let matcher = RuleMatcher::new(&runtime);
        Self {
            runtime,
            matcher,
            topics,
            version,
            loaded_at: Utc::now(),
        }
    }
}

/// 当前快照的共享句柄
///
/// 读者只克隆 `Arc`，重载时整体替换指针。
pub struct ConfigHandle {
    current: RwLock<Arc<ActiveConfig>>,
}

impl ConfigHandle {
    pub fn new(initial: ActiveConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    pub fn snapshot(&self) -> Arc<ActiveConfig> {
        self.current.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    pub(crate) fn swap(&self, next: ActiveConfig) {
        *self.current.write() = Arc::new(next);
    }
}

/// 被监视文件的状态（修改时间 + 大小）
type FileStamp = Option<(SystemTime, u64)>;

fn stamp(path: &Path) -> FileStamp {
    let metadata = std::fs::metadata(path).ok()?;
    Some((metadata.modified().ok()?, metadata.len()))
}

/// 配置重载监视器
pub struct ConfigReloadWatcher {
    rules_path: PathBuf,
    marker_path: PathBuf,
    handle: Arc<ConfigHandle>,
    embedder: Option<Arc<dyn Embedder>>,
    metrics: Arc<dyn MetricsSink>,
    last_seen: Mutex<(FileStamp, FileStamp)>,
}

impl ConfigReloadWatcher {
    /// 加载初始配置并创建监视器
    ///
    /// 初始配置无效时直接返回错误，没有旧快照可以沿用。
    pub async fn start(
        rules_path: PathBuf,
        marker_path: PathBuf,
        embedder: Option<Arc<dyn Embedder>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        let seen = (stamp(&rules_path), stamp(&marker_path));
        let active = build_snapshot(&rules_path, embedder.as_deref(), 1).await?;
        info!(
            channels = active.runtime.channels.len(),
            topics = active.topics.len(),
            mode = active.runtime.alerts.mode.as_str(),
            "Config loaded"
        );
        Ok(Self {
            rules_path,
            marker_path,
            handle: Arc::new(ConfigHandle::new(active)),
            embedder,
            metrics,
            last_seen: Mutex::new(seen),
        })
    }

    pub fn handle(&self) -> Arc<ConfigHandle> {
        self.handle.clone()
    }

    /// 立即重载，返回新版本号
    pub async fn reload_now(&self) -> Result<u64> {
        let next_version = self.handle.version() + 1;
        match build_snapshot(&self.rules_path, self.embedder.as_deref(), next_version).await {
            Ok(active) => {
                info!(
                    version = next_version,
                    channels = active.runtime.channels.len(),
                    topics = active.topics.len(),
                    "Config reloaded"
                );
                self.handle.swap(active);
                Ok(next_version)
            }
            Err(e) => {
                let err = match e {
                    SentinelError::ReloadFailure(_) => e,
                    other => SentinelError::ReloadFailure(other.to_string()),
                };
                error!(error = %err, version = self.handle.version(), "Keeping previous config");
                self.metrics.counter("reload_failures_total", &[], 1);
                Err(err)
            }
        }
    }

    /// 检查一次文件变化，有变化则重载。返回是否发生了重载尝试
    pub async fn check_once(&self) -> bool {
        let current = (stamp(&self.rules_path), stamp(&self.marker_path));
        {
            let mut last = self.last_seen.lock();
            if *last == current {
                return false;
            }
            *last = current;
        }
        debug!(path = %self.rules_path.display(), "Config change detected");
        // 失败已在 reload_now 中记录
        let _ = self.reload_now().await;
        true
    }

    /// 轮询直到取消
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Config watcher stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.check_once().await;
                }
            }
        }
    }
}

async fn build_snapshot(
    rules_path: &Path,
    embedder: Option<&dyn Embedder>,
    version: u64,
) -> Result<ActiveConfig> {
    let runtime = RuntimeConfig::load(rules_path)
        .map_err(|e| SentinelError::ReloadFailure(e.to_string()))?;

    let topics = match embedder {
        Some(embedder) if !runtime.interests.is_empty() => {
            let vectors = embedder
                .embed(&runtime.interests)
                .await
                .map_err(|e| SentinelError::ReloadFailure(format!("topic embedding failed: {}", e)))?;
            runtime
                .interests
                .iter()
                .cloned()
                .zip(vectors)
                .map(|(text, embedding)| InterestTopic { text, embedding })
                .collect()
        }
        _ => Vec::new(),
    };

    Ok(ActiveConfig::new(runtime, topics, version))
}
