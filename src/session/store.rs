//! 凭据存储 - 会话状态的唯一写入者
//!
//! 打开时获取 `<path>.lock` 的独占锁，整个进程生命周期内持有。
//! 写入先落临时文件再 rename，崩溃时不会留下半截内容。

use crate::error::{Result, SentinelError};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// 持久化的会话状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// 平台导出的不透明会话串
    pub blob: String,
    #[serde(default)]
    pub account: Option<String>,
    pub saved_at: DateTime<Utc>,
}

/// 凭据存储（写模式）
#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    _lock: File,
}

impl CredentialStore {
    /// 以写模式打开；另一个进程已持有时返回 `PersistenceFailure`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path.with_extension("lock"))?;
        lock.try_lock_exclusive().map_err(|_| {
            SentinelError::PersistenceFailure(format!(
                "{} is owned by another process",
                path.display()
            ))
        })?;
        Ok(Self { path, _lock: lock })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<SessionState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// 原子写入
    pub fn save(&self, state: &SessionState) -> Result<()> {
        let temp_path = self.path.with_extension("json.tmp");
        {
            let mut temp = File::create(&temp_path)?;
            temp.write_all(serde_json::to_string_pretty(state)?.as_bytes())?;
            temp.sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;
        debug!(path = %self.path.display(), "Session state saved");
        Ok(())
    }
}
