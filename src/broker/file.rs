//! 文件 Broker - 状态保存在 JSON 文件中，每次操作都在文件锁内完成
//!
//! 同一主机上的 worker 与展示进程共享同一个目录即可互通。

use super::state::BrokerState;
use super::{Broker, EntryId, StreamEntry};
use crate::error::{Result, SentinelError};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 文件 Broker
#[derive(Debug, Clone)]
pub struct FileBroker {
    state_path: PathBuf,
}

impl FileBroker {
    /// 在指定目录下创建（目录不存在时自动创建）
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        Ok(Self {
            state_path: dir.join("broker.json"),
        })
    }

    fn lock_path(&self) -> PathBuf {
        self.state_path.with_extension("json.lock")
    }

    fn read_state(&self) -> Result<BrokerState> {
        if !self.state_path.exists() {
            return Ok(BrokerState::default());
        }
        let content = fs::read_to_string(&self.state_path)?;
        if content.trim().is_empty() {
            return Ok(BrokerState::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn write_state(&self, state: &BrokerState) -> Result<()> {
        let temp_path = self.state_path.with_extension("json.tmp");
        fs::write(&temp_path, serde_json::to_vec(state)?)?;
        fs::rename(&temp_path, &self.state_path)?;
        Ok(())
    }

    /// 在排他锁内执行读-改-写
    fn with_locked_state<F, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce(&mut BrokerState, DateTime<Utc>) -> Result<T>,
    {
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(self.lock_path())?;
        lock_file
            .lock_exclusive()
            .map_err(|e| SentinelError::Broker(format!("cannot lock broker state: {}", e)))?;

        let result = (|| {
            let now = Utc::now();
            let mut state = self.read_state()?;
            state.purge_expired(now);
            let result = operation(&mut state, now)?;
            self.write_state(&state)?;
            Ok(result)
        })();

        let _ = lock_file.unlock();
        result
    }

    /// 在共享锁内只读
    fn with_locked_state_read<F, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce(&BrokerState, DateTime<Utc>) -> T,
    {
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(self.lock_path())?;
        lock_file
            .lock_shared()
            .map_err(|e| SentinelError::Broker(format!("cannot lock broker state: {}", e)))?;

        let result = self.read_state().map(|state| operation(&state, Utc::now()));

        let _ = lock_file.unlock();
        result
    }
}

impl Broker for FileBroker {
    fn append(&self, stream: &str, payload: Value) -> Result<EntryId> {
        self.with_locked_state(|state, _| Ok(state.append(stream, payload)))
    }

    fn create_group(&self, stream: &str, group: &str) -> Result<bool> {
        self.with_locked_state(|state, _| Ok(state.create_group(stream, group)))
    }

    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        self.with_locked_state(|state, now| state.read_group(stream, group, consumer, count, now))
    }

    fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        self.with_locked_state(|state, now| {
            state.claim_idle(stream, group, consumer, min_idle, count, now)
        })
    }

    fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<usize> {
        self.with_locked_state(|state, _| Ok(state.ack(stream, group, ids)))
    }

    fn depth(&self, stream: &str, group: &str) -> Result<usize> {
        self.with_locked_state_read(|state, _| state.depth(stream, group))
    }

    fn len(&self, stream: &str) -> Result<usize> {
        self.with_locked_state_read(|state, _| state.len(stream))
    }

    fn trim(&self, stream: &str, max_len: usize) -> Result<usize> {
        self.with_locked_state(|state, _| Ok(state.trim(stream, max_len)))
    }

    fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        self.with_locked_state(|state, now| {
            state.set(key, value, ttl, now);
            Ok(())
        })
    }

    fn set_nx(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        self.with_locked_state(|state, now| Ok(state.set_nx(key, value, ttl, now)))
    }

    fn get(&self, key: &str) -> Result<Option<Value>> {
        self.with_locked_state_read(|state, now| state.get(key, now))
    }

    fn delete(&self, key: &str) -> Result<bool> {
        self.with_locked_state(|state, now| Ok(state.delete(key, now)))
    }

    fn push(&self, queue: &str, value: Value) -> Result<()> {
        self.with_locked_state(|state, _| {
            state.push(queue, value);
            Ok(())
        })
    }

    fn pop(&self, queue: &str) -> Result<Option<Value>> {
        self.with_locked_state(|state, _| Ok(state.pop(queue)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let broker = FileBroker::open(dir.path()).unwrap();
            broker.create_group("s", "g").unwrap();
            broker.append("s", json!({"text": "hello"})).unwrap();
            broker.set("status", json!("authorized"), None).unwrap();
        }

        let broker = FileBroker::open(dir.path()).unwrap();
        let entries = broker.read_group("s", "g", "c1", 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload["text"], "hello");
        assert_eq!(broker.get("status").unwrap(), Some(json!("authorized")));
    }

    #[test]
    fn test_two_handles_share_state() {
        let dir = tempdir().unwrap();
        let worker = FileBroker::open(dir.path()).unwrap();
        let dashboard = FileBroker::open(dir.path()).unwrap();

        dashboard.push("ipc:auth", json!({"id": "r1"})).unwrap();
        assert_eq!(worker.pop("ipc:auth").unwrap(), Some(json!({"id": "r1"})));
        assert_eq!(dashboard.pop("ipc:auth").unwrap(), None);
    }
}
