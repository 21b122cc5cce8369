//! 消息存储 - 评分记录与反馈的 JSONL 日志
//!
//! 写入进程通过 `<path>.lock` 上的独占文件锁保证唯一，
//! 其他进程只能用 `load_snapshot` 只读加载。
//! 日志只追加，`compact` 按保留期重写为快照。

use crate::error::{Result, SentinelError};
use crate::model::{FeedbackRecord, MessageKey, MessageRecord};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 日志条目
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalEntry {
    Recorded {
        record: MessageRecord,
    },
    Alerted {
        chat_id: i64,
        msg_id: i64,
        at: DateTime<Utc>,
    },
    DeliveryFailed {
        chat_id: i64,
        msg_id: i64,
        destination: String,
    },
    Feedback {
        feedback: FeedbackRecord,
    },
}

/// 插入结果
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted,
    /// 相同键或相同指纹的记录已存在
    Duplicate(MessageRecord),
}

#[derive(Default)]
struct StoreState {
    records: HashMap<MessageKey, MessageRecord>,
    by_hash: HashMap<String, MessageKey>,
    feedback: Vec<FeedbackRecord>,
    journal: Option<File>,
}

impl StoreState {
    fn apply(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::Recorded { record } => {
                let key = record.key();
                if self.records.contains_key(&key) {
                    return;
                }
                self.by_hash.insert(record.dedupe_hash.clone(), key);
                self.records.insert(key, record);
            }
            JournalEntry::Alerted { chat_id, msg_id, .. } => {
                if let Some(record) = self.records.get_mut(&MessageKey { chat_id, msg_id }) {
                    record.alerted = true;
                }
            }
            JournalEntry::DeliveryFailed {
                chat_id,
                msg_id,
                destination,
            } => {
                if let Some(record) = self.records.get_mut(&MessageKey { chat_id, msg_id }) {
                    record.delivery_failures.push(destination);
                }
            }
            JournalEntry::Feedback { feedback } => self.feedback.push(feedback),
        }
    }

    fn append(&mut self, entry: &JournalEntry) -> Result<()> {
        if let Some(file) = self.journal.as_mut() {
            writeln!(file, "{}", serde_json::to_string(entry)?)?;
            file.flush()?;
        }
        Ok(())
    }
}

/// 消息与反馈存储
pub struct MessageStore {
    path: Option<PathBuf>,
    state: Mutex<StoreState>,
    read_only: bool,
    /// 持有期间保持独占锁
    _lock: Option<File>,
}

impl MessageStore {
    /// 以写模式打开存储；已有其他写进程时失败
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path(&path))?;
        lock.try_lock_exclusive().map_err(|_| {
            SentinelError::PersistenceFailure(format!(
                "{} is already opened for writing by another process",
                path.display()
            ))
        })?;

        let mut state = read_journal(&path)?;
        state.journal = Some(OpenOptions::new().create(true).append(true).open(&path)?);
        info!(
            path = %path.display(),
            records = state.records.len(),
            feedback = state.feedback.len(),
            "Message store opened"
        );

        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
            read_only: false,
            _lock: Some(lock),
        })
    }

    /// 不落盘的存储（测试与 dry-run）
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(StoreState::default()),
            read_only: false,
            _lock: None,
        }
    }

    /// 只读快照，不获取写锁
    pub fn load_snapshot(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = read_journal(&path)?;
        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
            read_only: true,
            _lock: None,
        })
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(SentinelError::PersistenceFailure(
                "store snapshot is read-only".to_string(),
            ));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &MessageKey) -> Option<MessageRecord> {
        self.state.lock().records.get(key).cloned()
    }

    pub fn find_by_hash(&self, hash: &str) -> Option<MessageRecord> {
        let state = self.state.lock();
        let key = state.by_hash.get(hash)?;
        state.records.get(key).cloned()
    }

    /// 插入新评分的记录；同键或同指纹已存在时返回已有记录
    pub fn insert(&self, record: MessageRecord) -> Result<InsertOutcome> {
        self.ensure_writable()?;
        let mut state = self.state.lock();
        let key = record.key();
        let existing = state.records.get(&key).or_else(|| {
            state
                .by_hash
                .get(&record.dedupe_hash)
                .and_then(|k| state.records.get(k))
        });
        if let Some(existing) = existing {
            return Ok(InsertOutcome::Duplicate(existing.clone()));
        }

        let entry = JournalEntry::Recorded { record };
        state.append(&entry)?;
        state.apply(entry);
        Ok(InsertOutcome::Inserted)
    }

    /// 标记已告警（只能 false -> true），返回是否发生了状态变化
    pub fn mark_alerted(&self, key: &MessageKey) -> Result<bool> {
        self.ensure_writable()?;
        let mut state = self.state.lock();
        match state.records.get(key) {
            None => Err(SentinelError::PersistenceFailure(format!(
                "no record for message {}",
                key
            ))),
            Some(record) if record.alerted => Ok(false),
            Some(_) => {
                let entry = JournalEntry::Alerted {
                    chat_id: key.chat_id,
                    msg_id: key.msg_id,
                    at: Utc::now(),
                };
                state.append(&entry)?;
                state.apply(entry);
                Ok(true)
            }
        }
    }

    pub fn record_delivery_failure(&self, key: &MessageKey, destination: &str) -> Result<()> {
        self.ensure_writable()?;
        let mut state = self.state.lock();
        if !state.records.contains_key(key) {
            return Err(SentinelError::PersistenceFailure(format!(
                "no record for message {}",
                key
            )));
        }
        let entry = JournalEntry::DeliveryFailed {
            chat_id: key.chat_id,
            msg_id: key.msg_id,
            destination: destination.to_string(),
        };
        state.append(&entry)?;
        state.apply(entry);
        Ok(())
    }

    pub fn add_feedback(&self, feedback: FeedbackRecord) -> Result<()> {
        self.ensure_writable()?;
        let mut state = self.state.lock();
        let entry = JournalEntry::Feedback { feedback };
        state.append(&entry)?;
        state.apply(entry);
        Ok(())
    }

    pub fn feedback_for(&self, key: &MessageKey) -> Vec<FeedbackRecord> {
        self.state
            .lock()
            .feedback
            .iter()
            .filter(|f| f.chat_id == key.chat_id && f.msg_id == key.msg_id)
            .cloned()
            .collect()
    }

    /// `[start, end)` 区间内收到的记录
    pub fn between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<MessageRecord> {
        self.state
            .lock()
            .records
            .values()
            .filter(|r| r.received_at >= start && r.received_at < end)
            .cloned()
            .collect()
    }

    /// 最近收到的 N 条记录（新的在前）
    pub fn recent(&self, limit: usize) -> Vec<MessageRecord> {
        let mut records: Vec<MessageRecord> =
            self.state.lock().records.values().cloned().collect();
        records.sort_by(|a, b| {
            b.received_at
                .cmp(&a.received_at)
                .then_with(|| b.key().cmp(&a.key()))
        });
        records.truncate(limit);
        records
    }

    /// 丢弃早于 `retain_after` 的记录及其反馈，并重写日志。返回删除的记录数
    pub fn compact(&self, retain_after: DateTime<Utc>) -> Result<usize> {
        self.ensure_writable()?;
        let mut state = self.state.lock();

        let before = state.records.len();
        state.records.retain(|_, r| r.received_at >= retain_after);
        let removed = before - state.records.len();
        let StoreState {
            records,
            by_hash,
            feedback,
            ..
        } = &mut *state;
        by_hash.retain(|_, key| records.contains_key(key));
        feedback.retain(|f| {
            records.contains_key(&MessageKey {
                chat_id: f.chat_id,
                msg_id: f.msg_id,
            })
        });

        let Some(path) = &self.path else {
            return Ok(removed);
        };

        // 写入临时文件后原子替换
        let temp_path = path.with_extension("jsonl.tmp");
        {
            let mut temp = File::create(&temp_path)?;
            let mut ordered: Vec<&MessageRecord> = state.records.values().collect();
            ordered.sort_by_key(|r| (r.created_at, r.key()));
            for record in ordered {
                let entry = JournalEntry::Recorded {
                    record: record.clone(),
                };
                writeln!(temp, "{}", serde_json::to_string(&entry)?)?;
            }
            for feedback in &state.feedback {
                let entry = JournalEntry::Feedback {
                    feedback: feedback.clone(),
                };
                writeln!(temp, "{}", serde_json::to_string(&entry)?)?;
            }
            temp.sync_all()?;
        }
        fs::rename(&temp_path, path)?;
        state.journal = Some(OpenOptions::new().create(true).append(true).open(path)?);

        debug!(removed, remaining = state.records.len(), "Message store compacted");
        Ok(removed)
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

fn read_journal(path: &Path) -> Result<StoreState> {
    let mut state = StoreState::default();
    if !path.exists() {
        return Ok(state);
    }

    let reader = BufReader::new(File::open(path)?);
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalEntry>(&line) {
            Ok(entry) => state.apply(entry),
            Err(e) => warn!(line = index + 1, error = %e, "Skipping corrupt journal line"),
        }
    }
    Ok(state)
}
