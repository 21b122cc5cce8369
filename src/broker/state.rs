//! Broker 的共享状态与操作语义，内存和文件实现都基于它

use super::{EntryId, StreamEntry};
use crate::error::{Result, SentinelError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct BrokerState {
    #[serde(default)]
    streams: HashMap<String, StreamState>,
    #[serde(default)]
    kv: HashMap<String, KvEntry>,
    #[serde(default)]
    queues: HashMap<String, VecDeque<Value>>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StreamState {
    last_seq: u64,
    entries: BTreeMap<u64, Value>,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct GroupState {
    /// 已投递的最大序号
    last_delivered: u64,
    pending: BTreeMap<u64, PendingEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingEntry {
    consumer: String,
    delivered_at: DateTime<Utc>,
    deliveries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KvEntry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl KvEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// std Duration 转 chrono，超出范围时按一百年处理
pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

fn expiry(now: DateTime<Utc>, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    ttl.map(|d| now + to_chrono(d))
}

fn missing_group(stream: &str, group: &str) -> SentinelError {
    SentinelError::Broker(format!("consumer group {} does not exist on {}", group, stream))
}

impl BrokerState {
    pub fn append(&mut self, stream: &str, payload: Value) -> EntryId {
        let state = self.streams.entry(stream.to_string()).or_default();
        state.last_seq += 1;
        state.entries.insert(state.last_seq, payload);
        EntryId(state.last_seq)
    }

    pub fn create_group(&mut self, stream: &str, group: &str) -> bool {
        let state = self.streams.entry(stream.to_string()).or_default();
        if state.groups.contains_key(group) {
            return false;
        }
        state.groups.insert(group.to_string(), GroupState::default());
        true
    }

    pub fn read_group(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<StreamEntry>> {
        let StreamState { entries, groups, .. } = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| missing_group(stream, group))?;
        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| missing_group(stream, group))?;

        let mut delivered = Vec::new();
        for (seq, payload) in entries
            .range(group_state.last_delivered + 1..)
            .take(count)
        {
            group_state.pending.insert(
                *seq,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
            delivered.push(StreamEntry {
                id: EntryId(*seq),
                payload: payload.clone(),
                deliveries: 1,
            });
        }
        if let Some(last) = delivered.last() {
            group_state.last_delivered = last.id.0;
        }
        Ok(delivered)
    }

    pub fn claim_idle(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<StreamEntry>> {
        let StreamState { entries, groups, .. } = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| missing_group(stream, group))?;
        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| missing_group(stream, group))?;
        let min_idle = to_chrono(min_idle);

        // 条目已被裁剪的 pending 直接丢弃
        group_state
            .pending
            .retain(|seq, _| entries.contains_key(seq));

        let mut claimed = Vec::new();
        for (seq, pending) in group_state.pending.iter_mut() {
            if claimed.len() >= count {
                break;
            }
            if now - pending.delivered_at < min_idle {
                continue;
            }
            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            pending.deliveries += 1;
            if let Some(payload) = entries.get(seq) {
                claimed.push(StreamEntry {
                    id: EntryId(*seq),
                    payload: payload.clone(),
                    deliveries: pending.deliveries,
                });
            }
        }
        Ok(claimed)
    }

    pub fn ack(&mut self, stream: &str, group: &str, ids: &[EntryId]) -> usize {
        let Some(group_state) = self
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        else {
            return 0;
        };
        ids.iter()
            .filter(|id| group_state.pending.remove(&id.0).is_some())
            .count()
    }

    pub fn depth(&self, stream: &str, group: &str) -> usize {
        let Some(state) = self.streams.get(stream) else {
            return 0;
        };
        let Some(group_state) = state.groups.get(group) else {
            return state.entries.len();
        };
        let undelivered = state
            .entries
            .range(group_state.last_delivered + 1..)
            .count();
        undelivered + group_state.pending.len()
    }

    pub fn len(&self, stream: &str) -> usize {
        self.streams.get(stream).map_or(0, |s| s.entries.len())
    }

    pub fn trim(&mut self, stream: &str, max_len: usize) -> usize {
        let Some(state) = self.streams.get_mut(stream) else {
            return 0;
        };
        // 所有组都已投递且已确认的序号才可以裁剪
        let safe_bound = state
            .groups
            .values()
            .map(|g| {
                let oldest_pending = g.pending.keys().next().copied().unwrap_or(u64::MAX);
                oldest_pending.min(g.last_delivered + 1)
            })
            .min()
            .unwrap_or(u64::MAX);

        let mut removed = 0;
        while state.entries.len() > max_len {
            let Some(first) = state.entries.keys().next().copied() else {
                break;
            };
            if first >= safe_bound {
                break;
            }
            state.entries.remove(&first);
            removed += 1;
        }
        removed
    }

    pub fn set(&mut self, key: &str, value: Value, ttl: Option<Duration>, now: DateTime<Utc>) {
        self.kv.insert(
            key.to_string(),
            KvEntry {
                value,
                expires_at: expiry(now, ttl),
            },
        );
    }

    pub fn set_nx(
        &mut self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.kv.get(key).is_some_and(|e| e.is_live(now)) {
            return false;
        }
        self.set(key, value, ttl, now);
        true
    }

    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<Value> {
        self.kv
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone())
    }

    pub fn delete(&mut self, key: &str, now: DateTime<Utc>) -> bool {
        self.kv.remove(key).is_some_and(|e| e.is_live(now))
    }

    pub fn push(&mut self, queue: &str, value: Value) {
        self.queues
            .entry(queue.to_string())
            .or_default()
            .push_back(value);
    }

    pub fn pop(&mut self, queue: &str) -> Option<Value> {
        let queue_state = self.queues.get_mut(queue)?;
        let value = queue_state.pop_front();
        if queue_state.is_empty() {
            self.queues.remove(queue);
        }
        value
    }

    /// 清理过期键
    pub fn purge_expired(&mut self, now: DateTime<Utc>) {
        self.kv.retain(|_, e| e.is_live(now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const STREAM: &str = "ingest";
    const GROUP: &str = "scorers";

    #[test]
    fn test_read_group_delivers_each_entry_once() {
        let mut state = BrokerState::default();
        state.create_group(STREAM, GROUP);
        state.append(STREAM, json!({"n": 1}));
        state.append(STREAM, json!({"n": 2}));
        let now = Utc::now();

        let first = state.read_group(STREAM, GROUP, "c1", 10, now).unwrap();
        assert_eq!(first.len(), 2);
        let again = state.read_group(STREAM, GROUP, "c1", 10, now).unwrap();
        assert!(again.is_empty());
        assert_eq!(state.depth(STREAM, GROUP), 2);
    }

    #[test]
    fn test_claim_idle_respects_min_idle() {
        let mut state = BrokerState::default();
        state.create_group(STREAM, GROUP);
        state.append(STREAM, json!("a"));
        let t0 = Utc::now();
        state.read_group(STREAM, GROUP, "c1", 10, t0).unwrap();

        let early = state
            .claim_idle(STREAM, GROUP, "c2", Duration::from_secs(60), 10, t0)
            .unwrap();
        assert!(early.is_empty());

        let later = t0 + chrono::Duration::seconds(61);
        let claimed = state
            .claim_idle(STREAM, GROUP, "c2", Duration::from_secs(60), 10, later)
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].deliveries, 2);
    }

    #[test]
    fn test_ack_removes_pending() {
        let mut state = BrokerState::default();
        state.create_group(STREAM, GROUP);
        let id = state.append(STREAM, json!("a"));
        state.read_group(STREAM, GROUP, "c1", 10, Utc::now()).unwrap();

        assert_eq!(state.ack(STREAM, GROUP, &[id]), 1);
        assert_eq!(state.ack(STREAM, GROUP, &[id]), 0);
        assert_eq!(state.depth(STREAM, GROUP), 0);
    }

    #[test]
    fn test_read_without_group_fails() {
        let mut state = BrokerState::default();
        state.append(STREAM, json!("a"));
        assert!(state.read_group(STREAM, GROUP, "c1", 1, Utc::now()).is_err());
    }

    #[test]
    fn test_trim_keeps_unprocessed_entries() {
        let mut state = BrokerState::default();
        state.create_group(STREAM, GROUP);
        for n in 0..5 {
            state.append(STREAM, json!(n));
        }
        let now = Utc::now();
        let batch = state.read_group(STREAM, GROUP, "c1", 3, now).unwrap();
        state.ack(STREAM, GROUP, &[batch[0].id, batch[1].id]);

        // 只有前两条已确认
        assert_eq!(state.trim(STREAM, 0), 2);
        assert_eq!(state.len(STREAM), 3);
    }

    #[test]
    fn test_set_nx_and_expiry() {
        let mut state = BrokerState::default();
        let now = Utc::now();
        assert!(state.set_nx("k", json!(1), Some(Duration::from_secs(5)), now));
        assert!(!state.set_nx("k", json!(2), Some(Duration::from_secs(5)), now));
        assert_eq!(state.get("k", now), Some(json!(1)));

        let later = now + chrono::Duration::seconds(6);
        assert_eq!(state.get("k", later), None);
        assert!(state.set_nx("k", json!(3), None, later));
        assert_eq!(state.get("k", later), Some(json!(3)));
    }

    #[test]
    fn test_queue_fifo() {
        let mut state = BrokerState::default();
        state.push("q", json!(1));
        state.push("q", json!(2));
        assert_eq!(state.pop("q"), Some(json!(1)));
        assert_eq!(state.pop("q"), Some(json!(2)));
        assert_eq!(state.pop("q"), None);
    }
}
