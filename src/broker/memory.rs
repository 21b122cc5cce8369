//! 进程内 Broker

use super::state::BrokerState;
use super::{Broker, EntryId, StreamEntry};
use crate::error::Result;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::time::Duration;

/// 进程内 Broker（单进程部署与测试）
#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Broker for MemoryBroker {
    fn append(&self, stream: &str, payload: Value) -> Result<EntryId> {
        Ok(self.state.lock().append(stream, payload))
    }

    fn create_group(&self, stream: &str, group: &str) -> Result<bool> {
        Ok(self.state.lock().create_group(stream, group))
    }

    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        self.state
            .lock()
            .read_group(stream, group, consumer, count, Utc::now())
    }

    fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        self.state
            .lock()
            .claim_idle(stream, group, consumer, min_idle, count, Utc::now())
    }

    fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<usize> {
        Ok(self.state.lock().ack(stream, group, ids))
    }

    fn depth(&self, stream: &str, group: &str) -> Result<usize> {
        Ok(self.state.lock().depth(stream, group))
    }

    fn len(&self, stream: &str) -> Result<usize> {
        Ok(self.state.lock().len(stream))
    }

    fn trim(&self, stream: &str, max_len: usize) -> Result<usize> {
        Ok(self.state.lock().trim(stream, max_len))
    }

    fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        self.state.lock().set(key, value, ttl, Utc::now());
        Ok(())
    }

    fn set_nx(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        Ok(self.state.lock().set_nx(key, value, ttl, Utc::now()))
    }

    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.state.lock().get(key, Utc::now()))
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.state.lock().delete(key, Utc::now()))
    }

    fn push(&self, queue: &str, value: Value) -> Result<()> {
        self.state.lock().push(queue, value);
        Ok(())
    }

    fn pop(&self, queue: &str) -> Result<Option<Value>> {
        Ok(self.state.lock().pop(queue))
    }
}
