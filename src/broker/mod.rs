//! 共享 Broker - 有序流（消费组语义）与带过期的键值/队列
//!
//! Worker 与展示进程通过同一个 Broker 交换数据：
//! - 流：append / 消费组读取 / 按空闲时长回收 / ack
//! - 键值：带 TTL 的 set、set-if-absent、get、delete
//! - 队列：push / pop
//!
//! `MemoryBroker` 用于单进程和测试，`FileBroker` 通过文件锁在同一主机的多个进程间共享。

pub mod file;
pub mod memory;
mod state;

pub use file::FileBroker;
pub use memory::MemoryBroker;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// 流条目 ID（单调递增）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub u64);

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 消费组投递出的条目
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: EntryId,
    pub payload: Value,
    /// 累计投递次数（首次读取为 1）
    pub deliveries: u32,
}

/// Broker 抽象
pub trait Broker: Send + Sync {
    /// 追加条目到流尾
    fn append(&self, stream: &str, payload: Value) -> Result<EntryId>;

    /// 创建消费组（幂等），从流起点开始投递。返回是否新建
    fn create_group(&self, stream: &str, group: &str) -> Result<bool>;

    /// 读取尚未投递给该组的新条目，并记入 pending
    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>>;

    /// 回收空闲超过 `min_idle` 的 pending 条目（不论原消费者）
    fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>>;

    /// 确认条目，返回实际移除的 pending 数量
    fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<usize>;

    /// 组内待确认 + 未投递的条目数
    fn depth(&self, stream: &str, group: &str) -> Result<usize>;

    fn len(&self, stream: &str) -> Result<usize>;

    /// 裁剪到最多 `max_len` 条，仍有组未处理的条目不会被裁掉
    fn trim(&self, stream: &str, max_len: usize) -> Result<usize>;

    fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;

    /// 键不存在（或已过期）时写入，返回是否写入
    fn set_nx(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool>;

    fn get(&self, key: &str) -> Result<Option<Value>>;

    fn delete(&self, key: &str) -> Result<bool>;

    fn push(&self, queue: &str, value: Value) -> Result<()>;

    fn pop(&self, queue: &str) -> Result<Option<Value>>;
}
