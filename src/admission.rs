//! 告警准入 - 每个频道的 60 分钟滑动窗口限流
//!
//! 检查与计数在同一把频道锁内完成，同一频道的并发请求不会超额。

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// 准入结果
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// 允许告警，`used` 为计入本次后的窗口用量
    Admitted { used: u32, limit: u32 },
    /// 超出上限，`retry_after` 后窗口内最早的一次告警过期
    RateLimited { limit: u32, retry_after: Option<Duration> },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}

type ChannelWindow = Arc<Mutex<VecDeque<DateTime<Utc>>>>;

/// 滑动窗口限流器
pub struct RateLimiter {
    window: Duration,
    channels: Mutex<HashMap<i64, ChannelWindow>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_window(Duration::minutes(60))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channel(&self, channel_id: i64) -> ChannelWindow {
        self.channels
            .lock()
            .entry(channel_id)
            .or_default()
            .clone()
    }

    /// 尝试占用一次告警额度
    ///
    /// `limit` 为 0 时不允许任何告警。
    pub fn try_admit(&self, channel_id: i64, limit: u32, now: DateTime<Utc>) -> Admission {
        if limit == 0 {
            return Admission::RateLimited {
                limit,
                retry_after: None,
            };
        }

        let window = self.channel(channel_id);
        let mut sent = window.lock();
        let cutoff = now - self.window;
        while sent.front().is_some_and(|t| *t <= cutoff) {
            sent.pop_front();
        }

        if sent.len() >= limit as usize {
            let retry_after = sent.front().map(|oldest| *oldest + self.window - now);
            return Admission::RateLimited { limit, retry_after };
        }

        sent.push_back(now);
        Admission::Admitted {
            used: sent.len() as u32,
            limit,
        }
    }

    /// 当前窗口内的用量
    pub fn usage(&self, channel_id: i64, now: DateTime<Utc>) -> u32 {
        let Some(window) = self.channels.lock().get(&channel_id).cloned() else {
            return 0;
        };
        let cutoff = now - self.window;
        let count = window.lock().iter().filter(|t| **t > cutoff).count();
        count as u32
    }

    /// 清理过期记录，移除空闲频道。返回移除的频道数
    pub fn trim(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.window;
        let mut channels = self.channels.lock();
        let before = channels.len();
        channels.retain(|_, window| {
            let mut sent = window.lock();
            while sent.front().is_some_and(|t| *t <= cutoff) {
                sent.pop_front();
            }
            !sent.is_empty()
        });
        before - channels.len()
    }
}
