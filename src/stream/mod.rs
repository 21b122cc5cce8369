//! 摄取流消费

pub mod consumer;

pub use consumer::{BatchReport, MessageHandler, StreamConsumer};
