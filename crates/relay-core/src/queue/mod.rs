//! Queue - 競合コンシューマ
//!
//! One channel, one bound processor, a bounded pool of workers. Failed
//! messages are released back to the transport until the [`Decider`]
//! routes them to the dead-letter destination.
//!
//! [`Decider`]: crate::domain::Decider

pub mod consumer;

pub use consumer::{MessageOutcome, QueueConsumer, QueueProcessor};
