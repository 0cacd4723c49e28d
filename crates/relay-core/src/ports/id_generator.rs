//! IdGenerator port - ID 生成の抽象化
//!
//! Engines that mint ids (dispatcher, broker) take an `IdGenerator` so that
//! tests can control the timestamp part.

use ulid::Ulid;

use crate::domain::ids::{CommandId, Id, IdMarker, MessageId, SubscriberId};
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn generate_message_id(&self) -> MessageId;

    fn generate_command_id(&self) -> CommandId;

    fn generate_subscriber_id(&self) -> SubscriberId;
}

/// ULID ベースの ID 生成器
///
/// The timestamp part comes from the clock, the rest is random.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next<T: IdMarker>(&self) -> Id<T> {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        Id::from_ulid(Ulid::from_parts(timestamp_ms, rand::random()))
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_message_id(&self) -> MessageId {
        self.next()
    }

    fn generate_command_id(&self) -> CommandId {
        self.next()
    }

    fn generate_subscriber_id(&self) -> SubscriberId {
        self.next()
    }
}
