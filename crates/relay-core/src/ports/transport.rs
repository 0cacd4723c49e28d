//! Transport port - ブローカーへのインターフェース
//!
//! A transport moves opaque bodies over named channels. The core decodes the
//! body into an [`Envelope`] itself so that malformed bodies can be routed to
//! the dead-letter destination instead of poisoning a consumer.
//!
//! # 設計原則
//! - `receive` は遅延・無限・再開可能なストリーム（再購読 = 現在位置から再開）
//! - 完了シグナル（acknowledge / abandon / dead_letter）は delivery 単位
//! - 接続プールの管理は実装側の責務

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::domain::{Envelope, FailureReason, TransportError};

/// One receipt of a message body from a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Transport-assigned token for completion signals.
    pub delivery_id: u64,
    pub channel: String,
    /// 1 on the first delivery, incremented on every abandon.
    pub delivery_count: u32,
    pub body: Vec<u8>,
}

impl Delivery {
    pub fn decode(&self) -> Result<Envelope, TransportError> {
        Envelope::from_json(&self.body)
    }
}

/// Infinite stream of deliveries for one subscription.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, TransportError>>;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, channel: &str, envelope: &Envelope) -> Result<(), TransportError>;

    /// Subscribes to `channel`. Competing subscriptions on the same channel
    /// each get a disjoint share of the messages.
    fn receive(&self, channel: &str) -> DeliveryStream;

    /// Processing finished; the message is removed.
    async fn acknowledge(&self, delivery: &Delivery) -> Result<(), TransportError>;

    /// Release the message back for redelivery.
    async fn abandon(&self, delivery: &Delivery, reason: &str) -> Result<(), TransportError>;

    /// Route the message to the channel's dead-letter destination.
    async fn dead_letter(
        &self,
        delivery: &Delivery,
        reason: &FailureReason,
    ) -> Result<(), TransportError>;
}
