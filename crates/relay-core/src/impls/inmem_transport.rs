//! InMemoryTransport - 開発用のトランスポート
//!
//! # 実装詳細
//! - channel ごとに ready / in-flight / dead-letter を管理
//! - tokio Mutex で排他制御、Notify で受信待ちを起こす
//! - 同じ channel の複数ストリームは競合コンシューマ（各メッセージは 1 つにだけ届く）

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::domain::{Envelope, FailureReason, TransportError};
use crate::ports::{Delivery, DeliveryStream, Transport};

/// A message parked in a channel's dead-letter destination.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    /// Decoded envelope with the failure annotated in its metadata, when the
    /// body was decodable.
    pub envelope: Option<Envelope>,
    pub body: Vec<u8>,
    pub reason: FailureReason,
    pub delivery_count: u32,
}

#[derive(Debug, Clone)]
struct Parked {
    body: Vec<u8>,
    /// Deliveries made so far.
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct ChannelState {
    ready: VecDeque<Parked>,
    in_flight: HashMap<u64, Parked>,
    dead_letters: Vec<DeadLetter>,
    acknowledged: usize,
}

#[derive(Debug, Default)]
struct TransportState {
    channels: HashMap<String, ChannelState>,
    unavailable: HashSet<String>,
    next_delivery_id: u64,
}

impl TransportState {
    fn channel(&mut self, name: &str) -> &mut ChannelState {
        self.channels.entry(name.to_string()).or_default()
    }

    fn pop_ready(&mut self, channel: &str) -> Option<Delivery> {
        let mut parked = self.channels.get_mut(channel)?.ready.pop_front()?;
        parked.delivery_count += 1;
        self.next_delivery_id += 1;
        let delivery_id = self.next_delivery_id;
        let delivery = Delivery {
            delivery_id,
            channel: channel.to_string(),
            delivery_count: parked.delivery_count,
            body: parked.body.clone(),
        };
        self.channel(channel).in_flight.insert(delivery_id, parked);
        Some(delivery)
    }

    fn take_in_flight(&mut self, delivery: &Delivery) -> Result<Parked, TransportError> {
        self.channels
            .get_mut(&delivery.channel)
            .and_then(|c| c.in_flight.remove(&delivery.delivery_id))
            .ok_or(TransportError::UnknownDelivery(delivery.delivery_id))
    }
}

#[derive(Clone, Default)]
pub struct InMemoryTransport {
    state: Arc<Mutex<TransportState>>,
    notify: Arc<Notify>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a raw body, bypassing envelope encoding.
    pub async fn send_raw(&self, channel: &str, body: Vec<u8>) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock().await;
            if state.unavailable.contains(channel) {
                return Err(TransportError::ChannelUnavailable(channel.to_string()));
            }
            state.channel(channel).ready.push_back(Parked {
                body,
                delivery_count: 0,
            });
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Makes every `send` to `channel` fail until switched back.
    pub async fn set_unavailable(&self, channel: &str, unavailable: bool) {
        let mut state = self.state.lock().await;
        if unavailable {
            state.unavailable.insert(channel.to_string());
        } else {
            state.unavailable.remove(channel);
        }
    }

    /// Messages waiting for delivery.
    pub async fn pending(&self, channel: &str) -> usize {
        let state = self.state.lock().await;
        state.channels.get(channel).map_or(0, |c| c.ready.len())
    }

    pub async fn in_flight(&self, channel: &str) -> usize {
        let state = self.state.lock().await;
        state.channels.get(channel).map_or(0, |c| c.in_flight.len())
    }

    pub async fn acknowledged(&self, channel: &str) -> usize {
        let state = self.state.lock().await;
        state.channels.get(channel).map_or(0, |c| c.acknowledged)
    }

    pub async fn dead_letters(&self, channel: &str) -> Vec<DeadLetter> {
        let state = self.state.lock().await;
        state
            .channels
            .get(channel)
            .map(|c| c.dead_letters.clone())
            .unwrap_or_default()
    }

    /// Removes and decodes every waiting message. Undecodable bodies are skipped.
    pub async fn drain(&self, channel: &str) -> Vec<Envelope> {
        let mut state = self.state.lock().await;
        let Some(c) = state.channels.get_mut(channel) else {
            return Vec::new();
        };
        c.ready
            .drain(..)
            .filter_map(|p| Envelope::from_json(&p.body).ok())
            .collect()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, channel: &str, envelope: &Envelope) -> Result<(), TransportError> {
        let body = envelope.to_json()?;
        self.send_raw(channel, body).await?;
        debug!(channel, message_id = %envelope.id(), "message sent");
        Ok(())
    }

    fn receive(&self, channel: &str) -> DeliveryStream {
        let seed = (
            Arc::clone(&self.state),
            Arc::clone(&self.notify),
            channel.to_string(),
        );
        Box::pin(futures::stream::unfold(
            seed,
            |(state, notify, channel)| async move {
                let delivery = loop {
                    // 登録してから確認する（取りこぼし防止）
                    let notified = notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();

                    let next = {
                        let mut guard = state.lock().await;
                        guard.pop_ready(&channel)
                    };
                    if let Some(delivery) = next {
                        break delivery;
                    }
                    notified.await;
                };
                Some((Ok::<_, TransportError>(delivery), (state, notify, channel)))
            },
        ))
    }

    async fn acknowledge(&self, delivery: &Delivery) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        state.take_in_flight(delivery)?;
        state.channel(&delivery.channel).acknowledged += 1;
        Ok(())
    }

    async fn abandon(&self, delivery: &Delivery, reason: &str) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock().await;
            let parked = state.take_in_flight(delivery)?;
            state.channel(&delivery.channel).ready.push_back(parked);
        }
        debug!(
            channel = %delivery.channel,
            delivery_id = delivery.delivery_id,
            "delivery abandoned: {reason}"
        );
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        reason: &FailureReason,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        let parked = state.take_in_flight(delivery)?;
        let envelope = Envelope::from_json(&parked.body).ok().map(|e| {
            e.with_metadata("dead_letter_reason", reason.message.clone())
                .with_metadata(
                    "dead_letter_kind",
                    serde_json::to_value(reason.kind).unwrap_or_default(),
                )
                .with_metadata("delivery_count", parked.delivery_count)
        });
        state.channel(&delivery.channel).dead_letters.push(DeadLetter {
            envelope,
            body: parked.body,
            reason: reason.clone(),
            delivery_count: parked.delivery_count,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ErrorKind, Payload};
    use futures::StreamExt;
    use std::time::Duration;

    async fn next(stream: &mut DeliveryStream) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("delivery in time")
            .expect("stream is infinite")
            .expect("delivery ok")
    }

    #[tokio::test]
    async fn send_then_receive_roundtrip() {
        let transport = InMemoryTransport::new();
        let e = Envelope::task("p", Payload::new());
        transport.send("tasks", &e).await.unwrap();

        let mut stream = transport.receive("tasks");
        let delivery = next(&mut stream).await;

        assert_eq!(delivery.delivery_count, 1);
        assert_eq!(delivery.decode().unwrap(), e);
        assert_eq!(transport.in_flight("tasks").await, 1);

        transport.acknowledge(&delivery).await.unwrap();
        assert_eq!(transport.in_flight("tasks").await, 0);
        assert_eq!(transport.acknowledged("tasks").await, 1);
    }

    #[tokio::test]
    async fn receive_waits_for_a_later_send() {
        let transport = InMemoryTransport::new();
        let mut stream = transport.receive("tasks");

        let sender = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            sender
                .send("tasks", &Envelope::task("p", Payload::new()))
                .await
                .unwrap();
        });

        let delivery = next(&mut stream).await;
        assert_eq!(delivery.channel, "tasks");
    }

    #[tokio::test]
    async fn stream_keeps_yielding_across_waits() {
        let transport = InMemoryTransport::new();
        let mut stream = transport.receive("tasks");

        let sender = transport.clone();
        tokio::spawn(async move {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_millis(20)).await;
                sender
                    .send("tasks", &Envelope::task("p", Payload::new()))
                    .await
                    .unwrap();
            }
        });

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(next(&mut stream).await.delivery_id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert_eq!(transport.in_flight("tasks").await, 3);
    }

    #[tokio::test]
    async fn abandon_redelivers_with_higher_count() {
        let transport = InMemoryTransport::new();
        transport
            .send("tasks", &Envelope::task("p", Payload::new()))
            .await
            .unwrap();
        let mut stream = transport.receive("tasks");

        let first = next(&mut stream).await;
        transport.abandon(&first, "try again").await.unwrap();
        let second = next(&mut stream).await;

        assert_eq!(second.delivery_count, 2);
        assert_ne!(first.delivery_id, second.delivery_id);
        assert_eq!(first.body, second.body);
    }

    #[tokio::test]
    async fn dead_letter_annotates_metadata() {
        let transport = InMemoryTransport::new();
        transport
            .send("tasks", &Envelope::task("p", Payload::new()))
            .await
            .unwrap();
        let mut stream = transport.receive("tasks");
        let delivery = next(&mut stream).await;

        let reason = FailureReason::new(ErrorKind::Unavailable, "model offline");
        transport.dead_letter(&delivery, &reason).await.unwrap();

        let dead = transport.dead_letters("tasks").await;
        assert_eq!(dead.len(), 1);
        let envelope = dead[0].envelope.as_ref().unwrap();
        assert_eq!(envelope.metadata()["dead_letter_reason"], "model offline");
        assert_eq!(envelope.metadata()["dead_letter_kind"], "UNAVAILABLE");
        assert_eq!(transport.pending("tasks").await, 0);
    }

    #[tokio::test]
    async fn completing_twice_is_an_error() {
        let transport = InMemoryTransport::new();
        transport
            .send("tasks", &Envelope::task("p", Payload::new()))
            .await
            .unwrap();
        let mut stream = transport.receive("tasks");
        let delivery = next(&mut stream).await;

        transport.acknowledge(&delivery).await.unwrap();
        let err = transport.acknowledge(&delivery).await.unwrap_err();
        assert_eq!(err, TransportError::UnknownDelivery(delivery.delivery_id));
    }

    #[tokio::test]
    async fn unavailable_channel_rejects_sends() {
        let transport = InMemoryTransport::new();
        transport.set_unavailable("orders", true).await;

        let err = transport
            .send("orders", &Envelope::task("p", Payload::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ChannelUnavailable(_)));
    }

    #[tokio::test]
    async fn competing_streams_split_messages() {
        let transport = InMemoryTransport::new();
        for _ in 0..2 {
            transport
                .send("tasks", &Envelope::task("p", Payload::new()))
                .await
                .unwrap();
        }
        let mut a = transport.receive("tasks");
        let mut b = transport.receive("tasks");

        let da = next(&mut a).await;
        let db = next(&mut b).await;
        assert_ne!(da.body, db.body);
        assert_eq!(transport.pending("tasks").await, 0);
    }
}
