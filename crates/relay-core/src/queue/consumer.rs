use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ConsumerConfig;
use crate::domain::{
    Decider, DefaultDecider, DeliveryDecision, Envelope, ErrorKind, FailureReason, Payload,
};
use crate::observability::{ConsumerCounters, ConsumerCounts};
use crate::ports::{CognitiveProcessor, Delivery, Transport, parse_response};
use crate::retry::{RetryPolicy, invoke_with_retry};

/// The processor a consumer is bound to.
#[derive(Clone)]
pub struct QueueProcessor {
    pub name: String,
    pub instructions: String,
    pub processor: Arc<dyn CognitiveProcessor>,
}

impl QueueProcessor {
    pub fn new(
        name: impl Into<String>,
        instructions: impl Into<String>,
        processor: Arc<dyn CognitiveProcessor>,
    ) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.into(),
            processor,
        }
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageOutcome {
    Acknowledged { response: Option<Envelope> },
    Abandoned { reason: FailureReason },
    DeadLettered { reason: FailureReason },
}

struct ConsumerInner {
    transport: Arc<dyn Transport>,
    channel: String,
    binding: QueueProcessor,
    config: ConsumerConfig,
    retry: RetryPolicy,
    decider: Arc<dyn Decider>,
    counters: ConsumerCounters,
}

/// Worker group handle.
/// - `shutdown_tx` で全ワーカーに停止を通知する
/// - 処理中のメッセージは最後まで処理される
struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    fn spawn(inner: Arc<ConsumerInner>) -> Self {
        let n = inner.config.max_concurrency.max(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let inner = Arc::clone(&inner);
            let mut rx = shutdown_rx.clone();
            joins.push(tokio::spawn(async move {
                worker_loop(worker_id, inner, &mut rx).await;
            }));
        }

        Self { shutdown_tx, joins }
    }

    async fn shutdown_and_join(self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
        for j in self.joins {
            if let Err(e) = j.await {
                error!("consumer worker panicked: {e}");
            }
        }
    }
}

/// Pulls task envelopes from one channel and runs each through the bound
/// processor.
///
/// Up to `max_concurrency` messages are in flight at once. No ordering is
/// guaranteed across messages.
pub struct QueueConsumer {
    inner: Arc<ConsumerInner>,
    group: Mutex<Option<WorkerGroup>>,
}

impl QueueConsumer {
    pub fn new(
        transport: Arc<dyn Transport>,
        channel: impl Into<String>,
        binding: QueueProcessor,
        config: ConsumerConfig,
    ) -> Self {
        let decider = Arc::new(DefaultDecider::new(config.max_delivery_attempts));
        Self {
            inner: Arc::new(ConsumerInner {
                transport,
                channel: channel.into(),
                binding,
                config,
                retry: RetryPolicy::default(),
                decider,
                counters: ConsumerCounters::default(),
            }),
            group: Mutex::new(None),
        }
    }

    /// Only callable before the consumer is shared.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.retry = retry;
        }
        self
    }

    pub fn with_decider(mut self, decider: Arc<dyn Decider>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.decider = decider;
        }
        self
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    pub fn counts(&self) -> ConsumerCounts {
        self.inner.counters.snapshot()
    }

    pub async fn is_running(&self) -> bool {
        self.group.lock().await.is_some()
    }

    /// Starts the worker pool. A second call while running is a no-op.
    pub async fn start(&self) {
        let mut group = self.group.lock().await;
        if group.is_some() {
            debug!(channel = %self.inner.channel, "consumer already running");
            return;
        }
        *group = Some(WorkerGroup::spawn(Arc::clone(&self.inner)));
        info!(
            channel = %self.inner.channel,
            processor = %self.inner.binding.name,
            workers = self.inner.config.max_concurrency,
            "queue consumer started"
        );
    }

    /// Stops taking new messages and waits for in-flight ones to finish.
    pub async fn stop(&self) {
        let Some(group) = self.group.lock().await.take() else {
            return;
        };
        group.shutdown_and_join().await;
        info!(channel = %self.inner.channel, "queue consumer stopped");
    }

    /// Processes one delivery and signals its outcome to the transport.
    pub async fn on_message(&self, delivery: Delivery) -> MessageOutcome {
        self.inner.on_message(delivery).await
    }
}

async fn worker_loop(
    worker_id: usize,
    inner: Arc<ConsumerInner>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let mut stream = inner.transport.receive(&inner.channel);
    let mut receive_errors: u32 = 0;
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // 受信待ちは shutdown と競合させる（処理中は競合させない）
        let next = tokio::select! {
            changed = shutdown_rx.changed() => {
                // consumer dropped without stop()
                if changed.is_err() {
                    break;
                }
                continue;
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                receive_errors = 0;
                inner.on_message(delivery).await;
            }
            Some(Err(e)) => {
                receive_errors = receive_errors.saturating_add(1);
                let delay = inner.retry.next_delay(receive_errors);
                warn!(
                    worker_id,
                    channel = %inner.channel,
                    delay_ms = delay.as_millis() as u64,
                    "receive failed, backing off: {e}"
                );
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => {
                // 再購読 = 現在位置から再開
                stream = inner.transport.receive(&inner.channel);
            }
        }
    }
    debug!(worker_id, channel = %inner.channel, "consumer worker exited");
}

impl ConsumerInner {
    async fn on_message(&self, delivery: Delivery) -> MessageOutcome {
        self.counters.received();

        let envelope = match delivery.decode() {
            Ok(e) => e,
            Err(e) => {
                let reason = FailureReason::new(ErrorKind::InvalidInput, e.to_string());
                return self.dead_letter(&delivery, reason).await;
            }
        };

        match self.handle(&envelope).await {
            Ok(response) => match self.transport.acknowledge(&delivery).await {
                Ok(()) => {
                    self.counters.acknowledged();
                    debug!(
                        channel = %self.channel,
                        message_id = %envelope.id(),
                        "message acknowledged"
                    );
                    MessageOutcome::Acknowledged { response }
                }
                Err(e) => {
                    // delivery already completed elsewhere; nothing left to release
                    error!(message_id = %envelope.id(), "acknowledge failed: {e}");
                    MessageOutcome::Abandoned {
                        reason: FailureReason::from(&e),
                    }
                }
            },
            Err(reason) => match self.decider.decide(delivery.delivery_count, &reason) {
                DeliveryDecision::Abandon { reason: note } => {
                    if let Err(e) = self.transport.abandon(&delivery, &note).await {
                        error!(message_id = %envelope.id(), "abandon failed: {e}");
                    } else {
                        self.counters.abandoned();
                    }
                    warn!(
                        channel = %self.channel,
                        message_id = %envelope.id(),
                        delivery_count = delivery.delivery_count,
                        "message abandoned: {note}"
                    );
                    MessageOutcome::Abandoned { reason }
                }
                DeliveryDecision::DeadLetter { reason: note } => {
                    debug!(message_id = %envelope.id(), "{note}");
                    self.dead_letter(&delivery, reason).await
                }
            },
        }
    }

    /// Invokes the processor and sends the Response.
    async fn handle(&self, envelope: &Envelope) -> Result<Option<Envelope>, FailureReason> {
        let text = invoke_with_retry(
            self.binding.processor.as_ref(),
            &self.retry,
            &self.binding.instructions,
            envelope.payload(),
            None,
        )
        .await
        .map_err(|e| FailureReason::from(&e))?;

        let mut payload = Payload::new();
        payload.insert("result".to_string(), parse_response(&text));
        let response = envelope
            .reply(self.binding.name.clone(), payload)
            .with_metadata("processor", Value::String(self.binding.name.clone()));

        let target = self
            .config
            .reply_channel
            .as_deref()
            .or_else(|| response.destination());
        match target {
            Some(channel) => {
                self.transport
                    .send(channel, &response)
                    .await
                    .map_err(|e| FailureReason::from(&e))?;
            }
            None => {
                warn!(
                    message_id = %envelope.id(),
                    "no reply channel for response, dropping it"
                );
            }
        }
        Ok(Some(response))
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: FailureReason) -> MessageOutcome {
        match self.transport.dead_letter(delivery, &reason).await {
            Ok(()) => self.counters.dead_lettered(),
            Err(e) => error!(delivery_id = delivery.delivery_id, "dead-letter failed: {e}"),
        }
        error!(
            channel = %self.channel,
            delivery_id = delivery.delivery_id,
            delivery_count = delivery.delivery_count,
            kind = ?reason.kind,
            "message dead-lettered: {}",
            reason.message
        );
        MessageOutcome::DeadLettered { reason }
    }
}
