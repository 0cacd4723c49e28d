use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

use crate::domain::{
    Envelope, ErrorKind, FailureReason, MessageId, Payload, RelayError, SubscriberId,
    SubscriberInfo, Topic,
};
use crate::ports::{CognitiveProcessor, IdGenerator, Transport, parse_response};
use crate::retry::{RetryPolicy, invoke_with_retry};

/// What a caller registers.
#[derive(Clone)]
pub struct Subscription {
    pub name: String,
    pub topics: BTreeSet<Topic>,
    pub instructions: String,
    pub processor: Arc<dyn CognitiveProcessor>,
}

impl Subscription {
    pub fn new<I, T>(
        name: impl Into<String>,
        topics: I,
        instructions: impl Into<String>,
        processor: Arc<dyn CognitiveProcessor>,
    ) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Topic>,
    {
        Self {
            name: name.into(),
            topics: topics.into_iter().map(Into::into).collect(),
            instructions: instructions.into(),
            processor,
        }
    }

    /// Flat exact match.
    pub fn matches(&self, topic: &Topic) -> bool {
        self.topics.contains(topic)
    }
}

struct Subscriber {
    id: SubscriberId,
    subscription: Subscription,
    processed: AtomicU64,
    failed: AtomicU64,
}

impl Subscriber {
    fn info(&self) -> SubscriberInfo {
        SubscriberInfo {
            id: self.id,
            name: self.subscription.name.clone(),
            topics: self.subscription.topics.clone(),
            instructions: self.subscription.instructions.clone(),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Success,
    Error,
}

/// One subscriber's handling of one published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub subscriber: SubscriberId,
    pub subscriber_name: String,
    pub topic: Topic,
    pub message_id: MessageId,
    pub status: DispatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureReason>,
}

/// Every dispatch result of one publish cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishReport {
    pub message_id: MessageId,
    pub topic: Topic,
    pub results: Vec<DispatchResult>,
}

impl PublishReport {
    pub fn succeeded(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.status == DispatchStatus::Success)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }
}

/// Returned by [`Broker::publish`] once dispatch has been initiated.
///
/// Dropping the handle does not cancel the cycle.
pub struct PublishHandle {
    pub message_id: MessageId,
    /// Subscribers matched at dispatch time.
    pub matched: usize,
    cycle: JoinHandle<PublishReport>,
}

impl PublishHandle {
    /// Waits for every dispatched subscriber to finish.
    pub async fn wait(self) -> Result<PublishReport, JoinError> {
        self.cycle.await
    }
}

/// Topic-based fan-out to registered subscribers.
///
/// Every matched subscriber runs in its own task; a failure (or panic) in
/// one is contained to its own [`DispatchResult`].
pub struct Broker {
    source: String,
    transport: Arc<dyn Transport>,
    ids: Arc<dyn IdGenerator>,
    retry: RetryPolicy,
    registry: RwLock<HashMap<SubscriberId, Arc<Subscriber>>>,
}

impl Broker {
    pub fn new(
        source: impl Into<String>,
        transport: Arc<dyn Transport>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            source: source.into(),
            transport,
            ids,
            retry: RetryPolicy::default(),
            registry: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn subscribe(&self, subscription: Subscription) -> SubscriberId {
        let id = self.ids.generate_subscriber_id();
        info!(
            subscriber = %subscription.name,
            subscriber_id = %id,
            topics = ?subscription.topics,
            "subscriber registered"
        );
        let subscriber = Arc::new(Subscriber {
            id,
            subscription,
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });
        self.registry.write().await.insert(id, subscriber);
        id
    }

    pub async fn unsubscribe(&self, id: SubscriberId) -> Result<(), RelayError> {
        match self.registry.write().await.remove(&id) {
            Some(s) => {
                info!(subscriber = %s.subscription.name, subscriber_id = %id, "subscriber removed");
                Ok(())
            }
            None => Err(RelayError::not_found("subscriber", id)),
        }
    }

    /// Sorted by name.
    pub async fn list_subscribers(&self) -> Vec<SubscriberInfo> {
        let mut out: Vec<_> = self.registry.read().await.values().map(|s| s.info()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    /// Publishes an Event on `topic` and starts dispatching it.
    ///
    /// Returns once every matched subscriber task has been spawned. The set
    /// of subscribers is snapshotted here; later registry edits do not affect
    /// this cycle.
    ///
    /// The event is also sent on the transport channel named after the
    /// topic, for consumers outside this broker. The broker never reads that
    /// channel back: draining or expiring it is the job of its readers or of
    /// the transport.
    pub async fn publish(&self, topic: &str, payload: Payload) -> Result<PublishHandle, RelayError> {
        let topic = Topic::from(topic);
        let event = Envelope::event(self.source.clone(), topic.as_str(), payload)
            .with_id(self.ids.generate_message_id());
        self.transport.send(topic.as_str(), &event).await?;

        let matched: Vec<Arc<Subscriber>> = self
            .registry
            .read()
            .await
            .values()
            .filter(|s| s.subscription.matches(&topic))
            .cloned()
            .collect();

        if matched.is_empty() {
            debug!(topic = %topic, message_id = %event.id(), "no subscribers for topic");
        }

        let message_id = event.id();
        let event = Arc::new(event);
        let dispatches: Vec<(Arc<Subscriber>, JoinHandle<DispatchResult>)> = matched
            .into_iter()
            .map(|s| {
                let task = tokio::spawn(dispatch(
                    Arc::clone(&s),
                    Arc::clone(&event),
                    topic.clone(),
                    self.retry.clone(),
                ));
                (s, task)
            })
            .collect();
        let count = dispatches.len();

        let cycle_topic = topic.clone();
        let cycle = tokio::spawn(async move {
            let (subscribers, tasks): (Vec<_>, Vec<_>) = dispatches.into_iter().unzip();
            let joined = join_all(tasks).await;

            let results: Vec<DispatchResult> = subscribers
                .iter()
                .zip(joined)
                .map(|(s, joined)| match joined {
                    Ok(result) => result,
                    Err(e) => {
                        s.failed.fetch_add(1, Ordering::Relaxed);
                        DispatchResult {
                            subscriber: s.id,
                            subscriber_name: s.subscription.name.clone(),
                            topic: cycle_topic.clone(),
                            message_id,
                            status: DispatchStatus::Error,
                            response: None,
                            error: Some(FailureReason::new(
                                ErrorKind::Unavailable,
                                format!("subscriber task aborted: {e}"),
                            )),
                        }
                    }
                })
                .collect();

            let report = PublishReport {
                message_id,
                topic: cycle_topic,
                results,
            };
            info!(
                topic = %report.topic,
                message_id = %report.message_id,
                succeeded = report.succeeded(),
                failed = report.failed(),
                "publish cycle complete"
            );
            report
        });

        Ok(PublishHandle {
            message_id,
            matched: count,
            cycle,
        })
    }
}

async fn dispatch(
    subscriber: Arc<Subscriber>,
    event: Arc<Envelope>,
    topic: Topic,
    retry: RetryPolicy,
) -> DispatchResult {
    let sub = &subscriber.subscription;
    let outcome = invoke_with_retry(
        sub.processor.as_ref(),
        &retry,
        &sub.instructions,
        event.payload(),
        None,
    )
    .await;

    let (status, response, error) = match outcome {
        Ok(text) => {
            subscriber.processed.fetch_add(1, Ordering::Relaxed);
            debug!(subscriber = %sub.name, message_id = %event.id(), "subscriber processed event");
            (DispatchStatus::Success, Some(parse_response(&text)), None)
        }
        Err(e) => {
            subscriber.failed.fetch_add(1, Ordering::Relaxed);
            warn!(subscriber = %sub.name, message_id = %event.id(), "subscriber failed: {e}");
            (DispatchStatus::Error, None, Some(FailureReason::from(&e)))
        }
    };

    DispatchResult {
        subscriber: subscriber.id,
        subscriber_name: sub.name.clone(),
        topic,
        message_id: event.id(),
        status,
        response,
        error,
    }
}
