use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::CommandConfig;
use crate::domain::envelope::COMMAND_TYPE_KEY;
use crate::domain::{
    CommandId, CommandRecord, CommandStatus, CommandType, Envelope, ErrorKind, FailureReason,
    InvalidTransition, MessageKind, Metadata, Payload, ProcessingError, ProcessorInfo, RelayError,
};
use crate::observability::CommandCounts;
use crate::ports::{Clock, CognitiveProcessor, IdGenerator, parse_response};
use crate::retry::{RetryPolicy, invoke_with_retry};

/// Declarative binding from command types to a processor.
#[derive(Clone)]
pub struct CommandProcessor {
    pub name: String,
    pub command_types: BTreeSet<CommandType>,
    pub instructions: String,
    pub processor: Arc<dyn CognitiveProcessor>,
}

impl CommandProcessor {
    pub fn new<I, T>(
        name: impl Into<String>,
        command_types: I,
        instructions: impl Into<String>,
        processor: Arc<dyn CognitiveProcessor>,
    ) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<CommandType>,
    {
        Self {
            name: name.into(),
            command_types: command_types.into_iter().map(Into::into).collect(),
            instructions: instructions.into(),
            processor,
        }
    }

    pub fn handles(&self, command_type: &CommandType) -> bool {
        self.command_types.contains(command_type)
    }
}

struct Registered {
    binding: CommandProcessor,
    processed: AtomicU64,
}

/// One command's record plus its change feed.
///
/// All transitions of a record go through its own lock, so commands never
/// contend with each other.
struct CommandSlot {
    record: Mutex<CommandRecord>,
    status_tx: watch::Sender<CommandStatus>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CommandSlot {
    async fn transition(
        &self,
        apply: impl FnOnce(&mut CommandRecord) -> Result<(), InvalidTransition>,
    ) -> Result<(), InvalidTransition> {
        let mut record = self.record.lock().await;
        apply(&mut record)?;
        self.status_tx.send_replace(record.status);
        debug!(
            command_id = %record.command_id,
            status = ?record.status,
            "command transitioned"
        );
        Ok(())
    }
}

/// Routes commands to processors by command type and tracks their status.
///
/// `submit` returns at once; execution happens on a retained task per
/// command. Submissions are never deduplicated: callers that need
/// idempotency put their own key in the command metadata.
pub struct CommandDispatcher {
    source: String,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    execution_timeout: Duration,
    processors: RwLock<Vec<Arc<Registered>>>,
    cursors: Mutex<HashMap<CommandType, usize>>,
    commands: RwLock<HashMap<CommandId, Arc<CommandSlot>>>,
}

impl CommandDispatcher {
    pub fn new(
        source: impl Into<String>,
        config: &CommandConfig,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source: source.into(),
            ids,
            clock,
            retry: RetryPolicy::default(),
            execution_timeout: config.execution_timeout(),
            processors: RwLock::new(Vec::new()),
            cursors: Mutex::new(HashMap::new()),
            commands: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    // ---- processor registry ----

    /// Registers `binding`. A processor with the same name is replaced.
    pub async fn register_processor(&self, binding: CommandProcessor) {
        let mut processors = self.processors.write().await;
        info!(
            processor = %binding.name,
            command_types = ?binding.command_types,
            "processor registered"
        );
        let entry = Arc::new(Registered {
            binding,
            processed: AtomicU64::new(0),
        });
        match processors
            .iter_mut()
            .find(|p| p.binding.name == entry.binding.name)
        {
            Some(existing) => *existing = entry,
            None => processors.push(entry),
        }
    }

    pub async fn unregister_processor(&self, name: &str) -> Result<(), RelayError> {
        let mut processors = self.processors.write().await;
        let before = processors.len();
        processors.retain(|p| p.binding.name != name);
        if processors.len() == before {
            return Err(RelayError::not_found("processor", name));
        }
        info!(processor = name, "processor unregistered");
        Ok(())
    }

    /// In registration order.
    pub async fn list_processors(&self) -> Vec<ProcessorInfo> {
        self.processors
            .read()
            .await
            .iter()
            .map(|p| ProcessorInfo {
                name: p.binding.name.clone(),
                command_types: p.binding.command_types.clone(),
                instructions: p.binding.instructions.clone(),
                processed: p.processed.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Round-robin over the processors declaring `command_type`.
    async fn select_processor(&self, command_type: &CommandType) -> Option<Arc<Registered>> {
        let candidates: Vec<Arc<Registered>> = self
            .processors
            .read()
            .await
            .iter()
            .filter(|p| p.binding.handles(command_type))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let mut cursors = self.cursors.lock().await;
        let cursor = cursors.entry(command_type.clone()).or_insert(0);
        let chosen = Arc::clone(&candidates[*cursor % candidates.len()]);
        *cursor = cursor.wrapping_add(1);
        Some(chosen)
    }

    // ---- submission ----

    /// Records the command as Pending and starts its execution.
    ///
    /// Without a matching processor the command is Failed before this
    /// returns.
    pub async fn submit(
        &self,
        command_type: impl Into<CommandType>,
        parameters: Payload,
        metadata: Option<Metadata>,
    ) -> CommandId {
        let command_type = command_type.into();
        let command_id = self.ids.generate_command_id();
        let record = CommandRecord::new(
            command_id,
            command_type.clone(),
            parameters,
            metadata.unwrap_or_default(),
            self.clock.now(),
        );
        let (status_tx, _) = watch::channel(CommandStatus::Pending);
        let slot = Arc::new(CommandSlot {
            record: Mutex::new(record),
            status_tx,
            handle: Mutex::new(None),
        });
        self.commands
            .write()
            .await
            .insert(command_id, Arc::clone(&slot));
        info!(command_id = %command_id, command_type = %command_type, "command submitted");

        let Some(processor) = self.select_processor(&command_type).await else {
            let reason = FailureReason::new(
                ErrorKind::Configuration,
                format!("no processor registered for command type {command_type}"),
            );
            let now = self.clock.now();
            if let Err(e) = slot.transition(|r| r.fail(reason, now)).await {
                error!(command_id = %command_id, "{e}");
            }
            warn!(command_id = %command_id, command_type = %command_type, "no processor registered");
            return command_id;
        };

        let task = tokio::spawn(execute(
            Arc::clone(&slot),
            processor,
            Arc::clone(&self.clock),
            self.retry.clone(),
            self.execution_timeout,
        ));
        *slot.handle.lock().await = Some(task);
        command_id
    }

    /// Submits a Command envelope. The command type is read from
    /// `metadata.command_type` and the payload becomes the parameters.
    pub async fn submit_envelope(&self, envelope: &Envelope) -> Result<CommandId, RelayError> {
        let command_type = envelope
            .metadata()
            .get(COMMAND_TYPE_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ProcessingError::InvalidInput(format!(
                    "envelope {} has no {COMMAND_TYPE_KEY}",
                    envelope.id()
                ))
            })?;
        let mut metadata = envelope.metadata().clone();
        metadata.remove(COMMAND_TYPE_KEY);
        metadata.insert("message_id".to_string(), json!(envelope.id().to_string()));
        Ok(self
            .submit(command_type, envelope.payload().clone(), Some(metadata))
            .await)
    }

    /// Submits, then waits up to `timeout` for a terminal status.
    ///
    /// A Failed command still yields a Response (with `status = "failed"`);
    /// only the wait itself can time out. On timeout the command keeps
    /// running.
    pub async fn invoke_and_wait(
        &self,
        command_type: impl Into<CommandType>,
        parameters: Payload,
        timeout: Duration,
    ) -> Result<Envelope, RelayError> {
        let command_id = self.submit(command_type, parameters, None).await;
        let slot = self.slot(command_id).await?;
        let mut rx = slot.status_tx.subscribe();

        match tokio::time::timeout(timeout, rx.wait_for(|s| s.is_terminal())).await {
            Err(_) => {
                debug!(command_id = %command_id, "wait timed out, command keeps running");
                return Err(RelayError::Timeout(timeout));
            }
            Ok(Err(_)) => {
                // sender lives in the slot; fall through to the record
            }
            Ok(Ok(_)) => {}
        }

        let record = slot.record.lock().await.clone();
        Ok(self.response_for(&record))
    }

    fn response_for(&self, record: &CommandRecord) -> Envelope {
        let mut payload = Payload::new();
        payload.insert("command_id".to_string(), json!(record.command_id.to_string()));
        payload.insert("status".to_string(), json!(record.status));
        if let Some(result) = &record.result {
            payload.insert("result".to_string(), result.clone());
        }
        if let Some(error) = &record.error {
            payload.insert("error".to_string(), json!(error));
        }
        Envelope::new(MessageKind::Response, self.source.clone(), payload)
            .with_id(self.ids.generate_message_id())
            .with_correlation_id(record.command_id.to_string())
            .with_metadata(COMMAND_TYPE_KEY, record.command_type.as_str())
    }

    // ---- status projections ----

    async fn slot(&self, command_id: CommandId) -> Result<Arc<CommandSlot>, RelayError> {
        self.commands
            .read()
            .await
            .get(&command_id)
            .cloned()
            .ok_or_else(|| RelayError::not_found("command", command_id))
    }

    pub async fn get_status(&self, command_id: CommandId) -> Result<CommandRecord, RelayError> {
        let slot = self.slot(command_id).await?;
        let record = slot.record.lock().await.clone();
        Ok(record)
    }

    /// Change feed of one command's status.
    pub async fn watch_status(
        &self,
        command_id: CommandId,
    ) -> Result<watch::Receiver<CommandStatus>, RelayError> {
        Ok(self.slot(command_id).await?.status_tx.subscribe())
    }

    /// Oldest first.
    pub async fn list_commands(&self) -> Vec<CommandRecord> {
        let slots: Vec<_> = self.commands.read().await.values().cloned().collect();
        let mut records = Vec::with_capacity(slots.len());
        for slot in slots {
            records.push(slot.record.lock().await.clone());
        }
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.command_id.cmp(&b.command_id))
        });
        records
    }

    pub async fn counts_by_status(&self) -> CommandCounts {
        let mut counts = CommandCounts::default();
        for record in self.list_commands().await {
            match record.status {
                CommandStatus::Pending => counts.pending += 1,
                CommandStatus::Processing => counts.processing += 1,
                CommandStatus::Completed => counts.completed += 1,
                CommandStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Waits for every retained execution to finish.
    pub async fn shutdown(&self) {
        let slots: Vec<_> = self.commands.read().await.values().cloned().collect();
        let mut handles = Vec::new();
        for slot in slots {
            if let Some(handle) = slot.handle.lock().await.take() {
                handles.push(handle);
            }
        }
        info!(in_flight = handles.len(), "command dispatcher shutting down");
        for handle in handles {
            if let Err(e) = handle.await {
                error!("command execution panicked: {e}");
            }
        }
    }
}

async fn execute(
    slot: Arc<CommandSlot>,
    processor: Arc<Registered>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    execution_timeout: Duration,
) {
    let binding = &processor.binding;
    let now = clock.now();
    if let Err(e) = slot.transition(|r| r.start(&binding.name, now)).await {
        error!("{e}");
        return;
    }

    let parameters = slot.record.lock().await.parameters.clone();
    let outcome = tokio::time::timeout(
        execution_timeout,
        invoke_with_retry(
            binding.processor.as_ref(),
            &retry,
            &binding.instructions,
            &parameters,
            None,
        ),
    )
    .await
    .unwrap_or_else(|_| {
        Err(ProcessingError::Timeout(format!(
            "processor {} exceeded {:?}",
            binding.name, execution_timeout
        )))
    });

    let now = clock.now();
    let result = match outcome {
        Ok(text) => {
            processor.processed.fetch_add(1, Ordering::Relaxed);
            let result = json!({
                "processor": binding.name,
                "response": parse_response(&text),
                "completed_at": now.to_rfc3339(),
            });
            slot.transition(|r| r.complete(result, now)).await
        }
        Err(e) => {
            warn!(processor = %binding.name, "command failed: {e}");
            let reason = FailureReason::from(&e);
            slot.transition(|r| r.fail(reason, now)).await
        }
    };
    if let Err(e) = result {
        error!("{e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::payload_from;
    use crate::impls::FnProcessor;
    use crate::ports::{FixedClock, SystemClock, UlidGenerator};
    use chrono::{TimeZone, Utc};

    fn dispatcher() -> CommandDispatcher {
        CommandDispatcher::new(
            "dispatcher",
            &CommandConfig::default(),
            Arc::new(UlidGenerator::new(SystemClock)),
            Arc::new(SystemClock),
        )
        .with_retry_policy(RetryPolicy::none())
    }

    fn echo(name: &str, types: &[&str]) -> CommandProcessor {
        let processor: Arc<dyn CognitiveProcessor> =
            Arc::new(FnProcessor::new(|_, input: &Payload| {
                Ok(Value::Object(input.clone()).to_string())
            }));
        CommandProcessor::new(name, types.iter().copied(), "echo the parameters", processor)
    }

    async fn wait_terminal(d: &CommandDispatcher, id: CommandId) -> CommandRecord {
        let mut rx = d.watch_status(id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| s.is_terminal()))
            .await
            .expect("terminal in time")
            .expect("sender alive");
        d.get_status(id).await.unwrap()
    }

    #[tokio::test]
    async fn unknown_command_type_fails_immediately() {
        let d = dispatcher();
        let id = d.submit("process_data", Payload::new(), None).await;

        let record = d.get_status(id).await.unwrap();
        assert_eq!(record.status, CommandStatus::Failed);
        let error = record.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Configuration);
        assert!(error.message.contains("no processor registered"));
    }

    #[tokio::test]
    async fn completed_command_carries_processor_result() {
        let d = dispatcher();
        d.register_processor(echo("echo", &["summarize"])).await;

        let id = d
            .submit("summarize", payload_from(json!({"doc": "x"})), None)
            .await;
        let record = wait_terminal(&d, id).await;

        assert_eq!(record.status, CommandStatus::Completed);
        assert_eq!(record.processor.as_deref(), Some("echo"));
        let result = record.result.unwrap();
        assert_eq!(result["processor"], "echo");
        assert_eq!(result["response"], json!({"doc": "x"}));
        assert!(result["completed_at"].is_string());
        assert_eq!(d.list_processors().await[0].processed, 1);
    }

    #[tokio::test]
    async fn status_never_regresses() {
        let d = dispatcher();
        let slow: Arc<dyn CognitiveProcessor> = Arc::new(
            FnProcessor::new(|_, _| Ok("ok".to_string())).with_delay(Duration::from_millis(30)),
        );
        d.register_processor(CommandProcessor::new("slow", ["work"], "", slow))
            .await;

        let id = d.submit("work", Payload::new(), None).await;
        let mut seen = vec![];
        loop {
            let status = d.get_status(id).await.unwrap().status;
            if seen.last() != Some(&status) {
                seen.push(status);
            }
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // declaration order is lifecycle order
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(seen.last(), Some(&CommandStatus::Completed));
    }

    #[tokio::test]
    async fn matching_processors_are_used_round_robin() {
        let d = dispatcher();
        d.register_processor(echo("a", &["summarize"])).await;
        d.register_processor(echo("b", &["summarize", "translate"])).await;
        d.register_processor(echo("c", &["translate"])).await;

        let mut used = vec![];
        for _ in 0..4 {
            let id = d.submit("summarize", Payload::new(), None).await;
            used.push(wait_terminal(&d, id).await.processor.unwrap());
        }

        assert_eq!(used, vec!["a", "b", "a", "b"]);
        let processed: Vec<_> = d.list_processors().await.iter().map(|p| p.processed).collect();
        assert_eq!(processed, vec![2, 2, 0]);
    }

    #[tokio::test]
    async fn identical_submissions_are_independent() {
        let d = dispatcher();
        d.register_processor(echo("echo", &["summarize"])).await;
        let params = payload_from(json!({"doc": "same"}));

        let first = d.submit("summarize", params.clone(), None).await;
        let second = d.submit("summarize", params, None).await;
        assert_ne!(first, second);

        wait_terminal(&d, first).await;
        wait_terminal(&d, second).await;
        assert_eq!(d.counts_by_status().await.completed, 2);
        assert_eq!(d.list_processors().await[0].processed, 2);
    }

    #[tokio::test]
    async fn invoke_and_wait_returns_a_response() {
        let d = dispatcher();
        d.register_processor(echo("echo", &["summarize"])).await;

        let response = d
            .invoke_and_wait(
                "summarize",
                payload_from(json!({"doc": "x"})),
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        assert_eq!(response.kind(), MessageKind::Response);
        assert_eq!(response.payload()["status"], "completed");
        assert_eq!(response.payload()["result"]["response"], json!({"doc": "x"}));
        let id: CommandId = response.correlation_id().unwrap().parse().unwrap();
        assert_eq!(d.get_status(id).await.unwrap().status, CommandStatus::Completed);
    }

    #[tokio::test]
    async fn invoke_and_wait_reports_failure_without_raising() {
        let d = dispatcher();
        let response = d
            .invoke_and_wait("process_data", Payload::new(), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(response.payload()["status"], "failed");
        assert_eq!(response.payload()["error"]["kind"], "CONFIGURATION");
    }

    #[tokio::test]
    async fn wait_timeout_leaves_command_running() {
        let d = dispatcher();
        let slow: Arc<dyn CognitiveProcessor> = Arc::new(
            FnProcessor::new(|_, _| Ok("late".to_string())).with_delay(Duration::from_millis(300)),
        );
        d.register_processor(CommandProcessor::new("slow", ["work"], "", slow))
            .await;

        let err = d
            .invoke_and_wait("work", Payload::new(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Timeout(_)));

        let record = d.list_commands().await.pop().unwrap();
        assert_eq!(record.status, CommandStatus::Processing);

        d.shutdown().await;
        let record = d.get_status(record.command_id).await.unwrap();
        assert_eq!(record.status, CommandStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn execution_timeout_fails_the_command() {
        let d = CommandDispatcher::new(
            "dispatcher",
            &CommandConfig {
                execution_timeout_ms: 100,
            },
            Arc::new(UlidGenerator::new(SystemClock)),
            Arc::new(SystemClock),
        );
        let stuck: Arc<dyn CognitiveProcessor> = Arc::new(
            FnProcessor::new(|_, _| Ok(String::new())).with_delay(Duration::from_secs(60)),
        );
        d.register_processor(CommandProcessor::new("stuck", ["work"], "", stuck))
            .await;

        let id = d.submit("work", Payload::new(), None).await;
        let record = wait_terminal(&d, id).await;

        assert_eq!(record.status, CommandStatus::Failed);
        assert_eq!(record.error.unwrap().kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let d = dispatcher();
        let err = d
            .get_status(CommandId::generate())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(d.unregister_processor("ghost").await.is_err());
    }

    #[tokio::test]
    async fn reregistration_replaces_and_unregister_removes() {
        let d = dispatcher();
        d.register_processor(echo("p", &["a"])).await;
        d.register_processor(echo("p", &["b"])).await;

        let infos = d.list_processors().await;
        assert_eq!(infos.len(), 1);
        assert!(infos[0].command_types.contains(&CommandType::from("b")));

        d.unregister_processor("p").await.unwrap();
        let id = d.submit("b", Payload::new(), None).await;
        assert_eq!(d.get_status(id).await.unwrap().status, CommandStatus::Failed);
    }

    #[tokio::test]
    async fn command_envelope_is_routed_by_type() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        let d = CommandDispatcher::new(
            "dispatcher",
            &CommandConfig::default(),
            Arc::new(UlidGenerator::new(clock)),
            Arc::new(clock),
        );
        d.register_processor(echo("echo", &["summarize"])).await;

        let envelope = Envelope::command("client", "summarize", payload_from(json!({"doc": "y"})))
            .with_metadata("idempotency_key", "k-1");
        let id = d.submit_envelope(&envelope).await.unwrap();
        let record = wait_terminal(&d, id).await;

        assert_eq!(record.command_type, CommandType::from("summarize"));
        assert_eq!(record.metadata["idempotency_key"], "k-1");
        assert_eq!(record.created_at, clock.now());

        let bare = Envelope::task("client", Payload::new());
        let err = d.submit_envelope(&bare).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
