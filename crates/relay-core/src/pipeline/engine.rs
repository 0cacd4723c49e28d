use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::domain::outcome::{TRANSFORMATIONS_KEY, append_transformation};
use crate::domain::{
    Envelope, ErrorKind, FailureReason, ProcessingError, StageStatus, TransformationRecord,
};
use crate::pipeline::filter::{Filter, FilterOutcome};

/// Metadata key listing the stages that failed during a sequential run.
pub const FAILURES_KEY: &str = "failures";

/// Metadata key set on a parallel result whose filter failed or rejected.
pub const ERROR_KEY: &str = "error";

/// Result of one sequential run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRun {
    /// `None` when a stage rejected the envelope.
    pub output: Option<Envelope>,
    /// One record per stage attempted in this run.
    pub transformations: Vec<TransformationRecord>,
}

impl PipelineRun {
    pub fn is_dropped(&self) -> bool {
        self.output.is_none()
    }

    pub fn failed_stages(&self) -> impl Iterator<Item = &str> {
        self.transformations
            .iter()
            .filter(|t| t.outcome == StageStatus::Failed)
            .map(|t| t.stage.as_str())
    }
}

/// One filter's result in a parallel run.
#[derive(Debug, Clone, PartialEq)]
pub struct StageResult {
    /// Registration index of the filter.
    pub index: usize,
    pub filter: String,
    pub status: StageStatus,
    /// The filter's output, or the untouched input copy when it did not
    /// transform.
    pub envelope: Envelope,
    pub error: Option<FailureReason>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    #[default]
    Sequential,
    Parallel,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchItem {
    Sequential(PipelineRun),
    Parallel(Vec<StageResult>),
}

impl BatchItem {
    /// Sequential: not dropped. Parallel: no filter failed or rejected.
    pub fn passed(&self) -> bool {
        match self {
            Self::Sequential(run) => !run.is_dropped(),
            Self::Parallel(results) => results.iter().all(|r| r.error.is_none()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub passed: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    /// In input order.
    pub items: Vec<BatchItem>,
    pub summary: BatchSummary,
}

/// Ordered chain of filters over one envelope.
pub struct Pipeline {
    name: String,
    filters: Vec<Arc<dyn Filter>>,
    stage_timeout: Duration,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, config: &PipelineConfig) -> Self {
        Self {
            name: name.into(),
            filters: Vec::new(),
            stage_timeout: config.stage_timeout(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends a filter; sequential runs apply filters in append order.
    pub fn add_filter(&mut self, filter: Arc<dyn Filter>) -> &mut Self {
        debug!(pipeline = %self.name, filter = filter.name(), "filter added");
        self.filters.push(filter);
        self
    }

    pub fn with_filter(mut self, filter: impl Filter + 'static) -> Self {
        self.add_filter(Arc::new(filter));
        self
    }

    pub fn list_filters(&self) -> Vec<String> {
        self.filters.iter().map(|f| f.name().to_string()).collect()
    }

    /// Applies `filter` under the stage timeout.
    async fn run_stage(&self, filter: &dyn Filter, envelope: &Envelope) -> FilterOutcome {
        match timeout(self.stage_timeout, filter.apply(envelope)).await {
            Ok(outcome) => outcome,
            Err(_) => FilterOutcome::Failed(ProcessingError::Timeout(format!(
                "stage {} exceeded {:?}",
                filter.name(),
                self.stage_timeout
            ))),
        }
    }

    /// Runs every filter in order over a private copy of `envelope`.
    ///
    /// - Transformed: the next stage receives the new revision
    /// - PassThrough: the next stage receives the same envelope
    /// - Rejected: the run stops and `output` is `None`
    /// - Failed: recorded in the trail and in `metadata.failures`; the next
    ///   stage receives the failed stage's input
    pub async fn process(&self, envelope: &Envelope) -> PipelineRun {
        let mut current = envelope.clone();
        let mut trail = Vec::with_capacity(self.filters.len());

        for filter in &self.filters {
            let started_at = Utc::now();
            let outcome = self.run_stage(filter.as_ref(), &current).await;
            let finished_at = Utc::now();
            let record = |status| {
                TransformationRecord::new(filter.name(), started_at, finished_at, status)
            };

            match outcome {
                FilterOutcome::Transformed(next) => {
                    let rec = record(StageStatus::Success);
                    let mut next = next;
                    carry_audit(&current, &mut next);
                    current = next;
                    append_transformation(&mut current, &rec);
                    trail.push(rec);
                }
                FilterOutcome::PassThrough => {
                    let rec = record(StageStatus::PassThrough);
                    append_transformation(&mut current, &rec);
                    trail.push(rec);
                }
                FilterOutcome::Rejected(reason) => {
                    let rec = record(StageStatus::Rejected).with_note(reason.clone());
                    trail.push(rec);
                    info!(
                        pipeline = %self.name,
                        filter = filter.name(),
                        message_id = %envelope.id(),
                        "envelope rejected: {reason}"
                    );
                    return PipelineRun {
                        output: None,
                        transformations: trail,
                    };
                }
                FilterOutcome::Failed(err) => {
                    let reason = FailureReason::from(&err);
                    let rec = record(StageStatus::Failed).with_failure(&reason);
                    append_transformation(&mut current, &rec);
                    push_failure(&mut current, filter.name(), &reason);
                    trail.push(rec);
                    warn!(
                        pipeline = %self.name,
                        filter = filter.name(),
                        message_id = %envelope.id(),
                        "stage failed, continuing with last good envelope: {reason}"
                    );
                }
            }
        }

        debug!(pipeline = %self.name, stages = trail.len(), "pipeline run complete");
        PipelineRun {
            output: Some(current),
            transformations: trail,
        }
    }

    /// Runs every filter concurrently, each on its own copy of `envelope`.
    ///
    /// Results are in filter registration order. A failing filter yields an
    /// entry carrying `metadata.error` and never affects the others.
    pub async fn process_parallel(&self, envelope: &Envelope) -> Vec<StageResult> {
        let runs = self.filters.iter().enumerate().map(|(index, filter)| {
            let input = envelope.clone();
            async move {
                let started_at = Utc::now();
                let outcome = self.run_stage(filter.as_ref(), &input).await;
                let finished_at = Utc::now();
                let (status, mut out, error) = match outcome {
                    FilterOutcome::Transformed(next) => (StageStatus::Success, next, None),
                    FilterOutcome::PassThrough => (StageStatus::PassThrough, input, None),
                    FilterOutcome::Rejected(reason) => (
                        StageStatus::Rejected,
                        input,
                        Some(FailureReason::new(ErrorKind::Rejected, reason)),
                    ),
                    FilterOutcome::Failed(err) => {
                        (StageStatus::Failed, input, Some(FailureReason::from(&err)))
                    }
                };

                let record =
                    TransformationRecord::new(filter.name(), started_at, finished_at, status);
                let record = match &error {
                    Some(reason) => record.with_failure(reason),
                    None => record,
                };
                append_transformation(&mut out, &record);
                if let Some(reason) = &error {
                    out.set_metadata(
                        ERROR_KEY,
                        json!({"filter": filter.name(), "kind": reason.kind, "message": reason.message}),
                    );
                }

                StageResult {
                    index,
                    filter: filter.name().to_string(),
                    status,
                    envelope: out,
                    error,
                }
            }
        });

        let results = join_all(runs).await;
        debug!(
            pipeline = %self.name,
            filters = results.len(),
            failed = results.iter().filter(|r| r.error.is_some()).count(),
            "parallel run complete"
        );
        results
    }

    /// Processes every envelope independently and concurrently.
    pub async fn process_batch(&self, envelopes: &[Envelope], mode: BatchMode) -> BatchReport {
        let items = join_all(envelopes.iter().map(|e| async move {
            match mode {
                BatchMode::Sequential => BatchItem::Sequential(self.process(e).await),
                BatchMode::Parallel => BatchItem::Parallel(self.process_parallel(e).await),
            }
        }))
        .await;

        let passed = items.iter().filter(|i| i.passed()).count();
        let summary = BatchSummary {
            passed,
            dropped: items.len() - passed,
        };
        info!(
            pipeline = %self.name,
            passed = summary.passed,
            dropped = summary.dropped,
            "batch processed"
        );
        BatchReport { items, summary }
    }
}

/// The engine owns the audit keys: a filter's output inherits them from the
/// stage input whatever the filter did to its metadata.
fn carry_audit(from: &Envelope, into: &mut Envelope) {
    for key in [TRANSFORMATIONS_KEY, FAILURES_KEY] {
        match from.metadata().get(key) {
            Some(value) => {
                into.metadata_mut().insert(key.to_string(), value.clone());
            }
            None => {
                into.metadata_mut().remove(key);
            }
        }
    }
}

fn push_failure(envelope: &mut Envelope, stage: &str, reason: &FailureReason) {
    let note = json!({"stage": stage, "kind": reason.kind, "message": reason.message});
    let failures = envelope
        .metadata_mut()
        .entry(FAILURES_KEY)
        .or_insert_with(|| Value::Array(Vec::new()));
    match failures {
        Value::Array(items) => items.push(note),
        other => *other = Value::Array(vec![note]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::outcome::transformations;
    use crate::domain::payload_from;
    use crate::impls::FnProcessor;
    use crate::pipeline::filters::{
        CognitiveFilter, EnrichmentFilter, TransformFilter, UppercaseFilter, ValidationFilter,
    };
    use crate::retry::RetryPolicy;

    fn envelope(payload: Value) -> Envelope {
        Envelope::task("test", payload_from(payload))
    }

    fn contact_pipeline() -> Pipeline {
        Pipeline::new("contacts", &PipelineConfig::default())
            .with_filter(ValidationFilter::new(["email"]))
            .with_filter(UppercaseFilter::new("name"))
    }

    fn always_fails() -> TransformFilter {
        TransformFilter::new("broken", |_| {
            Err(ProcessingError::Unavailable("model offline".to_string()))
        })
    }

    #[tokio::test]
    async fn valid_contact_is_uppercased() {
        let run = contact_pipeline()
            .process(&envelope(json!({"email": "a@b.com", "name": "joe"})))
            .await;

        let out = run.output.unwrap();
        assert_eq!(out.payload(), &payload_from(json!({"email": "a@b.com", "name": "JOE"})));
        assert_eq!(run.transformations.len(), 2);
        assert!(run.transformations.iter().all(TransformationRecord::is_success));
        assert_eq!(transformations(&out), run.transformations);
    }

    #[tokio::test]
    async fn missing_email_is_rejected_at_the_first_stage() {
        let run = contact_pipeline().process(&envelope(json!({"name": "joe"}))).await;

        assert!(run.is_dropped());
        assert_eq!(run.transformations.len(), 1);
        assert_eq!(run.transformations[0].outcome, StageStatus::Rejected);
        assert_eq!(run.transformations[0].stage, "validate");
    }

    #[tokio::test]
    async fn failed_stage_degrades_instead_of_aborting() {
        let pipeline = Pipeline::new("p", &PipelineConfig::default())
            .with_filter(EnrichmentFilter::new("enrich", payload_from(json!({"region": "eu"}))))
            .with_filter(always_fails())
            .with_filter(UppercaseFilter::new("name"));

        let run = pipeline.process(&envelope(json!({"name": "joe"}))).await;

        let out = run.output.as_ref().unwrap();
        assert_eq!(out.payload()["region"], "eu");
        assert_eq!(out.payload()["name"], "JOE");
        assert_eq!(run.transformations.len(), 3);
        assert_eq!(run.failed_stages().collect::<Vec<_>>(), vec!["broken"]);
        assert_eq!(out.metadata()[FAILURES_KEY][0]["stage"], "broken");
        assert_eq!(out.metadata()[FAILURES_KEY][0]["kind"], "UNAVAILABLE");
    }

    /// Replaces the envelope with a brand-new one, dropping its metadata.
    struct FreshEnvelope;

    #[async_trait::async_trait]
    impl Filter for FreshEnvelope {
        fn name(&self) -> &str {
            "fresh"
        }

        async fn apply(&self, envelope: &Envelope) -> FilterOutcome {
            FilterOutcome::Transformed(Envelope::task("fresh", envelope.payload().clone()))
        }
    }

    #[tokio::test]
    async fn trail_survives_a_filter_that_discards_metadata() {
        let pipeline = Pipeline::new("p", &PipelineConfig::default())
            .with_filter(UppercaseFilter::new("name"))
            .with_filter(always_fails())
            .with_filter(FreshEnvelope);

        let run = pipeline.process(&envelope(json!({"name": "joe"}))).await;

        let out = run.output.unwrap();
        assert_eq!(run.transformations.len(), 3);
        assert_eq!(transformations(&out), run.transformations);
        assert_eq!(out.metadata()[FAILURES_KEY][0]["stage"], "broken");
        assert_eq!(out.payload()["name"], "JOE");
    }

    #[tokio::test]
    async fn input_envelope_is_not_mutated() {
        let input = envelope(json!({"email": "a@b.com", "name": "joe"}));
        let _ = contact_pipeline().process(&input).await;

        assert_eq!(input.payload()["name"], "joe");
        assert!(input.metadata().is_empty());
    }

    #[tokio::test]
    async fn replay_yields_identical_payloads() {
        let pipeline = contact_pipeline().with_filter(EnrichmentFilter::new(
            "enrich",
            payload_from(json!({"source": "crm"})),
        ));
        let input = envelope(json!({"email": "a@b.com", "name": "joe"}));

        let first = pipeline.process(&input.clone()).await.output.unwrap();
        let second = pipeline.process(&input.clone()).await.output.unwrap();
        assert_eq!(first.payload(), second.payload());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_stage_times_out_as_failure() {
        let slow = Arc::new(
            FnProcessor::new(|_, _| Ok("late".to_string())).with_delay(Duration::from_secs(60)),
        );
        let pipeline = Pipeline::new("p", &PipelineConfig { stage_timeout_ms: 1_000 })
            .with_filter(
                CognitiveFilter::new("slow", slow, "think", "answer")
                    .with_retry_policy(RetryPolicy::none()),
            )
            .with_filter(UppercaseFilter::new("name"));

        let run = pipeline.process(&envelope(json!({"name": "joe"}))).await;

        assert_eq!(run.transformations[0].outcome, StageStatus::Failed);
        assert_eq!(run.transformations[0].error_kind, Some(ErrorKind::Timeout));
        assert_eq!(run.output.unwrap().payload()["name"], "JOE");
    }

    #[tokio::test]
    async fn parallel_run_isolates_the_failing_filter() {
        let pipeline = Pipeline::new("p", &PipelineConfig::default())
            .with_filter(UppercaseFilter::new("name"))
            .with_filter(always_fails())
            .with_filter(EnrichmentFilter::new("enrich", payload_from(json!({"region": "eu"}))));

        let input = envelope(json!({"name": "joe"}));
        let results = pipeline.process_parallel(&input).await;

        assert_eq!(results.len(), 3);
        assert_eq!(
            results.iter().map(|r| r.filter.as_str()).collect::<Vec<_>>(),
            vec!["uppercase", "broken", "enrich"]
        );
        assert_eq!(results[0].envelope.payload()["name"], "JOE");
        assert_eq!(results[1].status, StageStatus::Failed);
        assert_eq!(results[1].envelope.metadata()[ERROR_KEY]["filter"], "broken");
        // independent copies: enrichment never sees the uppercase result
        assert_eq!(results[2].envelope.payload()["name"], "joe");
        assert_eq!(results[2].envelope.payload()["region"], "eu");
        assert!(results[2].error.is_none());
    }

    #[tokio::test]
    async fn batch_counts_passed_and_dropped() {
        let inputs = vec![
            envelope(json!({"email": "a@b.com", "name": "ann"})),
            envelope(json!({"name": "bob"})),
            envelope(json!({"email": "c@d.com", "name": "cy"})),
        ];

        let report = contact_pipeline().process_batch(&inputs, BatchMode::Sequential).await;

        assert_eq!(report.summary, BatchSummary { passed: 2, dropped: 1 });
        assert_eq!(report.items.len(), 3);
        assert!(!report.items[1].passed());
    }

    #[tokio::test]
    async fn parallel_batch_reports_per_envelope_results() {
        let inputs = vec![envelope(json!({"email": "a@b.com"})), envelope(json!({}))];

        let report = contact_pipeline().process_batch(&inputs, BatchMode::Parallel).await;

        assert_eq!(report.summary, BatchSummary { passed: 1, dropped: 1 });
        let BatchItem::Parallel(results) = &report.items[1] else {
            panic!("expected parallel results");
        };
        assert_eq!(results[0].status, StageStatus::Rejected);
    }

    #[test]
    fn list_filters_keeps_append_order() {
        assert_eq!(contact_pipeline().list_filters(), vec!["validate", "uppercase"]);
    }
}
