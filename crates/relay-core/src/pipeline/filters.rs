//! Built-in filters.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{Envelope, Payload, ProcessingError};
use crate::pipeline::filter::{Filter, FilterOutcome};
use crate::ports::{CognitiveProcessor, parse_response};
use crate::retry::{RetryPolicy, invoke_with_retry};

/// Rejects envelopes missing any of the required payload fields.
#[derive(Debug, Clone)]
pub struct ValidationFilter {
    required: Vec<String>,
}

impl ValidationFilter {
    pub fn new<I, S>(required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required: required.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Filter for ValidationFilter {
    fn name(&self) -> &str {
        "validate"
    }

    async fn apply(&self, envelope: &Envelope) -> FilterOutcome {
        let missing: Vec<&str> = self
            .required
            .iter()
            .filter(|f| !envelope.payload().contains_key(f.as_str()))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            FilterOutcome::PassThrough
        } else {
            FilterOutcome::Rejected(format!("missing required fields: {}", missing.join(", ")))
        }
    }
}

/// Uppercases one string field. Anything else passes through.
#[derive(Debug, Clone)]
pub struct UppercaseFilter {
    field: String,
}

impl UppercaseFilter {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

#[async_trait]
impl Filter for UppercaseFilter {
    fn name(&self) -> &str {
        "uppercase"
    }

    async fn apply(&self, envelope: &Envelope) -> FilterOutcome {
        let Some(Value::String(s)) = envelope.payload().get(&self.field) else {
            return FilterOutcome::PassThrough;
        };
        let upper = s.to_uppercase();
        FilterOutcome::Transformed(envelope.map_payload(|mut p| {
            p.insert(self.field.clone(), Value::String(upper));
            p
        }))
    }
}

/// Merges a static set of fields into the payload (overwriting on conflict).
#[derive(Debug, Clone)]
pub struct EnrichmentFilter {
    name: String,
    fields: Payload,
}

impl EnrichmentFilter {
    pub fn new(name: impl Into<String>, fields: Payload) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }
}

#[async_trait]
impl Filter for EnrichmentFilter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, envelope: &Envelope) -> FilterOutcome {
        FilterOutcome::Transformed(envelope.map_payload(|mut p| {
            p.extend(self.fields.clone());
            p
        }))
    }
}

type PayloadFn = dyn Fn(&Payload) -> Result<Payload, ProcessingError> + Send + Sync;

/// Pure function over the payload.
#[derive(Clone)]
pub struct TransformFilter {
    name: String,
    f: Arc<PayloadFn>,
}

impl TransformFilter {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Payload) -> Result<Payload, ProcessingError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Arc::new(f),
        }
    }
}

#[async_trait]
impl Filter for TransformFilter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, envelope: &Envelope) -> FilterOutcome {
        match (self.f)(envelope.payload()) {
            Ok(payload) => FilterOutcome::Transformed(envelope.with_payload(payload)),
            Err(e) => FilterOutcome::Failed(e),
        }
    }
}

/// Sends the payload to a cognitive processor and stores the response in
/// `output_field`.
pub struct CognitiveFilter {
    name: String,
    processor: Arc<dyn CognitiveProcessor>,
    instructions: String,
    output_field: String,
    retry: RetryPolicy,
}

impl CognitiveFilter {
    pub fn new(
        name: impl Into<String>,
        processor: Arc<dyn CognitiveProcessor>,
        instructions: impl Into<String>,
        output_field: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            processor,
            instructions: instructions.into(),
            output_field: output_field.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl Filter for CognitiveFilter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, envelope: &Envelope) -> FilterOutcome {
        let text = match invoke_with_retry(
            self.processor.as_ref(),
            &self.retry,
            &self.instructions,
            envelope.payload(),
            None,
        )
        .await
        {
            Ok(text) => text,
            Err(e) => return FilterOutcome::Failed(e),
        };
        FilterOutcome::Transformed(envelope.map_payload(|mut p| {
            p.insert(self.output_field.clone(), parse_response(&text));
            p
        }))
    }
}
