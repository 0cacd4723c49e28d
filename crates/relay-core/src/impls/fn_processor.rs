//! FnProcessor - クロージャで動く CognitiveProcessor
//!
//! Deterministic local stand-in for a model backend. Used by the demo CLI
//! and as a test double.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{Payload, ProcessingError};
use crate::ports::{CognitiveProcessor, ConversationHandle};

pub struct FnProcessor<F> {
    f: F,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl<F> FnProcessor<F>
where
    F: Fn(&str, &Payload) -> Result<String, ProcessingError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Sleeps for `delay` before every call (simulates a slow model).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of `invoke` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<F> CognitiveProcessor for FnProcessor<F>
where
    F: Fn(&str, &Payload) -> Result<String, ProcessingError> + Send + Sync,
{
    async fn invoke(
        &self,
        instructions: &str,
        input: &Payload,
        _context: Option<&ConversationHandle>,
    ) -> Result<String, ProcessingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.f)(instructions, input)
    }
}
