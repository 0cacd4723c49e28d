use async_trait::async_trait;

use crate::domain::{Envelope, ProcessingError};

/// Result of applying one filter.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOutcome {
    /// A new revision of the envelope; the next stage receives it.
    Transformed(Envelope),
    /// Continue with the input unchanged.
    PassThrough,
    /// Deliberate drop. Not a failure.
    Rejected(String),
    /// The stage broke.
    Failed(ProcessingError),
}

/// One named pipeline stage.
///
/// Filters receive the envelope by reference and never mutate it. A
/// transformation is expressed by returning a new revision built with
/// [`Envelope::with_payload`] or [`Envelope::map_payload`].
#[async_trait]
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(&self, envelope: &Envelope) -> FilterOutcome;
}
