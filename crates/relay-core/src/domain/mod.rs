//! Domain model (IDs, envelope, outcomes, decisions, command records, ...).
//!
//! Pure data and pure functions only: nothing here touches a transport or a
//! processor.

pub mod command;
pub mod decision;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod outcome;
pub mod registration;

pub use command::{CommandRecord, CommandStatus, CommandType, InvalidTransition};
pub use decision::{Decider, DefaultDecider, DeliveryDecision};
pub use envelope::{Envelope, MessageKind, Metadata, Payload, Priority, payload_from};
pub use errors::{ErrorKind, FailureReason, ProcessingError, RelayError, TransportError};
pub use ids::{CommandId, MessageId, SubscriberId};
pub use outcome::{StageStatus, TransformationRecord};
pub use registration::{ProcessorInfo, SubscriberInfo, Topic};
