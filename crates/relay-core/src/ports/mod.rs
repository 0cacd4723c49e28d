//! Ports - 外部コラボレーターへのインターフェース
//!
//! The core only talks to the outside world through these traits:
//! - [`Transport`]: send/receive opaque message bodies on named channels
//! - [`CognitiveProcessor`]: submit text + instructions, get text back
//!
//! Broker wire protocols and model clients live behind them.

pub mod clock;
pub mod cognitive;
pub mod id_generator;
pub mod transport;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::cognitive::{CognitiveProcessor, ConversationHandle, parse_response};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::transport::{Delivery, DeliveryStream, Transport};
