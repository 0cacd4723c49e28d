//! Impls - ports の開発用・テスト用実装
//!
//! - **InMemoryTransport**: process-local channels with ack/abandon/dead-letter
//! - **FnProcessor**: closure-backed CognitiveProcessor
//!
//! Broker and model clients for production belong in separate crates.

pub mod fn_processor;
pub mod inmem_transport;

pub use self::fn_processor::FnProcessor;
pub use self::inmem_transport::{DeadLetter, InMemoryTransport};
