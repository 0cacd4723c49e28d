//! relay-core
//!
//! Messaging patterns that route typed envelopes through cognitive
//! processors.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, envelope, outcome, decision, command, registration, errors）
//! - **ports**: 抽象化レイヤー（Transport, CognitiveProcessor, Clock, IdGenerator）
//! - **impls**: 開発用の実装（InMemoryTransport, FnProcessor）
//! - **queue**: 競合コンシューマ（QueueConsumer）
//! - **pipeline**: フィルタの連鎖（Pipeline, Filter）
//! - **pubsub**: トピック単位のファンアウト（Broker）
//! - **command**: 非同期コマンド（CommandDispatcher）
//!
//! Cross-cutting: `config` (TOML), `retry` (rate-limit backoff) and
//! `observability` (counter projections).

pub mod command;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod pipeline;
pub mod ports;
pub mod pubsub;
pub mod queue;
pub mod retry;

pub use config::RelayConfig;
pub use domain::{Envelope, RelayError};
