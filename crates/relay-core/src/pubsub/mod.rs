//! PubSub - トピック単位のファンアウト
//!
//! A publish snapshots the matching subscribers and runs each in its own
//! task. Matching is an exact membership test on the subscriber's topic set.

pub mod broker;

pub use broker::{
    Broker, DispatchResult, DispatchStatus, PublishHandle, PublishReport, Subscription,
};
