//! Command - 非同期コマンドのディスパッチと状態管理
//!
//! # 状態遷移
//! - Pending → Processing → Completed | Failed
//! - Pending → Failed（対応するプロセッサがない場合、submit 内で即座に）
//!
//! The dispatcher owns every record. Callers read clones through
//! `get_status` / `list_commands`, or follow a command through
//! `watch_status`.

pub mod dispatcher;

pub use dispatcher::{CommandDispatcher, CommandProcessor};
