//! Pipeline - フィルタの連鎖
//!
//! # 設計原則
//! - フィルタは Envelope を変更しない（新しいリビジョンを返す）
//! - 失敗したステージは記録して続行（degrade, not abort）
//! - 試行したステージごとに必ず 1 件の TransformationRecord を残す

pub mod engine;
pub mod filter;
pub mod filters;

pub use engine::{
    BatchItem, BatchMode, BatchReport, BatchSummary, Pipeline, PipelineRun, StageResult,
};
pub use filter::{Filter, FilterOutcome};
pub use filters::{
    CognitiveFilter, EnrichmentFilter, TransformFilter, UppercaseFilter, ValidationFilter,
};
