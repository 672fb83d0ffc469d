//! Two-stage calibration of the deterministic floor.
//!
//! The clinical pass may only raise severities; the statistical pass tunes
//! gauge thresholds and decay weights. Any advisory failure degrades to the
//! floor with built-in gauge defaults.

pub mod advisor;
pub mod cancel;
pub mod merge;
pub mod pipeline;
pub mod proposals;

pub use advisor::{Advisor, HttpAdvisor, OfflineAdvisor};
pub use cancel::CancelToken;
pub use merge::{apply_adjustments, classify, Adjustment, MergeOutcome, TriggerBuckets};
pub use pipeline::{
    build_fallback_config, CalibrationInput, CalibrationPipeline, CalibrationRun, PipelineState,
};
