//! Extraction-and-load orchestration for shopsync.
//!
//! The [`orchestrator::Pipeline`] drives each configured dataset through
//! extract, normalize and load, committing watermarks only after the
//! warehouse confirms a batch.

pub mod config;
pub mod errors;
pub mod extract;
pub mod load;
pub mod normalize;
pub mod orchestrator;
pub mod result;
pub mod retry;
pub mod staging;

pub use errors::PipelineError;
pub use orchestrator::{Pipeline, RunMode};
pub use result::{DatasetOutcome, DatasetState, RunReport};
