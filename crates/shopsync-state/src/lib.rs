//! Watermark persistence for the shopsync engine.
//!
//! Provides the [`WatermarkStore`] trait and a [`SqliteWatermarkStore`]
//! implementation holding per-dataset watermarks and run history.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod sqlite;

pub use backend::WatermarkStore;
pub use error::StateError;
pub use sqlite::SqliteWatermarkStore;
