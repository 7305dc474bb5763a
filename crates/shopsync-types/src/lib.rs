//! Shared shopsync model types.
//!
//! Dataset descriptors, records, watermarks and table schemas live here
//! together with the two boundary traits the engine consumes:
//! [`source::PageSource`] and [`warehouse::Warehouse`]. Connectors depend on
//! this crate only, never on the engine.

pub mod dataset;
pub mod error;
pub mod record;
pub mod schema;
pub mod source;
pub mod state;
pub mod warehouse;
pub mod watermark;
