//! `SQLite` implementation of the shopsync [`Warehouse`] boundary.
//!
//! Datasets are rows of a `__datasets` registry; each table is stored as
//! `"<dataset>.<table>"` with its logical schema recorded in `__tables`.
//! Used as a local destination and as the warehouse in engine tests.
//!
//! [`Warehouse`]: shopsync_types::warehouse::Warehouse

mod ddl;
mod value;
mod warehouse;

pub use warehouse::SqliteWarehouse;
