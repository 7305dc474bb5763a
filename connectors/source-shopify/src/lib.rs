//! Shopify Admin REST API implementation of [`PageSource`].
//!
//! [`PageSource`]: shopsync_types::source::PageSource

mod client;
mod headers;

pub use client::{ShopifyConfig, ShopifySource};
