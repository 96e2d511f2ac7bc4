//! A multi-tenant store of immutable metric-sample chunks.
//!
//! Bodies are opaque blobs; findability comes from an inverted label index
//! kept in a wide-column store, sharded by `(tenant, hour, metric name)`.
//! See [`ChunkStore`] for the public surface.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod cache;
pub mod config;
mod dispatch;
pub mod index;
mod metrics;
mod query;
pub mod schema;
mod store;

pub use config::{ChunkStoreConfig, ConfigError, ServiceEndpoint};
pub use store::{ChunkStore, Error, Result};
