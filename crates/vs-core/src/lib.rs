//! vs-core: shared error taxonomy, configuration, identifiers and caches.
//!
//! This crate is the foundational dependency for the other vs-* crates,
//! providing the validated [`VideoId`], the unified [`Error`] type, the
//! application [`config::Config`], and the injectable [`cache::Cache`]
//! abstraction used for probe results and processing statistics.

pub mod cache;
pub mod config;
pub mod error;
pub mod ids;

// Re-export the most commonly used items at the crate root.
pub use cache::{Cache, MemoryCache};
pub use error::{Error, Result};
pub use ids::VideoId;
