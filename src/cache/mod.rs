//! In-memory response caching with request de-duplication.
//!
//! This module provides a backend-agnostic fetch service that:
//! - Serves payloads younger than the freshness window without a request
//! - Collapses concurrent identical requests into one
//! - Aborts a request once nobody is waiting for it
//! - Sweeps entries past the retention window and bounds the table size

mod inflight;
mod service;
mod signature;
mod store;
mod traits;

pub use service::FetchService;
pub use store::CachePolicy;
pub use traits::{CacheResult, CacheSource, Fetcher};
