//! Client for the air-quality sensor backend.

mod cached_client;
mod client;
pub mod endpoints;
mod error;
mod params;
pub mod types;

pub use cached_client::CachedClient;
pub use client::ApiClient;
pub use error::FetchError;
pub use params::Params;
