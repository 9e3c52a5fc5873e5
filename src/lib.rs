//! Corpus query front end built around a slow-tracking query cache.

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod query;
pub mod slow;

pub use client::QueryClient;
pub use error::SlowQueryError;
