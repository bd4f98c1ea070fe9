//! Polman library
//!
//! Fetches yr.no forecast documents, caches them in memory and serves them
//! over HTTP. Exposed as a library so the binary and integration tests share
//! one implementation.

pub mod cache;
pub mod cli;
pub mod data;
pub mod server;
pub mod sweep;
