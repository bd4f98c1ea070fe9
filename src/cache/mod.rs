//! Cache module for memoizing upstream forecasts in memory
//!
//! This module provides a TTL cache keyed by place path. Concurrent requests
//! for a key that is not cached share a single upstream fetch, and failed
//! fetches are never stored so the next request retries immediately.

mod manager;

pub use manager::{ForecastCache, Lookup, DEFAULT_TTL};
