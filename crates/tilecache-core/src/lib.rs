//! Map tile download and disk cache management.
//!
//! - [`download`]: policy-based admission of tile GETs with bounded
//!   concurrency, retries and redirect re-routing.
//! - [`storage`]: persistence of fetched tiles under the cache root.
//! - [`cache`]: background eviction keeping the cache under its quota.

pub mod cache;
pub mod config;
pub mod download;
pub mod http;
pub mod logging;
pub mod policy;
pub mod storage;
