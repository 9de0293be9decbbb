//! Resilient data access: multi-source fetching with priority fallback, TTL
//! caching and graceful degradation, plus an offline write queue that is
//! replayed in order when connectivity returns.

pub mod cache;
pub mod config;
pub mod http;
pub mod logging;
pub mod offline;
pub mod provider;
