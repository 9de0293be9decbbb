//! Multi-source data providers.
//!
//! A provider walks its sources in priority order, caches the first success,
//! falls back to that cache when every source fails, and otherwise degrades
//! to an empty result. Callers never see an error from `get`.
//!
//! - [`DataProvider`] is the engine, generic over a [`SourceProvider`]
//! - [`ApiSources`] wires a remote fetcher with a local-storage fallback
//! - [`CompositeSources`] chains several providers together

mod api;
mod composite;
mod engine;
mod types;

pub use api::{
  fetcher, local_key, ApiDataProvider, ApiSources, Fetcher, FALLBACK_API, LOCAL_STORAGE,
  PRIMARY_API,
};
pub use composite::{CompositeDataProvider, CompositeSources};
pub use engine::{DataProvider, Provider, SourceProvider, SourceRequest};
pub use types::{DataSource, FetchResult, ProviderConfig, ReenablePolicy, SourceKind};
