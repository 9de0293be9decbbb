//! Provider that chains other providers into one fallback sequence.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::debug;

use super::engine::{DataProvider, Provider, SourceProvider, SourceRequest};
use super::types::DataSource;

/// Labelled child providers whose sources are merged into one chain.
///
/// Source ids are namespaced as `{label}:{child source id}`, so two children
/// built from the same template do not collide.
pub struct CompositeSources<P, T> {
  children: Vec<(String, Arc<dyn Provider<P, T>>)>,
}

/// [`DataProvider`] over [`CompositeSources`].
pub type CompositeDataProvider<P, T> = DataProvider<P, T, CompositeSources<P, T>>;

impl<P, T> Default for CompositeSources<P, T> {
  fn default() -> Self {
    Self {
      children: Vec::new(),
    }
  }
}

impl<P, T> CompositeSources<P, T> {
  pub fn new() -> Self {
    Self::default()
  }

  /// Append a child. Registration order breaks priority ties.
  pub fn with(mut self, label: impl Into<String>, child: Arc<dyn Provider<P, T>>) -> Self {
    self.children.push((label.into(), child));
    self
  }

  /// Child that lists `source_id` once its label is stripped. Labels may
  /// themselves contain `:`, so a label prefix alone is not enough.
  fn owner(&self, source_id: &str) -> Option<&Arc<dyn Provider<P, T>>> {
    self
      .children
      .iter()
      .find(|(label, child)| {
        source_id
          .strip_prefix(label.as_str())
          .and_then(|rest| rest.strip_prefix(':'))
          .is_some_and(|id| child.sources_status().iter().any(|s| s.id == id))
      })
      .map(|(_, child)| child)
  }
}

impl<P, T> SourceProvider<P, T> for CompositeSources<P, T>
where
  P: Send + Sync,
  T: Send,
{
  fn list_sources(&self) -> Vec<DataSource> {
    let mut sources: Vec<DataSource> = self
      .children
      .iter()
      .flat_map(|(label, child)| {
        child.sources_status().into_iter().map(move |source| DataSource {
          id: format!("{}:{}", label, source.id),
          name: format!("{} / {}", label, source.name),
          ..source
        })
      })
      .collect();
    sources.sort_by_key(|s| s.priority);
    sources
  }

  fn fetch_from_source<'a>(
    &'a self,
    source: &'a DataSource,
    request: SourceRequest<'a, P>,
  ) -> BoxFuture<'a, Result<Option<T>>> {
    Box::pin(async move {
      let child = self
        .owner(&source.id)
        .ok_or_else(|| eyre!("No provider owns source {}", source.id))?;

      // The child's own cache hits count as plain successes here
      let result = child.fetch(request.params).await;
      if result.data.is_none() {
        debug!(source = %source.id, "Child provider had no data: {:?}", result.error);
      }
      Ok(result.data)
    })
  }
}
