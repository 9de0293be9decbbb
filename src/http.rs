//! HTTP implementations of the fetcher and sync-handler seams.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::HttpSettings;
use crate::offline::{SyncHandler, SyncQueueItem};
use crate::provider::{fetcher, Fetcher};

/// JSON-over-HTTP client
#[derive(Clone)]
pub struct HttpClient {
  client: reqwest::Client,
}

impl HttpClient {
  pub fn new(settings: &HttpSettings) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(settings.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }

  /// GET a JSON document, with object params sent as the query string.
  ///
  /// 404 and 204 mean "no data" and yield `None`.
  pub async fn get_json(&self, url: &Url, params: Option<&Value>) -> Result<Option<Value>> {
    let mut request = self.client.get(url.clone());
    if let Some(params) = params {
      request = request.query(&query_pairs(params)?);
    }

    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", url, e))?;

    let status = response.status();
    if status == StatusCode::NOT_FOUND || status == StatusCode::NO_CONTENT {
      debug!(url = %url, status = %status, "No data");
      return Ok(None);
    }
    if !status.is_success() {
      return Err(eyre!("{} responded with {}", url, status));
    }

    let body = response
      .text()
      .await
      .map_err(|e| eyre!("Failed to read response from {}: {}", url, e))?;

    let value = serde_json::from_str(&body)
      .map_err(|e| eyre!("Invalid JSON from {}: {}", url, e))?;
    Ok(Some(value))
  }

  /// POST a JSON body, failing on any non-success status.
  pub async fn post_json(&self, url: &Url, body: &Value) -> Result<()> {
    let response = self
      .client
      .post(url.clone())
      .header(CONTENT_TYPE, "application/json")
      .body(body.to_string())
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", url, e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(eyre!("{} responded with {}", url, status));
    }
    Ok(())
  }

  /// A [`Fetcher`] that GETs `url`.
  pub fn endpoint_fetcher(&self, url: &str) -> Result<Fetcher<Value, Value>> {
    let url = parse_url(url)?;
    let client = self.clone();

    Ok(fetcher(move |params: Option<Value>| {
      let client = client.clone();
      let url = url.clone();
      async move { client.get_json(&url, params.as_ref()).await }
    }))
  }
}

pub fn parse_url(raw: &str) -> Result<Url> {
  Url::parse(raw).map_err(|e| eyre!("Invalid URL '{}': {}", raw, e))
}

/// Flatten a JSON object into query pairs. Strings go as-is, other scalars
/// in their JSON form.
fn query_pairs(params: &Value) -> Result<Vec<(String, String)>> {
  let Value::Object(map) = params else {
    return Err(eyre!("Query params must be a JSON object, got {}", params));
  };

  Ok(
    map
      .iter()
      .filter(|(_, v)| !v.is_null())
      .map(|(k, v)| {
        let v = match v {
          Value::String(s) => s.clone(),
          other => other.to_string(),
        };
        (k.clone(), v)
      })
      .collect(),
  )
}

/// Replays queued writes by POSTing them to one URL.
pub struct HttpSyncHandler {
  client: HttpClient,
  url: Url,
}

impl HttpSyncHandler {
  pub fn new(client: HttpClient, url: &str) -> Result<Self> {
    Ok(Self {
      client,
      url: parse_url(url)?,
    })
  }
}

impl SyncHandler for HttpSyncHandler {
  fn sync<'a>(&'a self, item: &'a SyncQueueItem) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
      let body = serde_json::to_value(item).map_err(|e| eyre!("Failed to serialize write: {}", e))?;
      self.client.post_json(&self.url, &body).await
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_query_pairs() {
    let pairs = query_pairs(&json!({"q": "rust", "page": 2, "draft": null})).unwrap();
    assert_eq!(
      pairs,
      vec![
        ("page".to_string(), "2".to_string()),
        ("q".to_string(), "rust".to_string()),
      ]
    );
  }

  #[test]
  fn test_query_pairs_rejects_non_objects() {
    assert!(query_pairs(&json!([1, 2])).is_err());
  }

  #[test]
  fn test_parse_url() {
    assert!(parse_url("https://api.example.com/papers").is_ok());
    assert!(parse_url("not a url").is_err());
  }

  #[tokio::test]
  async fn test_unreachable_endpoint_is_an_error() {
    let client = HttpClient::new(&HttpSettings { timeout_secs: 2 }).unwrap();
    let fetch = client.endpoint_fetcher("http://127.0.0.1:9/papers").unwrap();

    assert!(fetch(None).await.is_err());
  }
}
