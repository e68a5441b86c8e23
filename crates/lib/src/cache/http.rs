//! HTTP cache backend.
//!
//! Entries map to `<base>/<prefix>/<path>/<key>` on a plain HTTP object
//! server: `GET` reads, `PUT` writes, `HEAD` checks, `DELETE` removes. Bodies
//! are streamed in both directions.

use async_trait::async_trait;
use futures_util::TryStreamExt;
use reqwest::{Client, StatusCode};
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::backend::{BoxReader, CacheBackend, validate_location};
use super::types::CacheError;

#[derive(Debug, Clone)]
pub struct HttpBackend {
  client: Client,
  base_url: String,
  prefix: String,
}

impl HttpBackend {
  pub fn new(base_url: &str, prefix: impl Into<String>) -> Result<Self, CacheError> {
    let client = Client::builder()
      .user_agent(concat!("grog/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| CacheError::Http {
        method: "INIT",
        url: base_url.to_string(),
        message: e.to_string(),
      })?;

    Ok(Self {
      client,
      base_url: base_url.trim_end_matches('/').to_string(),
      prefix: prefix.into(),
    })
  }

  pub fn url(&self, path: &str, key: &str) -> Result<String, CacheError> {
    validate_location(path, key)?;
    let mut url = format!("{}/{}", self.base_url, self.prefix);
    if !path.is_empty() {
      url.push('/');
      url.push_str(path);
    }
    url.push('/');
    url.push_str(key);
    Ok(url)
  }

  async fn send(
    &self,
    ctx: &CancellationToken,
    method: &'static str,
    url: &str,
    request: reqwest::RequestBuilder,
  ) -> Result<reqwest::Response, CacheError> {
    tokio::select! {
      biased;
      _ = ctx.cancelled() => Err(CacheError::Cancelled),
      response = request.send() => response.map_err(|e| CacheError::Http {
        method,
        url: url.to_string(),
        message: e.to_string(),
      }),
    }
  }
}

fn status_error(method: &'static str, url: &str, status: StatusCode) -> CacheError {
  CacheError::Http {
    method,
    url: url.to_string(),
    message: format!("unexpected status {status}"),
  }
}

#[async_trait]
impl CacheBackend for HttpBackend {
  async fn get(&self, ctx: &CancellationToken, path: &str, key: &str) -> Result<BoxReader, CacheError> {
    let url = self.url(path, key)?;
    let response = self.send(ctx, "GET", &url, self.client.get(&url)).await?;

    match response.status() {
      StatusCode::NOT_FOUND => Err(CacheError::NotFound {
        path: path.to_string(),
        key: key.to_string(),
      }),
      status if status.is_success() => {
        let stream = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::new(StreamReader::new(Box::pin(stream))))
      }
      status => Err(status_error("GET", &url, status)),
    }
  }

  async fn set(&self, ctx: &CancellationToken, path: &str, key: &str, reader: BoxReader) -> Result<(), CacheError> {
    let url = self.url(path, key)?;
    let body = reqwest::Body::wrap_stream(ReaderStream::new(reader));
    let response = self.send(ctx, "PUT", &url, self.client.put(&url).body(body)).await?;

    let status = response.status();
    if !status.is_success() {
      return Err(status_error("PUT", &url, status));
    }
    debug!(url = %url, "uploaded cache entry");
    Ok(())
  }

  async fn delete(&self, ctx: &CancellationToken, path: &str, key: &str) -> Result<(), CacheError> {
    let url = self.url(path, key)?;
    let response = self.send(ctx, "DELETE", &url, self.client.delete(&url)).await?;

    match response.status() {
      StatusCode::NOT_FOUND => Ok(()),
      status if status.is_success() => Ok(()),
      status => Err(status_error("DELETE", &url, status)),
    }
  }

  async fn exists(&self, ctx: &CancellationToken, path: &str, key: &str) -> Result<bool, CacheError> {
    let url = self.url(path, key)?;
    let response = self.send(ctx, "HEAD", &url, self.client.head(&url)).await?;

    match response.status() {
      StatusCode::NOT_FOUND => Ok(false),
      status if status.is_success() => Ok(true),
      status => Err(status_error("HEAD", &url, status)),
    }
  }

  fn name(&self) -> &'static str {
    "http"
  }
}
