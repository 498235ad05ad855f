//! # Transport
//!
//! The seam between the cache engine and the network. The engine consumes a
//! [`Transport`]: fetch a URL into a destination file, report the observed
//! content type, support cancellation. [`HttpTransport`] is the reqwest
//! implementation used by default; tests substitute their own.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderValue};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::CacheConfig;
use crate::error::CacheError;

/// Extensions recognized from the Content-Type header. Anything else maps
/// to the default.
const KNOWN_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "gif", "webp", "psd"];

/// Extension used when the content type is missing or unrecognized.
const DEFAULT_EXTENSION: &str = "png";

/// Outcome of a successful transport fetch
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// Content-Type header of the response, if present.
    pub content_type: Option<String>,
}

impl FetchResponse {
    /// Map the observed content type to a file extension. Best-effort sniff
    /// against a fixed allow-list; parameters after `;` are ignored and
    /// matching is case-insensitive. Falls back to `png`.
    pub fn extension(&self) -> &'static str {
        let Some(content_type) = &self.content_type else {
            return DEFAULT_EXTENSION;
        };
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let Some(subtype) = essence.strip_prefix("image/") else {
            return DEFAULT_EXTENSION;
        };
        KNOWN_EXTENSIONS
            .iter()
            .find(|ext| **ext == subtype)
            .copied()
            .unwrap_or(DEFAULT_EXTENSION)
    }
}

/// A transport capable of fetching a remote resource into a local file
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch `url` and write the response body to `dest`. The fetch must
    /// stop promptly when `cancel` is triggered.
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        cancel: CancellationToken,
    ) -> Result<FetchResponse, CacheError>;
}

/// Create a reqwest Client with the provided configuration
pub fn create_client(config: &CacheConfig) -> Result<Client, CacheError> {
    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(5) // Allow multiple connections to same host
        .user_agent(&config.user_agent)
        .default_headers(default_headers())
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.timeout.is_zero() {
        client_builder = client_builder.timeout(config.timeout);
    }

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    client_builder.build().map_err(CacheError::from)
}

fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        reqwest::header::ACCEPT_ENCODING,
        HeaderValue::from_static("gzip, deflate"),
    );
    headers.insert(
        reqwest::header::CONNECTION,
        HeaderValue::from_static("keep-alive"),
    );
    headers.insert(
        reqwest::header::ACCEPT,
        HeaderValue::from_static("image/avif,image/webp,image/png,image/*;q=0.8,*/*;q=0.5"),
    );
    headers
}

/// HTTP transport backed by reqwest, streaming bodies straight to disk
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &CacheConfig) -> Result<Self, CacheError> {
        Ok(Self {
            client: create_client(config)?,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        cancel: CancellationToken,
    ) -> Result<FetchResponse, CacheError> {
        let response = tokio::select! {
            result = self.client.get(url).send() => result?,
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
        };

        if !response.status().is_success() {
            return Err(CacheError::StatusCode(response.status()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let mut file = fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();

        loop {
            let chunk: Option<Result<Bytes, reqwest::Error>> = tokio::select! {
                chunk = stream.next() => chunk,
                _ = cancel.cancelled() => {
                    drop(file);
                    let _ = fs::remove_file(dest).await;
                    return Err(CacheError::Cancelled);
                }
            };
            match chunk {
                Some(Ok(bytes)) => file.write_all(&bytes).await?,
                Some(Err(e)) => {
                    drop(file);
                    let _ = fs::remove_file(dest).await;
                    return Err(CacheError::from(e));
                }
                None => break,
            }
        }

        file.flush().await?;
        debug!(url = %url, path = ?dest, "Fetched resource to temp file");

        Ok(FetchResponse { content_type })
    }
}
