//! Where asset bytes come from

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::FetchError;

/// Streams the bytes behind a locator into a sink
#[async_trait]
pub trait AssetSource: Send + Sync {
    /// Whether this source understands `locator`
    fn handles(&self, locator: &str) -> bool;

    /// Write every byte behind `locator` into `sink`, returning the count.
    ///
    /// On error the sink may hold a partial body; callers discard it.
    async fn fetch(
        &self,
        locator: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, FetchError>;
}

/// HTTP(S) downloads through reqwest
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpSource {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("newhelm/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Network {
                locator: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { client, timeout })
    }

    fn classify(&self, locator: &str, error: reqwest::Error) -> FetchError {
        if error.is_timeout() {
            FetchError::Timeout {
                locator: locator.to_string(),
                after: self.timeout,
            }
        } else {
            FetchError::Network {
                locator: locator.to_string(),
                message: error.to_string(),
            }
        }
    }
}

#[async_trait]
impl AssetSource for HttpSource {
    fn handles(&self, locator: &str) -> bool {
        locator.starts_with("http://") || locator.starts_with("https://")
    }

    async fn fetch(
        &self,
        locator: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, FetchError> {
        let response = self
            .client
            .get(locator)
            .send()
            .await
            .map_err(|e| self.classify(locator, e))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound {
                locator: locator.to_string(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                locator: locator.to_string(),
                status: status.as_u16(),
            });
        }

        let mut written = 0u64;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| self.classify(locator, e))?;
            sink.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        sink.flush().await?;

        tracing::debug!(locator, bytes = written, "downloaded asset");
        Ok(written)
    }
}

/// Files already on disk, addressed as `file://<path>` or a plain path
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSource;

impl LocalFileSource {
    fn path_of(locator: &str) -> &str {
        locator.strip_prefix("file://").unwrap_or(locator)
    }
}

#[async_trait]
impl AssetSource for LocalFileSource {
    fn handles(&self, locator: &str) -> bool {
        locator.starts_with("file://") || !locator.contains("://")
    }

    async fn fetch(
        &self,
        locator: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, FetchError> {
        let path = Self::path_of(locator);
        let mut file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FetchError::NotFound {
                    locator: locator.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let written = tokio::io::copy(&mut file, sink).await?;
        sink.flush().await?;
        Ok(written)
    }
}

/// Dispatches each locator to the first source that handles it
#[derive(Clone, Default)]
pub struct SourceRouter {
    sources: Vec<Arc<dyn AssetSource>>,
}

impl std::fmt::Debug for SourceRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRouter")
            .field("sources", &self.sources.len())
            .finish()
    }
}

impl SourceRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// HTTP(S) plus local files
    pub fn with_defaults(download_timeout: Duration) -> Result<Self, FetchError> {
        Ok(Self::new()
            .with_source(Arc::new(HttpSource::new(download_timeout)?))
            .with_source(Arc::new(LocalFileSource)))
    }

    pub fn with_source(mut self, source: Arc<dyn AssetSource>) -> Self {
        self.sources.push(source);
        self
    }

    fn route(&self, locator: &str) -> Option<&Arc<dyn AssetSource>> {
        self.sources.iter().find(|s| s.handles(locator))
    }
}

#[async_trait]
impl AssetSource for SourceRouter {
    fn handles(&self, locator: &str) -> bool {
        self.route(locator).is_some()
    }

    async fn fetch(
        &self,
        locator: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, FetchError> {
        match self.route(locator) {
            Some(source) => source.fetch(locator, sink).await,
            None => Err(FetchError::UnsupportedLocator(locator.to_string())),
        }
    }
}
