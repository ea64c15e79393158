//! Remote artifact sources
//!
//! The lifecycle manager pulls bytes through the [`ArtifactSource`] seam so the
//! transfer logic is independent of the transport.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use common::error::{Error, Result};
use config::DownloadConfig;

/// Stream of body chunks
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// An opened remote artifact
pub struct ArtifactResponse {
    /// Length announced by the server, if any
    pub content_length: Option<u64>,

    /// Body chunks
    pub body: ByteStream,
}

/// Something that can hand out artifact bodies by URL
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Opens `url` for streaming
    async fn open(&self, url: &str) -> Result<ArtifactResponse>;
}

/// HTTP(S) artifact source backed by `reqwest`
pub struct HttpArtifactSource {
    /// HTTP client
    client: Client,
}

impl HttpArtifactSource {
    /// Creates a new HTTP source
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        // No overall timeout: weight files take minutes on slow links
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| Error::Download(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl ArtifactSource for HttpArtifactSource {
    async fn open(&self, url: &str) -> Result<ArtifactResponse> {
        debug!("Requesting {}", url);

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Download(format!("request to {} failed: {}", url, e)))?;

        if !resp.status().is_success() {
            return Err(Error::Download(format!("HTTP {} for {}", resp.status(), url)));
        }

        let content_length = resp.content_length();
        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Error::Download(format!("transfer interrupted: {}", e))))
            .boxed();

        Ok(ArtifactResponse {
            content_length,
            body,
        })
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod memory {
    //! In-memory source for transfer tests

    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Serves fixed bodies in fixed-size chunks
    #[derive(Default)]
    pub struct MemoryArtifactSource {
        pub bodies: HashMap<String, Vec<u8>>,
        pub chunk_size: usize,
        pub chunk_delay: Duration,
        /// Inject a transfer error once this many bytes of a body were sent
        pub fail_after: Option<usize>,
        pub opened: Arc<AtomicUsize>,
    }

    impl MemoryArtifactSource {
        pub fn new(chunk_size: usize) -> Self {
            Self {
                chunk_size,
                ..Default::default()
            }
        }

        pub fn with_body(mut self, url: &str, body: Vec<u8>) -> Self {
            self.bodies.insert(url.to_string(), body);
            self
        }

        pub fn open_count(&self) -> usize {
            self.opened.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ArtifactSource for MemoryArtifactSource {
        async fn open(&self, url: &str) -> Result<ArtifactResponse> {
            self.opened.fetch_add(1, Ordering::SeqCst);

            let body = self
                .bodies
                .get(url)
                .cloned()
                .ok_or_else(|| Error::Download(format!("HTTP 404 Not Found for {}", url)))?;

            let content_length = Some(body.len() as u64);
            let chunk_size = self.chunk_size.max(1);
            let delay = self.chunk_delay;
            let fail_after = self.fail_after;

            let chunks: Vec<Bytes> = body.chunks(chunk_size).map(Bytes::copy_from_slice).collect();
            let body = futures::stream::iter(chunks.into_iter().enumerate())
                .then(move |(index, chunk)| async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    match fail_after {
                        Some(limit) if index * chunk_size >= limit => {
                            Err(Error::Download("connection reset by peer".to_string()))
                        }
                        _ => Ok(chunk),
                    }
                })
                .boxed();

            Ok(ArtifactResponse {
                content_length,
                body,
            })
        }
    }
}
