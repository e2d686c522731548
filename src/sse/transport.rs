// Byte-stream transport under the SSE client

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use log::debug;
use std::time::Duration;
use url::Url;

use crate::error::{ChatError, Result};

pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;

/// Opens one event-stream connection. A returned stream ending (or yielding
/// an error) means the connection is closed.
#[async_trait]
pub trait SseTransport: Send + Sync {
    async fn open(&self, url: &Url) -> Result<ByteStream>;
}

/// Streams the response body of a long-lived GET
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        // No overall timeout: the body is expected to stay open indefinitely
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ChatError::Network(format!("HTTP client: {}", e)))?;
        Ok(HttpTransport { client })
    }
}

#[async_trait]
impl SseTransport for HttpTransport {
    async fn open(&self, url: &Url) -> Result<ByteStream> {
        debug!("Opening event stream at {}{}", url.origin().ascii_serialization(), url.path());
        let resp = self
            .client
            .get(url.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| ChatError::Connection(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ChatError::Connection(format!("event stream rejected with HTTP {}", status)));
        }

        Ok(resp
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| ChatError::Connection(e.to_string()))
            })
            .boxed())
    }
}
