//! Planner pressure stream.
//!
//! The planner publishes demand over a long-lived HTTP streaming endpoint:
//! one newline-delimited JSON `PressureSample` per update. Blank lines are
//! keep-alives. The create loop holds one subscription at a time and
//! reconnects with backoff on any disconnect.

use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::warn;

use crate::config::Config;
use crate::error::StreamError;
use crate::fleet::PressureSample;

/// A live subscription yielding pressure samples until disconnect.
#[async_trait]
pub trait PressureSubscription: Send {
    /// Next sample; `None` when the peer closed the stream.
    async fn next_sample(&mut self) -> Option<Result<PressureSample, StreamError>>;
}

/// Connection factory for the planner's pressure endpoint.
#[async_trait]
pub trait PressureStream: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn PressureSubscription>, StreamError>;
}

/// HTTP NDJSON pressure stream.
pub struct HttpPressureStream {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpPressureStream {
    pub fn new(config: &Config, url: &str) -> Self {
        // No overall request timeout: the stream is long-lived by design.
        // Connect latency is still bounded.
        let client = reqwest::Client::builder()
            .connect_timeout(config.api_timeout)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            url: format!("{}?fleet={}", url.trim_end_matches('/'), config.fleet_name),
            token: config.planner_token.clone(),
        }
    }
}

#[async_trait]
impl PressureStream for HttpPressureStream {
    async fn connect(&self) -> Result<Box<dyn PressureSubscription>, StreamError> {
        let mut request = self.client.get(&self.url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StreamError::Connect(e.to_string()))?;

        if !response.status().is_success() {
            return Err(StreamError::Connect(format!(
                "planner returned {}",
                response.status()
            )));
        }

        Ok(Box::new(HttpSubscription {
            bytes: response.bytes_stream().boxed(),
            buffer: Vec::new(),
        }))
    }
}

struct HttpSubscription {
    bytes: futures_util::stream::BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    buffer: Vec<u8>,
}

#[async_trait]
impl PressureSubscription for HttpSubscription {
    async fn next_sample(&mut self) -> Option<Result<PressureSample, StreamError>> {
        loop {
            // Drain any complete line already buffered.
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim();

                // Blank keep-alive lines are ignored.
                if line.is_empty() {
                    continue;
                }

                match serde_json::from_str::<PressureSample>(line) {
                    Ok(sample) => return Some(Ok(sample)),
                    Err(e) => {
                        // Malformed line: skip rather than kill the stream.
                        warn!(error = %e, "Discarding malformed pressure sample");
                        continue;
                    }
                }
            }

            match self.bytes.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => return Some(Err(StreamError::Read(e.to_string()))),
                None => return None,
            }
        }
    }
}

/// Scripted pressure stream for tests, fed through a channel.
pub mod mock {
    use tokio::sync::mpsc;

    use super::*;

    pub struct MockPressureStream {
        subscriptions: std::sync::Mutex<Vec<MockSubscription>>,
    }

    pub struct MockSubscription {
        rx: mpsc::UnboundedReceiver<Result<PressureSample, StreamError>>,
    }

    impl MockPressureStream {
        /// Build a stream whose `connect()` hands out the queued
        /// subscriptions in order; once exhausted, connect fails.
        pub fn scripted(mut subscriptions: Vec<MockSubscription>) -> Self {
            subscriptions.reverse();
            Self {
                subscriptions: std::sync::Mutex::new(subscriptions),
            }
        }

        pub fn subscription() -> (
            mpsc::UnboundedSender<Result<PressureSample, StreamError>>,
            MockSubscription,
        ) {
            let (tx, rx) = mpsc::unbounded_channel();
            (tx, MockSubscription { rx })
        }
    }

    #[async_trait]
    impl PressureStream for MockPressureStream {
        async fn connect(&self) -> Result<Box<dyn PressureSubscription>, StreamError> {
            match self.subscriptions.lock().unwrap().pop() {
                Some(subscription) => Ok(Box::new(subscription)),
                None => Err(StreamError::Connect("no planner available".to_string())),
            }
        }
    }

    #[async_trait]
    impl PressureSubscription for MockSubscription {
        async fn next_sample(&mut self) -> Option<Result<PressureSample, StreamError>> {
            self.rx.recv().await
        }
    }
}
