//! Job-queue depth client for the queue-depth desired-count source.
//!
//! The core only reads pending depth; consuming and acking messages stays
//! with the runner agents. Queue administration is out of scope.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::QueueError;

/// Read-only view of the external job queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Number of pending job messages.
    async fn depth(&self) -> Result<u32, QueueError>;
}

/// HTTP client against a queue stats endpoint.
pub struct HttpQueue {
    client: reqwest::Client,
    stats_url: String,
}

impl HttpQueue {
    pub fn new(stats_url: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            stats_url: stats_url.to_string(),
        }
    }
}

#[async_trait]
impl JobQueue for HttpQueue {
    async fn depth(&self) -> Result<u32, QueueError> {
        let response = self.client.get(&self.stats_url).send().await?;

        if !response.status().is_success() {
            return Err(QueueError::Protocol(format!(
                "stats returned {}",
                response.status()
            )));
        }

        let stats: QueueStats = response.json().await?;
        Ok(stats.pending)
    }
}

#[derive(Debug, Deserialize)]
struct QueueStats {
    pending: u32,
}

/// Fixed-depth queue for tests.
pub struct MockQueue {
    depth: AtomicU32,
}

impl MockQueue {
    pub fn new(depth: u32) -> Self {
        Self {
            depth: AtomicU32::new(depth),
        }
    }

    pub fn set_depth(&self, depth: u32) {
        self.depth.store(depth, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobQueue for MockQueue {
    async fn depth(&self) -> Result<u32, QueueError> {
        Ok(self.depth.load(Ordering::SeqCst))
    }
}
