//! Desired-count sources.
//!
//! Exactly one source is active per deployment, selected once at startup
//! from configuration: a queue connection selects queue-depth, a planner
//! URL selects the pressure stream, and absence of both falls back to the
//! static value.

use std::sync::Arc;

use crate::error::ReconcileError;
use crate::queue::JobQueue;

/// The active desired-count strategy.
pub enum DesiredSource {
    /// Fixed configured value.
    Static(u32),

    /// Mirror the pending depth of an external job queue.
    QueueDepth(Arc<dyn JobQueue>),

    /// Pushed by the planner's pressure stream; no synchronous read.
    Planner,
}

impl DesiredSource {
    /// Read the current target, clamped to the fleet maximum.
    ///
    /// Fails for the planner source, which is push-based and never pulled
    /// from the reconcile hot path.
    pub async fn get(&self, max_runners: u32) -> Result<u32, ReconcileError> {
        match self {
            Self::Static(n) => Ok(fleet_scaling::clamp_desired(i64::from(*n), max_runners)),
            Self::QueueDepth(queue) => {
                let depth = queue.depth().await?;
                Ok(fleet_scaling::clamp_desired(i64::from(depth), max_runners))
            }
            Self::Planner => Err(ReconcileError::PushOnlySource),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Static(_) => "static",
            Self::QueueDepth(_) => "queue-depth",
            Self::Planner => "planner",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MockQueue;

    #[tokio::test]
    async fn test_static_source_clamped() {
        let source = DesiredSource::Static(40);
        assert_eq!(source.get(16).await.unwrap(), 16);

        let source = DesiredSource::Static(4);
        assert_eq!(source.get(16).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_queue_source_mirrors_depth() {
        let queue = Arc::new(MockQueue::new(5));
        let source = DesiredSource::QueueDepth(queue.clone());
        assert_eq!(source.get(16).await.unwrap(), 5);

        queue.set_depth(100);
        assert_eq!(source.get(16).await.unwrap(), 16);
    }

    #[tokio::test]
    async fn test_planner_source_has_no_pull() {
        let source = DesiredSource::Planner;
        assert!(matches!(
            source.get(16).await,
            Err(ReconcileError::PushOnlySource)
        ));
    }
}
