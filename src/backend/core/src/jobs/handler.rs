//! Handler trait and the immutable registry the worker pool dispatches through.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::{JobContext, JobResult};

/// A handler for one job type.
///
/// Return [`JobError::Permanent`](super::JobError::Permanent) for failures a
/// retry can never fix and [`JobError::Transient`](super::JobError::Transient)
/// for failures worth retrying.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The dispatch key this handler serves.
    fn job_type(&self) -> &'static str;

    /// Execute one attempt of the job.
    async fn handle(&self, ctx: &JobContext, payload: &[u8]) -> JobResult;
}

/// Collects handlers before the pool starts.
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
}

impl HandlerRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. A second handler for the same type replaces the first.
    pub fn register(mut self, handler: Arc<dyn JobHandler>) -> Self {
        let job_type = handler.job_type();
        if self.handlers.insert(job_type, handler).is_some() {
            tracing::warn!(job_type, "Handler registered twice, replacing previous handler");
        }
        self
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: self.handlers,
        }
    }
}

/// Immutable map from job type to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::new()
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn job_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
