//! Dispatch of type-tagged jobs.
//!
//! Jobs travel as JSON envelopes `{"type": "...", "payload": ...}`. A [`JobRouter`] maps
//! job types to handlers and turns into a regular [`Handler`] for a consumer.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, warn};

use crate::delivery::Delivery;
use crate::error::Error;
use crate::message::Job;
use crate::middleware::Handler;
use crate::Result;

/// Handler of one job type, receives the decoded envelope and its delivery.
pub type JobHandler = Arc<dyn Fn(Job, Delivery) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Build a [`JobHandler`] from an async closure.
pub fn job_handler_fn<F, Fut>(f: F) -> JobHandler
where
    F: Fn(Job, Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |job, delivery| f(job, delivery).boxed())
}

#[derive(Clone, Default)]
pub struct JobRouter {
    handlers: HashMap<String, JobHandler>,
}

impl JobRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler of a job type, replacing any previous one.
    pub fn route(mut self, kind: &str, handler: JobHandler) -> Self {
        self.insert(kind, handler);
        self
    }

    pub fn insert(&mut self, kind: &str, handler: JobHandler) {
        self.handlers.insert(kind.to_owned(), handler);
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Decode the envelope and run the handler of its type.
    ///
    /// A body that is no job envelope is rejected without requeue. Jobs of an unknown
    /// type succeed without running anything.
    pub async fn dispatch(&self, delivery: Delivery) -> Result<()> {
        let job: Job = match delivery.json() {
            Ok(job) => job,
            Err(err) => {
                warn!(
                    "failed to decode job {} from queue '{}', cause: {}.",
                    delivery.delivery_tag(),
                    delivery.queue(),
                    err
                );
                if !delivery.is_settled() {
                    delivery.nack(false).await?;
                }
                return Err(Error::InvalidMessage(format!("not a job envelope: {}", err)));
            }
        };
        match self.handlers.get(&job.kind) {
            Some(handler) => handler(job, delivery).await,
            None => {
                debug!("no handler found for job type '{}'", job.kind);
                Ok(())
            }
        }
    }

    /// Consumer handler dispatching through this router.
    pub fn into_handler(self) -> Handler {
        let router = Arc::new(self);
        Arc::new(move |delivery| {
            let router = router.clone();
            async move { router.dispatch(delivery).await }.boxed()
        })
    }
}
