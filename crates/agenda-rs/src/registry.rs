//! Maps a job name to its handler and concurrency limits (§4.6).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;

use crate::job::Job;

/// What a handler returns on success; an error is reported through
/// `AgendaError::Handler` and never propagated to the orchestrator caller
/// (§4.8 step 7).
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// The facade passed to a running handler, exposing the `touch`/`data`
/// surface described in §4.8 step 5 without exposing repository internals.
pub struct JobHandle<'a> {
    job: &'a Job,
    touch: Box<dyn Fn(Option<u8>) + Send + Sync + 'a>,
}

impl<'a> JobHandle<'a> {
    pub fn new(job: &'a Job, touch: impl Fn(Option<u8>) + Send + Sync + 'a) -> Self {
        Self {
            job,
            touch: Box::new(touch),
        }
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.job.data
    }

    pub fn attrs(&self) -> &Job {
        self.job
    }

    /// Refreshes the lock and optionally records progress, exactly as a
    /// long-running handler is expected to call periodically (§5,
    /// "Cancellation & timeouts").
    pub fn touch(&self, progress: Option<u8>) {
        (self.touch)(progress);
    }
}

/// A handler taking the `Job` facade and returning its outcome.
///
/// Two ergonomic registration paths exist (`Registry::define` for a plain
/// async closure, `Registry::define_with` for anything implementing
/// [`JobHandler`]) but both funnel into this same boxed representation —
/// Rust has no arity-based dispatch to preserve from the source's
/// synchronous-vs-callback handler split (§9).
pub type BoxedHandler =
    Arc<dyn for<'a> Fn(JobHandle<'a>) -> BoxFuture<'a, Result<Option<serde_json::Value>, HandlerError>> + Send + Sync>;

/// Implementable alternative to a bare closure, for handlers that want a
/// named type (e.g. to hold injected dependencies).
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: JobHandle<'_>) -> Result<Option<serde_json::Value>, HandlerError>;
}

/// Per-name limits supplied to `define` (§4.6, §6).
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub concurrency: u32,
    pub lock_limit: u32,
    pub lock_lifetime: chrono::Duration,
    pub priority: crate::job::Priority,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            lock_limit: 0,
            lock_lifetime: chrono::Duration::milliseconds(600_000),
            priority: crate::job::Priority::NORMAL,
        }
    }
}

struct Definition {
    handler: BoxedHandler,
    options: JobOptions,
    running: AtomicU32,
    locked: AtomicU32,
}

/// In-memory map of job name to handler and limits, owned by a single
/// orchestrator instance.
#[derive(Default)]
pub struct Registry {
    definitions: RwLock<HashMap<String, Arc<Definition>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the handler for `name` — re-define is
    /// idempotent by name, per §4.9.
    pub fn define(
        &self,
        name: impl Into<String>,
        options: JobOptions,
        handler: BoxedHandler,
    ) {
        let definition = Arc::new(Definition {
            handler,
            options,
            running: AtomicU32::new(0),
            locked: AtomicU32::new(0),
        });
        self.definitions.write().insert(name.into(), definition);
    }

    /// Registers a [`JobHandler`] implementor under `name`.
    pub fn define_with<H: JobHandler>(&self, name: impl Into<String>, options: JobOptions, handler: H) {
        let handler = Arc::new(handler);
        let boxed: BoxedHandler = Arc::new(move |job_handle| {
            let handler = Arc::clone(&handler);
            Box::pin(async move { handler.handle(job_handle).await })
        });
        self.define(name, options, boxed);
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.definitions.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.definitions.read().keys().cloned().collect()
    }

    pub fn options(&self, name: &str) -> Option<JobOptions> {
        self.definitions.read().get(name).map(|d| d.options.clone())
    }

    pub fn handler(&self, name: &str) -> Option<BoxedHandler> {
        self.definitions.read().get(name).map(|d| Arc::clone(&d.handler))
    }

    pub fn running(&self, name: &str) -> u32 {
        self.definitions
            .read()
            .get(name)
            .map(|d| d.running.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn locked(&self, name: &str) -> u32 {
        self.definitions
            .read()
            .get(name)
            .map(|d| d.locked.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn incr_running(&self, name: &str) {
        if let Some(d) = self.definitions.read().get(name) {
            d.running.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn decr_running(&self, name: &str) {
        if let Some(d) = self.definitions.read().get(name) {
            d.running.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1))).ok();
        }
    }

    pub fn incr_locked(&self, name: &str) {
        if let Some(d) = self.definitions.read().get(name) {
            d.locked.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn decr_locked(&self, name: &str) {
        if let Some(d) = self.definitions.read().get(name) {
            d.locked.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1))).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redefining_a_name_replaces_its_handler() {
        let registry = Registry::new();
        registry.define(
            "ping",
            JobOptions::default(),
            Arc::new(|_h| Box::pin(async { Ok(None) })),
        );
        assert!(registry.is_defined("ping"));
        assert_eq!(registry.names(), vec!["ping".to_string()]);

        registry.define(
            "ping",
            JobOptions {
                concurrency: 9,
                ..JobOptions::default()
            },
            Arc::new(|_h| Box::pin(async { Ok(None) })),
        );
        assert_eq!(registry.options("ping").unwrap().concurrency, 9);
    }

    #[test]
    fn running_and_locked_counters_track_increments() {
        let registry = Registry::new();
        registry.define("ping", JobOptions::default(), Arc::new(|_h| Box::pin(async { Ok(None) })));
        registry.incr_running("ping");
        registry.incr_running("ping");
        registry.decr_running("ping");
        assert_eq!(registry.running("ping"), 1);

        registry.incr_locked("ping");
        assert_eq!(registry.locked("ping"), 1);
        registry.decr_locked("ping");
        assert_eq!(registry.locked("ping"), 0);
    }
}
