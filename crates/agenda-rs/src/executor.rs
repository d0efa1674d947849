//! `jobProcessing` / `runOrRetry` (§4.8): dispatches concurrency-free jobs
//! off the [`PriorityJobQueue`], invokes the registered handler, and
//! persists the resulting lifecycle transition.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, instrument, warn};

use crate::clock::Clock;
use crate::error::AgendaError;
use crate::events::{AgendaEvent, Observer};
use crate::job::Job;
use crate::metrics::AgendaMetrics;
use crate::queue::PriorityJobQueue;
use crate::recurrence::compute_next_run_at;
use crate::registry::{JobHandle, Registry};
use crate::repository::JobRepository;

pub struct Executor {
    registry: Arc<Registry>,
    queue: Arc<PriorityJobQueue>,
    repository: Arc<dyn JobRepository>,
    observer: Observer,
    clock: Arc<dyn Clock>,
    max_concurrency: u32,
    kick: Notify,
}

impl Executor {
    pub fn new(
        registry: Arc<Registry>,
        queue: Arc<PriorityJobQueue>,
        repository: Arc<dyn JobRepository>,
        observer: Observer,
        clock: Arc<dyn Clock>,
        max_concurrency: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            queue,
            repository,
            observer,
            clock,
            max_concurrency,
            kick: Notify::new(),
        })
    }

    /// Wakes the executor loop — called by the [`Scheduler`](crate::scheduler::Scheduler)
    /// whenever a new job lands in the queue.
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    /// Drives `jobProcessing` until `shutdown` fires. One instance per
    /// [`crate::orchestrator::Agenda`].
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        loop {
            let wait = self.drain_ready().await;
            let sleep = match wait {
                Some(d) => tokio::time::sleep(d),
                None => tokio::time::sleep(Duration::from_secs(3600)),
            };
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("executor loop shutting down");
                    return;
                }
                _ = self.kick.notified() => {}
                _ = sleep => {}
            }
        }
    }

    /// Dispatches every currently-eligible job. Returns how long to wait
    /// before the next wake-up (the head's `nextRunAt`, or a short retry
    /// delay if the queue is non-empty but saturated), or `None` if the
    /// queue is empty.
    async fn drain_ready(self: &Arc<Self>) -> Option<Duration> {
        AgendaMetrics::queue_depth(self.queue.len());
        loop {
            let head_at = self.queue.peek_next_run_at()?;
            let now = self.clock.now();
            if head_at > now {
                return Some((head_at - now).to_std().unwrap_or(Duration::ZERO));
            }

            let Some(job) = self.queue.return_next_concurrency_free_job(&self.registry, self.max_concurrency) else {
                // Queue is non-empty but every eligible name is saturated;
                // back off briefly rather than busy-looping.
                return Some(Duration::from_millis(100));
            };

            if let Some(next_run_at) = job.next_run_at {
                if next_run_at > now {
                    let wait = (next_run_at - now).to_std().unwrap_or(Duration::ZERO);
                    self.queue.insert(job);
                    return Some(wait);
                }
            }

            // Reserve the slot synchronously: `registry.running` must already
            // reflect this job before the loop re-evaluates
            // `return_next_concurrency_free_job`, or a burst of same-name due
            // jobs would all see stale headroom and blow past the
            // concurrency cap before any of their spawned `dispatch` calls
            // get a chance to run.
            self.registry.incr_running(&job.name);
            AgendaMetrics::running_jobs(self.total_running());

            let executor = Arc::clone(self);
            tokio::spawn(async move { executor.dispatch(job).await });
        }
    }

    #[instrument(skip(self, job), fields(job.id = ?job.id, job.name = %job.name))]
    async fn dispatch(self: Arc<Self>, mut job: Job) {
        let lock_lifetime = self
            .registry
            .options(&job.name)
            .map(|o| o.lock_lifetime)
            .unwrap_or_else(|| chrono::Duration::milliseconds(600_000));
        let lock_deadline = self.clock.now() - lock_lifetime;

        if job.locked_at.map(|at| at < lock_deadline).unwrap_or(false) {
            warn!("lock expired before dispatch, releasing orphaned job");
            self.registry.decr_locked(&job.name);
            self.registry.decr_running(&job.name);
            AgendaMetrics::running_jobs(self.total_running());
            return;
        }

        if job.disabled {
            debug!("job disabled before dispatch, skipping handler invocation");
            job.locked_at = None;
            if let Err(e) = self.repository.save_job_state(&job).await {
                warn!(error = %e, "failed to persist unlock of disabled job");
            }
            self.registry.decr_locked(&job.name);
            self.registry.decr_running(&job.name);
            AgendaMetrics::running_jobs(self.total_running());
            return;
        }

        self.observer.emit(AgendaEvent::Start(job.clone()));
        AgendaMetrics::job_dispatched(&job.name);
        let started_at = std::time::Instant::now();

        let handler = self.registry.handler(&job.name);
        let outcome = match handler {
            Some(handler) => {
                let repository = Arc::clone(&self.repository);
                let clock = Arc::clone(&self.clock);
                let id = job.id;
                let name = job.name.clone();
                let job_ref = &job;
                let handle = JobHandle::new(job_ref, move |progress| {
                    let Some(id) = id else { return };
                    let repository = Arc::clone(&repository);
                    let clock = Arc::clone(&clock);
                    let name = name.clone();
                    tokio::spawn(async move {
                        if let Err(e) = repository.lock_job_by_id(id, None, clock.now()).await {
                            debug!(error = %e, job.id = %id, job.name = %name, ?progress, "touch heartbeat failed to extend lock");
                        }
                    });
                });
                handler(handle).await
            }
            None => {
                error!(job.name = %job.name, "dispatched a job with no registered handler");
                Err(Box::new(AgendaError::Configuration(format!("no handler registered for {}", job.name)))
                    as crate::registry::HandlerError)
            }
        };

        let now = self.clock.now();
        job.locked_at = None;
        job.last_finished_at = Some(now);

        let event = match outcome {
            Ok(result) => {
                if job.should_save_result {
                    job.result = result;
                }
                AgendaMetrics::job_succeeded(&job.name, started_at.elapsed());
                AgendaEvent::Success(job.clone())
            }
            Err(e) => {
                job.fail_count += 1;
                job.fail_reason = Some(e.to_string());
                job.failed_at = Some(now);
                AgendaMetrics::job_failed(&job.name, started_at.elapsed());
                AgendaEvent::Fail(job.clone(), e.to_string())
            }
        };

        match compute_next_run_at(&job, now) {
            Ok(next) => job.next_run_at = next,
            Err(e) => {
                warn!(error = %e, "recurrence became invalid after run, disabling further scheduling");
                job.next_run_at = None;
                job.disabled = true;
            }
        }

        if let Err(e) = self.repository.save_job_state(&job).await {
            warn!(error = %e, "failed to persist job state after run, state may be stale");
        }

        self.observer.emit(event);
        self.observer.emit(AgendaEvent::Complete(job.clone()));

        self.registry.decr_running(&job.name);
        self.registry.decr_locked(&job.name);
        AgendaMetrics::running_jobs(self.total_running());
        self.kick.notify_one();
    }

    fn total_running(&self) -> u32 {
        self.registry.names().iter().map(|n| self.registry.running(n)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::events::AgendaEvent;
    use crate::registry::JobOptions;
    use crate::repository::memory::MemoryJobRepository;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn successful_handler_clears_lock_and_emits_complete() {
        let registry = Arc::new(Registry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        registry.define(
            "ping",
            JobOptions::default(),
            Arc::new(move |_h| {
                let calls = calls_clone.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                })
            }),
        );

        let queue = Arc::new(PriorityJobQueue::new());
        let repository: Arc<dyn JobRepository> = Arc::new(MemoryJobRepository::new());
        let observer = Observer::new();
        let mut events = observer.subscribe();
        let clock: Arc<dyn Clock> = Arc::new(MockClock::at(Utc::now()));

        let mut job = Job::new("ping", serde_json::json!(null));
        job.next_run_at = Some(clock.now());
        let saved = repository.save_job(job).await.unwrap();
        let locked = repository
            .get_next_job_to_run("ping", clock.now(), clock.now() - chrono::Duration::minutes(10), clock.now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(locked.id, saved.id);
        registry.incr_locked("ping");

        let executor = Executor::new(registry.clone(), queue.clone(), repository.clone(), observer, clock, 0);
        executor.dispatch(locked).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.running("ping"), 0);
        assert_eq!(registry.locked("ping"), 0);

        let saw_success = loop {
            match events.recv().await.unwrap() {
                AgendaEvent::Success(_) => break true,
                AgendaEvent::Complete(_) => continue,
                AgendaEvent::Start(_) => continue,
                _ => continue,
            }
        };
        assert!(saw_success);
    }

    #[tokio::test]
    async fn failing_handler_records_fail_reason() {
        let registry = Arc::new(Registry::new());
        registry.define(
            "boom",
            JobOptions::default(),
            Arc::new(|_h| Box::pin(async { Err("kaboom".into()) })),
        );
        let queue = Arc::new(PriorityJobQueue::new());
        let repository: Arc<dyn JobRepository> = Arc::new(MemoryJobRepository::new());
        let observer = Observer::new();
        let clock: Arc<dyn Clock> = Arc::new(MockClock::at(Utc::now()));

        let mut job = Job::new("boom", serde_json::json!(null));
        job.next_run_at = Some(clock.now());
        let saved = repository.save_job(job).await.unwrap();
        registry.incr_locked("boom");

        let executor = Executor::new(registry.clone(), queue, repository.clone(), observer, clock, 0);
        executor.dispatch(saved).await;

        assert_eq!(registry.locked("boom"), 0);
    }
}
