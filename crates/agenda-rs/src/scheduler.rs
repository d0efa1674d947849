//! Poll flow + push flow (§4.7). Unlike the teacher's leader-elected single
//! scanner, every instance polls and claims independently — the repository's
//! atomic `get_next_job_to_run`/`lock_job_by_id` is the only serialization
//! point across instances (§5), so there is no leader lock to acquire here.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use crate::clock::Clock;
use crate::executor::Executor;
use crate::job::{Job, JobId};
use crate::metrics::AgendaMetrics;
use crate::queue::PriorityJobQueue;
use crate::registry::Registry;
use crate::repository::JobRepository;

/// Tunables the orchestrator forwards from [`crate::config::AgendaConfig`].
#[derive(Debug, Clone)]
pub struct SchedulerLimits {
    pub process_every: Duration,
    pub max_lock_limit: u32,
}

impl Default for SchedulerLimits {
    fn default() -> Self {
        Self { process_every: Duration::from_secs(5), max_lock_limit: 0 }
    }
}

struct PushRequest {
    id: JobId,
    name: String,
    expected_next_run_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Drives `jobQueueFilling` on a timer and `lockOnTheFly` on demand.
pub struct Scheduler {
    registry: Arc<Registry>,
    repository: Arc<dyn JobRepository>,
    queue: Arc<PriorityJobQueue>,
    executor: Arc<Executor>,
    clock: Arc<dyn Clock>,
    limits: SchedulerLimits,

    filling_names: Mutex<std::collections::HashSet<String>>,
    jobs_to_lock: Mutex<VecDeque<PushRequest>>,
    locking_on_the_fly: AtomicBool,
}

impl Scheduler {
    pub fn new(
        registry: Arc<Registry>,
        repository: Arc<dyn JobRepository>,
        queue: Arc<PriorityJobQueue>,
        executor: Arc<Executor>,
        clock: Arc<dyn Clock>,
        limits: SchedulerLimits,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            repository,
            queue,
            executor,
            clock,
            limits,
            filling_names: Mutex::new(std::collections::HashSet::new()),
            jobs_to_lock: Mutex::new(VecDeque::new()),
            locking_on_the_fly: AtomicBool::new(false),
        })
    }

    /// Poll-flow main loop; one instance per running [`crate::orchestrator::Agenda`].
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut tick = tokio::time::interval(self.limits.process_every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("scheduler poll loop shutting down");
                    return;
                }
                _ = tick.tick() => self.poll_once().await,
            }
        }
    }

    #[instrument(skip(self))]
    async fn poll_once(self: &Arc<Self>) {
        let names = self.registry.names();
        let fills = names.into_iter().map(|name| {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.job_queue_filling(&name).await })
        });
        for fill in fills {
            let _ = fill.await;
        }
        self.executor.kick();
    }

    /// `jobQueueFilling(name)`: claims every currently-due job for `name`
    /// up to whatever limits are in force, recursing until none remain.
    async fn job_queue_filling(self: Arc<Self>, name: &str) {
        {
            let mut filling = self.filling_names.lock();
            if filling.contains(name) {
                return;
            }
            filling.insert(name.to_string());
        }

        loop {
            if !self.should_lock(name) {
                break;
            }

            let now = self.clock.now();
            let next_scan_at = now + chrono::Duration::from_std(self.limits.process_every).unwrap_or_default();
            let lock_deadline = now
                - self
                    .registry
                    .options(name)
                    .map(|o| o.lock_lifetime)
                    .unwrap_or_else(|| chrono::Duration::milliseconds(600_000));

            let claimed = self.repository.get_next_job_to_run(name, next_scan_at, lock_deadline, now).await;
            match claimed {
                Ok(Some(job)) => {
                    if !self.should_lock(name) {
                        // A limit was hit concurrently; best-effort release.
                        if let Some(id) = job.id {
                            let _ = self.repository.unlock_jobs(&[id]).await;
                        }
                        break;
                    }
                    self.registry.incr_locked(name);
                    AgendaMetrics::job_locked(name);
                    self.queue.insert(job);
                }
                Ok(None) => {
                    AgendaMetrics::lock_contention_miss(name);
                    break;
                }
                Err(e) => {
                    warn!(error = %e, name, "poll claim failed, backend unavailable this tick");
                    break;
                }
            }
        }

        self.filling_names.lock().remove(name);
    }

    /// `shouldLock(name)`.
    fn should_lock(&self, name: &str) -> bool {
        if self.limits.max_lock_limit > 0 && self.global_locked() >= self.limits.max_lock_limit {
            return false;
        }
        match self.registry.options(name) {
            Some(opts) if opts.lock_limit > 0 => self.registry.locked(name) < opts.lock_limit,
            _ => true,
        }
    }

    /// Sum of `locked[name]` across all defined names — the Rust stand-in
    /// for the source's flat `_lockedJobs.length` counter, derived instead
    /// of duplicated so it can never drift from the per-name counts.
    fn global_locked(&self) -> u32 {
        self.registry.names().iter().map(|n| self.registry.locked(n)).sum()
    }

    /// Entry point for `now()`/the NotificationListener: request a push-flow
    /// claim for a job that just became runnable.
    pub fn request_lock_on_the_fly(self: &Arc<Self>, id: JobId, name: String, expected_next_run_at: Option<chrono::DateTime<chrono::Utc>>) {
        self.jobs_to_lock.lock().push_back(PushRequest { id, name, expected_next_run_at });
        if self
            .locking_on_the_fly
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.drain_lock_on_the_fly().await });
        }
    }

    /// `lockOnTheFly`: coalesced so only one push-claim runs at a time per
    /// instance (§4.7, "peer pressure").
    async fn drain_lock_on_the_fly(self: Arc<Self>) {
        loop {
            let request = self.jobs_to_lock.lock().pop_front();
            let Some(request) = request else {
                self.locking_on_the_fly.store(false, Ordering::SeqCst);
                return;
            };

            if self.filling_names.lock().contains(&request.name) {
                continue;
            }
            if !self.should_lock(&request.name) {
                self.jobs_to_lock.lock().clear();
                continue;
            }

            let now = self.clock.now();
            match self.repository.lock_job_by_id(request.id, request.expected_next_run_at, now).await {
                Ok(Some(job)) => {
                    self.registry.incr_locked(&request.name);
                    AgendaMetrics::job_locked(&request.name);
                    self.queue.insert(job);
                    self.executor.kick();
                }
                Ok(None) => {
                    AgendaMetrics::lock_contention_miss(&request.name);
                    debug!(job.id = %request.id, "lock-on-the-fly missed, another instance or poll won");
                }
                Err(e) => warn!(error = %e, job.id = %request.id, "lock-on-the-fly failed, backend unavailable"),
            }
        }
    }

    pub fn locked_count(&self) -> u32 {
        self.global_locked()
    }
}

#[allow(dead_code)]
fn _assert_job_is_send(_job: &Job) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::events::Observer;
    use crate::registry::JobOptions;
    use crate::repository::memory::MemoryJobRepository;
    use chrono::Utc;

    fn make_scheduler(limits: SchedulerLimits) -> (Arc<Scheduler>, Arc<Registry>, Arc<dyn JobRepository>) {
        let registry = Arc::new(Registry::new());
        let repository: Arc<dyn JobRepository> = Arc::new(MemoryJobRepository::new());
        let queue = Arc::new(PriorityJobQueue::new());
        let clock: Arc<dyn Clock> = Arc::new(MockClock::at(Utc::now()));
        let executor = Executor::new(registry.clone(), queue.clone(), repository.clone(), Observer::new(), clock.clone(), 0);
        let scheduler = Scheduler::new(registry.clone(), repository.clone(), queue, executor, clock, limits);
        (scheduler, registry, repository)
    }

    #[tokio::test]
    async fn job_queue_filling_claims_all_due_jobs_for_a_name() {
        let (scheduler, registry, repository) = make_scheduler(SchedulerLimits::default());
        registry.define("ping", JobOptions::default(), Arc::new(|_h| Box::pin(async { Ok(None) })));

        for _ in 0..3 {
            let mut job = Job::new("ping", serde_json::json!(null));
            job.next_run_at = Some(Utc::now() - chrono::Duration::seconds(1));
            repository.save_job(job).await.unwrap();
        }

        scheduler.clone().job_queue_filling("ping").await;
        assert_eq!(registry.locked("ping"), 3);
        assert_eq!(scheduler.locked_count(), 3);
    }

    #[tokio::test]
    async fn should_lock_respects_per_name_lock_limit() {
        let (scheduler, registry, _repository) = make_scheduler(SchedulerLimits::default());
        registry.define(
            "ping",
            JobOptions { lock_limit: 1, ..JobOptions::default() },
            Arc::new(|_h| Box::pin(async { Ok(None) })),
        );
        registry.incr_locked("ping");
        assert!(!scheduler.should_lock("ping"));
    }
}
