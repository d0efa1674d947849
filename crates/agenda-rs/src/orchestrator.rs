//! `Agenda`: the public facade tying Registry, Repository, NotificationChannel,
//! Scheduler and Executor together (§4.9).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::AgendaConfig;
use crate::error::{AgendaError, AgendaResult};
use crate::events::{AgendaEvent, Observer};
use crate::executor::Executor;
use crate::job::{Debounce, DebounceStrategy, Job, JobType, Priority, Recurrence, Unique};
use crate::listener::NotificationListener;
use crate::notification::{JobSavedEvent, NotificationChannel};
use crate::queue::PriorityJobQueue;
use crate::recurrence::compute_next_run_at;
use crate::registry::{BoxedHandler, JobHandler, JobOptions, Registry};
use crate::repository::{JobFilter, JobRepository, NameOverview, SortSpec};
use crate::scheduler::{Scheduler, SchedulerLimits};

/// `every()`'s recurrence-shaping options beyond the bare interval string.
#[derive(Debug, Clone, Default)]
pub struct RecurrenceOptions {
    pub timezone: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub skip_days: Option<String>,
    /// If true, `lastRunAt` is seeded to `now` before the first
    /// `computeNextRunAt` call, so the first fire is one interval out
    /// instead of immediate.
    pub skip_immediate: bool,
}

/// Result of [`Agenda::drain`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DrainResult {
    pub completed: bool,
    pub running: u32,
    pub timed_out: bool,
    pub aborted: bool,
}

#[derive(Clone, Copy)]
struct DebounceWindow {
    t0: DateTime<Utc>,
    last_call: DateTime<Utc>,
}

fn debounce_key(name: &str, query: &str) -> String {
    format!("{name}:{query}")
}

pub struct Agenda {
    registry: Arc<Registry>,
    repository: Arc<dyn JobRepository>,
    notification: Option<Arc<dyn NotificationChannel>>,
    queue: Arc<PriorityJobQueue>,
    executor: Arc<Executor>,
    scheduler: Arc<Scheduler>,
    listener: Mutex<Option<NotificationListener>>,
    observer: Observer,
    clock: Arc<dyn Clock>,
    config: AgendaConfig,
    shutdown_tx: broadcast::Sender<()>,
    running: AtomicBool,
    debounce_state: Mutex<HashMap<String, DebounceWindow>>,
}

impl Agenda {
    pub fn new(repository: Arc<dyn JobRepository>, config: AgendaConfig) -> Arc<Self> {
        Self::with_clock(repository, None, config, Arc::new(SystemClock))
    }

    pub fn with_notification_channel(
        repository: Arc<dyn JobRepository>,
        notification: Arc<dyn NotificationChannel>,
        config: AgendaConfig,
    ) -> Arc<Self> {
        Self::with_clock(repository, Some(notification), config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        repository: Arc<dyn JobRepository>,
        notification: Option<Arc<dyn NotificationChannel>>,
        config: AgendaConfig,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let registry = Arc::new(Registry::new());
        let queue = Arc::new(PriorityJobQueue::new());
        let observer = Observer::new();
        let (shutdown_tx, _) = broadcast::channel(1);

        let executor = Executor::new(
            registry.clone(),
            queue.clone(),
            repository.clone(),
            observer.clone(),
            clock.clone(),
            config.max_concurrency,
        );
        let scheduler = Scheduler::new(
            registry.clone(),
            repository.clone(),
            queue.clone(),
            executor.clone(),
            clock.clone(),
            SchedulerLimits { process_every: config.process_every(), max_lock_limit: config.lock_limit },
        );

        Arc::new(Self {
            registry,
            repository,
            notification,
            queue,
            executor,
            scheduler,
            listener: Mutex::new(None),
            observer,
            clock,
            config,
            shutdown_tx,
            running: AtomicBool::new(false),
            debounce_state: Mutex::new(HashMap::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgendaEvent> {
        self.observer.subscribe()
    }

    /// Registers (or replaces) the handler for `name`, idempotent by name.
    pub fn define(&self, name: impl Into<String>, options: JobOptions, handler: BoxedHandler) {
        self.registry.define(name, options, handler);
    }

    pub fn define_with<H: JobHandler>(&self, name: impl Into<String>, options: JobOptions, handler: H) {
        self.registry.define_with(name, options, handler);
    }

    /// `now(name, data) → Job`: persist with `nextRunAt = now`, publish,
    /// trigger an immediate lock-on-the-fly.
    #[instrument(skip(self, data))]
    pub async fn now(&self, name: impl Into<String>, data: serde_json::Value) -> AgendaResult<Job> {
        let name = name.into();
        let mut job = Job::new(name.as_str(), data);
        job.next_run_at = Some(self.clock.now());
        job.priority = self.registry.options(&name).map(|o| o.priority).unwrap_or_default();
        job.last_modified_by = Some(self.config.name.clone());
        self.save_and_publish(job).await
    }

    /// `schedule(when, name, data)`.
    #[instrument(skip(self, data))]
    pub async fn schedule(&self, when: DateTime<Utc>, name: impl Into<String>, data: serde_json::Value) -> AgendaResult<Job> {
        let name = name.into();
        let mut job = Job::new(name.as_str(), data);
        job.next_run_at = Some(when);
        job.priority = self.registry.options(&name).map(|o| o.priority).unwrap_or_default();
        job.last_modified_by = Some(self.config.name.clone());
        self.save_and_publish(job).await
    }

    /// `every(interval, name, data, opts)`: persisted as `type=single` with
    /// `repeatInterval`; `opts.skip_immediate` seeds `lastRunAt = now`
    /// before the first `computeNextRunAt` call.
    #[instrument(skip(self, data, opts))]
    pub async fn every(
        &self,
        interval: impl Into<String>,
        name: impl Into<String>,
        data: serde_json::Value,
        opts: RecurrenceOptions,
    ) -> AgendaResult<Job> {
        let name = name.into();
        let mut job = Job::new(name.as_str(), data);
        job.job_type = JobType::Single;
        job.priority = self.registry.options(&name).map(|o| o.priority).unwrap_or_default();
        job.last_modified_by = Some(self.config.name.clone());
        job.recurrence = Recurrence {
            interval: Some(interval.into()),
            timezone: opts.timezone,
            at: None,
            start_date: opts.start_date,
            end_date: opts.end_date,
            skip_days: opts.skip_days,
        };
        if opts.skip_immediate {
            job.last_run_at = Some(self.clock.now());
        }
        job.next_run_at = compute_next_run_at(&job, self.clock.now())?;
        self.save_and_publish(job).await
    }

    /// Saves a caller-built [`Job`] — the only entry point that honors a
    /// [`Unique`]/[`Debounce`] policy attached via [`Job::with_unique`]/
    /// [`Job::with_priority`]/[`Job::with_debounce`]. `now`/`schedule`/`every`
    /// are thin wrappers around this for the common unkeyed case.
    pub async fn save(&self, job: Job) -> AgendaResult<Job> {
        self.save_and_publish(job).await
    }

    /// Saves a job honoring any attached [`Debounce`] policy, publishes the
    /// jobSaved event, and kicks the push flow.
    async fn save_and_publish(&self, mut job: Job) -> AgendaResult<Job> {
        if let Some(unique) = &job.unique {
            if unique.query.trim().is_empty() {
                return Err(AgendaError::Configuration("unique query fragment must not be empty".into()));
            }
        }

        if let Some(debounce) = job.debounce.clone() {
            let query = job.unique.as_ref().map(|u| u.query.clone()).ok_or_else(|| {
                AgendaError::Configuration("debounce requires a unique key to scope its quiet window".into())
            })?;
            let key = debounce_key(&job.name, &query);
            if let Some(next) = self.apply_debounce(&key, &debounce, self.clock.now()) {
                job.next_run_at = Some(next);
            } else {
                // Leading strategy coalesced into an existing pending fire:
                // still upsert so the new `data` reaches the eventual run,
                // but keep the existing row's fire time rather than the one
                // `now`/`schedule`/`every` computed for this call.
                let filter = JobFilter { name: Some(job.name.clone()), ..JobFilter::default() };
                let (existing, _) = self.repository.query_jobs(&filter, self.config.sort, 0, u64::MAX).await?;
                if let Some(row) = existing.iter().find(|j| {
                    j.unique.as_ref().map(|u| u.query == query).unwrap_or(false)
                }) {
                    job.next_run_at = row.next_run_at;
                }
            }
        }

        let saved = self.repository.save_job(job).await?;

        if let Some(channel) = &self.notification {
            let event = JobSavedEvent::new(saved.id.expect("save_job assigns an id"), &saved.name, saved.next_run_at);
            if let Err(e) = channel.publish(event).await {
                warn!(error = %e, "failed to publish jobSaved notification, poll flow will still pick this up");
            }
        }

        if let Some(id) = saved.id {
            self.scheduler.request_lock_on_the_fly(id, saved.name.clone(), saved.next_run_at);
        }

        Ok(saved)
    }

    fn apply_debounce(&self, key: &str, debounce: &Debounce, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut state = self.debounce_state.lock();
        match debounce.strategy {
            DebounceStrategy::Trailing => {
                let window = state.entry(key.to_string()).or_insert(DebounceWindow { t0: now, last_call: now });
                if now - window.last_call > debounce.delay {
                    window.t0 = now;
                }
                window.last_call = now;
                let mut next = now + debounce.delay;
                if let Some(max_wait) = debounce.max_wait {
                    next = next.min(window.t0 + max_wait);
                }
                Some(next)
            }
            DebounceStrategy::Leading => match state.get_mut(key) {
                Some(window) if now - window.last_call < debounce.delay => {
                    window.last_call = now;
                    None
                }
                _ => {
                    state.insert(key.to_string(), DebounceWindow { t0: now, last_call: now });
                    Some(now)
                }
            },
        }
    }

    pub async fn cancel(&self, filter: JobFilter) -> AgendaResult<u64> {
        self.repository.cancel(&filter).await
    }

    pub async fn disable(&self, filter: JobFilter) -> AgendaResult<u64> {
        self.toggle_disabled(filter, true).await
    }

    pub async fn enable(&self, filter: JobFilter) -> AgendaResult<u64> {
        self.toggle_disabled(filter, false).await
    }

    async fn toggle_disabled(&self, filter: JobFilter, disabled: bool) -> AgendaResult<u64> {
        let (jobs, _) = self.repository.query_jobs(&filter, self.config.sort, 0, u64::MAX).await?;
        let mut changed = 0u64;
        for mut job in jobs {
            if job.disabled != disabled {
                job.disabled = disabled;
                self.repository.save_job_state(&job).await?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Removes rows whose name is not currently defined.
    pub async fn purge(&self) -> AgendaResult<u64> {
        self.repository.purge(&self.registry.names()).await
    }

    pub async fn query_jobs(&self, filter: JobFilter, sort: SortSpec, skip: u64, limit: u64) -> AgendaResult<(Vec<Job>, u64)> {
        self.repository.query_jobs(&filter, sort, skip, limit).await
    }

    pub async fn get_jobs_overview(&self) -> AgendaResult<Vec<NameOverview>> {
        self.repository.get_jobs_overview().await
    }

    /// In-memory running/locked counters, summed across all defined names.
    pub fn get_running_stats(&self) -> (u32, u32) {
        let names = self.registry.names();
        let running = names.iter().map(|n| self.registry.running(n)).sum();
        let locked = names.iter().map(|n| self.registry.locked(n)).sum();
        (running, locked)
    }

    /// Starts the poll-flow and executor loops, and the notification
    /// listener if a channel was configured.
    pub async fn start(self: &Arc<Self>) -> AgendaResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AgendaError::Configuration("agenda is already running".into()));
        }

        info!(instance = %self.config.name, "starting agenda");
        crate::metrics::register_metrics();

        if let Some(channel) = &self.notification {
            channel.connect().await?;
            let listener = NotificationListener::start(channel.clone(), self.scheduler.clone());
            *self.listener.lock() = Some(listener);
        }

        tokio::spawn(self.scheduler.clone().run(self.shutdown_tx.subscribe()));
        tokio::spawn(self.executor.clone().run(self.shutdown_tx.subscribe()));

        self.observer.emit(AgendaEvent::Ready);
        Ok(())
    }

    /// Signals the poll and executor loops to stop accepting new work.
    /// Does not wait for in-flight handlers; see [`Agenda::drain`].
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            let _ = self.shutdown_tx.send(());
            if let Some(listener) = self.listener.lock().take() {
                listener.stop();
            }
        }
    }

    /// Waits up to `timeout` for `running == 0`. `abort` is checked each
    /// poll tick; when set, the wait (not the handlers) is cancelled.
    pub async fn drain(&self, timeout: Duration, abort: Option<Arc<AtomicBool>>) -> DrainResult {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let (running, _) = self.get_running_stats();
            if running == 0 {
                return DrainResult { completed: true, running: 0, timed_out: false, aborted: false };
            }
            if let Some(flag) = &abort {
                if flag.load(Ordering::SeqCst) {
                    return DrainResult { completed: false, running, timed_out: false, aborted: true };
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return DrainResult { completed: false, running, timed_out: true, aborted: false };
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Convenience constructors mirroring the teacher's `unique`/`debounce`
/// builder-style attribute helpers on `Job`.
impl Job {
    pub fn with_unique(mut self, query: impl Into<String>, insert_only: bool) -> Self {
        self.unique = Some(Unique { query: query.into(), insert_only });
        self
    }

    pub fn with_debounce(mut self, delay: chrono::Duration, max_wait: Option<chrono::Duration>, strategy: DebounceStrategy) -> Self {
        self.debounce = Some(Debounce { delay, max_wait, strategy });
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::repository::memory::MemoryJobRepository;
    use std::sync::atomic::AtomicUsize;

    fn config() -> AgendaConfig {
        AgendaConfig { process_every_ms: 20, ..AgendaConfig::default() }
    }

    #[tokio::test]
    async fn now_persists_a_due_job_and_it_runs() {
        let repository: Arc<dyn JobRepository> = Arc::new(MemoryJobRepository::new());
        let clock = Arc::new(MockClock::at(Utc::now()));
        let agenda = Agenda::with_clock(repository, None, config(), clock.clone());

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        agenda.define(
            "ping",
            JobOptions::default(),
            Arc::new(move |_h| {
                let calls = calls_clone.clone();
                Box::pin(async move {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(None)
                })
            }),
        );

        agenda.start().await.unwrap();
        agenda.now("ping", serde_json::json!({"x": 1})).await.unwrap();

        let result = agenda.drain(Duration::from_secs(2), None).await;
        assert!(result.completed, "expected the dispatched job to finish");
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        agenda.stop();
    }

    #[tokio::test]
    async fn trailing_debounce_resets_the_quiet_window() {
        let repository: Arc<dyn JobRepository> = Arc::new(MemoryJobRepository::new());
        let clock = Arc::new(MockClock::at(Utc::now()));
        let agenda = Agenda::with_clock(repository, None, config(), clock.clone());
        agenda.define("debounced", JobOptions::default(), Arc::new(|_h| Box::pin(async { Ok(None) })));

        let job = Job::new("debounced", serde_json::json!(null))
            .with_unique("k1", false)
            .with_debounce(chrono::Duration::seconds(10), None, DebounceStrategy::Trailing);
        let first = agenda.save_and_publish(job.clone()).await.unwrap();

        clock.advance(chrono::Duration::seconds(2));
        let second = agenda.save_and_publish(job).await.unwrap();

        assert_eq!(first.id, second.id, "unique key should coalesce to one row");
        assert!(second.next_run_at.unwrap() > first.next_run_at.unwrap(), "trailing debounce should push the fire time out");
    }

    #[test]
    fn debounce_key_scopes_by_name_and_query() {
        assert_ne!(debounce_key("a", "q"), debounce_key("b", "q"));
    }
}
