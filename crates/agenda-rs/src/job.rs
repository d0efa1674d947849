//! The `Job` entity: the single persisted record a scheduler instance acts on.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque job identifier, assigned by the repository on first save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generates a new random job id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `single` jobs have at most one row per `name` (invariant 1); used by
/// `every`. `normal` jobs may have arbitrarily many rows sharing a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Normal,
    Single,
}

/// Signed priority; higher runs first. String aliases map onto the same
/// `-20..=20` range the source spec enumerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    pub const LOWEST: Priority = Priority(-20);
    pub const LOW: Priority = Priority(-10);
    pub const NORMAL: Priority = Priority(0);
    pub const HIGH: Priority = Priority(10);
    pub const HIGHEST: Priority = Priority(20);

    /// Parses the string aliases (`"lowest"`, `"low"`, `"normal"`, `"high"`,
    /// `"highest"`), case-insensitively, or a bare integer.
    pub fn parse(s: &str) -> Option<Priority> {
        match s.to_ascii_lowercase().as_str() {
            "lowest" => Some(Self::LOWEST),
            "low" => Some(Self::LOW),
            "normal" => Some(Self::NORMAL),
            "high" => Some(Self::HIGH),
            "highest" => Some(Self::HIGHEST),
            other => other.parse::<i32>().ok().map(Priority),
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

/// Coalescing strategy for debounced saves (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebounceStrategy {
    Leading,
    Trailing,
}

impl Default for DebounceStrategy {
    fn default() -> Self {
        Self::Trailing
    }
}

/// Debounce configuration attached to a job at save time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Debounce {
    pub delay: chrono::Duration,
    pub max_wait: Option<chrono::Duration>,
    pub strategy: DebounceStrategy,
}

/// Dedup key for a job. `insert_only` selects upsert-vs-leave-existing
/// semantics when a row with the same key already exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unique {
    pub query: String,
    pub insert_only: bool,
}

/// Recurrence configuration: at most one of `interval`/`at` is meaningful at
/// a time; both may be present on the wire but `at` is only consulted when
/// `interval` is absent (§4.1).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Recurrence {
    /// A cron expression or a human interval string (`"5 seconds"`).
    pub interval: Option<String>,
    /// IANA timezone applied to cron evaluation and start/end clamping.
    pub timezone: Option<String>,
    /// A human clock phrase (`"3:30pm"`), used only when `interval` is unset.
    pub at: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    /// Human interval added to the computed `next_run_at` after the first run.
    pub skip_days: Option<String>,
}

impl Recurrence {
    pub fn is_repeating(&self) -> bool {
        self.interval.is_some() || self.at.is_some()
    }
}

/// The single persisted entity a scheduler instance acts on (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Option<JobId>,
    pub name: String,
    pub job_type: JobType,
    pub priority: Priority,
    pub data: serde_json::Value,

    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,

    pub fail_count: u32,
    pub fail_reason: Option<String>,

    pub recurrence: Recurrence,

    pub disabled: bool,
    pub unique: Option<Unique>,
    pub debounce: Option<Debounce>,

    pub should_save_result: bool,
    pub result: Option<serde_json::Value>,
    pub progress: Option<u8>,

    pub last_modified_by: Option<String>,
}

impl Job {
    /// A fresh, not-yet-persisted job for `name` carrying `data`.
    pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: None,
            name: name.into(),
            job_type: JobType::Normal,
            priority: Priority::default(),
            data,
            next_run_at: None,
            last_run_at: None,
            last_finished_at: None,
            failed_at: None,
            locked_at: None,
            fail_count: 0,
            fail_reason: None,
            recurrence: Recurrence::default(),
            disabled: false,
            unique: None,
            debounce: None,
            should_save_result: false,
            result: None,
            progress: None,
            last_modified_by: None,
        }
    }

    /// `running`: last started after it last finished (or never finished)
    /// and still locked by some instance.
    pub fn is_running(&self) -> bool {
        if self.locked_at.is_none() {
            return false;
        }
        match (self.last_run_at, self.last_finished_at) {
            (Some(_), None) => true,
            (Some(run), Some(finished)) => run > finished,
            (None, _) => false,
        }
    }

    /// `scheduled`: has a future fire time.
    pub fn is_scheduled(&self, now: DateTime<Utc>) -> bool {
        matches!(self.next_run_at, Some(at) if at > now)
    }

    /// `queued`: due and not currently locked by anyone.
    pub fn is_queued(&self, now: DateTime<Utc>) -> bool {
        matches!(self.next_run_at, Some(at) if at <= now) && self.locked_at.is_none()
    }

    /// `completed`: has finished at least once and did not fail last time.
    pub fn is_completed(&self) -> bool {
        match (self.last_finished_at, self.failed_at) {
            (Some(finished), Some(failed)) => finished > failed,
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// `failed`: most recent conclusion was a failure.
    pub fn is_failed(&self) -> bool {
        match (self.last_finished_at, self.failed_at) {
            (Some(finished), Some(failed)) => failed >= finished,
            (None, Some(_)) => true,
            _ => false,
        }
    }

    pub fn is_repeating(&self) -> bool {
        self.recurrence.is_repeating()
    }

    /// Marks the job as locked by the current instance at `now`, used by
    /// both poll- and push-flow claims.
    pub fn mark_locked(&mut self, now: DateTime<Utc>) {
        self.locked_at = Some(now);
    }

    /// Clears the lock without touching lifecycle fields (orphan release).
    pub fn mark_unlocked(&mut self) {
        self.locked_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_roundtrips_through_display() {
        let id = JobId::new();
        let parsed = JobId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn priority_aliases_match_spec_range() {
        assert_eq!(Priority::parse("highest"), Some(Priority::HIGHEST));
        assert_eq!(Priority::parse("LOW"), Some(Priority::LOW));
        assert_eq!(Priority::parse("7"), Some(Priority(7)));
        assert_eq!(Priority::parse("not-a-priority"), None);
    }

    #[test]
    fn fresh_job_is_not_repeating_scheduled_or_queued() {
        let job = Job::new("ping", serde_json::json!({"i": 1}));
        assert!(!job.is_repeating());
        assert!(!job.is_scheduled(Utc::now()));
        assert!(!job.is_queued(Utc::now()));
    }

    #[test]
    fn queued_job_is_due_and_unlocked() {
        let mut job = Job::new("ping", serde_json::json!(null));
        let now = Utc::now();
        job.next_run_at = Some(now - chrono::Duration::seconds(1));
        assert!(job.is_queued(now));
        job.mark_locked(now);
        assert!(!job.is_queued(now));
    }
}
