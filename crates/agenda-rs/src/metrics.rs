//! Operational metrics (§10.4) — jobs locked/dispatched, queue depth,
//! channel state. Ambient observability only: no HTTP exporter, just
//! instrumentation points a host process can scrape.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

pub mod names {
    pub const JOBS_LOCKED_TOTAL: &str = "agenda_jobs_locked_total";
    pub const JOBS_DISPATCHED_TOTAL: &str = "agenda_jobs_dispatched_total";
    pub const JOBS_SUCCEEDED_TOTAL: &str = "agenda_jobs_succeeded_total";
    pub const JOBS_FAILED_TOTAL: &str = "agenda_jobs_failed_total";
    pub const LOCK_CONTENTION_MISSES_TOTAL: &str = "agenda_lock_contention_misses_total";

    pub const QUEUE_DEPTH: &str = "agenda_queue_depth";
    pub const RUNNING_JOBS: &str = "agenda_running_jobs";

    /// 0=disconnected, 1=connecting, 2=connected, 3=reconnecting, 4=error.
    pub const NOTIFICATION_CHANNEL_STATE: &str = "agenda_notification_channel_state";

    pub const JOB_DURATION_SECONDS: &str = "agenda_job_duration_seconds";
}

pub fn register_metrics() {
    describe_counter!(names::JOBS_LOCKED_TOTAL, "Total jobs claimed via poll or push flow");
    describe_counter!(names::JOBS_DISPATCHED_TOTAL, "Total jobs handed to a handler");
    describe_counter!(names::JOBS_SUCCEEDED_TOTAL, "Total jobs whose handler returned Ok");
    describe_counter!(names::JOBS_FAILED_TOTAL, "Total jobs whose handler returned Err");
    describe_counter!(names::LOCK_CONTENTION_MISSES_TOTAL, "Total claim attempts that found no eligible row");

    describe_gauge!(names::QUEUE_DEPTH, "Jobs currently held in the priority queue, locked but not yet dispatched");
    describe_gauge!(names::RUNNING_JOBS, "Jobs currently executing inside a handler");
    describe_gauge!(names::NOTIFICATION_CHANNEL_STATE, "Notification channel connection state, 0-4");

    describe_histogram!(names::JOB_DURATION_SECONDS, "Handler execution duration in seconds");
}

/// Recorder used by the scheduler/executor; a thin wrapper so call sites
/// read `AgendaMetrics::job_locked(name)` instead of the raw macros.
#[derive(Clone, Copy)]
pub struct AgendaMetrics;

impl AgendaMetrics {
    pub fn job_locked(job_name: &str) {
        counter!(names::JOBS_LOCKED_TOTAL, "job_name" => job_name.to_string()).increment(1);
    }

    pub fn lock_contention_miss(job_name: &str) {
        counter!(names::LOCK_CONTENTION_MISSES_TOTAL, "job_name" => job_name.to_string()).increment(1);
    }

    pub fn job_dispatched(job_name: &str) {
        counter!(names::JOBS_DISPATCHED_TOTAL, "job_name" => job_name.to_string()).increment(1);
    }

    pub fn job_succeeded(job_name: &str, duration: Duration) {
        counter!(names::JOBS_SUCCEEDED_TOTAL, "job_name" => job_name.to_string()).increment(1);
        histogram!(names::JOB_DURATION_SECONDS, "job_name" => job_name.to_string(), "outcome" => "success")
            .record(duration.as_secs_f64());
    }

    pub fn job_failed(job_name: &str, duration: Duration) {
        counter!(names::JOBS_FAILED_TOTAL, "job_name" => job_name.to_string()).increment(1);
        histogram!(names::JOB_DURATION_SECONDS, "job_name" => job_name.to_string(), "outcome" => "failure")
            .record(duration.as_secs_f64());
    }

    pub fn queue_depth(depth: usize) {
        gauge!(names::QUEUE_DEPTH).set(depth as f64);
    }

    pub fn running_jobs(count: u32) {
        gauge!(names::RUNNING_JOBS).set(count as f64);
    }

    pub fn channel_state(state: crate::notification::ConnectionState) {
        use crate::notification::ConnectionState::*;
        let value = match state {
            Disconnected => 0.0,
            Connecting => 1.0,
            Connected => 2.0,
            Reconnecting => 3.0,
            Error => 4.0,
        };
        gauge!(names::NOTIFICATION_CHANNEL_STATE).set(value);
    }
}
