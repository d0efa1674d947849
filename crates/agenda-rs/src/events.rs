//! Typed replacement for the source's string-keyed emitter (§6, "Events
//! surfaced to users"). `ready`/`start`/`success`/`fail`/`complete`/`error`
//! become variants of one enum instead of event-name strings, and per-name
//! filtering (`start:<name>`) is a `match` on `AgendaEvent::name()` at the
//! subscriber rather than a second registration surface.

use tokio::sync::broadcast;

use crate::job::Job;

/// One observable occurrence in the scheduler's lifecycle.
#[derive(Debug, Clone)]
pub enum AgendaEvent {
    /// The scheduler has started polling and is ready to process jobs.
    Ready,
    /// A handler is about to run.
    Start(Job),
    /// A handler returned successfully.
    Success(Job),
    /// A handler returned an error; the job's `fail_reason`/`fail_count`
    /// already reflect it.
    Fail(Job, String),
    /// Emitted after either `Success` or `Fail`, once state is persisted.
    Complete(Job),
    /// A runtime error not tied to a specific job (backend unavailable,
    /// notification channel exhausted its reconnect attempts, ...).
    Error(String),
}

impl AgendaEvent {
    /// The job name this event concerns, if any — the Rust analogue of the
    /// source's `success:<name>` filtered subscription.
    pub fn job_name(&self) -> Option<&str> {
        match self {
            AgendaEvent::Start(job) | AgendaEvent::Success(job) | AgendaEvent::Complete(job) => {
                Some(&job.name)
            }
            AgendaEvent::Fail(job, _) => Some(&job.name),
            AgendaEvent::Ready | AgendaEvent::Error(_) => None,
        }
    }
}

/// Broadcasts [`AgendaEvent`]s to any number of subscribers; a lagging
/// subscriber drops the oldest events rather than blocking emission.
#[derive(Clone)]
pub struct Observer {
    tx: broadcast::Sender<AgendaEvent>,
}

impl Default for Observer {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }
}

impl Observer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgendaEvent> {
        self.tx.subscribe()
    }

    /// Never errors on behalf of the caller: an event with no subscribers
    /// is simply dropped, matching the source's fire-and-forget emitter.
    pub fn emit(&self, event: AgendaEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let observer = Observer::new();
        let mut rx = observer.subscribe();
        observer.emit(AgendaEvent::Ready);
        observer.emit(AgendaEvent::Start(Job::new("ping", serde_json::json!(null))));

        assert!(matches!(rx.recv().await.unwrap(), AgendaEvent::Ready));
        let next = rx.recv().await.unwrap();
        assert_eq!(next.job_name(), Some("ping"));
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let observer = Observer::new();
        observer.emit(AgendaEvent::Error("boom".into()));
    }
}
