//! Bridges a [`NotificationChannel`] subscription into the scheduler's
//! push flow: every peer-published `jobSaved` event becomes a
//! `lockOnTheFly` request (§2, data-flow diagram).

use std::sync::Arc;

use tracing::debug;

use crate::notification::{JobSavedEvent, NotificationChannel, SubscriptionId};
use crate::scheduler::Scheduler;

/// Owns the subscription for the lifetime of the orchestrator; dropping it
/// does not auto-unsubscribe, callers must call [`NotificationListener::stop`].
pub struct NotificationListener {
    channel: Arc<dyn NotificationChannel>,
    subscription: SubscriptionId,
}

impl NotificationListener {
    pub fn start(channel: Arc<dyn NotificationChannel>, scheduler: Arc<Scheduler>) -> Self {
        let subscription = channel.subscribe(Arc::new(move |event: JobSavedEvent| {
            debug!(job.id = %event.id, job.name = %event.name, "received jobSaved notification");
            scheduler.request_lock_on_the_fly(event.id, event.name, event.next_run_at);
        }));
        Self { channel, subscription }
    }

    pub fn stop(self) {
        self.channel.unsubscribe(self.subscription);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::events::Observer;
    use crate::executor::Executor;
    use crate::job::Job;
    use crate::notification::MemoryNotificationChannel;
    use crate::queue::PriorityJobQueue;
    use crate::registry::{JobOptions, Registry};
    use crate::repository::memory::MemoryJobRepository;
    use crate::repository::JobRepository;
    use crate::scheduler::SchedulerLimits;
    use chrono::Utc;

    #[tokio::test]
    async fn notification_triggers_a_lock_on_the_fly_request() {
        let registry = Arc::new(Registry::new());
        registry.define("ping", JobOptions::default(), Arc::new(|_h| Box::pin(async { Ok(None) })));
        let repository: Arc<dyn JobRepository> = Arc::new(MemoryJobRepository::new());
        let queue = Arc::new(PriorityJobQueue::new());
        let clock = Arc::new(MockClock::at(Utc::now()));
        let executor = Executor::new(registry.clone(), queue.clone(), repository.clone(), Observer::new(), clock.clone(), 0);
        let scheduler = Scheduler::new(registry.clone(), repository.clone(), queue, executor, clock.clone(), SchedulerLimits::default());

        let mut job = Job::new("ping", serde_json::json!(null));
        job.next_run_at = Some(clock.now());
        let saved = repository.save_job(job).await.unwrap();

        let channel = MemoryNotificationChannel::new();
        channel.connect().await.unwrap();
        let _listener = NotificationListener::start(channel.clone(), scheduler.clone());

        channel
            .publish(JobSavedEvent::new(saved.id.unwrap(), "ping", saved.next_run_at))
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(scheduler.locked_count() >= 1);
    }
}
