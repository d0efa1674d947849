//! Cross-instance pub/sub of "job saved" events (§4.4). Purely advisory:
//! the scheduler's poll loop is always correct on its own, a channel just
//! lets a peer react to a `now`/`schedule`/`every` call without waiting for
//! the next poll tick.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::error::AgendaResult;
use crate::job::JobId;
use crate::metrics::AgendaMetrics;

/// Connection lifecycle state (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

/// Wire event published whenever a job row is upserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSavedEvent {
    pub v: u8,
    #[serde(rename = "type")]
    pub event_type: String,
    pub id: JobId,
    pub name: String,
    pub next_run_at: Option<DateTime<Utc>>,
}

impl JobSavedEvent {
    pub fn new(id: JobId, name: impl Into<String>, next_run_at: Option<DateTime<Utc>>) -> Self {
        Self { v: 1, event_type: "jobSaved".into(), id, name: name.into(), next_run_at }
    }
}

/// Exponential backoff policy governing reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { initial_delay: Duration::from_millis(200), max_delay: Duration::from_secs(30), max_attempts: 10 }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt number `attempt` (1-indexed), or `None` once
    /// `max_attempts` is exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.max_attempts {
            return None;
        }
        let millis = self.initial_delay.as_millis() as u64 * 2u64.saturating_pow(attempt.saturating_sub(1));
        Some(Duration::from_millis(millis).min(self.max_delay))
    }
}

pub type SubscriptionId = u64;

/// Pub/sub abstraction every backend implements alongside its
/// `JobRepository` (§4.4).
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn connect(&self) -> AgendaResult<()>;
    async fn disconnect(&self) -> AgendaResult<()>;
    async fn publish(&self, event: JobSavedEvent) -> AgendaResult<()>;
    fn subscribe(&self, handler: Arc<dyn Fn(JobSavedEvent) + Send + Sync>) -> SubscriptionId;
    fn unsubscribe(&self, id: SubscriptionId);
    fn state(&self) -> ConnectionState;
}

/// Single-process channel: a `tokio::sync::broadcast` loop stands in for
/// the wire, so `connect`/`disconnect` only flip the reported state.
pub struct MemoryNotificationChannel {
    tx: broadcast::Sender<JobSavedEvent>,
    state: RwLock<ConnectionState>,
    subscribers: RwLock<Vec<(SubscriptionId, Arc<dyn Fn(JobSavedEvent) + Send + Sync>)>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl Default for MemoryNotificationChannel {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            tx,
            state: RwLock::new(ConnectionState::Disconnected),
            subscribers: RwLock::new(Vec::new()),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }
}

impl MemoryNotificationChannel {
    pub fn new() -> Arc<Self> {
        let channel = Arc::new(Self::default());
        channel.spawn_dispatch_loop();
        channel
    }

    fn spawn_dispatch_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut rx = this.tx.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        for (_, handler) in this.subscribers.read().iter() {
                            handler(event.clone());
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "notification channel subscriber lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

#[async_trait]
impl NotificationChannel for MemoryNotificationChannel {
    async fn connect(&self) -> AgendaResult<()> {
        *self.state.write() = ConnectionState::Connected;
        AgendaMetrics::channel_state(ConnectionState::Connected);
        debug!("notification channel connected");
        Ok(())
    }

    async fn disconnect(&self) -> AgendaResult<()> {
        *self.state.write() = ConnectionState::Disconnected;
        AgendaMetrics::channel_state(ConnectionState::Disconnected);
        Ok(())
    }

    async fn publish(&self, event: JobSavedEvent) -> AgendaResult<()> {
        let _ = self.tx.send(event);
        Ok(())
    }

    fn subscribe(&self, handler: Arc<dyn Fn(JobSavedEvent) + Send + Sync>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.subscribers.write().push((id, handler));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.write().retain(|(existing, _)| *existing != id);
    }

    fn state(&self) -> ConnectionState {
        *self.state.read()
    }
}

#[cfg(feature = "redis-backend")]
pub mod redis_channel {
    use super::{AgendaResult, Arc, ConnectionState, JobSavedEvent, NotificationChannel, ReconnectPolicy, SubscriptionId};
    use crate::error::AgendaError;
    use crate::metrics::AgendaMetrics;
    use deadpool_redis::Pool;
    use futures::StreamExt;
    use parking_lot::RwLock;
    use redis::AsyncCommands;
    use tracing::{error, info, warn};

    /// Redis `PUBLISH`/`SUBSCRIBE` channel with exponential-backoff
    /// reconnect, grounded on the same pool the repository uses.
    pub struct RedisNotificationChannel {
        pool: Pool,
        channel_name: String,
        state: RwLock<ConnectionState>,
        policy: ReconnectPolicy,
        subscribers: RwLock<Vec<(SubscriptionId, Arc<dyn Fn(JobSavedEvent) + Send + Sync>)>>,
        next_id: std::sync::atomic::AtomicU64,
    }

    impl RedisNotificationChannel {
        pub fn new(pool: Pool, channel_name: impl Into<String>, policy: ReconnectPolicy) -> Arc<Self> {
            Arc::new(Self {
                pool,
                channel_name: channel_name.into(),
                state: RwLock::new(ConnectionState::Disconnected),
                policy,
                subscribers: RwLock::new(Vec::new()),
                next_id: std::sync::atomic::AtomicU64::new(1),
            })
        }

        fn dispatch(&self, event: JobSavedEvent) {
            for (_, handler) in self.subscribers.read().iter() {
                handler(event.clone());
            }
        }

        async fn run_subscribe_loop(self: Arc<Self>) {
            let mut attempt = 0u32;
            loop {
                let connecting = if attempt == 0 { ConnectionState::Connecting } else { ConnectionState::Reconnecting };
                *self.state.write() = connecting;
                AgendaMetrics::channel_state(connecting);

                match self.pool.get().await {
                    Ok(conn) => {
                        let conn = conn.into_connection();
                        match conn.into_pubsub().await {
                            Ok(mut pubsub) => {
                                if let Err(e) = pubsub.subscribe(&self.channel_name).await {
                                    error!(error = %e, "failed to subscribe to notification channel");
                                } else {
                                    *self.state.write() = ConnectionState::Connected;
                                    AgendaMetrics::channel_state(ConnectionState::Connected);
                                    attempt = 0;
                                    info!(channel = %self.channel_name, "notification channel connected");
                                    let mut stream = pubsub.into_on_message();
                                    while let Some(msg) = stream.next().await {
                                        let Ok(payload) = msg.get_payload::<String>() else { continue };
                                        match serde_json::from_str::<JobSavedEvent>(&payload) {
                                            Ok(event) => self.dispatch(event),
                                            Err(e) => warn!(error = %e, "dropping malformed notification payload"),
                                        }
                                    }
                                    warn!("notification channel subscription stream ended, reconnecting");
                                }
                            }
                            Err(e) => error!(error = %e, "failed to enter pubsub mode"),
                        }
                    }
                    Err(e) => error!(error = %e, "failed to acquire redis connection for notification channel"),
                }

                attempt += 1;
                match self.policy.delay_for(attempt) {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => {
                        *self.state.write() = ConnectionState::Error;
                        AgendaMetrics::channel_state(ConnectionState::Error);
                        error!("notification channel reconnect attempts exhausted");
                        return;
                    }
                }
            }
        }
    }

    #[async_trait::async_trait]
    impl NotificationChannel for RedisNotificationChannel {
        async fn connect(&self) -> AgendaResult<()> {
            Ok(())
        }

        async fn disconnect(&self) -> AgendaResult<()> {
            *self.state.write() = ConnectionState::Disconnected;
            AgendaMetrics::channel_state(ConnectionState::Disconnected);
            Ok(())
        }

        async fn publish(&self, event: JobSavedEvent) -> AgendaResult<()> {
            let mut conn = self.pool.get().await?;
            let payload = serde_json::to_string(&event)?;
            let _: i64 = conn
                .publish(&self.channel_name, payload)
                .await
                .map_err(AgendaError::from)?;
            Ok(())
        }

        fn subscribe(&self, handler: Arc<dyn Fn(JobSavedEvent) + Send + Sync>) -> SubscriptionId {
            let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.subscribers.write().push((id, handler));
            id
        }

        fn unsubscribe(&self, id: SubscriptionId) {
            self.subscribers.write().retain(|(existing, _)| *existing != id);
        }

        fn state(&self) -> ConnectionState {
            *self.state.read()
        }
    }

    /// Spawns the background subscribe/reconnect loop; call once at startup.
    pub fn spawn(channel: Arc<RedisNotificationChannel>) {
        tokio::spawn(channel.run_subscribe_loop());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn reconnect_policy_doubles_until_capped() {
        let policy = ReconnectPolicy { initial_delay: Duration::from_millis(100), max_delay: Duration::from_secs(1), max_attempts: 5 };
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_for(10), None);
        assert_eq!(policy.delay_for(5), Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let channel = MemoryNotificationChannel::new();
        channel.connect().await.unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        channel.subscribe(Arc::new(move |_event| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        }));

        channel
            .publish(JobSavedEvent::new(JobId::new(), "ping", Some(Utc::now())))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
