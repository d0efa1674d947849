//! agenda-rs - Distributed, persistent job scheduler
//!
//! A backend-agnostic job scheduler in the Agenda.js tradition:
//! - Cron, human-interval (`"5 minutes"`) and clock-phrase (`"3:30pm"`) recurrence
//! - Priority locking with per-name and global concurrency caps
//! - `unique`/`debounce` coalescing for noisy producers
//! - A pluggable persistent store and notification channel, with in-memory
//!   and Redis reference implementations
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                         Agenda instance                        │
//! ├────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │   define/now/schedule/every/cancel      (Agenda facade, §4.9)   │
//! │           │                                                     │
//! │           ▼                                                     │
//! │   ┌────────────┐        poll every        ┌────────────────┐   │
//! │   │ Registry   │◀──────process_every_ms───│   Scheduler    │   │
//! │   │(name→       │                          │ (poll + push   │   │
//! │   │ handler,    │──────lock-on-the-fly────▶│   flow, §4.7)  │   │
//! │   │ limits)     │                          └───────┬────────┘   │
//! │   └──────┬─────┘                                  │            │
//! │          │                                  claims/locks       │
//! │          │                                         ▼            │
//! │          │                          ┌─────────────────────────┐│
//! │          │                          │   JobRepository (§4.3)  ││
//! │          │                          │   memory | redis        ││
//! │          │                          └─────────────────────────┘│
//! │          ▼                                                      │
//! │   ┌────────────┐       dispatch       ┌────────────────┐        │
//! │   │PriorityJob │◀──────────────────── │    Executor    │        │
//! │   │  Queue     │──────────────────────▶│  (§4.8)       │        │
//! │   └────────────┘                       └───────┬────────┘       │
//! │                                                 │                │
//! │                                          AgendaEvent/Observer    │
//! │                                                 ▼                │
//! │                                          NotificationChannel     │
//! │                                          (cross-instance, §4.4)  │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use agenda_rs::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn run() -> AgendaResult<()> {
//! let repository: Arc<dyn JobRepository> = Arc::new(MemoryJobRepository::new());
//! let agenda = Agenda::new(repository, AgendaConfig::default());
//!
//! agenda.define_with("send-email", JobOptions::default(), |handle: JobHandle<'_>| async move {
//!     println!("sending to {:?}", handle.data());
//!     Ok(None)
//! });
//!
//! agenda.start().await?;
//! agenda.now("send-email", serde_json::json!({"to": "user@example.com"})).await?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod job;
pub mod listener;
pub mod metrics;
pub mod notification;
pub mod orchestrator;
pub mod queue;
pub mod recurrence;
pub mod registry;
pub mod repository;
pub mod scheduler;

pub use clock::{Clock, SystemClock};
pub use config::AgendaConfig;
pub use error::{AgendaError, AgendaResult};
pub use events::{AgendaEvent, Observer};
pub use job::{Debounce, DebounceStrategy, Job, JobId, JobType, Priority, Recurrence, Unique};
pub use notification::{ConnectionState, JobSavedEvent, NotificationChannel, ReconnectPolicy};
pub use orchestrator::{Agenda, DrainResult, RecurrenceOptions};
pub use queue::PriorityJobQueue;
pub use registry::{BoxedHandler, HandlerError, JobHandle, JobHandler, JobOptions, Registry};
pub use repository::{JobFilter, JobRepository, NameOverview, SortSpec};
pub use scheduler::{Scheduler, SchedulerLimits};

/// Re-export of the surface most callers need for defining and running jobs.
pub mod prelude {
    pub use crate::config::AgendaConfig;
    pub use crate::error::{AgendaError, AgendaResult};
    pub use crate::job::{Debounce, DebounceStrategy, Job, JobId, JobType, Priority, Recurrence, Unique};
    pub use crate::notification::{MemoryNotificationChannel, NotificationChannel};
    pub use crate::orchestrator::{Agenda, DrainResult, RecurrenceOptions};
    pub use crate::registry::{BoxedHandler, JobHandle, JobHandler, JobOptions};
    pub use crate::repository::memory::MemoryJobRepository;
    pub use crate::repository::{JobFilter, JobRepository, SortSpec};
}
