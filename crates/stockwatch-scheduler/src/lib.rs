//! # StockWatch Scheduler
//!
//! Availability polling, alert dispatch and product persistence.
//!
//! ## Architecture
//! ```text
//! spawn_poller (cron: "*/10 * * * *")
//!   └── AvailabilityPoller::run_tick   (single-flight)
//!         ├── ProductStore::list_all   (SQLite / JSON / memory)
//!         ├── Prober::probe            per watch
//!         └── on restock → NotificationEngine::send_stock_alert
//!                           ├── RateLimiter   (per-recipient cooldown)
//!                           ├── Transport     (first attempt)
//!                           └── DeliveryQueue (one retry when throttled)
//! ```

pub mod cron;
pub mod engine;
pub mod notify;
pub mod persistence;
pub mod queue;
pub mod rate_limit;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cron::{CronSchedule, next_run_from_cron};
pub use engine::{AvailabilityPoller, TickOutcome, TickReport, spawn_poller};
pub use notify::{AlertRecord, DispatchOutcome, NotificationEngine, StockAlert, render_stock_alert};
pub use persistence::SqliteStore;
pub use queue::{DeliveryQueue, QueueStats, QueuedMessage};
pub use rate_limit::{RateLimiter, RatePermit};
pub use store::{JsonFileStore, MemoryStore};
