//! Availability poller — the scheduler tick that probes every watch and
//! alerts subscribers on the unavailable→available edge.
//!
//! Per watch, per tick:
//! ```text
//!   Unknown|Unavailable --probe=true-->  Available    (alert every subscriber)
//!   *                   --probe=false--> Unavailable  (no alert)
//!   Available           --probe=true-->  Available    (no alert)
//! ```
//! A probe failure leaves the stored state untouched and the tick moves on.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use stockwatch_core::traits::{ProductStore, Prober};
use stockwatch_core::types::{Availability, ProductWatch};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::cron::CronSchedule;
use crate::notify::{DispatchOutcome, NotificationEngine};

/// Summary of one completed tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub products: usize,
    pub checked: usize,
    pub probe_failures: usize,
    pub store_failures: usize,
    pub restocked: usize,
    pub delivered: usize,
    pub suppressed: usize,
    pub queued: usize,
    pub dropped: usize,
}

impl TickReport {
    fn absorb(&mut self, check: WatchCheck) {
        match check {
            WatchCheck::ProbeFailed => self.probe_failures += 1,
            WatchCheck::Checked {
                restocked,
                outcomes,
                stored,
            } => {
                self.checked += 1;
                if restocked {
                    self.restocked += 1;
                }
                if !stored {
                    self.store_failures += 1;
                }
                for outcome in outcomes {
                    match outcome {
                        DispatchOutcome::Delivered => self.delivered += 1,
                        DispatchOutcome::Suppressed => self.suppressed += 1,
                        DispatchOutcome::Queued => self.queued += 1,
                        DispatchOutcome::Dropped => self.dropped += 1,
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TickOutcome {
    Completed(TickReport),
    /// Another tick was still running.
    Skipped,
}

enum WatchCheck {
    ProbeFailed,
    Checked {
        restocked: bool,
        outcomes: Vec<DispatchOutcome>,
        stored: bool,
    },
}

/// Resets the single-flight flag however the tick ends.
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct AvailabilityPoller {
    store: Arc<dyn ProductStore>,
    prober: Arc<dyn Prober>,
    notifier: Arc<NotificationEngine>,
    max_concurrent: usize,
    running: AtomicBool,
}

impl AvailabilityPoller {
    pub fn new(
        store: Arc<dyn ProductStore>,
        prober: Arc<dyn Prober>,
        notifier: Arc<NotificationEngine>,
    ) -> Self {
        Self {
            store,
            prober,
            notifier,
            max_concurrent: 1,
            running: AtomicBool::new(false),
        }
    }

    /// Probe up to `n` watches at once (default 1, sequential).
    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n.max(1);
        self
    }

    pub fn notifier(&self) -> &Arc<NotificationEngine> {
        &self.notifier
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Check every watch once.
    pub async fn run_tick(&self) -> TickOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("⏭️ Availability check still running, skipping this trigger");
            return TickOutcome::Skipped;
        }
        let _guard = TickGuard(&self.running);

        tracing::info!("🔄 Running scheduled availability check...");
        let pruned = self.notifier.rate_limiter().prune();
        if pruned > 0 {
            tracing::debug!("🧹 Pruned {} expired rate-limit entries", pruned);
        }

        let watches = match self.store.list_all().await {
            Ok(watches) => watches,
            Err(e) => {
                tracing::error!("❌ Failed to load products: {e}");
                return TickOutcome::Completed(TickReport::default());
            }
        };

        let mut report = TickReport {
            products: watches.len(),
            ..Default::default()
        };
        if watches.is_empty() {
            tracing::info!("No products to monitor in the database.");
            return TickOutcome::Completed(report);
        }

        let checks: Vec<WatchCheck> = stream::iter(watches)
            .map(|watch| self.check_watch(watch))
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;
        for check in checks {
            report.absorb(check);
        }

        tracing::info!(
            "✅ Completed all product checks: {}/{} checked, {} failed, {} restocked",
            report.checked,
            report.products,
            report.probe_failures,
            report.restocked
        );
        TickOutcome::Completed(report)
    }

    async fn check_watch(&self, watch: ProductWatch) -> WatchCheck {
        tracing::info!("Checking: {} for location {}", watch.url, watch.location_code);

        let observed = match self.prober.probe(&watch.url, &watch.location_code).await {
            Ok(available) => Availability::from_observed(available),
            Err(e) => {
                tracing::warn!("⚠️ Error checking {}: {e}", watch.url);
                return WatchCheck::ProbeFailed;
            }
        };

        let restocked = watch.last_availability.is_restock(observed);
        let mut outcomes = Vec::new();
        if restocked {
            tracing::info!(
                "📢 Sending stock alerts for {} to {} subscriber(s)",
                watch.url,
                watch.subscribers.len()
            );
            for recipient in &watch.subscribers {
                outcomes.push(
                    self.notifier
                        .send_stock_alert(*recipient, &watch.url, &watch.fingerprint)
                        .await,
                );
            }
        }

        let stored = match self.store.record_availability(&watch.key, observed).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("⚠️ Failed to save status for {}: {e}", watch.key);
                false
            }
        };

        tracing::info!(
            "{} ({}): {}",
            watch.url,
            watch.location_code,
            observed.label()
        );
        WatchCheck::Checked {
            restocked,
            outcomes,
            stored,
        }
    }
}

/// Run the poller on a cron schedule until `shutdown` flips to `true`.
///
/// Ticks run as tasks so a slow tick cannot delay the next trigger; the
/// single-flight guard decides whether a trigger does any work. Returns only
/// after every tick it started has finished.
pub async fn spawn_poller(
    poller: Arc<AvailabilityPoller>,
    schedule: CronSchedule,
    run_on_start: bool,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("📅 Product availability scheduler started");
    let mut ticks = JoinSet::new();

    if run_on_start {
        start_tick(&mut ticks, &poller);
    }

    loop {
        let now = Utc::now();
        let Some(next) = schedule.next_after(now) else {
            tracing::error!("❌ Cron schedule has no future run time, scheduler stopping");
            break;
        };
        let wait = (next - now).to_std().unwrap_or_default();
        tracing::debug!("⏰ Next availability check at {}", next.format("%H:%M:%S UTC"));

        tokio::select! {
            _ = tokio::time::sleep(wait) => start_tick(&mut ticks, &poller),
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    if !ticks.is_empty() {
        tracing::info!("⏳ Waiting for the running availability check to finish...");
    }
    while let Some(result) = ticks.join_next().await {
        if let Err(e) = result {
            tracing::error!("❌ Availability check task failed: {e}");
        }
    }
    tracing::info!("⏹️ Product availability scheduler stopped");
}

fn start_tick(ticks: &mut JoinSet<()>, poller: &Arc<AvailabilityPoller>) {
    while ticks.try_join_next().is_some() {}
    let poller = poller.clone();
    ticks.spawn(async move {
        poller.run_tick().await;
    });
}
