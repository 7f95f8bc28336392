//! Stock alert dispatch.
//!
//! `NotificationEngine` owns the per-recipient rate limiter and the retry
//! queue. A call to [`NotificationEngine::send_stock_alert`] produces at most
//! one direct send; a throttled send is handed to the queue instead. Transport
//! errors never leave this module, they come back as a [`DispatchOutcome`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use stockwatch_core::config::NotifyConfig;
use stockwatch_core::traits::{Clock, InlineButton, SendOptions, Transport};
use stockwatch_core::types::{Fingerprint, RecipientId};

use crate::queue::DeliveryQueue;
use crate::rate_limit::RateLimiter;

const HISTORY_LIMIT: usize = 100;

/// What happened to one alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DispatchOutcome {
    /// Sent directly.
    Delivered,
    /// Recipient is inside its cooldown window; nothing sent.
    Suppressed,
    /// Throttled by the transport; handed to the delivery queue.
    Queued,
    /// Failed and not retried.
    Dropped,
}

/// Rendered alert body and keyboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockAlert {
    pub text: String,
    pub options: SendOptions,
}

/// One entry of the dispatch history.
#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    pub recipient: RecipientId,
    pub url: String,
    pub outcome: DispatchOutcome,
    pub timestamp: DateTime<Utc>,
}

/// Best-effort humanised product name from the last URL path segment.
pub fn product_name(url: &str) -> String {
    let slug = match reqwest::Url::parse(url) {
        Ok(parsed) => parsed
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .unwrap_or_default()
            .to_string(),
        Err(_) => url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string(),
    };

    let name = slug
        .split('-')
        .filter(|w| !w.is_empty())
        .map(capitalize)
        .collect::<Vec<_>>()
        .join(" ");

    if name.is_empty() {
        "Product".to_string()
    } else {
        name
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Escape Telegram MarkdownV1 special characters.
pub fn escape_markdown(s: &str) -> String {
    s.replace('_', "\\_")
        .replace('*', "\\*")
        .replace('[', "\\[")
        .replace('`', "\\`")
}

/// Build the alert message with its "Buy Now" and "Stop Monitoring" buttons.
pub fn render_stock_alert(url: &str, fingerprint: &Fingerprint) -> StockAlert {
    let text = format!(
        "🎉 *STOCK ALERT!* 🎉\n\n\
         📦 *{}* is now available!\n\n\
         🔗 {}\n\n\
         ⚡ *Act fast!* Popular items sell out quickly.\n\n\
         Tap 🛑 below or use /stop to stop monitoring this product.",
        escape_markdown(&product_name(url)),
        escape_markdown(url),
    );

    let options = SendOptions::markdown().with_row(vec![
        InlineButton::url("🛒 Buy Now", url),
        InlineButton::callback("🛑 Stop Monitoring", &fingerprint.stop_action()),
    ]);

    StockAlert { text, options }
}

pub struct NotificationEngine {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    limiter: RateLimiter,
    queue: DeliveryQueue,
    history: Mutex<VecDeque<AlertRecord>>,
}

impl NotificationEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        config: &NotifyConfig,
    ) -> Self {
        let limiter = RateLimiter::new(config.cooldown(), clock.clone());
        let queue = DeliveryQueue::new(
            transport.clone(),
            clock.clone(),
            config.drain_delay(),
            config.queue_capacity,
        );
        Self {
            transport,
            clock,
            limiter,
            queue,
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Alert `recipient` that `url` is back in stock.
    pub async fn send_stock_alert(
        &self,
        recipient: RecipientId,
        url: &str,
        fingerprint: &Fingerprint,
    ) -> DispatchOutcome {
        let Some(permit) = self.limiter.try_acquire(recipient) else {
            tracing::info!("⏳ Rate limited notification for user {}", recipient);
            return self.record(recipient, url, DispatchOutcome::Suppressed);
        };

        let alert = render_stock_alert(url, fingerprint);

        let outcome = match self
            .transport
            .send(recipient, &alert.text, &alert.options)
            .await
        {
            Ok(_) => {
                tracing::info!("✅ Stock alert sent to {}", recipient);
                DispatchOutcome::Delivered
            }
            Err(e) => {
                self.limiter.release(permit);
                tracing::error!("❌ Failed to send stock alert to {}: {e}", recipient);
                if e.is_throttled() {
                    if self.queue.enqueue(recipient, alert.text, alert.options).await {
                        DispatchOutcome::Queued
                    } else {
                        DispatchOutcome::Dropped
                    }
                } else {
                    DispatchOutcome::Dropped
                }
            }
        };

        self.record(recipient, url, outcome)
    }

    fn record(
        &self,
        recipient: RecipientId,
        url: &str,
        outcome: DispatchOutcome,
    ) -> DispatchOutcome {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(AlertRecord {
            recipient,
            url: url.to_string(),
            outcome,
            timestamp: self.clock.now(),
        });
        // Ring buffer: keep the last HISTORY_LIMIT
        while history.len() > HISTORY_LIMIT {
            history.pop_front();
        }
        outcome
    }

    /// Recent dispatch results, oldest first.
    pub fn history(&self) -> Vec<AlertRecord> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }
}
