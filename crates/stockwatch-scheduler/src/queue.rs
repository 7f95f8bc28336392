//! Delivery queue: ordered retry buffer for throttled alerts.
//!
//! Many producers, one consumer. The first `enqueue` on an idle queue spawns
//! the drain task; the drain exits when it finds the list empty. Both the
//! pending list and the `draining` flag sit behind the same lock.
//!
//! Every queued message gets exactly one more delivery attempt. A failure
//! while draining is logged and the message is discarded.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use stockwatch_core::traits::{Clock, SendOptions, Transport};
use stockwatch_core::types::RecipientId;
use tokio::sync::{Mutex, Notify};

/// A message waiting for its retry.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub recipient: RecipientId,
    pub text: String,
    pub options: SendOptions,
    pub enqueued_at: DateTime<Utc>,
}

/// Counters for queue activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub draining: bool,
    pub delivered: u64,
    pub failed: u64,
    pub rejected: u64,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueuedMessage>,
    draining: bool,
}

struct QueueInner {
    state: Mutex<QueueState>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    delay: Duration,
    capacity: usize,
    idle: Notify,
    delivered: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct DeliveryQueue {
    inner: Arc<QueueInner>,
}

impl DeliveryQueue {
    pub fn new(
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        delay: Duration,
        capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                transport,
                clock,
                delay,
                capacity,
                idle: Notify::new(),
                delivered: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
            }),
        }
    }

    /// Append a message and make sure a drain is running.
    /// Returns `false` if the queue is full and the message was dropped.
    pub async fn enqueue(
        &self,
        recipient: RecipientId,
        text: String,
        options: SendOptions,
    ) -> bool {
        let mut state = self.inner.state.lock().await;
        if state.pending.len() >= self.inner.capacity {
            self.inner.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "⚠️ Delivery queue full ({} pending), dropping message for {}",
                state.pending.len(),
                recipient
            );
            return false;
        }

        state.pending.push_back(QueuedMessage {
            recipient,
            text,
            options,
            enqueued_at: self.inner.clock.now(),
        });
        tracing::info!(
            "📥 Queued message for {} ({} pending)",
            recipient,
            state.pending.len()
        );

        if !state.draining {
            state.draining = true;
            tokio::spawn(drain(self.inner.clone()));
        }
        true
    }

    pub async fn pending(&self) -> usize {
        self.inner.state.lock().await.pending.len()
    }

    pub async fn is_draining(&self) -> bool {
        self.inner.state.lock().await.draining
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock().await;
        QueueStats {
            pending: state.pending.len(),
            draining: state.draining,
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
        }
    }

    /// Resolve once nothing is pending and no drain is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            {
                let state = self.inner.state.lock().await;
                if !state.draining && state.pending.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }
}

async fn drain(inner: Arc<QueueInner>) {
    tracing::debug!("📤 Delivery queue drain started");

    loop {
        let next = {
            let mut state = inner.state.lock().await;
            match state.pending.pop_front() {
                Some(message) => message,
                None => {
                    state.draining = false;
                    break;
                }
            }
        };

        match inner
            .transport
            .send(next.recipient, &next.text, &next.options)
            .await
        {
            Ok(_) => {
                inner.delivered.fetch_add(1, Ordering::Relaxed);
                tracing::info!("✅ Queued message sent to {}", next.recipient);
            }
            Err(e) => {
                inner.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!("❌ Failed to send queued message to {}: {e}", next.recipient);
            }
        }

        tokio::time::sleep(inner.delay).await;
    }

    tracing::debug!("📤 Delivery queue drained");
    inner.idle.notify_waiters();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTransport;
    use stockwatch_core::TransportError;
    use stockwatch_core::traits::SystemClock;

    fn queue(transport: Arc<FakeTransport>, capacity: usize) -> DeliveryQueue {
        DeliveryQueue::new(
            transport,
            Arc::new(SystemClock),
            Duration::from_millis(5),
            capacity,
        )
    }

    async fn settle(q: &DeliveryQueue) {
        tokio::time::timeout(Duration::from_secs(5), q.wait_idle())
            .await
            .expect("queue did not drain");
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let transport = Arc::new(FakeTransport::new());
        let q = queue(transport.clone(), 10);
        q.enqueue(RecipientId(1), "A".into(), SendOptions::default()).await;
        q.enqueue(RecipientId(2), "B".into(), SendOptions::default()).await;
        q.enqueue(RecipientId(1), "C".into(), SendOptions::default()).await;
        settle(&q).await;

        let texts: Vec<String> = transport.sent().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["A", "B", "C"]);
        assert_eq!(q.stats().await.delivered, 3);
        assert!(!q.is_draining().await);
    }

    #[tokio::test]
    async fn test_failed_message_not_retried() {
        let transport = Arc::new(FakeTransport::new());
        transport.fail_next(TransportError::Network("boom".into()));
        let q = queue(transport.clone(), 10);
        q.enqueue(RecipientId(7), "alert".into(), SendOptions::default()).await;
        settle(&q).await;

        assert_eq!(transport.attempts(), 1);
        assert!(transport.sent().is_empty());
        let stats = q.stats().await;
        assert_eq!((stats.failed, stats.delivered, stats.pending), (1, 0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_delay_after_failed_send() {
        let transport = Arc::new(FakeTransport::new());
        transport.fail_next(TransportError::Network("boom".into()));
        let delay = Duration::from_millis(1000);
        let q = DeliveryQueue::new(transport.clone(), Arc::new(SystemClock), delay, 10);
        q.enqueue(RecipientId(1), "A".into(), SendOptions::default()).await;
        q.enqueue(RecipientId(2), "B".into(), SendOptions::default()).await;
        settle(&q).await;

        let times = transport.attempt_times();
        assert_eq!(times.len(), 2);
        assert!(times[1] - times[0] >= delay);
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!((sent[0].recipient, sent[0].text.as_str()), (RecipientId(2), "B"));
    }

    #[tokio::test]
    async fn test_restarts_after_idle() {
        let transport = Arc::new(FakeTransport::new());
        let q = queue(transport.clone(), 10);
        q.enqueue(RecipientId(1), "first".into(), SendOptions::default()).await;
        settle(&q).await;
        assert!(!q.is_draining().await);

        q.enqueue(RecipientId(1), "second".into(), SendOptions::default()).await;
        settle(&q).await;
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_capacity_bound() {
        let transport = Arc::new(FakeTransport::new());
        let q = DeliveryQueue::new(
            transport.clone(),
            Arc::new(SystemClock),
            Duration::from_millis(50),
            1,
        );
        assert!(q.enqueue(RecipientId(1), "a".into(), SendOptions::default()).await);
        // The drain may already hold "a"; fill the slot again, then overflow.
        while q.pending().await > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(q.enqueue(RecipientId(1), "b".into(), SendOptions::default()).await);
        assert!(!q.enqueue(RecipientId(1), "c".into(), SendOptions::default()).await);
        settle(&q).await;
        assert_eq!(q.stats().await.rejected, 1);
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_producers_single_drain() {
        let transport = Arc::new(FakeTransport::new());
        let q = queue(transport.clone(), 100);
        let mut handles = Vec::new();
        for i in 0..20 {
            let q = q.clone();
            handles.push(tokio::spawn(async move {
                q.enqueue(RecipientId(i), format!("m{i}"), SendOptions::default()).await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap());
        }
        settle(&q).await;
        assert_eq!(transport.sent().len(), 20);
        assert_eq!(transport.max_in_flight(), 1);
    }
}
