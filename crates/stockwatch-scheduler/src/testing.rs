//! In-process fakes for the transport and prober collaborators.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use async_trait::async_trait;
use stockwatch_core::error::{ProbeError, TransportError};
use stockwatch_core::traits::{Prober, SendOptions, SentMessage, Transport};
use stockwatch_core::types::RecipientId;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct SentRecord {
    pub recipient: RecipientId,
    pub text: String,
    pub options: SendOptions,
    pub message_id: i64,
}

/// Records every call; failures can be scripted per attempt.
#[derive(Default)]
pub struct FakeTransport {
    sent: Mutex<Vec<SentRecord>>,
    edits: Mutex<Vec<(RecipientId, i64, String)>>,
    answers: Mutex<Vec<(String, Option<String>)>>,
    failures: Mutex<VecDeque<TransportError>>,
    attempts: AtomicUsize,
    attempt_times: Mutex<Vec<tokio::time::Instant>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    next_id: AtomicI64,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next send attempt fails with `err`.
    pub fn fail_next(&self, err: TransportError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn sent(&self) -> Vec<SentRecord> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, recipient: RecipientId) -> Vec<SentRecord> {
        self.sent()
            .into_iter()
            .filter(|m| m.recipient == recipient)
            .collect()
    }

    pub fn edits(&self) -> Vec<(RecipientId, i64, String)> {
        self.edits.lock().unwrap().clone()
    }

    pub fn answers(&self) -> Vec<(String, Option<String>)> {
        self.answers.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// When each send attempt started, in order.
    pub fn attempt_times(&self) -> Vec<tokio::time::Instant> {
        self.attempt_times.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(
        &self,
        recipient: RecipientId,
        text: &str,
        options: &SendOptions,
    ) -> Result<SentMessage, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.attempt_times.lock().unwrap().push(tokio::time::Instant::now());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let message_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.sent.lock().unwrap().push(SentRecord {
            recipient,
            text: text.to_string(),
            options: options.clone(),
            message_id,
        });
        Ok(SentMessage { message_id })
    }

    async fn edit_message(
        &self,
        recipient: RecipientId,
        message_id: i64,
        text: &str,
    ) -> Result<(), TransportError> {
        self.edits
            .lock()
            .unwrap()
            .push((recipient, message_id, text.to_string()));
        Ok(())
    }

    async fn answer_action(
        &self,
        action_id: &str,
        text: Option<&str>,
    ) -> Result<(), TransportError> {
        self.answers
            .lock()
            .unwrap()
            .push((action_id.to_string(), text.map(str::to_string)));
        Ok(())
    }
}

/// Prober that replays a scripted sequence of results per URL.
#[derive(Default)]
pub struct ScriptedProber {
    script: Mutex<HashMap<String, VecDeque<Result<bool, ProbeError>>>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, url: &str, result: Result<bool, ProbeError>) {
        self.script
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, url: &str, location_code: &str) -> Result<bool, ProbeError> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), location_code.to_string()));
        self.script
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| Err(ProbeError::Http(format!("no scripted result for {url}"))))
    }
}

/// Prober whose calls block until the gate is opened.
pub struct GatedProber {
    gate: watch::Sender<bool>,
    started: AtomicUsize,
    available: bool,
}

impl GatedProber {
    pub fn new(available: bool) -> Self {
        Self {
            gate: watch::channel(false).0,
            started: AtomicUsize::new(0),
            available,
        }
    }

    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Waits until at least `n` calls have entered `probe`.
    pub async fn wait_started(&self, n: usize) {
        while self.started() < n {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl Prober for GatedProber {
    async fn probe(&self, _url: &str, _location_code: &str) -> Result<bool, ProbeError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.gate.subscribe();
        rx.wait_for(|open| *open)
            .await
            .map_err(|e| ProbeError::Http(e.to_string()))?;
        Ok(self.available)
    }
}
