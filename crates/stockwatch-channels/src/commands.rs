//! Chat command handler — /start, /help, /monitor, /stop, /status and the
//! inline "stop monitoring" action on stock alerts.

use std::sync::{Arc, LazyLock};

use futures::{Stream, StreamExt};
use regex::Regex;
use stockwatch_core::error::Result;
use stockwatch_core::traits::{Prober, ProductStore, SendOptions, Transport};
use stockwatch_core::types::{Fingerprint, RecipientId, WatchKey};
use stockwatch_scheduler::notify::escape_markdown;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;

use crate::telegram::BotEvent;

static COMMAND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/([a-zA-Z]+)(?:@\w+)?(?:\s+(\S+))?(?:\s+(\S+))?").expect("static regex")
});

static LOCATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{6}$").expect("static regex"));

const START_TEXT: &str = "🤖 *Stock Monitor Bot Started!*

Available commands:
/monitor <URL> [PINCODE] - Start monitoring a product
/stop <URL> [PINCODE] - Stop monitoring a product
/status - Show current monitoring status
/help - Show this help message

Example:
`/monitor https://shop.amul.com/en/product/amul-high-protein-rose-lassi-200-ml-or-pack-of-30`";

const HELP_TEXT: &str = "🤖 *Telegram Stock Monitor Bot*

This bot tracks product availability and notifies you when an item is back in stock for a specific delivery pincode.

*Commands:*
/start - Initialize the bot
/monitor <URL> [PINCODE] - Add a product to the monitoring list. Pincode is optional.
/stop <URL> [PINCODE] - Remove a product from the monitoring list.
/status - Show all products currently being monitored.
/help - Show this help message.

*Example Usage:*
`/monitor https://shop.amul.com/en/product/amul-high-protein-rose-lassi-200-ml-or-pack-of-30 396191`";

/// A parsed chat command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Status,
    Monitor {
        url: String,
        location: Option<String>,
    },
    Stop {
        url: String,
        location: Option<String>,
    },
    /// `/monitor` or `/stop` without a URL.
    Usage(&'static str),
}

impl Command {
    /// Parse a message text. `None` for anything that is not a known command.
    pub fn parse(text: &str) -> Option<Self> {
        let caps = COMMAND_RE.captures(text.trim())?;
        let name = caps.get(1)?.as_str().to_ascii_lowercase();
        let url = caps.get(2).map(|m| m.as_str().to_string());
        // A trailing argument that is not a 6-digit code is ignored.
        let location = caps
            .get(3)
            .map(|m| m.as_str())
            .filter(|code| LOCATION_RE.is_match(code))
            .map(str::to_string);

        match name.as_str() {
            "start" => Some(Command::Start),
            "help" => Some(Command::Help),
            "status" => Some(Command::Status),
            "monitor" => Some(match url {
                Some(url) => Command::Monitor { url, location },
                None => Command::Usage("/monitor <URL> [PINCODE]"),
            }),
            "stop" => Some(match url {
                Some(url) => Command::Stop { url, location },
                None => Command::Usage("/stop <URL> [PINCODE]"),
            }),
            _ => None,
        }
    }
}

/// `http`/`https` URLs with a host.
pub fn is_valid_url(url: &str) -> bool {
    reqwest::Url::parse(url)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.has_host())
        .unwrap_or(false)
}

/// Turns chat events into store updates and replies.
pub struct CommandHandler {
    store: Arc<dyn ProductStore>,
    prober: Arc<dyn Prober>,
    transport: Arc<dyn Transport>,
    default_location: String,
}

impl CommandHandler {
    pub fn new(
        store: Arc<dyn ProductStore>,
        prober: Arc<dyn Prober>,
        transport: Arc<dyn Transport>,
        default_location: impl Into<String>,
    ) -> Self {
        Self {
            store,
            prober,
            transport,
            default_location: default_location.into(),
        }
    }

    /// Handle one event. Errors are store or reply failures.
    pub async fn handle(&self, event: BotEvent) -> Result<()> {
        match event {
            BotEvent::Message { chat, text } => match Command::parse(&text) {
                Some(command) => self.handle_command(chat, command).await,
                None => Ok(()),
            },
            BotEvent::Action {
                action_id,
                chat,
                message_id,
                data,
            } => self.handle_action(&action_id, chat, message_id, &data).await,
        }
    }

    pub async fn handle_command(&self, chat: RecipientId, command: Command) -> Result<()> {
        tracing::debug!("💬 {chat}: {command:?}");
        match command {
            Command::Start => self.reply_markdown(chat, START_TEXT).await,
            Command::Help => self.reply_markdown(chat, HELP_TEXT).await,
            Command::Usage(usage) => self.reply(chat, &format!("Usage: {usage}")).await,
            Command::Status => self.status(chat).await,
            Command::Monitor { url, location } => {
                let location = location.unwrap_or_else(|| self.default_location.clone());
                self.monitor(chat, &url, &location).await
            }
            Command::Stop { url, location } => {
                let location = location.unwrap_or_else(|| self.default_location.clone());
                self.stop(chat, &url, &location).await
            }
        }
    }

    async fn monitor(&self, chat: RecipientId, url: &str, location: &str) -> Result<()> {
        if !is_valid_url(url) {
            return self.reply(chat, "❌ Invalid URL format").await;
        }

        if !self.store.upsert_subscriber(url, location, chat).await? {
            return self
                .reply(
                    chat,
                    &format!("ℹ️ This product is already being monitored for pincode {location}."),
                )
                .await;
        }
        tracing::info!("➕ {chat} started monitoring {url} ({location})");

        self.reply_markdown(
            chat,
            &format!(
                "✅ Started monitoring:\n{}\nfor pincode: *{}*",
                escape_markdown(url),
                escape_markdown(location)
            ),
        )
        .await?;

        // Report only; the poller owns the stored state.
        match self.prober.probe(url, location).await {
            Ok(available) => {
                let status = if available { "✅ In Stock" } else { "❌ Out of Stock" };
                self.reply(chat, &format!("Current status: {status}")).await
            }
            Err(e) => {
                tracing::warn!("⚠️ Initial check of {url} failed: {e}");
                self.reply(chat, "⚠️ Error during the initial check. The bot will keep trying.")
                    .await
            }
        }
    }

    async fn stop(&self, chat: RecipientId, url: &str, location: &str) -> Result<()> {
        let key = WatchKey::new(url, location);
        let removed = self.store.remove_subscriber(&key, chat).await?;
        if removed && self.store.delete_if_no_subscribers(&key).await? {
            tracing::info!("🗑️ Removed unmonitored product {key}");
        }

        let text = if removed {
            tracing::info!("➖ {chat} stopped monitoring {url} ({location})");
            format!(
                "🛑 Stopped monitoring:\n{}\nfor pincode: *{}*",
                escape_markdown(url),
                escape_markdown(location)
            )
        } else {
            format!(
                "❌ You were not monitoring this product for pincode *{}*.",
                escape_markdown(location)
            )
        };
        self.reply_markdown(chat, &text).await
    }

    async fn status(&self, chat: RecipientId) -> Result<()> {
        let watches = self.store.find_by_subscriber(chat).await?;
        if watches.is_empty() {
            return self
                .reply(chat, "📋 You are not currently monitoring any products.")
                .await;
        }

        let mut text = String::from("📋 *Your Monitored Products:*\n\n");
        for watch in &watches {
            text.push_str(&format!(
                "*URL*: {}\n*Pincode*: {}\n*Status*: {}\n\n",
                escape_markdown(&watch.url),
                escape_markdown(&watch.location_code),
                watch.last_availability.label()
            ));
        }
        self.reply_markdown(chat, text.trim_end()).await
    }

    async fn handle_action(
        &self,
        action_id: &str,
        chat: RecipientId,
        message_id: Option<i64>,
        data: &str,
    ) -> Result<()> {
        let Some(fingerprint) = Fingerprint::from_stop_action(data) else {
            tracing::debug!("Ignoring unknown action {data:?}");
            self.transport.answer_action(action_id, None).await?;
            return Ok(());
        };

        let Some(watch) = self.store.find_by_fingerprint(&fingerprint).await? else {
            self.transport
                .answer_action(action_id, Some("This product is no longer monitored."))
                .await?;
            return Ok(());
        };

        if !self.store.remove_subscriber(&watch.key, chat).await? {
            self.transport
                .answer_action(action_id, Some("You were not monitoring this product."))
                .await?;
            return Ok(());
        }
        if self.store.delete_if_no_subscribers(&watch.key).await? {
            tracing::info!("🗑️ Removed unmonitored product {}", watch.key);
        }
        tracing::info!("➖ {chat} stopped monitoring {} via alert button", watch.url);

        if let Some(message_id) = message_id
            && let Err(e) = self
                .transport
                .edit_message(chat, message_id, &format!("🛑 Stopped monitoring:\n{}", watch.url))
                .await
        {
            tracing::warn!("⚠️ Could not edit alert message {message_id}: {e}");
        }
        self.transport
            .answer_action(action_id, Some("Stopped monitoring"))
            .await?;
        Ok(())
    }

    async fn reply(&self, chat: RecipientId, text: &str) -> Result<()> {
        self.transport
            .send(chat, text, &SendOptions::default())
            .await?;
        Ok(())
    }

    async fn reply_markdown(&self, chat: RecipientId, text: &str) -> Result<()> {
        self.transport.send(chat, text, &SendOptions::markdown()).await?;
        Ok(())
    }
}

/// Handle chat events until the stream ends or `shutdown` flips to `true`.
///
/// Each event runs as its own task, at most `max_concurrent` at a time, so a
/// slow page check for one chat does not hold up the others. Events from one
/// chat may complete out of order. Returns after the running handlers finish.
pub async fn serve<S>(
    handler: Arc<CommandHandler>,
    mut events: S,
    mut shutdown: watch::Receiver<bool>,
    max_concurrent: usize,
) where
    S: Stream<Item = BotEvent> + Unpin,
{
    let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                while tasks.try_join_next().is_some() {}
                let handler = handler.clone();
                let permits = permits.clone();
                tasks.spawn(async move {
                    let Ok(_permit) = permits.acquire_owned().await else { return };
                    if let Err(e) = handler.handle(event).await {
                        tracing::error!("❌ Command failed: {e}");
                    }
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    if !tasks.is_empty() {
        tracing::info!("⏳ Waiting for {} chat command(s) to finish...", tasks.len());
    }
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            tracing::error!("❌ Command task failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockwatch_core::ProbeError;
    use stockwatch_core::types::Availability;
    use stockwatch_scheduler::store::MemoryStore;
    use stockwatch_scheduler::testing::{FakeTransport, GatedProber, ScriptedProber};
    use std::time::Duration;

    const URL: &str = "https://shop.example/en/product/rose-lassi";

    struct Harness {
        handler: CommandHandler,
        store: Arc<MemoryStore>,
        prober: Arc<ScriptedProber>,
        transport: Arc<FakeTransport>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let prober = Arc::new(ScriptedProber::new());
        let transport = Arc::new(FakeTransport::new());
        let handler =
            CommandHandler::new(store.clone(), prober.clone(), transport.clone(), "396191");
        Harness {
            handler,
            store,
            prober,
            transport,
        }
    }

    async fn say(h: &Harness, chat: i64, text: &str) {
        h.handler
            .handle(BotEvent::Message {
                chat: RecipientId(chat),
                text: text.into(),
            })
            .await
            .unwrap();
    }

    fn texts(h: &Harness) -> Vec<String> {
        h.transport.sent().into_iter().map(|m| m.text).collect()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("/start"), Some(Command::Start));
        assert_eq!(Command::parse("/help@StockBot"), Some(Command::Help));
        assert_eq!(
            Command::parse(&format!("/monitor {URL} 110001")),
            Some(Command::Monitor {
                url: URL.into(),
                location: Some("110001".into())
            })
        );
        assert_eq!(
            Command::parse(&format!("/stop {URL} 1234")),
            Some(Command::Stop {
                url: URL.into(),
                location: None
            })
        );
        assert!(matches!(Command::parse("/monitor"), Some(Command::Usage(_))));
        assert_eq!(Command::parse("hello"), None);
        assert_eq!(Command::parse("/unknown"), None);
    }

    #[test]
    fn test_url_validation() {
        assert!(is_valid_url(URL));
        assert!(is_valid_url("http://shop.example"));
        assert!(!is_valid_url("ftp://shop.example/x"));
        assert!(!is_valid_url("not a url"));
    }

    #[tokio::test]
    async fn test_monitor_subscribes_and_reports_status() {
        let h = harness();
        h.prober.push(URL, Ok(false));
        say(&h, 42, &format!("/monitor {URL}")).await;

        let watch = h
            .store
            .get(&WatchKey::new(URL, "396191"))
            .await
            .unwrap()
            .unwrap();
        assert!(watch.subscribers.contains(&RecipientId(42)));
        // The initial probe is reported but not stored.
        assert_eq!(watch.last_availability, Availability::Unknown);

        let texts = texts(&h);
        assert_eq!(texts.len(), 2);
        assert!(texts[0].starts_with("✅ Started monitoring"));
        assert!(texts[0].contains("*396191*"));
        assert_eq!(texts[1], "Current status: ❌ Out of Stock");
    }

    #[tokio::test]
    async fn test_monitor_twice_reports_already_monitoring() {
        let h = harness();
        h.prober.push(URL, Ok(true));
        say(&h, 42, &format!("/monitor {URL} 110001")).await;
        say(&h, 42, &format!("/monitor {URL} 110001")).await;

        let texts = texts(&h);
        assert_eq!(
            texts.last().unwrap(),
            "ℹ️ This product is already being monitored for pincode 110001."
        );
        assert_eq!(h.prober.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_monitor_probe_failure_still_subscribes() {
        let h = harness();
        h.prober.push(URL, Err(ProbeError::Timeout));
        say(&h, 1, &format!("/monitor {URL}")).await;
        assert_eq!(h.store.list_all().await.unwrap().len(), 1);
        assert!(texts(&h)[1].starts_with("⚠️ Error during the initial check"));
    }

    #[tokio::test]
    async fn test_monitor_invalid_url() {
        let h = harness();
        say(&h, 1, "/monitor notaurl").await;
        assert_eq!(texts(&h), vec!["❌ Invalid URL format"]);
        assert!(h.store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_removes_and_deletes_empty_watch() {
        let h = harness();
        h.store.upsert_subscriber(URL, "396191", RecipientId(42)).await.unwrap();
        say(&h, 42, &format!("/stop {URL}")).await;
        assert!(h.store.list_all().await.unwrap().is_empty());
        assert!(texts(&h)[0].starts_with("🛑 Stopped monitoring"));

        say(&h, 42, &format!("/stop {URL}")).await;
        assert!(texts(&h)[1].starts_with("❌ You were not monitoring"));
    }

    #[tokio::test]
    async fn test_stop_keeps_watch_with_other_subscribers() {
        let h = harness();
        h.store.upsert_subscriber(URL, "396191", RecipientId(1)).await.unwrap();
        h.store.upsert_subscriber(URL, "396191", RecipientId(2)).await.unwrap();
        say(&h, 1, &format!("/stop {URL}")).await;
        let all = h.store.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].subscribers.len(), 1);
    }

    #[tokio::test]
    async fn test_status_lists_only_callers_watches() {
        let h = harness();
        h.store.upsert_subscriber(URL, "396191", RecipientId(1)).await.unwrap();
        h.store
            .upsert_subscriber("https://shop.example/p/other", "396191", RecipientId(2))
            .await
            .unwrap();
        h.store
            .record_availability(&WatchKey::new(URL, "396191"), Availability::Available)
            .await
            .unwrap();

        say(&h, 1, "/status").await;
        say(&h, 3, "/status").await;
        let sent = texts(&h);
        assert!(sent[0].contains("rose-lassi"));
        assert!(sent[0].contains("✅ In Stock"));
        assert!(!sent[0].contains("other"));
        assert_eq!(sent[1], "📋 You are not currently monitoring any products.");
    }

    #[tokio::test]
    async fn test_start_and_help() {
        let h = harness();
        say(&h, 1, "/start").await;
        say(&h, 1, "/help").await;
        let sent = h.transport.sent();
        assert!(sent[0].text.contains("Stock Monitor Bot Started"));
        assert!(sent[1].text.contains("/monitor <URL> [PINCODE]"));
        assert_eq!(sent[1].options, SendOptions::markdown());
    }

    #[tokio::test]
    async fn test_stop_action_unsubscribes_and_edits_alert() {
        let h = harness();
        h.store.upsert_subscriber(URL, "396191", RecipientId(42)).await.unwrap();
        let fp = WatchKey::new(URL, "396191").fingerprint();

        h.handler
            .handle(BotEvent::Action {
                action_id: "cb1".into(),
                chat: RecipientId(42),
                message_id: Some(9),
                data: fp.stop_action(),
            })
            .await
            .unwrap();

        assert!(h.store.list_all().await.unwrap().is_empty());
        let edits = h.transport.edits();
        assert_eq!(edits.len(), 1);
        assert_eq!((edits[0].0, edits[0].1), (RecipientId(42), 9));
        assert_eq!(
            h.transport.answers(),
            vec![("cb1".to_string(), Some("Stopped monitoring".to_string()))]
        );
    }

    #[tokio::test]
    async fn test_stop_action_for_unknown_product() {
        let h = harness();
        h.handler
            .handle(BotEvent::Action {
                action_id: "cb2".into(),
                chat: RecipientId(42),
                message_id: Some(9),
                data: "stop_ffffffffffff".into(),
            })
            .await
            .unwrap();
        assert!(h.transport.edits().is_empty());
        assert_eq!(
            h.transport.answers()[0].1.as_deref(),
            Some("This product is no longer monitored.")
        );
    }

    #[tokio::test]
    async fn test_slow_monitor_does_not_block_other_chats() {
        let store = Arc::new(MemoryStore::new());
        let prober = Arc::new(GatedProber::new(true));
        let transport = Arc::new(FakeTransport::new());
        let handler = Arc::new(CommandHandler::new(
            store.clone(),
            prober.clone(),
            transport.clone(),
            "396191",
        ));
        let events = futures::stream::iter([
            BotEvent::Message {
                chat: RecipientId(1),
                text: format!("/monitor {URL}"),
            },
            BotEvent::Message {
                chat: RecipientId(2),
                text: "/start".into(),
            },
        ])
        .chain(futures::stream::pending());
        let (tx, rx) = watch::channel(false);
        let server = tokio::spawn(serve(handler, Box::pin(events), rx, 4));

        tokio::time::timeout(Duration::from_secs(5), prober.wait_started(1))
            .await
            .expect("/monitor never checked the page");
        // The page check stays blocked until the gate opens.
        tokio::time::timeout(Duration::from_secs(5), async {
            while transport.sent_to(RecipientId(2)).is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("/start was not answered while /monitor was pending");

        prober.open();
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("serve did not stop")
            .unwrap();

        let replies: Vec<String> = transport
            .sent_to(RecipientId(1))
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(replies.last().map(String::as_str), Some("Current status: ✅ In Stock"));
        assert!(store.get(&WatchKey::new(URL, "396191")).await.unwrap().is_some());
    }
}
