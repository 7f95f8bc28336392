//! Telegram Bot channel — long polling + message sending via Bot API.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::Stream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use stockwatch_core::config::TelegramConfig;
use stockwatch_core::error::{Result, StockWatchError, TransportError};
use stockwatch_core::traits::{ButtonAction, ParseMode, SendOptions, SentMessage, Transport};
use stockwatch_core::types::RecipientId;
use tokio::sync::watch;

/// Seconds Telegram holds a getUpdates request open.
const LONG_POLL_TIMEOUT: u64 = 30;

/// Something a user did in a chat with the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotEvent {
    /// A text message.
    Message { chat: RecipientId, text: String },
    /// An inline keyboard button press.
    Action {
        action_id: String,
        chat: RecipientId,
        message_id: Option<i64>,
        data: String,
    },
}

/// Telegram Bot API client.
pub struct TelegramChannel {
    config: TelegramConfig,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(config: TelegramConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| StockWatchError::Channel(format!("HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token,
            method
        )
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &serde_json::Value,
        timeout: Option<Duration>,
    ) -> std::result::Result<T, TransportError> {
        let mut request = self.client.post(self.api_url(method)).json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Network(format!("{method} failed: {e}")))?;

        let status = response.status().as_u16();
        match response.json::<TelegramApiResponse<T>>().await {
            Ok(body) => body.into_result(status),
            Err(_) if status == 429 => Err(TransportError::Throttled { retry_after: None }),
            Err(e) => Err(TransportError::Network(format!(
                "Invalid {method} response (HTTP {status}): {e}"
            ))),
        }
    }

    /// Get bot info.
    pub async fn get_me(&self) -> Result<TelegramUser> {
        Ok(self.call("getMe", &serde_json::json!({}), None).await?)
    }

    /// Fetch updates after `offset` using long polling.
    pub async fn get_updates(&self, offset: i64) -> Result<Vec<TelegramUpdate>> {
        let body = serde_json::json!({
            "offset": offset,
            "timeout": LONG_POLL_TIMEOUT,
            "allowed_updates": ["message", "callback_query"],
        });
        let timeout = Duration::from_secs(LONG_POLL_TIMEOUT + self.config.request_timeout_secs);
        Ok(self.call("getUpdates", &body, Some(timeout)).await?)
    }

    /// Start polling loop — returns a stream of bot events.
    /// The loop ends when `shutdown` flips to `true` or the stream is dropped.
    pub fn start_polling(
        self: std::sync::Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> TelegramPollingStream {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            let channel = self;
            let mut offset = 0;
            tracing::info!("📡 Telegram polling loop started");

            loop {
                let updates = tokio::select! {
                    updates = channel.get_updates(offset) => updates,
                    _ = shutdown.changed() => break,
                };

                match updates {
                    Ok(updates) => {
                        for update in updates {
                            offset = offset.max(update.update_id + 1);
                            if let Some(event) = update.to_event()
                                && tx.send(event).is_err()
                            {
                                tracing::info!("Telegram polling stopped (receiver dropped)");
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!("❌ Telegram polling error: {e}");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }

                if *shutdown.borrow() {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(channel.config.poll_interval)).await;
            }
            tracing::info!("⏹️ Telegram polling loop stopped");
        });

        TelegramPollingStream { rx }
    }
}

/// Stream of incoming bot events from polling.
pub struct TelegramPollingStream {
    rx: tokio::sync::mpsc::UnboundedReceiver<BotEvent>,
}

impl Stream for TelegramPollingStream {
    type Item = BotEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// `sendMessage` request body.
pub fn send_message_payload(chat_id: i64, text: &str, options: &SendOptions) -> serde_json::Value {
    let mut body = serde_json::json!({
        "chat_id": chat_id,
        "text": text,
    });
    if let Some(mode) = options.parse_mode {
        body["parse_mode"] = match mode {
            ParseMode::Markdown => "Markdown",
            ParseMode::Html => "HTML",
        }
        .into();
    }
    if options.disable_preview {
        body["disable_web_page_preview"] = true.into();
    }
    if !options.buttons.is_empty() {
        let keyboard: Vec<Vec<serde_json::Value>> = options
            .buttons
            .iter()
            .map(|row| {
                row.iter()
                    .map(|button| match &button.action {
                        ButtonAction::Url(url) => {
                            serde_json::json!({ "text": button.text, "url": url })
                        }
                        ButtonAction::Callback(data) => {
                            serde_json::json!({ "text": button.text, "callback_data": data })
                        }
                    })
                    .collect()
            })
            .collect();
        body["reply_markup"] = serde_json::json!({ "inline_keyboard": keyboard });
    }
    body
}

#[async_trait]
impl Transport for TelegramChannel {
    async fn send(
        &self,
        recipient: RecipientId,
        text: &str,
        options: &SendOptions,
    ) -> std::result::Result<SentMessage, TransportError> {
        let body = send_message_payload(recipient.0, text, options);
        let message: TelegramMessage = self.call("sendMessage", &body, None).await?;
        Ok(SentMessage {
            message_id: message.message_id,
        })
    }

    async fn edit_message(
        &self,
        recipient: RecipientId,
        message_id: i64,
        text: &str,
    ) -> std::result::Result<(), TransportError> {
        let body = serde_json::json!({
            "chat_id": recipient.0,
            "message_id": message_id,
            "text": text,
        });
        // Result is the edited Message, or `true` for inline messages.
        let _: serde_json::Value = self.call("editMessageText", &body, None).await?;
        Ok(())
    }

    async fn answer_action(
        &self,
        action_id: &str,
        text: Option<&str>,
    ) -> std::result::Result<(), TransportError> {
        let mut body = serde_json::json!({ "callback_query_id": action_id });
        if let Some(text) = text {
            body["text"] = text.into();
        }
        let _: bool = self.call("answerCallbackQuery", &body, None).await?;
        Ok(())
    }
}

// --- Telegram API Types ---

#[derive(Debug, Deserialize)]
pub struct TelegramApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub description: Option<String>,
    pub error_code: Option<u16>,
    pub parameters: Option<ResponseParameters>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseParameters {
    pub retry_after: Option<u64>,
}

impl<T> TelegramApiResponse<T> {
    /// Map an API envelope to the payload or a [`TransportError`].
    pub fn into_result(self, http_status: u16) -> std::result::Result<T, TransportError> {
        if self.ok
            && let Some(result) = self.result
        {
            return Ok(result);
        }

        let code = self.error_code.unwrap_or(http_status);
        let retry_after = self.parameters.and_then(|p| p.retry_after);
        if code == 429 || retry_after.is_some() {
            return Err(TransportError::Throttled { retry_after });
        }
        Err(TransportError::Api {
            code,
            description: self
                .description
                .unwrap_or_else(|| "missing result".to_string()),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    pub message: Option<TelegramMessage>,
    pub callback_query: Option<TelegramCallbackQuery>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub from: Option<TelegramUser>,
    pub chat: TelegramChat,
    pub text: Option<String>,
    pub date: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramCallbackQuery {
    pub id: String,
    pub from: TelegramUser,
    pub message: Option<TelegramMessage>,
    pub data: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    pub is_bot: bool,
    pub first_name: String,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: String,
}

impl TelegramUpdate {
    /// Convert to a [`BotEvent`], skipping bots and non-text updates.
    pub fn to_event(&self) -> Option<BotEvent> {
        if let Some(msg) = &self.message {
            if msg.from.as_ref().is_some_and(|f| f.is_bot) {
                return None;
            }
            return Some(BotEvent::Message {
                chat: RecipientId(msg.chat.id),
                text: msg.text.clone()?,
            });
        }

        let query = self.callback_query.as_ref()?;
        // Older alerts can lose their message; fall back to the presser's chat.
        let chat = query
            .message
            .as_ref()
            .map(|m| m.chat.id)
            .unwrap_or(query.from.id);
        Some(BotEvent::Action {
            action_id: query.id.clone(),
            chat: RecipientId(chat),
            message_id: query.message.as_ref().map(|m| m.message_id),
            data: query.data.clone()?,
        })
    }
}
