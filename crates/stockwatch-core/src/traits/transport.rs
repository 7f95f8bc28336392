//! Messaging transport interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::types::RecipientId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParseMode {
    Markdown,
    Html,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ButtonAction {
    Url(String),
    Callback(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineButton {
    pub text: String,
    pub action: ButtonAction,
}

impl InlineButton {
    pub fn url(text: &str, url: &str) -> Self {
        Self {
            text: text.to_string(),
            action: ButtonAction::Url(url.to_string()),
        }
    }

    pub fn callback(text: &str, data: &str) -> Self {
        Self {
            text: text.to_string(),
            action: ButtonAction::Callback(data.to_string()),
        }
    }
}

/// Formatting and keyboard for an outbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOptions {
    pub parse_mode: Option<ParseMode>,
    pub disable_preview: bool,
    /// Inline keyboard rows.
    pub buttons: Vec<Vec<InlineButton>>,
}

impl SendOptions {
    pub fn markdown() -> Self {
        Self {
            parse_mode: Some(ParseMode::Markdown),
            ..Default::default()
        }
    }

    pub fn with_row(mut self, row: Vec<InlineButton>) -> Self {
        self.buttons.push(row);
        self
    }
}

/// Handle of a delivered message, used for later edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentMessage {
    pub message_id: i64,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        recipient: RecipientId,
        text: &str,
        options: &SendOptions,
    ) -> Result<SentMessage, TransportError>;

    async fn edit_message(
        &self,
        recipient: RecipientId,
        message_id: i64,
        text: &str,
    ) -> Result<(), TransportError>;

    /// Acknowledge an inline action (Telegram callback query).
    async fn answer_action(
        &self,
        action_id: &str,
        text: Option<&str>,
    ) -> Result<(), TransportError>;
}
