//! # StockWatch Channels
//! Telegram transport, update polling and the chat command handler.

pub mod commands;
pub mod telegram;

pub use commands::{Command, CommandHandler, serve};
pub use telegram::{BotEvent, TelegramChannel, TelegramPollingStream};
