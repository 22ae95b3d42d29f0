//! Taskbot: a conversational task tracker for chat messengers.

pub mod bot;
pub mod channels;
pub mod commands;
pub mod config;
pub mod error;
pub mod queue;
pub mod reminders;
pub mod scanner;
pub mod session;
pub mod store;
pub mod tasks;
