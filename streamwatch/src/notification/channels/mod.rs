//! Notification sinks.

mod log;
mod webhook;

pub use log::LogSink;
pub use webhook::WebhookSink;
