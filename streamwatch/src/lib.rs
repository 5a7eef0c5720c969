//! streamwatch library crate.
//!
//! Polls an external streaming platform for the live status of every channel
//! watched by any community, and notifies each community exactly once per
//! live session.
//!
//! The pieces, leaves first:
//! - [`credentials`]: app access token acquisition and single-flight refresh
//! - [`monitor`]: status queries, transition tracking and the monitoring loop
//! - [`registry`]: the watch configuration read by the loop
//! - [`notification`]: sinks that deliver live notifications

pub mod config;
pub mod credentials;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod notification;
pub mod registry;
pub mod utils;

pub use error::{Error, Result};
