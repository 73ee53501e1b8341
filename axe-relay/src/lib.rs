//! Status relay for BitAxe and NerdAxe miners.
//!
//! Polls each configured device's AxeOS HTTP API on a fixed interval,
//! keeps a short-lived snapshot cache, tracks the best difficulty each
//! device has ever reported, and hands a status summary plus
//! threshold alerts to a chat [`notify::Notifier`].

pub mod alert;
pub mod best_diff;
pub mod cache;
pub mod config;
pub mod device;
pub mod error;
pub mod monitor;
pub mod notify;
pub mod summary;
pub mod tracing;
pub mod types;
