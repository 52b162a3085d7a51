//! Crosspost - watches creator channels through a WebSub hub and republishes
//! new short-form items.
//!
//! Hub notifications arrive at the callback endpoint, pass a per-channel
//! admission gate and flow through a bounded fetch → publish pipeline. The
//! public callback URL comes from a supervised tunnel or a static setting.

pub mod admission;
pub mod alert;
pub mod app;
pub mod collab;
pub mod config;
pub mod feed;
pub mod hub;
pub mod persistence;
pub mod pipeline;
pub mod retry;
pub mod server;
pub mod tunnel;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;
