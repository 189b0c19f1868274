//! Window Cover Bridge library.
//!
//! This library exposes a motorized window opener as an MQTT cover. The
//! device layer drives the opener over its serial line protocol and keeps
//! a time-based position estimate, the cover layer reconciles that into
//! platform state, and the MQTT layer publishes it.

pub mod config;
pub mod cover;
pub mod device;
pub mod error;
pub mod instance_lock;
pub mod mqtt;
