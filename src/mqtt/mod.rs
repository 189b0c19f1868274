//! MQTT platform integration.
//!
//! The cover is exposed over plain MQTT topics compatible with Home
//! Assistant's MQTT cover platform, including optional discovery.

pub mod client;
pub mod integration;

pub use client::{MqttClient, MqttMessage};
pub use integration::MqttIntegration;
