//! MQTT transport implementation based on rumqttc.
//!
//! This module adapts the rumqttc API to the domain-level `Transport` trait
//! without leaking MQTT client types upward.
//!
//! # Features
//!
//! - Single actor task owning the rumqttc `EventLoop`; it is the session's
//!   notification context
//! - Locally issued delivery tokens matched to MQTT packet ids
//! - Connect waits for CONNACK; refused connections report the broker's
//!   return code
//!
//! # Usage
//!
//! Enabled by default through the `transport_rumqttc` feature:
//!
//! ```toml
//! [dependencies]
//! mqtt-delivery = { version = "0.1", features = ["transport_rumqttc"] }
//! ```

mod transport;
pub use transport::create_transport;
