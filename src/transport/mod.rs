//! Transport implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Transport` trait. Broker-backed transports are hidden behind feature
//! flags and exposed only through constructor functions.
//!
//! Domain code must not depend on transport-specific types.

mod memory;

#[cfg(feature = "transport_rumqttc")]
mod rumqttc;

pub use memory::{AckMode, MemoryBroker, MemoryCall};

#[cfg(feature = "transport_rumqttc")]
pub use self::rumqttc::create_transport as create_rumqttc_transport;

use crate::{log_error, ListenerPtr, MqttConfig, ReasonCode, TransportPtr};

/// Create the transport selected by `config.transport_type`.
///
/// With no explicit type, rumqttc is used when compiled in, the memory
/// transport otherwise.
pub(crate) fn create_transport(
    config: &MqttConfig,
    listener: ListenerPtr,
) -> Result<TransportPtr, ReasonCode> {
    // ---
    match config.transport_type.as_deref() {
        Some("memory") => memory::create_transport(config, listener),

        #[cfg(feature = "transport_rumqttc")]
        Some("rumqttc") | None => self::rumqttc::create_transport(config, listener),

        #[cfg(not(feature = "transport_rumqttc"))]
        None => memory::create_transport(config, listener),

        Some(other) => {
            log_error!("unrecognized transport_type: {other}, valid values: memory, rumqttc");
            Err(ReasonCode::BAD_PROTOCOL)
        }
    }
}
