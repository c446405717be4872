//! Domain layer public interface.
//!
//! This module defines the session abstractions shared by the connection
//! manager, the delivery correlator and the concrete transports. Nothing in
//! here refers to a specific MQTT client library.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod transport;

// --- Transport domain re-exports ---

pub use transport::{
    //
    ConnectOptions,
    DeliveryToken,
    ListenerPtr,
    OutboundMessage,
    ReasonCode,
    SessionListener,
    Transport,
    TransportPtr,
};
