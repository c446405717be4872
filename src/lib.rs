//! Publish-acknowledgment correlation over MQTT
//!
//! This library publishes messages to an MQTT broker at QoS 1 and reports
//! the final outcome of each publish to a caller-supplied completion
//! handler. Broker acknowledgements arrive on the transport's notification
//! context and may overtake the publishing task; the correlation table
//! matches them to their handlers in whichever order the two sides arrive.
//!

mod macros;
pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

mod domain;
mod transport;

mod config;
mod connection;
mod correlation;
mod correlator;
mod error;

// Re-export main types
pub use correlator::DeliveryCorrelator;

pub use config::{FailurePolicy, MqttConfig};
pub use connection::{Connection, LinkState};
pub use correlation::{CompletionHandler, Outcome};
pub use error::{ConnectError, Error, Result};

pub use transport::{AckMode, MemoryBroker, MemoryCall};

#[cfg(feature = "transport_rumqttc")]
pub use transport::create_rumqttc_transport;

// --- public re-exports
pub use domain::{
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
