// src/domain/transport.rs

//! Session domain abstractions.
//!
//! A [`Transport`] is one broker session seen from the core: it can be
//! connected, it accepts outbound messages and hands back a
//! [`DeliveryToken`] for each, and it can be disconnected and released.
//!
//! Delivery outcomes do not travel back through `publish()`. The transport
//! reports them later, from its own execution context, through the
//! [`SessionListener`] it was created with. A confirmation may reach the
//! listener before the `publish()` call that produced the token has
//! returned; consumers of this trait must tolerate that ordering.
//!
//! Concrete implementations live under `src/transport/`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

/// Numeric reason code reported by a transport.
///
/// Zero means success. Negative values are client-side failures, positive
/// values are broker return codes (e.g. a refused CONNACK).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReasonCode(pub i32);

impl ReasonCode {
    /// Operation succeeded.
    pub const SUCCESS: ReasonCode = ReasonCode(0);
    /// Generic client-side failure.
    pub const FAILURE: ReasonCode = ReasonCode(-1);
    /// The client is not connected.
    pub const DISCONNECTED: ReasonCode = ReasonCode(-3);
    /// Too many publishes are awaiting acknowledgement.
    pub const MAX_MESSAGES_INFLIGHT: ReasonCode = ReasonCode(-4);
    /// A required parameter (such as the topic) was empty.
    pub const NULL_PARAMETER: ReasonCode = ReasonCode(-6);
    /// The broker URL uses an unsupported scheme or is malformed.
    pub const BAD_PROTOCOL: ReasonCode = ReasonCode(-14);

    /// Raw numeric value.
    pub fn value(self) -> i32 {
        self.0
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for ReasonCode {
    fn from(value: i32) -> Self {
        ReasonCode(value)
    }
}

/// Opaque identifier a transport issues for each accepted publish.
///
/// Unique among publishes still in flight on one session. A transport may
/// reuse a token once its delivery has been reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryToken(u64);

impl DeliveryToken {
    /// Raw token value, for logging.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for DeliveryToken {
    fn from(value: u64) -> Self {
        DeliveryToken(value)
    }
}

impl fmt::Display for DeliveryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message ready to be handed to a transport.
///
/// Always published at-least-once (MQTT QoS 1); transports do not offer
/// other delivery tiers.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub retained: bool,
}

impl OutboundMessage {
    /// Build an at-least-once, non-retained message.
    ///
    /// This is the only shape the delivery correlator ever publishes.
    pub fn at_least_once(topic: impl Into<Arc<str>>, payload: impl Into<Bytes>) -> Self {
        // ---
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retained: false,
        }
    }
}

/// Session options applied between creation and connect.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Receiver of a transport's asynchronous notifications.
///
/// The listener is bound when the transport is created and replaces any
/// notion of a raw context pointer: the transport holds an
/// `Arc<dyn SessionListener>` and calls it from its notification context.
///
/// A transport invokes these methods serially, never concurrently with each
/// other, but they do run concurrently with callers of
/// [`Transport::publish`].
pub trait SessionListener: Send + Sync {
    /// The broker acknowledged the publish identified by `token`.
    fn delivery_complete(&self, token: DeliveryToken);

    /// The session dropped unexpectedly.
    fn connection_lost(&self, cause: &str);

    /// A message arrived on a subscribed topic.
    fn message_arrived(&self, topic: &str, payload: &[u8]);
}

/// Shared listener pointer handed to transport factories.
pub type ListenerPtr = Arc<dyn SessionListener>;

/// Broker session abstraction.
///
/// Lifecycle: a factory creates the session (fallible), the connection
/// manager calls [`connect`](Transport::connect) once, then any number of
/// [`publish`](Transport::publish) calls, then
/// [`disconnect`](Transport::disconnect) if connect succeeded, and finally
/// [`release`](Transport::release) exactly once.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Identifier used in log output.
    fn transport_id(&self) -> &str;

    /// Connect to the broker with the given options.
    async fn connect(&self, options: &ConnectOptions) -> Result<(), ReasonCode>;

    /// Hand a message off for delivery.
    ///
    /// Success means the transport accepted the message and will later
    /// report `delivery_complete` for the returned token. The report may
    /// arrive before this call returns.
    async fn publish(&self, msg: OutboundMessage) -> Result<DeliveryToken, ReasonCode>;

    /// Gracefully disconnect, waiting at most `timeout`.
    async fn disconnect(&self, timeout: Duration) -> Result<(), ReasonCode>;

    /// Release the underlying session object.
    fn release(&self);
}

/// Shared transport pointer.
pub type TransportPtr = Arc<dyn Transport>;
