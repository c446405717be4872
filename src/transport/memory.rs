//! In-memory transport implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! `Transport` trait. It is intended for testing, local execution, and as
//! the reference for the acknowledgement semantics other transports must
//! approximate.
//!
//! ## Reference Semantics
//!
//! - Every accepted publish receives exactly one `delivery_complete`
//!   notification unless acknowledgements are driven manually.
//! - Tokens are issued sequentially and are never reused within a session.
//! - Deferred acknowledgements are reported from a single notification task,
//!   one at a time, concurrently with publishers.
//!
//! ## Controlling the broker
//!
//! A [`MemoryBroker`] stands in for the remote side. Tests use it to inject
//! failures at each lifecycle step, to choose when acknowledgements are
//! reported (including before `publish()` returns), and to simulate
//! connection loss or inbound messages.
//!
//! ## Non-Goals
//!
//! This transport does not emulate MQTT wire behavior, retained messages,
//! subscriptions, or persistence.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::{
    // ---
    log_debug,
    log_warn,
    ConnectOptions,
    DeliveryToken,
    ListenerPtr,
    MqttConfig,
    OutboundMessage,
    ReasonCode,
    Transport,
    TransportPtr,
};

/// When the memory broker reports acknowledgements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Reported from the notification task shortly after the handoff.
    #[default]
    Deferred,

    /// Reported from inside `publish()`, before the token is returned.
    BeforeReturn,

    /// Only reported when [`MemoryBroker::acknowledge`] is called.
    Manual,
}

/// Session lifecycle calls observed by the broker, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryCall {
    Create,
    Connect,
    Disconnect,
    Release,
}

#[derive(Default)]
struct BrokerState {
    fail_create: Option<ReasonCode>,
    fail_connect: Option<ReasonCode>,
    fail_disconnect: Option<ReasonCode>,
    publish_failures: VecDeque<ReasonCode>,

    ack_mode: AckMode,
    next_token: u64,
    connected: bool,

    listener: Option<ListenerPtr>,
    last_options: Option<ConnectOptions>,
    published: Vec<(DeliveryToken, OutboundMessage)>,
    unacknowledged: BTreeSet<DeliveryToken>,
    calls: Vec<MemoryCall>,
}

/// In-process stand-in for an MQTT broker.
///
/// # ⚠️  Testing Only
///
/// Exposed so integration tests and local experiments can drive the
/// correlator deterministically. Production code should select a real
/// transport through [`MqttConfig::transport_type`].
pub struct MemoryBroker {
    // ---
    state: Mutex<BrokerState>,
}

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MemoryBroker {
    // ---

    /// Create a new broker that accepts everything and acknowledges promptly.
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new(Self {
            state: Mutex::new(BrokerState {
                next_token: 1,
                ..BrokerState::default()
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        lock_ignore_poison(&self.state)
    }

    /// Create a session on this broker, bound to `listener`.
    pub fn create_transport(
        self: &Arc<Self>,
        config: &MqttConfig,
        listener: ListenerPtr,
    ) -> Result<TransportPtr, ReasonCode> {
        // ---
        let mut state = self.state();
        if let Some(code) = state.fail_create {
            return Err(code);
        }

        state.calls.push(MemoryCall::Create);
        state.listener = Some(listener.clone());

        let transport_id = format!("memory:{}", config.resolved_client_id());
        log_debug!("{transport_id}: create memory transport");

        Ok(Arc::new(MemoryTransport {
            transport_id,
            broker: Arc::clone(self),
            listener,
            notices: Mutex::new(None),
        }))
    }

    pub fn fail_create(&self, code: ReasonCode) {
        self.state().fail_create = Some(code);
    }

    pub fn fail_connect(&self, code: ReasonCode) {
        self.state().fail_connect = Some(code);
    }

    pub fn fail_disconnect(&self, code: ReasonCode) {
        self.state().fail_disconnect = Some(code);
    }

    /// Refuse the next publish handoff with `code`.
    ///
    /// Calls queue up: each refuses one handoff, in order.
    pub fn fail_next_publish(&self, code: ReasonCode) {
        self.state().publish_failures.push_back(code);
    }

    /// Issue `token` for the next accepted publish; later ones follow it.
    pub fn set_next_token(&self, token: u64) {
        self.state().next_token = token;
    }

    pub fn set_ack_mode(&self, mode: AckMode) {
        self.state().ack_mode = mode;
    }

    /// Report the acknowledgement for `token` now, on the caller's context.
    ///
    /// Returns `false` if the token is unknown or was already acknowledged.
    pub fn acknowledge(&self, token: DeliveryToken) -> bool {
        // ---
        let listener = {
            let mut state = self.state();
            if !state.unacknowledged.remove(&token) {
                return false;
            }
            state.listener.clone()
        };

        if let Some(listener) = listener {
            listener.delivery_complete(token);
        }
        true
    }

    /// Acknowledge everything still outstanding, lowest token first.
    pub fn acknowledge_all(&self) -> usize {
        // ---
        let tokens: Vec<DeliveryToken> = self.state().unacknowledged.iter().copied().collect();
        tokens.into_iter().filter(|token| self.acknowledge(*token)).count()
    }

    /// Drop the session as if the network went away.
    pub fn drop_connection(&self, cause: &str) {
        // ---
        let listener = {
            let mut state = self.state();
            state.connected = false;
            state.listener.clone()
        };

        if let Some(listener) = listener {
            listener.connection_lost(cause);
        }
    }

    /// Deliver an inbound message to the session.
    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        // ---
        let listener = self.state().listener.clone();
        if let Some(listener) = listener {
            listener.message_arrived(topic, payload);
        }
    }

    /// Every accepted publish, in handoff order.
    pub fn published(&self) -> Vec<(DeliveryToken, OutboundMessage)> {
        self.state().published.clone()
    }

    /// Tokens accepted but not yet acknowledged.
    pub fn unacknowledged(&self) -> Vec<DeliveryToken> {
        self.state().unacknowledged.iter().copied().collect()
    }

    pub fn calls(&self) -> Vec<MemoryCall> {
        self.state().calls.clone()
    }

    /// Options passed to the most recent connect.
    pub fn last_connect_options(&self) -> Option<ConnectOptions> {
        self.state().last_options.clone()
    }

    fn accept(&self, msg: OutboundMessage) -> Result<(DeliveryToken, AckMode), ReasonCode> {
        // ---
        let mut state = self.state();

        if !state.connected {
            return Err(ReasonCode::DISCONNECTED);
        }
        if msg.topic.is_empty() {
            return Err(ReasonCode::NULL_PARAMETER);
        }
        if let Some(code) = state.publish_failures.pop_front() {
            return Err(code);
        }

        let token = DeliveryToken::from(state.next_token);
        state.next_token += 1;
        state.published.push((token, msg));
        state.unacknowledged.insert(token);

        Ok((token, state.ack_mode))
    }
}

/// In-memory session bound to a [`MemoryBroker`].
struct MemoryTransport {
    // ---
    transport_id: String,
    broker: Arc<MemoryBroker>,
    listener: ListenerPtr,
    // Feeds the notification task; `Some` between connect and release.
    notices: Mutex<Option<mpsc::UnboundedSender<DeliveryToken>>>,
}

impl MemoryTransport {
    // ---

    /// Spawn the notification task that reports deferred acknowledgements.
    fn start_notifier(&self) -> mpsc::UnboundedSender<DeliveryToken> {
        // ---
        let (tx, mut rx) = mpsc::unbounded_channel::<DeliveryToken>();
        let broker = Arc::clone(&self.broker);
        let _transport_id = self.transport_id.clone();

        tokio::spawn(async move {
            while let Some(token) = rx.recv().await {
                // Let the publisher race the acknowledgement.
                tokio::task::yield_now().await;
                broker.acknowledge(token);
            }
            log_debug!("{_transport_id}: notification task stopped");
        });

        tx
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    async fn connect(&self, options: &ConnectOptions) -> Result<(), ReasonCode> {
        // ---
        {
            let mut state = self.broker.state();
            state.calls.push(MemoryCall::Connect);
            state.last_options = Some(options.clone());
            if let Some(code) = state.fail_connect {
                return Err(code);
            }
            state.connected = true;
        }

        let notifier = self.start_notifier();
        *lock_ignore_poison(&self.notices) = Some(notifier);
        Ok(())
    }

    /// Accept the message and schedule its acknowledgement per [`AckMode`].
    async fn publish(&self, msg: OutboundMessage) -> Result<DeliveryToken, ReasonCode> {
        // ---
        let (token, mode) = self.broker.accept(msg)?;
        log_debug!("{}: accepted publish, token {token}", self.transport_id);

        match mode {
            AckMode::Deferred => {
                let sent = lock_ignore_poison(&self.notices)
                    .as_ref()
                    .map(|tx| tx.send(token).is_ok())
                    .unwrap_or(false);
                if !sent {
                    log_warn!("{}: no notification task for token {token}", self.transport_id);
                }
            }
            AckMode::BeforeReturn => {
                if self.broker.state().unacknowledged.remove(&token) {
                    self.listener.delivery_complete(token);
                }
            }
            AckMode::Manual => {}
        }

        Ok(token)
    }

    async fn disconnect(&self, _timeout: Duration) -> Result<(), ReasonCode> {
        // ---
        let mut state = self.broker.state();
        state.calls.push(MemoryCall::Disconnect);
        state.connected = false;
        match state.fail_disconnect {
            Some(code) => Err(code),
            None => Ok(()),
        }
    }

    fn release(&self) {
        // ---
        lock_ignore_poison(&self.notices).take();
        self.broker.state().calls.push(MemoryCall::Release);
        log_debug!("{}: released", self.transport_id);
    }
}

/// Create a memory transport on a private broker.
///
/// Used when configuration selects `"memory"`; the broker is not reachable
/// from outside, so acknowledgements are always deferred.
pub fn create_transport(config: &MqttConfig, listener: ListenerPtr) -> Result<TransportPtr, ReasonCode> {
    // ---
    MemoryBroker::new().create_transport(config, listener)
}
