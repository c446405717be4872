//! Delivery correlator.
//!
//! [`DeliveryCorrelator`] publishes messages over a [`Connection`] and calls
//! each publish's completion handler exactly once, when the broker
//! acknowledgement for its delivery token comes back through the
//! transport's notification context.
//!
//! The notification side is a [`SessionListener`] bound to the transport at
//! creation. It holds the correlation table and the link state, not the
//! connection, so the transport never keeps its own owner alive.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::correlation::{CorrelationTable, Registration};
use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    CompletionHandler,
    Connection,
    DeliveryToken,
    Error,
    FailurePolicy,
    LinkState,
    ListenerPtr,
    MqttConfig,
    OutboundMessage,
    Outcome,
    ReasonCode,
    Result,
    SessionListener,
    TransportPtr,
};

/// Notification-side state shared with the transport.
struct Tracker {
    table: CorrelationTable,
    link: LinkState,
    policy: FailurePolicy,
}

impl Tracker {
    // ---

    fn new(policy: FailurePolicy) -> Arc<Self> {
        Arc::new(Self {
            table: CorrelationTable::new(),
            link: LinkState::new(),
            policy,
        })
    }

    /// Complete every waiting handler with `ConnectionLost`.
    fn fail_pending(&self) {
        // ---
        let flushed = self.table.flush();
        if !flushed.is_empty() {
            log_warn!("failing {} pending deliveries", flushed.len());
        }
        for (_token, handler) in flushed {
            handler(Outcome::ConnectionLost);
        }
    }
}

impl SessionListener for Tracker {
    // ---

    fn delivery_complete(&self, token: DeliveryToken) {
        // ---
        if let Some(handler) = self.table.confirm(token) {
            handler(Outcome::Delivered);
        }
    }

    fn connection_lost(&self, cause: &str) {
        // ---
        self.link.mark_lost();
        log_error!("mqtt connection lost: {cause}");

        match self.policy {
            FailurePolicy::Report => self.fail_pending(),
            FailurePolicy::Legacy => {
                let _unresolved = self.table.awaiting();
                log_warn!("{_unresolved} pending deliveries left unresolved");
            }
        }
    }

    fn message_arrived(&self, topic: &str, _payload: &[u8]) {
        log_info!("mqtt message on {topic} ({} bytes)", _payload.len());
    }
}

/// Publishes messages and reports one outcome per publish.
///
/// # Example
///
/// ```no_run
/// use mqtt_delivery::{DeliveryCorrelator, MqttConfig};
///
/// # async fn example() -> mqtt_delivery::Result<()> {
/// let config = MqttConfig::with_broker("localhost").with_credentials("nut", "secret");
/// let correlator = DeliveryCorrelator::open(&config).await?;
///
/// correlator
///     .publish("ups/ups0/status", "OL", |outcome| {
///         println!("publish finished: {outcome} (code {})", outcome.reason_code());
///     })
///     .await;
///
/// correlator.close().await;
/// # Ok(())
/// # }
/// ```
pub struct DeliveryCorrelator {
    // ---
    connection: Connection,
    tracker: Arc<Tracker>,
}

impl DeliveryCorrelator {
    // ---

    /// Open a session with the transport selected by `config`.
    pub async fn open(config: &MqttConfig) -> Result<Self> {
        // ---
        let tracker = Tracker::new(config.policy);
        let listener: ListenerPtr = tracker.clone();

        let connection = Connection::open(config, tracker.link.clone(), listener).await?;

        Ok(Self {
            connection,
            tracker,
        })
    }

    /// Open a session on a transport built by `create`.
    ///
    /// `create` receives the listener the transport must report to.
    pub async fn open_with<F>(config: &MqttConfig, create: F) -> Result<Self>
    where
        F: FnOnce(&MqttConfig, ListenerPtr) -> std::result::Result<TransportPtr, ReasonCode>,
    {
        // ---
        let tracker = Tracker::new(config.policy);
        let listener: ListenerPtr = tracker.clone();

        let connection =
            Connection::open_with(config, tracker.link.clone(), |config| create(config, listener))
                .await?;

        Ok(Self {
            connection,
            tracker,
        })
    }

    /// Publish `message` on `topic` at QoS 1, not retained.
    ///
    /// `on_complete` is invoked exactly once with the final outcome, except
    /// under [`FailurePolicy::Legacy`] where publishes on an unusable or lost
    /// connection never complete. A refused handoff completes the handler
    /// before this returns; an acknowledgement usually completes it later,
    /// from the transport's notification context.
    pub async fn publish<F>(&self, topic: &str, message: impl Into<Bytes>, on_complete: F)
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        // ---
        let handler: CompletionHandler = Box::new(on_complete);

        if !self.connection.is_usable() {
            match self.tracker.policy {
                FailurePolicy::Report => handler(Outcome::Unusable),
                FailurePolicy::Legacy => {
                    log_debug!("connection not usable, dropping publish to {topic}");
                }
            }
            return;
        }

        let msg = OutboundMessage::at_least_once(topic, message);

        match self.connection.send(msg).await {
            Err(code) => {
                log_debug!("publish to {topic} refused, return code {code}");
                handler(Outcome::Rejected(code));
            }
            Ok(token) => match self.tracker.table.register(token, handler) {
                Registration::Pending => {}
                Registration::Resolved(handler, outcome) => handler(outcome),
            },
        }
    }

    /// Publish and wait for the outcome.
    ///
    /// # Errors
    ///
    /// - [`Error::Rejected`] if the transport refused the handoff
    /// - [`Error::Unusable`] if the connection was not usable
    /// - [`Error::ConnectionLost`] if the connection dropped before the
    ///   acknowledgement
    /// - [`Error::Dropped`] if the publish was discarded (legacy policy)
    pub async fn publish_confirmed(&self, topic: &str, message: impl Into<Bytes>) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();

        self.publish(topic, message, move |outcome| {
            let _ = tx.send(outcome);
        })
        .await;

        match rx.await {
            Ok(outcome) => outcome_to_result(outcome),
            Err(_) => Err(Error::Dropped),
        }
    }

    /// Broker acknowledged `token`. Normally called by the transport.
    pub fn on_delivery_confirmed(&self, token: DeliveryToken) {
        self.tracker.delivery_complete(token);
    }

    /// The session dropped. Normally called by the transport.
    pub fn on_connection_lost(&self, cause: &str) {
        self.tracker.connection_lost(cause);
    }

    /// Inbound message on a subscribed topic; logged only.
    pub fn on_message_arrived(&self, topic: &str, payload: &[u8]) {
        self.tracker.message_arrived(topic, payload);
    }

    pub fn is_usable(&self) -> bool {
        self.connection.is_usable()
    }

    /// Entries in the correlation table.
    ///
    /// Equals the number of unacknowledged publishes, plus any
    /// acknowledgement that overtook its publish and has not been matched
    /// yet.
    pub fn pending(&self) -> usize {
        self.tracker.table.len()
    }

    /// Disconnect and release the session.
    ///
    /// Under [`FailurePolicy::Report`] handlers still waiting afterwards are
    /// completed with [`Outcome::ConnectionLost`].
    pub async fn close(mut self) {
        // ---
        self.connection.close().await;

        if self.tracker.policy == FailurePolicy::Report {
            self.tracker.fail_pending();
        }
    }
}

impl Drop for DeliveryCorrelator {
    fn drop(&mut self) {
        // ---
        // The connection releases itself when dropped; waiting handlers
        // still need an outcome.
        if self.tracker.policy == FailurePolicy::Report && self.tracker.table.awaiting() > 0 {
            log_warn!("correlator dropped without close");
            self.tracker.fail_pending();
        }
    }
}

fn outcome_to_result(outcome: Outcome) -> Result<()> {
    // ---
    match outcome {
        Outcome::Delivered => Ok(()),
        Outcome::Rejected(code) => Err(Error::Rejected(code)),
        Outcome::Unusable => Err(Error::Unusable),
        Outcome::ConnectionLost => Err(Error::ConnectionLost),
    }
}
