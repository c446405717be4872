//! MQTT transport implementation using `rumqttc`.
//!
//! ## Concurrency model
//!
//! - `connect()` builds the `AsyncClient`/`EventLoop` pair and spawns a single
//!   **actor task** that owns the event loop.
//! - The actor is the session's notification context: it alone calls the
//!   [`SessionListener`](crate::SessionListener), one notification at a time.
//! - Publishers only touch the `AsyncClient` request channel.
//!
//! ## Delivery tokens
//!
//! rumqttc assigns MQTT packet ids inside the event loop, after `publish()`
//! has already returned, so the packet id cannot serve as the delivery
//! token. Instead each handoff is given a locally issued token and pushed
//! onto a FIFO *in the same order* the request enters the client channel
//! (both happen under one handoff lock). The event loop emits
//! `Outgoing::Publish(pkid)` in request order, which pairs the head of the
//! FIFO with its packet id; the matching `PubAck` then resolves the token.
//! A handoff that never reaches the channel (refused, or its future dropped
//! while the channel was full) is taken back off the FIFO.
//!
//! The acknowledgement can be reported before the publishing task has
//! returned from `publish()`. The delivery correlator handles that race.
//!
//! ## Scope and limitations
//!
//! - One transport instance corresponds to a single broker connection.
//! - A transport-level error after connect is reported as connection loss
//!   and stops the actor; reconnecting is left to whoever owns the session.
//! - Subscriptions are not managed here; inbound publishes are forwarded to
//!   the listener as they arrive.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rumqttc::{
    //
    AsyncClient,
    ConnectReturnCode,
    ConnectionError,
    Event,
    EventLoop,
    MqttOptions,
    Outgoing,
    Packet,
};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::{
    //
    log_debug,
    log_error,
    log_info,
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

/// Capacity of the request channel between publishers and the event loop.
const REQUEST_CAPACITY: usize = 64;

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Token bookkeeping shared by publishers and the actor.
#[derive(Default)]
struct PacketTracker {
    // Handed to the client, not yet written by the event loop.
    queued: Mutex<VecDeque<DeliveryToken>>,
    // Written with a packet id, awaiting PubAck.
    inflight: Mutex<HashMap<u16, DeliveryToken>>,
}

impl PacketTracker {
    // ---

    /// Queue `token` for the next handoff; it is taken back off the queue
    /// when the returned guard drops before [`QueuedToken::sent`].
    fn queue(&self, token: DeliveryToken) -> QueuedToken<'_> {
        lock_ignore_poison(&self.queued).push_back(token);
        QueuedToken {
            tracker: self,
            token,
            sent: false,
        }
    }

    fn unqueue(&self, token: DeliveryToken) {
        lock_ignore_poison(&self.queued).retain(|queued| *queued != token);
    }

    /// The event loop wrote the next queued publish with `pkid`.
    fn written(&self, pkid: u16) {
        // ---
        let Some(token) = lock_ignore_poison(&self.queued).pop_front() else {
            log_warn!("publish written with packet id {pkid} but no token queued");
            return;
        };

        if let Some(previous) = lock_ignore_poison(&self.inflight).insert(pkid, token) {
            log_warn!("packet id {pkid} reused while token {previous} was in flight");
        }
    }

    /// The broker completed the exchange for `pkid`.
    fn acknowledged(&self, pkid: u16) -> Option<DeliveryToken> {
        lock_ignore_poison(&self.inflight).remove(&pkid)
    }
}

/// A token on the FIFO whose request may not have reached the client yet.
struct QueuedToken<'a> {
    tracker: &'a PacketTracker,
    token: DeliveryToken,
    sent: bool,
}

impl QueuedToken<'_> {
    /// The request is in the client channel; the event loop owns it now.
    fn sent(mut self) -> DeliveryToken {
        self.sent = true;
        self.token
    }
}

impl Drop for QueuedToken<'_> {
    fn drop(&mut self) {
        if !self.sent {
            self.tracker.unqueue(self.token);
        }
    }
}

/// MQTT-based implementation of the `Transport` trait.
pub struct RumqttcTransport {
    // ---
    transport_id: String,
    base_options: MqttOptions,
    listener: ListenerPtr,
    tracker: Arc<PacketTracker>,

    client: Mutex<Option<AsyncClient>>,
    actor: Mutex<Option<JoinHandle<()>>>,
    closing: Arc<AtomicBool>,

    // Serializes token queueing with the client request channel.
    handoff: tokio::sync::Mutex<()>,
    next_token: AtomicU64,
}

impl RumqttcTransport {
    // ---

    fn new(transport_id: String, base_options: MqttOptions, listener: ListenerPtr) -> Self {
        Self {
            transport_id,
            base_options,
            listener,
            tracker: Arc::new(PacketTracker::default()),
            client: Mutex::new(None),
            actor: Mutex::new(None),
            closing: Arc::new(AtomicBool::new(false)),
            handoff: tokio::sync::Mutex::new(()),
            next_token: AtomicU64::new(1),
        }
    }

    fn client(&self) -> Option<AsyncClient> {
        lock_ignore_poison(&self.client).clone()
    }

    fn issue_token(&self) -> DeliveryToken {
        DeliveryToken::from(self.next_token.fetch_add(1, Ordering::Relaxed))
    }
}

struct SessionActor {
    // ---
    transport_id: String, // for logging only
    event_loop: EventLoop,
    listener: ListenerPtr,
    tracker: Arc<PacketTracker>,
    closing: Arc<AtomicBool>,
}

impl SessionActor {
    // ---

    async fn run(mut self, connected: oneshot::Sender<Result<(), ReasonCode>>) {
        // ---
        let mut connected = Some(connected);

        loop {
            let event = self.event_loop.poll().await;

            match event {
                Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                    let result = match connack.code {
                        ConnectReturnCode::Success => Ok(()),
                        code => Err(refused_code(code)),
                    };
                    log_info!("{}: connack {:?}", self.transport_id, connack.code);

                    let refused = result.is_err();
                    if let Some(tx) = connected.take() {
                        let _ = tx.send(result);
                    }
                    if refused {
                        break;
                    }
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => self.tracker.written(pkid),
                Ok(Event::Incoming(Packet::PubAck(ack))) => self.acknowledged(ack.pkid),
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.listener
                        .message_arrived(&publish.topic, publish.payload.as_ref());
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    log_debug!("{}: disconnect written", self.transport_id);
                    break;
                }
                Ok(_event) => {
                    log_debug!(
                        "{}: received mqtt event (ignored): {:?}",
                        self.transport_id,
                        _event
                    );
                }
                Err(err) => {
                    if let Some(tx) = connected.take() {
                        log_error!("{}: connection failed: {err}", self.transport_id);
                        let _ = tx.send(Err(connect_failure_code(&err)));
                        break;
                    }
                    if self.closing.load(Ordering::Acquire) {
                        log_debug!("{}: event loop closed: {err}", self.transport_id);
                        break;
                    }
                    log_error!("{}: mqtt connection lost: {err}", self.transport_id);
                    self.listener.connection_lost(&err.to_string());
                    break;
                }
            }
        }

        log_debug!("{}: event loop actor stopped", self.transport_id);
    }

    fn acknowledged(&self, pkid: u16) {
        // ---
        match self.tracker.acknowledged(pkid) {
            Some(token) => self.listener.delivery_complete(token),
            None => log_warn!(
                "{}: acknowledgement for unknown packet id {pkid}",
                self.transport_id
            ),
        }
    }
}

/// Numeric code for a refused CONNACK (MQTT 3.1.1 return codes).
fn refused_code(code: ConnectReturnCode) -> ReasonCode {
    // ---
    ReasonCode(match code {
        ConnectReturnCode::Success => 0,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::BadClientId => 2,
        ConnectReturnCode::ServiceUnavailable => 3,
        ConnectReturnCode::BadUserNamePassword => 4,
        ConnectReturnCode::NotAuthorized => 5,
    })
}

fn connect_failure_code(err: &ConnectionError) -> ReasonCode {
    // ---
    match err {
        ConnectionError::ConnectionRefused(code) => refused_code(*code),
        _ => ReasonCode::FAILURE,
    }
}

/// Topic names for PUBLISH must be non-empty and free of wildcards.
fn valid_publish_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['+', '#'])
}

#[async_trait::async_trait]
impl Transport for RumqttcTransport {
    // ---

    fn transport_id(&self) -> &str {
        // ---
        &self.transport_id
    }

    async fn connect(&self, options: &ConnectOptions) -> Result<(), ReasonCode> {
        // ---
        let mut mqtt_options = self.base_options.clone();
        mqtt_options.set_keep_alive(options.keep_alive);
        mqtt_options.set_clean_session(options.clean_session);
        if let Some(username) = &options.username {
            mqtt_options.set_credentials(username.clone(), options.password.clone().unwrap_or_default());
        }

        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);

        let actor = SessionActor {
            transport_id: self.transport_id.clone(),
            event_loop,
            listener: self.listener.clone(),
            tracker: Arc::clone(&self.tracker),
            closing: Arc::clone(&self.closing),
        };

        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(actor.run(tx));

        *lock_ignore_poison(&self.client) = Some(client);
        *lock_ignore_poison(&self.actor) = Some(handle);

        // A dropped sender means the actor died before reporting.
        rx.await.unwrap_or(Err(ReasonCode::FAILURE))
    }

    async fn publish(&self, msg: OutboundMessage) -> Result<DeliveryToken, ReasonCode> {
        // ---
        if !valid_publish_topic(&msg.topic) {
            return Err(ReasonCode::NULL_PARAMETER);
        }
        let client = self.client().ok_or(ReasonCode::DISCONNECTED)?;

        let _order = self.handoff.lock().await;

        let queued = self.tracker.queue(self.issue_token());

        // Blocks while the request channel is full; dropping this future
        // here drops `queued` and takes the token back.
        let result = client
            .publish(
                msg.topic.to_string(),
                rumqttc::QoS::AtLeastOnce,
                msg.retained,
                msg.payload.to_vec(),
            )
            .await;

        match result {
            Ok(()) => Ok(queued.sent()),
            Err(_err) => {
                drop(queued);
                log_error!(
                    "{}: publish failed for topic {}: {_err}",
                    self.transport_id,
                    msg.topic
                );
                Err(ReasonCode::DISCONNECTED)
            }
        }
    }

    async fn disconnect(&self, timeout: Duration) -> Result<(), ReasonCode> {
        // ---
        self.closing.store(true, Ordering::Release);

        let client = self.client().ok_or(ReasonCode::DISCONNECTED)?;
        client.disconnect().await.map_err(|_err| {
            log_debug!("{}: mqtt disconnect failed: {_err}", self.transport_id);
            ReasonCode::DISCONNECTED
        })?;

        let handle = lock_ignore_poison(&self.actor).take();
        let Some(mut handle) = handle else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(_) => Ok(()),
            Err(_) => {
                handle.abort();
                Err(ReasonCode::FAILURE)
            }
        }
    }

    fn release(&self) {
        // ---
        self.closing.store(true, Ordering::Release);
        if let Some(handle) = lock_ignore_poison(&self.actor).take() {
            handle.abort();
        }
        lock_ignore_poison(&self.client).take();
        log_debug!("{}: mqtt session released", self.transport_id);
    }
}

/// Split `host` into host and optional port, accepting `tcp://` and
/// `mqtt://` prefixes.
fn parse_host(host: &str, default_port: u16) -> Result<(String, u16), ReasonCode> {
    // ---
    let bare = match host.split_once("://") {
        Some(("tcp" | "mqtt", rest)) => rest,
        Some((_scheme, _)) => return Err(ReasonCode::BAD_PROTOCOL),
        None => host,
    };

    let (name, port) = match bare.rsplit_once(':') {
        Some((name, port)) => (
            name,
            port.parse().map_err(|_| ReasonCode::BAD_PROTOCOL)?,
        ),
        None => (bare, default_port),
    };

    if name.is_empty() {
        return Err(ReasonCode::BAD_PROTOCOL);
    }
    Ok((name.to_string(), port))
}

/// Create a rumqttc-backed session from `config`.
///
/// Only validates the broker address and client id; the network connection
/// is made by [`Transport::connect`].
pub fn create_transport(config: &MqttConfig, listener: ListenerPtr) -> Result<TransportPtr, ReasonCode> {
    // ---
    let (host, port) = parse_host(&config.host, config.port).map_err(|code| {
        log_error!("rumqttc: invalid broker address {}", config.host);
        code
    })?;
    let client_id = config.resolved_client_id();

    let base_options = MqttOptions::new(client_id.clone(), host, port);

    Ok(Arc::new(RumqttcTransport::new(
        format!("rumqttc:{client_id}"),
        base_options,
        listener,
    )))
}
