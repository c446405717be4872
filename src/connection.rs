//! Broker session lifecycle.
//!
//! [`Connection`] owns one [`Transport`](crate::Transport) from creation to
//! release: create, apply options and connect in [`Connection::open`]; then
//! disconnect (bounded, best effort) and release in [`Connection::close`].
//!
//! Usability is tracked in a [`LinkState`] that the connection shares with
//! whoever receives the transport's notifications, so a connection-lost
//! report can mark the link unusable without going through the connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    ConnectError,
    DeliveryToken,
    ListenerPtr,
    MqttConfig,
    OutboundMessage,
    ReasonCode,
    TransportPtr,
};

/// Shared "is usable" flag for one connection.
///
/// Cheap to clone; all clones observe the same flag.
#[derive(Clone, Debug, Default)]
pub struct LinkState {
    usable: Arc<AtomicBool>,
}

impl LinkState {
    /// A link that is not usable until a connection opens on it.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_usable(&self) -> bool {
        self.usable.load(Ordering::Acquire)
    }

    /// Mark the link unusable after the session dropped.
    pub fn mark_lost(&self) {
        self.usable.store(false, Ordering::Release);
    }

    fn set_usable(&self, usable: bool) {
        self.usable.store(usable, Ordering::Release);
    }
}

/// One broker session.
///
/// `transport` is `Some` exactly while the session object is created and not
/// yet released; `connected` is only ever true while `transport` is `Some`.
pub struct Connection {
    // ---
    transport: Option<TransportPtr>,
    connected: bool,
    link: LinkState,
    disconnect_timeout: Duration,
}

impl Connection {
    // ---

    /// Open a session using the transport selected by `config`.
    ///
    /// `listener` receives the transport's notifications for the lifetime of
    /// the session.
    pub async fn open(
        config: &MqttConfig,
        link: LinkState,
        listener: ListenerPtr,
    ) -> Result<Self, ConnectError> {
        // ---
        Self::open_with(config, link, |config| {
            crate::transport::create_transport(config, listener)
        })
        .await
    }

    /// Open a session on a transport built by `create`.
    ///
    /// A session that is created but fails to connect is released before
    /// this returns.
    pub async fn open_with<F>(
        config: &MqttConfig,
        link: LinkState,
        create: F,
    ) -> Result<Self, ConnectError>
    where
        F: FnOnce(&MqttConfig) -> Result<TransportPtr, ReasonCode>,
    {
        // ---
        let url = config.url();

        let transport = create(config).map_err(|code| {
            log_error!("{url}: failed to create client, return code {code}");
            ConnectError::Create(code)
        })?;

        let mut connection = Self {
            transport: Some(transport.clone()),
            connected: false,
            link,
            disconnect_timeout: config.disconnect_timeout(),
        };

        if let Err(code) = transport.connect(&config.connect_options()).await {
            log_error!(
                "{}: failed to connect to {url}, return code {code}",
                transport.transport_id()
            );
            connection.close().await;
            return Err(ConnectError::Connect(code));
        }

        log_info!("{}: connected to {url}", transport.transport_id());

        connection.connected = true;
        connection.link.set_usable(true);
        Ok(connection)
    }

    /// True after a successful open, before close and before the session
    /// was reported lost.
    pub fn is_usable(&self) -> bool {
        self.connected && self.link.is_usable()
    }

    /// The shared usability flag.
    pub fn link(&self) -> &LinkState {
        &self.link
    }

    /// Hand a message to the transport.
    pub async fn send(&self, msg: OutboundMessage) -> Result<DeliveryToken, ReasonCode> {
        // ---
        match &self.transport {
            Some(transport) => transport.publish(msg).await,
            None => Err(ReasonCode::DISCONNECTED),
        }
    }

    /// Disconnect (if connected) and release the session (if created).
    ///
    /// Disconnect failures are logged and otherwise ignored; the session is
    /// released regardless. Calling `close` again is a no-op.
    pub async fn close(&mut self) {
        // ---
        self.link.set_usable(false);

        let Some(transport) = self.transport.take() else {
            return;
        };
        let id = transport.transport_id().to_string();

        if std::mem::take(&mut self.connected) {
            let timeout = self.disconnect_timeout;
            match tokio::time::timeout(timeout, transport.disconnect(timeout)).await {
                Ok(Ok(())) => log_debug!("{id}: disconnected"),
                Ok(Err(code)) => {
                    log_error!("{id}: failed to disconnect, return code {code}");
                }
                Err(_) => {
                    log_error!("{id}: disconnect did not complete within {timeout:?}");
                }
            }
        }

        transport.release();
        log_debug!("{id}: session released");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // ---
        if let Some(transport) = self.transport.take() {
            log_warn!(
                "{}: connection dropped without close, releasing without disconnect",
                transport.transport_id()
            );
            self.link.set_usable(false);
            transport.release();
        }
    }
}
