//! Broker connection configuration.
//!
//! Loading configuration (files, environment, command line) is left to the
//! embedding application; [`MqttConfig`] only needs to be deserializable so
//! it can sit inside whatever configuration document that application uses.

use std::time::Duration;

use serde::Deserialize;

use crate::ConnectOptions;

/// Default MQTT broker port.
pub const DEFAULT_PORT: u16 = 1883;

/// Default keep-alive interval in seconds.
pub const DEFAULT_KEEP_ALIVE_SECS: u16 = 20;

/// Default bound on the graceful disconnect at close, in milliseconds.
pub const DEFAULT_DISCONNECT_TIMEOUT_MS: u64 = 10_000;

/// How the correlator treats publishes it cannot track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Every publish gets an outcome.
    ///
    /// Publishing on an unusable connection completes the handler with
    /// `Outcome::Unusable`; a lost connection completes every pending handler
    /// with `Outcome::ConnectionLost`.
    #[default]
    Report,

    /// Publishes on an unusable connection are silently dropped and pending
    /// handlers are left unresolved when the connection is lost.
    Legacy,
}

/// Broker connection settings.
///
/// # Example
///
/// ```
/// use mqtt_delivery::{FailurePolicy, MqttConfig};
///
/// let config = MqttConfig::with_broker("broker.local")
///     .with_credentials("nut", "secret")
///     .with_client_id("ups-monitor")
///     .with_policy(FailurePolicy::Report);
///
/// assert_eq!(config.url(), "tcp://broker.local:1883");
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    // ---
    /// Broker host name or address.
    pub host: String,

    /// Broker TCP port.
    pub port: u16,

    /// MQTT client identifier. Generated when `None`.
    pub client_id: Option<String>,

    pub username: Option<String>,
    pub password: Option<String>,

    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u16,

    /// Ask the broker to discard session state on connect.
    pub clean_session: bool,

    /// Upper bound on the graceful disconnect performed at close, in
    /// milliseconds.
    pub disconnect_timeout_ms: u64,

    /// Transport selection: `"memory"` or `"rumqttc"`.
    ///
    /// `None` picks rumqttc when the `transport_rumqttc` feature is enabled,
    /// the memory transport otherwise.
    pub transport_type: Option<String>,

    pub policy: FailurePolicy,
}

impl Default for MqttConfig {
    fn default() -> Self {
        // ---
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            clean_session: true,
            disconnect_timeout_ms: DEFAULT_DISCONNECT_TIMEOUT_MS,
            transport_type: None,
            policy: FailurePolicy::Report,
        }
    }
}

impl MqttConfig {
    /// Configuration for a broker at `host` on the default port.
    pub fn with_broker(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    /// Configuration for the in-process memory transport.
    pub fn memory() -> Self {
        Self {
            transport_type: Some("memory".to_string()),
            ..Self::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_keep_alive_secs(mut self, secs: u16) -> Self {
        self.keep_alive_secs = secs;
        self
    }

    /// Bound the graceful disconnect; sub-millisecond parts round up.
    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        // ---
        let millis = timeout.as_nanos().div_ceil(1_000_000);
        self.disconnect_timeout_ms = u64::try_from(millis).unwrap_or(u64::MAX);
        self
    }

    pub fn with_transport_type(mut self, kind: impl Into<String>) -> Self {
        self.transport_type = Some(kind.into());
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Broker URL in `tcp://host:port` form.
    pub fn url(&self) -> String {
        // ---
        format!("tcp://{}:{}", self.host, self.port)
    }

    /// Client identifier, generating a unique one when none was configured.
    pub fn resolved_client_id(&self) -> String {
        // ---
        match &self.client_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => format!("mqtt-delivery-{}", uuid::Uuid::new_v4().simple()),
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(u64::from(self.keep_alive_secs))
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    /// Options applied to the session between creation and connect.
    pub fn connect_options(&self) -> ConnectOptions {
        // ---
        ConnectOptions {
            keep_alive: self.keep_alive(),
            clean_session: self.clean_session,
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}
