/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing types for configuring an MQTT session.
 */

use crate::error::{MqttError, MqttResult};
use crate::mqtt::*;
use crate::store::MessageStore;

pub use crate::packet_id::PacketIdPolicy;

use log::*;
use rand::Rng;
use std::fmt::{Debug, Formatter};
use std::time::Duration;

pub(crate) const DEFAULT_KEEP_ALIVE_SECONDS : u16 = 60;
pub(crate) const DEFAULT_MAX_INFLIGHT : u16 = 65535;
pub(crate) const GENERATED_CLIENT_ID_PREFIX : &str = "gneiss_";

/// Configuration options that determine packet field values for the CONNECT packet sent by the
/// session on each connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectOptions {

    pub(crate) protocol_version: ProtocolVersion,

    pub(crate) keep_alive_interval_seconds: u16,

    pub(crate) clean_session: bool,

    pub(crate) client_id: Option<String>,

    pub(crate) username: Option<String>,

    pub(crate) password: Option<Vec<u8>>,

    pub(crate) will: Option<PublishPacket>,

    pub(crate) receive_maximum: Option<u16>,
}

impl ConnectOptions {

    /// Creates a new builder for ConnectOptions instances
    pub fn builder() -> ConnectOptionsBuilder {
        ConnectOptionsBuilder::new()
    }

    pub(crate) fn to_connect_packet(&self, client_id: &str) -> ConnectPacket {
        ConnectPacket {
            protocol_version: self.protocol_version,
            keep_alive_interval_seconds: self.keep_alive_interval_seconds,
            clean_start: self.clean_session,
            client_id: client_id.to_string(),
            username: self.username.clone(),
            password: self.password.clone(),
            will: self.will.clone(),
            receive_maximum: if self.protocol_version == ProtocolVersion::Mqtt5 { self.receive_maximum } else { None },
        }
    }

    /// Returns the MQTT client id currently configured in these options
    pub fn client_id(&self) -> &Option<String> { &self.client_id }

    /// Returns the protocol version the session will speak
    pub fn protocol_version(&self) -> ProtocolVersion { self.protocol_version }

    /// Returns whether each connection asks the broker to discard prior session state
    pub fn clean_session(&self) -> bool { self.clean_session }

    /// Returns the keep alive interval, in seconds.  Zero means keep alive is disabled.
    pub fn keep_alive_interval_seconds(&self) -> u16 { self.keep_alive_interval_seconds }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            protocol_version: ProtocolVersion::Mqtt311,
            keep_alive_interval_seconds: DEFAULT_KEEP_ALIVE_SECONDS,
            clean_session: true,
            client_id: None,
            username: None,
            password: None,
            will: None,
            receive_maximum: None,
        }
    }
}

/// A builder for connection-related options on the session.
#[derive(Debug, Default)]
pub struct ConnectOptionsBuilder {
    options: ConnectOptions
}

impl ConnectOptionsBuilder {

    /// Creates a new builder object for ConnectOptions
    pub fn new() -> Self {
        ConnectOptionsBuilder {
            options: ConnectOptions::default()
        }
    }

    /// Sets the MQTT protocol version.  Defaults to 3.1.1.
    pub fn with_protocol_version(&mut self, protocol_version: ProtocolVersion) -> &mut Self {
        self.options.protocol_version = protocol_version;
        self
    }

    /// Sets the maximum time interval, in seconds, that is permitted to elapse between the point
    /// at which the client finishes transmitting one MQTT packet and the point it starts sending
    /// the next.  Zero disables keep alive.  Defaults to sixty seconds.
    pub fn with_keep_alive_interval_seconds(&mut self, keep_alive: u16) -> &mut Self {
        self.options.keep_alive_interval_seconds = keep_alive;
        self
    }

    /// Sets whether the broker should discard any existing session for this client id on every
    /// connection.  Defaults to true.
    pub fn with_clean_session(&mut self, clean_session: bool) -> &mut Self {
        self.options.clean_session = clean_session;
        self
    }

    /// Sets the client id.  Required when clean session is false; otherwise a random id is
    /// generated when the session is created.
    pub fn with_client_id(&mut self, client_id: &str) -> &mut Self {
        self.options.client_id = Some(client_id.to_string());
        self
    }

    /// Sets the username for broker authentication
    pub fn with_username(&mut self, username: &str) -> &mut Self {
        self.options.username = Some(username.to_string());
        self
    }

    /// Sets the password for broker authentication
    pub fn with_password(&mut self, password: &[u8]) -> &mut Self {
        self.options.password = Some(password.to_vec());
        self
    }

    /// Sets the will message the broker publishes if the connection is lost ungracefully
    pub fn with_will(&mut self, will: PublishPacket) -> &mut Self {
        self.options.will = Some(will);
        self
    }

    /// Sets the MQTT5 receive maximum the client advertises for inbound QoS 1+ publishes.
    /// Ignored by earlier protocol versions.
    pub fn with_receive_maximum(&mut self, receive_maximum: u16) -> &mut Self {
        self.options.receive_maximum = Some(receive_maximum);
        self
    }

    /// Builds a new set of connect options
    pub fn build(&self) -> ConnectOptions {
        self.options.clone()
    }
}

pub(crate) fn generate_client_id() -> String {
    let suffix : u32 = rand::thread_rng().gen();
    format!("{}{:08x}", GENERATED_CLIENT_ID_PREFIX, suffix)
}

/// Controls how the session treats existing and newly-submitted operations while it does not
/// have a valid connection to the broker.
///
/// Protocol requirements always override this setting.  In-progress QoS 1 and 2 exchanges stay
/// in the message store regardless so that a resumed session can complete them.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum OfflineQueuePolicy {

    /// Operations are never failed due to connection state
    PreserveAll,

    /// QoS 0 publishes are failed when there is no connection; all other operations are kept.
    #[default]
    PreserveAcknowledged,

    /// Only QoS 1 and QoS 2 publishes are retained when there is no connection
    PreserveQos1PlusPublishes,

    /// Nothing is retained when there is no connection
    PreserveNothing,
}

/// Controls what happens to a QoS 1+ publish when the in-flight bound has been reached
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum InflightLimitPolicy {

    /// The publish waits in the operation queue until an in-flight exchange completes
    #[default]
    Queue,

    /// The publish is failed immediately with a CapacityExceeded error
    Reject,
}

/// Controls how the waiting period between connection attempts grows
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum ReconnectBackoffType {

    /// The waiting period doubles after each failed attempt, up to the maximum period
    #[default]
    Exponential,

    /// Every waiting period equals the base period
    Fixed,
}

/// Controls what kind of jitter, if any, the session will apply to the waiting period
/// in-between connection attempts.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum ExponentialBackoffJitterType {

    /// No jitter; useful for correctness testing.
    #[default]
    None,

    /// The session will pick a wait duration uniformly between 0 and the current backoff period.
    Uniform
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct ReconnectOptions {
    pub(crate) backoff_type: ReconnectBackoffType,
    pub(crate) reconnect_period_jitter: ExponentialBackoffJitterType,
    pub(crate) base_reconnect_period: Duration,
    pub(crate) max_reconnect_period: Duration,
    pub(crate) reconnect_stability_reset_period: Duration,
    pub(crate) max_reconnect_attempts: Option<u32>,
}

impl ReconnectOptions {
    pub(crate) fn normalize(&mut self) {
        if self.base_reconnect_period > self.max_reconnect_period {
            std::mem::swap(&mut self.base_reconnect_period, &mut self.max_reconnect_period)
        }
    }

    /// A zero base period turns automatic reconnection off
    pub(crate) fn is_enabled(&self) -> bool {
        !self.base_reconnect_period.is_zero()
    }
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        ReconnectOptions {
            backoff_type: ReconnectBackoffType::default(),
            reconnect_period_jitter: ExponentialBackoffJitterType::default(),
            base_reconnect_period: Duration::from_secs(1),
            max_reconnect_period: Duration::from_secs(120),
            reconnect_stability_reset_period: Duration::from_secs(30),
            max_reconnect_attempts: None,
        }
    }
}

/// Session-level behavioral configuration
pub struct SessionOptions {
    pub(crate) offline_queue_policy: OfflineQueuePolicy,

    pub(crate) connect_timeout: Duration,
    pub(crate) ping_timeout: Duration,

    pub(crate) max_inflight: u16,
    pub(crate) inflight_limit_policy: InflightLimitPolicy,

    pub(crate) packet_id_policy: PacketIdPolicy,

    pub(crate) reconnect_options: ReconnectOptions,

    pub(crate) outgoing_store: Option<Box<dyn MessageStore>>,
    pub(crate) incoming_store: Option<Box<dyn MessageStore>>,
}

impl SessionOptions {

    /// Creates a new builder for SessionOptions instances
    pub fn builder() -> SessionOptionsBuilder {
        SessionOptionsBuilder::new()
    }
}

impl Debug for SessionOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionOptions {{ ")?;
        write!(f, "offline_queue_policy: {:?}, ", self.offline_queue_policy)?;
        write!(f, "connect_timeout: {:?}, ", self.connect_timeout)?;
        write!(f, "ping_timeout: {:?}, ", self.ping_timeout)?;
        write!(f, "max_inflight: {}, ", self.max_inflight)?;
        write!(f, "inflight_limit_policy: {:?}, ", self.inflight_limit_policy)?;
        write!(f, "packet_id_policy: {:?}, ", self.packet_id_policy)?;
        write!(f, "reconnect_options: {:?}, ", self.reconnect_options)?;
        write!(f, "outgoing_store: {}, ", if self.outgoing_store.is_some() { "Some(...)" } else { "None" })?;
        write!(f, "incoming_store: {} ", if self.incoming_store.is_some() { "Some(...)" } else { "None" })?;

        write!(f, "}}")
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            offline_queue_policy: OfflineQueuePolicy::default(),
            connect_timeout: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
            max_inflight: DEFAULT_MAX_INFLIGHT,
            inflight_limit_policy: InflightLimitPolicy::default(),
            packet_id_policy: PacketIdPolicy::default(),
            reconnect_options: ReconnectOptions::default(),
            outgoing_store: None,
            incoming_store: None,
        }
    }
}

/// A builder for session-level behavior configuration options
#[derive(Default)]
pub struct SessionOptionsBuilder {
    options: SessionOptions
}

impl SessionOptionsBuilder {

    /// Creates a new builder object for SessionOptions
    pub fn new() -> Self {
        SessionOptionsBuilder {
            options: SessionOptions::default()
        }
    }

    /// Configures how the session should treat queued and newly-submitted operations while
    /// it does not have a connection to the broker.
    pub fn with_offline_queue_policy(mut self, offline_queue_policy: OfflineQueuePolicy) -> Self {
        self.options.offline_queue_policy = offline_queue_policy;
        self
    }

    /// Configures how long a connection attempt may take, from opening the transport to
    /// receiving a successful CONNACK.  Defaults to thirty seconds.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.options.connect_timeout = connect_timeout;
        self
    }

    /// Configures how long, after sending a PINGREQ, the session will wait for a response before
    /// giving up on the connection.  The effective value never exceeds half the keep alive
    /// interval.  Defaults to ten seconds.
    pub fn with_ping_timeout(mut self, ping_timeout: Duration) -> Self {
        self.options.ping_timeout = ping_timeout;
        self
    }

    /// Bounds the number of concurrent outbound QoS 1+ exchanges.  Defaults to 65535.
    pub fn with_max_inflight(mut self, max_inflight: u16) -> Self {
        self.options.max_inflight = max_inflight;
        self
    }

    /// Configures what happens to publishes submitted beyond the in-flight bound
    pub fn with_inflight_limit_policy(mut self, inflight_limit_policy: InflightLimitPolicy) -> Self {
        self.options.inflight_limit_policy = inflight_limit_policy;
        self
    }

    /// Configures how packet identifiers are chosen
    pub fn with_packet_id_policy(mut self, packet_id_policy: PacketIdPolicy) -> Self {
        self.options.packet_id_policy = packet_id_policy;
        self
    }

    /// Configures how the waiting period between connection attempts grows
    pub fn with_reconnect_backoff_type(mut self, backoff_type: ReconnectBackoffType) -> Self {
        self.options.reconnect_options.backoff_type = backoff_type;
        self
    }

    /// Configures what kind of jitter, if any, should be applied to the waiting period between
    /// connection attempts.
    pub fn with_reconnect_period_jitter(mut self, reconnect_period_jitter: ExponentialBackoffJitterType) -> Self {
        self.options.reconnect_options.reconnect_period_jitter = reconnect_period_jitter;
        self
    }

    /// Configures the base amount of time to wait between connection attempts.  Zero disables
    /// automatic reconnection.  Defaults to one second.
    pub fn with_base_reconnect_period(mut self, base_reconnect_period: Duration) -> Self {
        self.options.reconnect_options.base_reconnect_period = base_reconnect_period;
        self
    }

    /// Configures the maximum amount of time to wait between connection attempts.  Defaults to
    /// two minutes.
    pub fn with_max_reconnect_period(mut self, max_reconnect_period: Duration) -> Self {
        self.options.reconnect_options.max_reconnect_period = max_reconnect_period;
        self
    }

    /// Configures the interval of time that the session must remain successfully connected
    /// before the reconnect backoff is reset.  Defaults to thirty seconds.
    pub fn with_reconnect_stability_reset_period(mut self, reconnect_stability_reset_period: Duration) -> Self {
        self.options.reconnect_options.reconnect_stability_reset_period = reconnect_stability_reset_period;
        self
    }

    /// Configures how many consecutive failed connection attempts are made before the session
    /// gives up and settles in the disconnected state.  Unlimited by default.
    pub fn with_max_reconnect_attempts(mut self, max_reconnect_attempts: u32) -> Self {
        self.options.reconnect_options.max_reconnect_attempts = Some(max_reconnect_attempts);
        self
    }

    /// Replaces the in-memory store used for outbound QoS 1+ exchanges
    pub fn with_outgoing_store(mut self, store: Box<dyn MessageStore>) -> Self {
        self.options.outgoing_store = Some(store);
        self
    }

    /// Replaces the in-memory store used for inbound QoS 2 exchanges
    pub fn with_incoming_store(mut self, store: Box<dyn MessageStore>) -> Self {
        self.options.incoming_store = Some(store);
        self
    }

    /// Builds a new set of session options
    pub fn build(self) -> SessionOptions {
        self.options
    }
}

/// The transport a broker url selects
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TransportKind {

    /// Plain TCP
    Tcp,

    /// TLS over TCP
    Tls,

    /// Websockets over TCP
    Websocket,

    /// Websockets over TLS over TCP
    SecureWebsocket,
}

impl TransportKind {
    fn default_port(&self) -> u16 {
        match self {
            TransportKind::Tcp => { 1883 }
            TransportKind::Tls => { 8883 }
            TransportKind::Websocket => { 80 }
            TransportKind::SecureWebsocket => { 443 }
        }
    }

    /// Returns whether the transport requires a TLS handshake
    pub fn is_secure(&self) -> bool {
        matches!(self, TransportKind::Tls | TransportKind::SecureWebsocket)
    }

    /// Returns whether the transport performs a websocket upgrade
    pub fn is_websocket(&self) -> bool {
        matches!(self, TransportKind::Websocket | TransportKind::SecureWebsocket)
    }
}

/// Where and how to reach a broker, parsed from a broker url such as `mqtts://broker:8883`
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BrokerEndpoint {

    /// Transport selected by the url scheme
    pub transport: TransportKind,

    /// Broker host name or address
    pub host: String,

    /// Broker port; defaults from the scheme when absent
    pub port: u16,

    /// Websocket request path (and query); `/mqtt` when absent.  Empty for non-websocket
    /// transports.
    pub path: String,
}

impl BrokerEndpoint {

    /// Parses a broker url.  Recognized schemes are `mqtt`/`tcp`, `mqtts`/`ssl`/`tls`, `ws`, and
    /// `wss`.
    pub fn parse(url: &str) -> MqttResult<Self> {
        let uri = url.parse::<http::Uri>()?;

        let transport =
            match uri.scheme_str() {
                Some("mqtt") | Some("tcp") => { TransportKind::Tcp }
                Some("mqtts") | Some("ssl") | Some("tls") => { TransportKind::Tls }
                Some("ws") => { TransportKind::Websocket }
                Some("wss") => { TransportKind::SecureWebsocket }
                Some(scheme) => {
                    return Err(MqttError::new_invalid_configuration(format!("unsupported broker url scheme \"{}\"", scheme)));
                }
                None => {
                    return Err(MqttError::new_invalid_configuration("broker url has no scheme"));
                }
            };

        let host =
            match uri.host() {
                Some(host) if !host.is_empty() => { host.trim_start_matches('[').trim_end_matches(']').to_string() }
                _ => {
                    return Err(MqttError::new_invalid_configuration("broker url has no host"));
                }
            };

        let port = uri.port_u16().unwrap_or_else(|| transport.default_port());

        let path =
            if transport.is_websocket() {
                match uri.path_and_query().map(|path_and_query| path_and_query.as_str()) {
                    None | Some("") | Some("/") => { "/mqtt".to_string() }
                    Some(path) => { path.to_string() }
                }
            } else {
                String::new()
            };

        let endpoint = BrokerEndpoint {
            transport,
            host,
            port,
            path
        };

        debug!("BrokerEndpoint::parse - {} parsed as {:?}", url, endpoint);

        Ok(endpoint)
    }

    pub(crate) fn websocket_uri(&self) -> String {
        let scheme = if self.transport.is_secure() { "wss" } else { "ws" };
        format!("{}://{}:{}{}", scheme, self.host, self.port, self.path)
    }
}
