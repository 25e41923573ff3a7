/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing the public session client and associated types necessary to invoke operations
on it.
 */

#![warn(missing_docs)]

pub(crate) mod shared_impl;
pub mod tokio_impl;

use crate::client::shared_impl::*;
use crate::client::tokio_impl::*;
use crate::config::*;
use crate::error::{MqttError, MqttResult};
use crate::mqtt::*;
use crate::mqtt::utils::*;
use crate::validate::*;

use log::*;
use std::fmt;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};

/// Additional client options applicable to an MQTT Publish operation
#[derive(Debug, Default, Clone)]
pub struct PublishOptions {
    pub(crate) ack_timeout: Option<Duration>,
    pub(crate) retain: bool,
}

impl PublishOptions {

    /// Creates a new builder for PublishOptions instances
    pub fn builder() -> PublishOptionsBuilder {
        PublishOptionsBuilder::new()
    }
}

/// Builder type for the optional behavior of an MQTT Publish operation
#[derive(Default)]
pub struct PublishOptionsBuilder {
    options: PublishOptions
}

impl PublishOptionsBuilder {

    /// Creates a new builder object for PublishOptions
    pub fn new() -> Self {
        PublishOptionsBuilder {
            ..Default::default()
        }
    }

    /// Sets the time allowed between writing the publish and receiving its final
    /// acknowledgement.  Has no effect on QoS 0 publishes.
    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.options.ack_timeout = Some(ack_timeout);
        self
    }

    /// Sets the retain flag of the publish
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.options.retain = retain;
        self
    }

    /// Creates a new PublishOptions object from what was configured on the builder.
    pub fn build(self) -> PublishOptions {
        self.options
    }
}

/// Final acknowledgement of a QoS 2 publish
#[derive(Debug, Eq, PartialEq)]
pub enum Qos2Response {

    /// The exchange ended at PUBREC, either because the broker failed it or because the
    /// session it belonged to was not resumed after the PUBREC had been received
    Pubrec(PubrecPacket),

    /// The exchange completed normally
    Pubcomp(PubcompPacket),
}

impl Display for Qos2Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Qos2Response::Pubrec(pubrec) => {
                write!(f, "Pubrec ( {} )", pubrec)
            }
            Qos2Response::Pubcomp(pubcomp) => {
                write!(f, "Pubcomp ( {} )", pubcomp)
            }
        }
    }
}

/// Result of a successful publish, which varies by QoS level
#[derive(Debug, Eq, PartialEq)]
pub enum PublishResponse {

    /// QoS 0 publishes complete as soon as they are written to the transport
    Qos0,

    /// QoS 1 publishes complete with the broker's PUBACK
    Qos1(PubackPacket),

    /// QoS 2 publishes complete with the last packet of the exchange
    Qos2(Qos2Response),
}

impl Display for PublishResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PublishResponse::Qos0 => {
                write!(f, "PublishResponse Qos0")
            }
            PublishResponse::Qos1(puback) => {
                write!(f, "PublishResponse Qos1 ( {} )", puback)
            }
            PublishResponse::Qos2(qos2response) => {
                write!(f, "PublishResponse Qos2 ( {} )", qos2response)
            }
        }
    }
}

/// Result type for the final outcome of a Publish operation
pub type PublishResult = MqttResult<PublishResponse>;

/// Return type of a Publish operation
pub type PublishResultFuture = dyn Future<Output = PublishResult> + Send;

/// Additional client options applicable to an MQTT Subscribe operation
#[derive(Debug, Default, Clone)]
pub struct SubscribeOptions {
    pub(crate) ack_timeout: Option<Duration>,
}

impl SubscribeOptions {

    /// Creates a new builder for SubscribeOptions instances
    pub fn builder() -> SubscribeOptionsBuilder {
        SubscribeOptionsBuilder::new()
    }
}

/// Builder type for the optional behavior of an MQTT Subscribe operation
#[derive(Default)]
pub struct SubscribeOptionsBuilder {
    options: SubscribeOptions
}

impl SubscribeOptionsBuilder {

    /// Creates a new builder object for SubscribeOptions
    pub fn new() -> Self {
        SubscribeOptionsBuilder {
            ..Default::default()
        }
    }

    /// Sets the time allowed between writing the subscribe and receiving its SUBACK.
    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.options.ack_timeout = Some(ack_timeout);
        self
    }

    /// Creates a new SubscribeOptions object from what was configured on the builder.
    pub fn build(self) -> SubscribeOptions {
        self.options
    }
}

/// Result type for the final outcome of a Subscribe operation
pub type SubscribeResult = MqttResult<SubackPacket>;

/// Return type of a Subscribe operation
pub type SubscribeResultFuture = dyn Future<Output = SubscribeResult> + Send;

/// Additional client options applicable to an MQTT Unsubscribe operation
#[derive(Debug, Default, Clone)]
pub struct UnsubscribeOptions {
    pub(crate) ack_timeout: Option<Duration>,
}

impl UnsubscribeOptions {

    /// Creates a new builder for UnsubscribeOptions instances
    pub fn builder() -> UnsubscribeOptionsBuilder {
        UnsubscribeOptionsBuilder::new()
    }
}

/// Builder type for the optional behavior of an MQTT Unsubscribe operation
#[derive(Default)]
pub struct UnsubscribeOptionsBuilder {
    options: UnsubscribeOptions
}

impl UnsubscribeOptionsBuilder {

    /// Creates a new builder object for UnsubscribeOptions
    pub fn new() -> Self {
        UnsubscribeOptionsBuilder {
            ..Default::default()
        }
    }

    /// Sets the time allowed between writing the unsubscribe and receiving its UNSUBACK.
    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.options.ack_timeout = Some(ack_timeout);
        self
    }

    /// Creates a new UnsubscribeOptions object from what was configured on the builder.
    pub fn build(self) -> UnsubscribeOptions {
        self.options
    }
}

/// Result type for the final outcome of an Unsubscribe operation
pub type UnsubscribeResult = MqttResult<UnsubackPacket>;

/// Return type of an Unsubscribe operation
pub type UnsubscribeResultFuture = dyn Future<Output = UnsubscribeResult> + Send;

pub(crate) type ResponseHandler<T> = Box<dyn FnOnce(T) -> MqttResult<()> + Send>;

pub(crate) struct PublishOptionsInternal {
    pub(crate) options: PublishOptions,
    pub(crate) response_handler: Option<ResponseHandler<PublishResult>>,
}

pub(crate) struct SubscribeOptionsInternal {
    pub(crate) options: SubscribeOptions,
    pub(crate) response_handler: Option<ResponseHandler<SubscribeResult>>,
}

pub(crate) struct UnsubscribeOptionsInternal {
    pub(crate) options: UnsubscribeOptions,
    pub(crate) response_handler: Option<ResponseHandler<UnsubscribeResult>>,
}

/// Connection-scoped values established by a successful CONNACK
#[derive(Default, Clone, PartialEq, Eq, Debug)]
pub struct NegotiatedSettings {

    /// Protocol version spoken on the connection
    pub protocol_version: ProtocolVersion,

    /// Client id in use for the current connection.  Broker-assigned when the CONNECT carried
    /// none.
    pub client_id: String,

    /// Keep alive interval in effect, in seconds.  Zero means keep alive is disabled.
    pub keep_alive_interval_seconds: u16,

    /// The number of QoS 1 and QoS 2 publications the server is willing to process concurrently.
    pub receive_maximum_from_server: u16,

    /// The maximum QoS allowed between the server and client.
    pub maximum_qos: QualityOfService,

    /// Whether or not the client has rejoined an existing session.
    pub rejoined_session: bool,
}

impl Display for NegotiatedSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "NegotiatedSettings {{")?;
        writeln!(f, "  protocol_version: {}", protocol_version_to_str(self.protocol_version))?;
        writeln!(f, "  client_id: {}", self.client_id)?;
        writeln!(f, "  keep_alive_interval_seconds: {}", self.keep_alive_interval_seconds)?;
        writeln!(f, "  receive_maximum_from_server: {}", self.receive_maximum_from_server)?;
        writeln!(f, "  maximum_qos: {}", quality_of_service_to_str(self.maximum_qos))?;
        writeln!(f, "  rejoined_session: {}", self.rejoined_session)?;
        write!(f, "}}")?;

        Ok(())
    }
}

/// Externally visible lifecycle state of a session
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionState {

    /// No connection and no attempt in progress
    Disconnected,

    /// Opening the transport or waiting on the CONNACK
    Connecting,

    /// CONNACK received; operations flow
    Connected,

    /// The connection was lost and another attempt is scheduled
    Reconnecting,

    /// A graceful shutdown is flushing its DISCONNECT
    Disconnecting,

    /// Ended by the user.  A later connect leaves this state.
    Closed,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => { write!(f, "Disconnected") }
            ConnectionState::Connecting => { write!(f, "Connecting") }
            ConnectionState::Connected => { write!(f, "Connected") }
            ConnectionState::Reconnecting => { write!(f, "Reconnecting") }
            ConnectionState::Disconnecting => { write!(f, "Disconnecting") }
            ConnectionState::Closed => { write!(f, "Closed") }
        }
    }
}

/// An event emitted by the session every time it attempts to establish a new network connection
#[derive(Debug)]
pub struct ConnectionAttemptEvent {}

/// An event emitted by the session after receiving a successful CONNACK from the broker.
#[derive(Debug)]
pub struct ConnectionSuccessEvent {

    /// Successful CONNACK packet received from the broker.
    pub connack: ConnackPacket,

    /// Final values for the connection-scoped settings
    pub settings: NegotiatedSettings
}

/// An event emitted when a connection attempt fails for any reason
#[derive(Debug)]
pub struct ConnectionFailureEvent {

    /// Reason that the connection attempt failed
    pub error: MqttError,

    /// The CONNACK packet received from the broker, if the attempt got that far
    pub connack: Option<ConnackPacket>,
}

/// An event emitted when a successfully established connection is shut down
#[derive(Debug)]
pub struct DisconnectionEvent {

    /// Reason the connection was shut down
    pub error: MqttError,

    /// MQTT5 DISCONNECT packet sent by the broker, if that is what ended the connection
    pub disconnect: Option<DisconnectPacket>,
}

/// An event emitted when the session has scheduled another connection attempt
#[derive(Debug)]
pub struct ReconnectScheduledEvent {

    /// One-based index of the scheduled attempt since the last successful connection
    pub attempt: u32,

    /// Time until the next attempt begins
    pub delay: Duration,
}

/// An event emitted when the session has been ended by the user
#[derive(Debug)]
pub struct ClosedEvent {}

/// An event emitted when an application message is delivered by the broker.  Redelivered QoS 2
/// messages are only emitted once.
#[derive(Debug)]
pub struct PublishReceivedEvent {

    /// Received publish
    pub publish: PublishPacket
}

/// An event emitted when the broker acknowledges a packet id that has no exchange behind it
#[derive(Debug)]
pub struct DuplicateAckEvent {

    /// Type of the unmatched acknowledgement
    pub packet_type: PacketType,

    /// Packet id the acknowledgement carried
    pub packet_id: u16,
}

/// Union type for all of the different event types emitted by the session.
#[derive(Debug)]
pub enum ClientEvent {

    /// An event emitted every time the session attempts to establish a new network connection
    ConnectionAttempt(ConnectionAttemptEvent),

    /// An event emitted after receiving a successful CONNACK from the broker.
    ConnectionSuccess(ConnectionSuccessEvent),

    /// An event emitted when a connection attempt fails for any reason
    ConnectionFailure(ConnectionFailureEvent),

    /// An event emitted when a successfully established connection is shut down
    Disconnection(DisconnectionEvent),

    /// An event emitted when another connection attempt has been scheduled
    ReconnectScheduled(ReconnectScheduledEvent),

    /// An event emitted when the session has been ended
    Closed(ClosedEvent),

    /// An event emitted when an application message is received from the broker
    PublishReceived(PublishReceivedEvent),

    /// An event emitted when the broker acknowledges an unknown packet id
    DuplicateAck(DuplicateAckEvent),
}

impl Display for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientEvent::ConnectionAttempt(_) => { write!(f, "ConnectionAttempt") }
            ClientEvent::ConnectionSuccess(event) => { write!(f, "ConnectionSuccess {{ rejoined_session: {} }}", event.settings.rejoined_session) }
            ClientEvent::ConnectionFailure(event) => { write!(f, "ConnectionFailure {{ error: {} }}", event.error) }
            ClientEvent::Disconnection(event) => { write!(f, "Disconnection {{ error: {} }}", event.error) }
            ClientEvent::ReconnectScheduled(event) => { write!(f, "ReconnectScheduled {{ attempt: {}, delay: {:?} }}", event.attempt, event.delay) }
            ClientEvent::Closed(_) => { write!(f, "Closed") }
            ClientEvent::PublishReceived(event) => { write!(f, "PublishReceived {{ {} }}", event.publish) }
            ClientEvent::DuplicateAck(event) => { write!(f, "DuplicateAck {{ {} {} }}", event.packet_type, event.packet_id) }
        }
    }
}

/// Receiving half of an event listener registration.  Dropping it unregisters the listener.
pub type ClientEventReceiver = mpsc::UnboundedReceiver<Arc<ClientEvent>>;

macro_rules! submit_client_operation {
    ($self:ident, $operation_type:ident, $options_internal_type: ident, $options_value: expr, $packet_value: expr) => ({

        let (response_sender, response_receiver) = oneshot::channel();
        let response_handler = Box::new(move |result| {
            if response_sender.send(result).is_err() {
                return Err(MqttError::new_operation_channel_failure("operation result receiver dropped"));
            }

            Ok(())
        });
        let internal_options = $options_internal_type {
            options : $options_value.unwrap_or_default(),
            response_handler : Some(response_handler)
        };
        let send_result = $self.send_operation(OperationOptions::$operation_type($packet_value, internal_options));
        Box::pin(async move {
            send_result?;
            response_receiver.await?
        })
    })
}

/// An MQTT client session.
///
/// All protocol work happens on a task spawned into the supplied tokio runtime; the session
/// object is a cheaply cloneable handle that submits operations to that task.  The task exits,
/// closing both message stores, once every handle has been dropped.
#[derive(Clone)]
pub struct SessionClient {
    operation_sender: mpsc::UnboundedSender<OperationOptions>,
    state_receiver: watch::Receiver<ConnectionState>,
}

impl SessionClient {

    /// Validates configuration and creates a new session whose event loop runs on the tokio
    /// runtime identified by `runtime_handle`.  The session starts Disconnected.
    pub fn new_with_tokio<T>(connect_options: ConnectOptions, session_options: SessionOptions, tokio_options: TokioSessionOptions<T>, runtime_handle: &Handle) -> MqttResult<SessionClient> where T : AsyncRead + AsyncWrite + Send + Sync + 'static {
        validate_connect_options(&connect_options)?;
        validate_session_options(&session_options)?;

        let (state_sender, state_receiver) = watch::channel(ConnectionState::Disconnected);
        let session_impl = SessionImpl::new(connect_options, session_options, state_sender)?;
        let (operation_sender, runtime_state) = create_runtime_states(tokio_options);

        spawn_session_impl(session_impl, runtime_state, runtime_handle);

        Ok(SessionClient {
            operation_sender,
            state_receiver,
        })
    }

    fn send_operation(&self, operation: OperationOptions) -> MqttResult<()> {
        if let Err(send_error) = self.operation_sender.send(operation) {
            return Err(MqttError::new_operation_channel_failure(send_error.to_string()));
        }

        Ok(())
    }

    /// Starts maintaining a connection to the broker.  Resolves when the first CONNACK success
    /// arrives, or with the error that ended the first failed attempt.  Reconnection continues
    /// according to the reconnect options either way.
    pub async fn connect(&self) -> MqttResult<()> {
        info!("session connect invoked");
        let (sender, receiver) = oneshot::channel();
        self.send_operation(OperationOptions::Connect(sender))?;

        receiver.await?
    }

    /// Submits a publish.  The returned future completes when the exchange matching the QoS level
    /// finishes.
    pub fn publish(&self, topic: &str, payload: &[u8], qos: QualityOfService, options: Option<PublishOptions>) -> Pin<Box<PublishResultFuture>> {
        debug!("Publish operation submitted");
        let packet = PublishPacket {
            topic: topic.to_string(),
            qos,
            retain: options.as_ref().map(|options| options.retain).unwrap_or(false),
            payload: Some(payload.to_vec()),
            ..Default::default()
        };

        if let Err(error) = validate_publish_outbound(&packet) {
            return Box::pin(async move { Err(error) });
        }

        let boxed_packet = Box::new(MqttPacket::Publish(packet));
        submit_client_operation!(self, Publish, PublishOptionsInternal, options, boxed_packet)
    }

    /// Submits a subscribe.  The returned future completes with the broker's SUBACK.
    pub fn subscribe(&self, subscriptions: Vec<Subscription>, options: Option<SubscribeOptions>) -> Pin<Box<SubscribeResultFuture>> {
        debug!("Subscribe operation submitted");
        let packet = SubscribePacket {
            packet_id: 0,
            subscriptions,
        };

        if let Err(error) = validate_subscribe_outbound(&packet) {
            return Box::pin(async move { Err(error) });
        }

        let boxed_packet = Box::new(MqttPacket::Subscribe(packet));
        submit_client_operation!(self, Subscribe, SubscribeOptionsInternal, options, boxed_packet)
    }

    /// Submits an unsubscribe.  The returned future completes with the broker's UNSUBACK.
    pub fn unsubscribe(&self, topic_filters: Vec<String>, options: Option<UnsubscribeOptions>) -> Pin<Box<UnsubscribeResultFuture>> {
        debug!("Unsubscribe operation submitted");
        let packet = UnsubscribePacket {
            packet_id: 0,
            topic_filters,
        };

        if let Err(error) = validate_unsubscribe_outbound(&packet) {
            return Box::pin(async move { Err(error) });
        }

        let boxed_packet = Box::new(MqttPacket::Unsubscribe(packet));
        submit_client_operation!(self, Unsubscribe, UnsubscribeOptionsInternal, options, boxed_packet)
    }

    /// Ends the session's connection and moves it to Closed.
    ///
    /// Without `force`, a connected session first writes a DISCONNECT ahead of any queued work.
    /// With `force`, the transport is dropped immediately.  Either way every pending operation
    /// is failed once Closed is reached; stored in-flight exchanges are kept for a later resumed
    /// session.  Ending an already closed session succeeds immediately.
    pub async fn end(&self, force: bool) -> MqttResult<()> {
        info!("session end invoked, force: {}", force);
        let (sender, receiver) = oneshot::channel();
        self.send_operation(OperationOptions::End(force, sender))?;

        receiver.await?
    }

    /// Returns the session's current lifecycle state
    pub fn connection_state(&self) -> ConnectionState {
        *self.state_receiver.borrow()
    }

    /// Returns a watch receiver that observes every lifecycle state change
    pub fn state_watcher(&self) -> watch::Receiver<ConnectionState> {
        self.state_receiver.clone()
    }

    /// Registers a new event listener.  Events are delivered in emission order; dropping the
    /// receiver removes the listener.
    pub fn add_event_listener(&self) -> MqttResult<ClientEventReceiver> {
        debug!("AddListener operation submitted");
        let (sender, receiver) = mpsc::unbounded_channel();
        self.send_operation(OperationOptions::AddListener(sender))?;

        Ok(receiver)
    }
}
