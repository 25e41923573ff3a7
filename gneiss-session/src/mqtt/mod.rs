/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing the decoded MQTT control packet model consumed and produced by the session
engine.

Packets are plain data.  Turning them into bytes (and back) is the job of a
[`Codec`](crate::codec::Codec) implementation supplied by the user, so every field is public.
Only the subset of MQTT5 properties that affects session behavior is modeled.
 */

pub mod utils;

use crate::error::MqttError;

use std::fmt;

/// Version of the MQTT protocol spoken on a connection.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum ProtocolVersion {

    /// MQTT 3.1, protocol name "MQIsdp", protocol level 3
    Mqtt31,

    /// MQTT 3.1.1, protocol name "MQTT", protocol level 4
    #[default]
    Mqtt311,

    /// MQTT 5.0, protocol name "MQTT", protocol level 5
    Mqtt5,
}

impl ProtocolVersion {

    /// Returns the protocol level byte written into the CONNECT variable header
    pub fn protocol_level(&self) -> u8 {
        match self {
            ProtocolVersion::Mqtt31 => { 3 }
            ProtocolVersion::Mqtt311 => { 4 }
            ProtocolVersion::Mqtt5 => { 5 }
        }
    }

    /// Returns the protocol name written into the CONNECT variable header
    pub fn protocol_name(&self) -> &'static str {
        match self {
            ProtocolVersion::Mqtt31 => { "MQIsdp" }
            _ => { "MQTT" }
        }
    }
}

/// MQTT message delivery quality of service.
///
/// Enum values match the MQTT encoding values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum QualityOfService {

    /// The message arrives at the receiver either once or not at all.
    #[default]
    AtMostOnce = 0,

    /// The message arrives at the receiver at least once.
    AtLeastOnce = 1,

    /// The message arrives at the receiver exactly once.
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QualityOfService {
    type Error = MqttError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        utils::convert_u8_to_quality_of_service(value)
    }
}

/// Server return code for connection attempts.
///
/// Values match MQTT5 encoding.  MQTT 3.1/3.1.1 return codes are mapped onto this enum by
/// [`utils::convert_connect_return_code_311`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnectReasonCode {

    /// The connection is accepted.
    #[default]
    Success = 0,

    /// The server failed but does not want to specify a reason.
    UnspecifiedError = 128,

    /// Data in the CONNECT packet could not be correctly parsed by the server.
    MalformedPacket = 129,

    /// Data in the CONNECT packet does not conform to the specification.
    ProtocolError = 130,

    /// The CONNECT packet is valid but was not accepted by the server.
    ImplementationSpecificError = 131,

    /// The server does not support the requested protocol version.
    UnsupportedProtocolVersion = 132,

    /// The client identifier is not allowed on the server.
    ClientIdentifierNotValid = 133,

    /// The username and/or password were not accepted.
    BadUsernameOrPassword = 134,

    /// The client is not authorized to connect.
    NotAuthorized = 135,

    /// The server is not available.
    ServerUnavailable = 136,

    /// The server is too busy; try again later.
    ServerBusy = 137,

    /// The client has been banned.
    Banned = 138,

    /// The authentication method is not supported.
    BadAuthenticationMethod = 140,

    /// The will topic is not accepted.
    TopicNameInvalid = 144,

    /// The CONNECT packet exceeded the maximum permissible size.
    PacketTooLarge = 149,

    /// A quota has been exceeded.
    QuotaExceeded = 151,

    /// The will payload does not match its payload format indicator.
    PayloadFormatInvalid = 153,

    /// The server does not support retained messages but the will requested retain.
    RetainNotSupported = 154,

    /// The server does not support the will QoS.
    QosNotSupported = 155,

    /// The client should temporarily use another server.
    UseAnotherServer = 156,

    /// The client should permanently use another server.
    ServerMoved = 157,

    /// The connection rate limit has been exceeded.
    ConnectionRateExceeded = 159,
}

impl ConnectReasonCode {
    /// Returns whether or not the reason code represents a successful connect
    pub fn is_success(&self) -> bool {
        matches!(self, ConnectReasonCode::Success)
    }
}

/// Reason code inside PUBACK packets.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PubackReasonCode {

    /// The (QoS 1) publish was accepted.
    #[default]
    Success = 0,

    /// The publish was accepted but there were no matching subscribers.
    NoMatchingSubscribers = 16,

    /// The publish was not accepted, no reason given.
    UnspecifiedError = 128,

    /// The publish was valid but the receiver was not willing to accept it.
    ImplementationSpecificError = 131,

    /// The publish was not authorized.
    NotAuthorized = 135,

    /// The topic name was valid but not accepted.
    TopicNameInvalid = 144,

    /// The packet identifier was already in use by the receiver.
    PacketIdentifierInUse = 145,

    /// An internal quota on the recipient was exceeded.
    QuotaExceeded = 151,

    /// The payload did not match its payload format indicator.
    PayloadFormatInvalid = 153,
}

impl PubackReasonCode {
    /// Returns whether or not the reason code represents a successful publish
    pub fn is_success(&self) -> bool {
        matches!(self, PubackReasonCode::Success | PubackReasonCode::NoMatchingSubscribers)
    }
}

/// Reason code inside PUBREC packets.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PubrecReasonCode {

    /// The (QoS 2) publish was accepted.
    #[default]
    Success = 0,

    /// The publish was accepted but there were no matching subscribers.
    NoMatchingSubscribers = 16,

    /// The publish was not accepted, no reason given.
    UnspecifiedError = 128,

    /// The publish was valid but the receiver was not willing to accept it.
    ImplementationSpecificError = 131,

    /// The publish was not authorized.
    NotAuthorized = 135,

    /// The topic name was valid but not accepted.
    TopicNameInvalid = 144,

    /// The packet identifier was already in use by the receiver.
    PacketIdentifierInUse = 145,

    /// An internal quota on the recipient was exceeded.
    QuotaExceeded = 151,

    /// The payload did not match its payload format indicator.
    PayloadFormatInvalid = 153,
}

impl PubrecReasonCode {
    /// Returns whether or not the reason code represents a successful publish.  A failing
    /// PUBREC ends the QoS 2 exchange without a PUBREL.
    pub fn is_success(&self) -> bool {
        matches!(self, PubrecReasonCode::Success | PubrecReasonCode::NoMatchingSubscribers)
    }
}

/// Reason code inside PUBREL packets.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PubrelReasonCode {

    /// The associated PUBREC was accepted.
    #[default]
    Success = 0,

    /// The packet id was not being tracked as an in-progress QoS 2 delivery.
    PacketIdentifierNotFound = 146,
}

/// Reason code inside PUBCOMP packets.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PubcompReasonCode {

    /// The associated PUBREL was accepted, completing the QoS 2 exchange.
    #[default]
    Success = 0,

    /// The packet id was not being tracked as an in-progress QoS 2 delivery.
    PacketIdentifierNotFound = 146,
}

/// Reason code inside DISCONNECT packets (MQTT5 only).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DisconnectReasonCode {

    /// Close the connection normally; do not send the will message.
    #[default]
    NormalDisconnection = 0,

    /// Close the connection normally but send the will message.
    DisconnectWithWillMessage = 4,

    /// No reason given.
    UnspecifiedError = 128,

    /// A received packet could not be parsed.
    MalformedPacket = 129,

    /// An unexpected or out-of-order packet was received.
    ProtocolError = 130,

    /// A valid packet was received that could not be processed.
    ImplementationSpecificError = 131,

    /// The request is not authorized.
    NotAuthorized = 135,

    /// The server is busy.
    ServerBusy = 137,

    /// The server is shutting down.
    ServerShuttingDown = 139,

    /// No packet was received within 1.5 times the keep alive.
    KeepAliveTimeout = 141,

    /// Another connection using the same client id has connected.
    SessionTakenOver = 142,

    /// A topic filter was well formed but not accepted.
    TopicFilterInvalid = 143,

    /// A topic name was well formed but not accepted.
    TopicNameInvalid = 144,

    /// More in-flight QoS 1+ publishes were received than the receive maximum allows.
    ReceiveMaximumExceeded = 147,

    /// A topic alias was invalid.
    TopicAliasInvalid = 148,

    /// A packet exceeded the maximum permissible size.
    PacketTooLarge = 149,

    /// The received data rate is too high.
    MessageRateTooHigh = 150,

    /// A quota has been exceeded.
    QuotaExceeded = 151,

    /// The connection was closed due to an administrative action.
    AdministrativeAction = 152,

    /// A payload did not match its payload format indicator.
    PayloadFormatInvalid = 153,

    /// Retained messages are not supported.
    RetainNotSupported = 154,

    /// A QoS greater than the maximum QoS was used.
    QosNotSupported = 155,

    /// Temporarily use another server.
    UseAnotherServer = 156,

    /// Permanently use another server.
    ServerMoved = 157,

    /// Shared subscriptions are not supported.
    SharedSubscriptionsNotSupported = 158,

    /// The connection rate limit has been exceeded.
    ConnectionRateExceeded = 159,

    /// The maximum connection time authorized has been exceeded.
    MaximumConnectTime = 160,

    /// Subscription identifiers are not supported.
    SubscriptionIdentifiersNotSupported = 161,

    /// Wildcard subscriptions are not supported.
    WildcardSubscriptionsNotSupported = 162,
}

/// Reason codes inside SUBACK packet payloads, one per requested subscription.
///
/// MQTT 3.1.1 SUBACK return codes (0, 1, 2, 0x80) map directly onto this enum.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SubackReasonCode {

    /// Accepted; maximum QoS 0.
    #[default]
    GrantedQos0 = 0,

    /// Accepted; maximum QoS 1.
    GrantedQos1 = 1,

    /// Accepted; maximum QoS 2.
    GrantedQos2 = 2,

    /// Failed, no reason given.
    UnspecifiedError = 128,

    /// Valid but not accepted.
    ImplementationSpecificError = 131,

    /// Not authorized.
    NotAuthorized = 135,

    /// The topic filter was well formed but not allowed.
    TopicFilterInvalid = 143,

    /// The packet identifier was already in use on the server.
    PacketIdentifierInUse = 145,

    /// A quota was exceeded.
    QuotaExceeded = 151,

    /// Shared subscriptions are not supported.
    SharedSubscriptionsNotSupported = 158,

    /// Subscription identifiers are not supported.
    SubscriptionIdentifiersNotSupported = 161,

    /// Wildcard subscriptions are not supported.
    WildcardSubscriptionsNotSupported = 162,
}

impl SubackReasonCode {
    /// Returns whether or not the reason code represents a successful subscription
    pub fn is_success(&self) -> bool {
        matches!(self, SubackReasonCode::GrantedQos0 | SubackReasonCode::GrantedQos1 | SubackReasonCode::GrantedQos2)
    }
}

/// Reason codes inside UNSUBACK packet payloads (MQTT5 only).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum UnsubackReasonCode {

    /// The client is no longer subscribed to the topic filter.
    #[default]
    Success = 0,

    /// No matching subscription existed.
    NoSubscriptionExisted = 17,

    /// Failed, no reason given.
    UnspecifiedError = 128,

    /// Valid but not accepted.
    ImplementationSpecificError = 131,

    /// Not authorized.
    NotAuthorized = 135,

    /// The topic filter was well formed but not allowed.
    TopicNameInvalid = 144,

    /// The packet identifier was already in use on the server.
    PacketIdentifierInUse = 145,
}

/// Specifies a single subscription within a Subscribe operation
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Subscription {

    /// Topic filter to subscribe to
    pub topic_filter: String,

    /// Maximum QoS on which the subscriber will accept publish messages
    pub qos: QualityOfService,
}

impl Subscription {

    /// Creates a new subscription
    pub fn new(topic_filter: &str, qos: QualityOfService) -> Self {
        Subscription {
            topic_filter: topic_filter.to_string(),
            qos
        }
    }
}

/// Data model of a CONNECT packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnectPacket {

    /// Protocol version that determines the protocol name and level fields
    pub protocol_version: ProtocolVersion,

    /// Keep alive interval, in seconds.  Zero disables keep alive.
    pub keep_alive_interval_seconds: u16,

    /// Clean session (3.1/3.1.1) or clean start (5) flag
    pub clean_start: bool,

    /// Client identifier; may be empty only for clean sessions
    pub client_id: String,

    /// Optional user name
    pub username: Option<String>,

    /// Optional password
    pub password: Option<Vec<u8>>,

    /// Optional will message.  The will's packet id is unused.
    pub will: Option<PublishPacket>,

    /// MQTT5 receive maximum the client requests for inbound QoS 1+ publishes
    pub receive_maximum: Option<u16>,
}

/// Data model of a CONNACK packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnackPacket {

    /// True if the server resumed a prior session for this client
    pub session_present: bool,

    /// Result of the connection attempt
    pub reason_code: ConnectReasonCode,

    /// MQTT5: client id assigned by the server when the CONNECT carried an empty one
    pub assigned_client_identifier: Option<String>,

    /// MQTT5: keep alive the server requires the client to use instead of its own
    pub server_keep_alive: Option<u16>,

    /// MQTT5: number of concurrent QoS 1+ publishes the server is willing to process
    pub receive_maximum: Option<u16>,

    /// MQTT5: maximum QoS the server supports
    pub maximum_qos: Option<QualityOfService>,

    /// MQTT5: additional diagnostic information
    pub reason_string: Option<String>,
}

/// Data model of a PUBLISH packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PublishPacket {

    /// Packet id; zero for QoS 0 and for publishes not yet assigned an id
    pub packet_id: u16,

    /// Topic the message is published to
    pub topic: String,

    /// Delivery quality of service
    pub qos: QualityOfService,

    /// Set on retransmissions of a previously-sent QoS 1+ publish
    pub duplicate: bool,

    /// Retained message flag
    pub retain: bool,

    /// Message payload
    pub payload: Option<Vec<u8>>,
}

impl PublishPacket {

    /// Creates a new builder for a PublishPacket.
    pub fn builder(topic: &str, qos: QualityOfService) -> PublishPacketBuilder {
        PublishPacketBuilder::new(topic, qos)
    }

    /// Returns the message payload, if any
    pub fn payload(&self) -> Option<&[u8]> { self.payload.as_deref() }
}

/// Builder type for PublishPacket instances
pub struct PublishPacketBuilder {
    packet: PublishPacket
}

impl PublishPacketBuilder {

    /// Creates a new builder for a publish to a topic at a QoS level
    pub fn new(topic: &str, qos: QualityOfService) -> Self {
        PublishPacketBuilder {
            packet: PublishPacket {
                topic: topic.to_string(),
                qos,
                ..Default::default()
            }
        }
    }

    /// Sets if this should be a retained message
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.packet.retain = retain;
        self
    }

    /// Sets the payload of the publish message.
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.packet.payload = Some(payload);
        self
    }

    /// Builds a new PublishPacket.  Consumes the builder in the process.
    pub fn build(self) -> PublishPacket {
        self.packet
    }
}

/// Data model of a PUBACK packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubackPacket {

    /// Packet id of the acknowledged publish
    pub packet_id: u16,

    /// MQTT5 result; always Success under 3.1/3.1.1
    pub reason_code: PubackReasonCode,
}

/// Data model of a PUBREC packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubrecPacket {

    /// Packet id of the acknowledged publish
    pub packet_id: u16,

    /// MQTT5 result; always Success under 3.1/3.1.1
    pub reason_code: PubrecReasonCode,
}

/// Data model of a PUBREL packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubrelPacket {

    /// Packet id of the QoS 2 exchange being released
    pub packet_id: u16,

    /// MQTT5 result; always Success under 3.1/3.1.1
    pub reason_code: PubrelReasonCode,
}

/// Data model of a PUBCOMP packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubcompPacket {

    /// Packet id of the completed QoS 2 exchange
    pub packet_id: u16,

    /// MQTT5 result; always Success under 3.1/3.1.1
    pub reason_code: PubcompReasonCode,
}

/// Data model of a SUBSCRIBE packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SubscribePacket {

    /// Packet id; assigned by the client when the packet is sent
    pub packet_id: u16,

    /// Subscriptions requested
    pub subscriptions: Vec<Subscription>,
}

/// Data model of a SUBACK packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SubackPacket {

    /// Packet id of the acknowledged subscribe
    pub packet_id: u16,

    /// One result per requested subscription, in request order
    pub reason_codes: Vec<SubackReasonCode>,
}

/// Data model of an UNSUBSCRIBE packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UnsubscribePacket {

    /// Packet id; assigned by the client when the packet is sent
    pub packet_id: u16,

    /// Topic filters to remove
    pub topic_filters: Vec<String>,
}

/// Data model of an UNSUBACK packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UnsubackPacket {

    /// Packet id of the acknowledged unsubscribe
    pub packet_id: u16,

    /// MQTT5: one result per topic filter.  Empty under 3.1/3.1.1.
    pub reason_codes: Vec<UnsubackReasonCode>,
}

/// Data model of a PINGREQ packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PingreqPacket {}

/// Data model of a PINGRESP packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PingrespPacket {}

/// Data model of a DISCONNECT packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DisconnectPacket {

    /// MQTT5 reason for the disconnect; ignored under 3.1/3.1.1
    pub reason_code: DisconnectReasonCode,

    /// MQTT5 diagnostic string
    pub reason_string: Option<String>,
}

/// Algebraic union of all MQTT packet types the session engine handles.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MqttPacket {

    /// CONNECT
    Connect(ConnectPacket),

    /// CONNACK
    Connack(ConnackPacket),

    /// PUBLISH
    Publish(PublishPacket),

    /// PUBACK
    Puback(PubackPacket),

    /// PUBREC
    Pubrec(PubrecPacket),

    /// PUBREL
    Pubrel(PubrelPacket),

    /// PUBCOMP
    Pubcomp(PubcompPacket),

    /// SUBSCRIBE
    Subscribe(SubscribePacket),

    /// SUBACK
    Suback(SubackPacket),

    /// UNSUBSCRIBE
    Unsubscribe(UnsubscribePacket),

    /// UNSUBACK
    Unsuback(UnsubackPacket),

    /// PINGREQ
    Pingreq(PingreqPacket),

    /// PINGRESP
    Pingresp(PingrespPacket),

    /// DISCONNECT
    Disconnect(DisconnectPacket),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
/// An enum indicating the kind of MQTT packet
pub enum PacketType {
    /// A Connect packet
    Connect,

    /// A Connack packet
    Connack,

    /// A Publish packet
    Publish,

    /// A Puback packet
    Puback,

    /// A Pubrec packet
    Pubrec,

    /// A Pubrel packet
    Pubrel,

    /// A Pubcomp packet
    Pubcomp,

    /// A Subscribe packet
    Subscribe,

    /// A Suback packet
    Suback,

    /// An Unsubscribe packet
    Unsubscribe,

    /// An Unsuback packet
    Unsuback,

    /// A Pingreq packet
    Pingreq,

    /// A Pingresp packet
    Pingresp,

    /// A Disconnect packet
    Disconnect,
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketType::Connect => { write!(f, "ConnectPacket") }
            PacketType::Connack => { write!(f, "ConnackPacket") }
            PacketType::Publish => { write!(f, "PublishPacket") }
            PacketType::Puback => { write!(f, "PubackPacket") }
            PacketType::Pubrec => { write!(f, "PubrecPacket") }
            PacketType::Pubrel => { write!(f, "PubrelPacket") }
            PacketType::Pubcomp => { write!(f, "PubcompPacket") }
            PacketType::Subscribe => { write!(f, "SubscribePacket") }
            PacketType::Suback => { write!(f, "SubackPacket") }
            PacketType::Unsubscribe => { write!(f, "UnsubscribePacket") }
            PacketType::Unsuback => { write!(f, "UnsubackPacket") }
            PacketType::Pingreq => { write!(f, "PingreqPacket") }
            PacketType::Pingresp => { write!(f, "PingrespPacket") }
            PacketType::Disconnect => { write!(f, "DisconnectPacket") }
        }
    }
}
