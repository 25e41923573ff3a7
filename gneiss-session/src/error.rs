/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
A module containing the core crate error enumeration, context structures, and conversion
definitions.
 */

use crate::mqtt::{ConnectReasonCode, PacketType};

use std::error::Error;
use std::fmt;
use std::sync::Arc;

type ErrorSource = Arc<dyn Error + Send + Sync + 'static>;

fn to_source(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> ErrorSource {
    Arc::from(source.into())
}

/// Additional details about a ProtocolViolation error variant
#[derive(Debug, Clone)]
pub struct ProtocolViolationContext {
    source: ErrorSource
}

/// Additional details about a ConnectionRefused error variant
#[derive(Debug, Clone)]
pub struct ConnectionRefusedContext {

    /// reason code returned by the broker in the failing CONNACK
    pub reason_code: ConnectReasonCode,
}

/// What the client was waiting on when a Timeout error was raised
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TimeoutKind {

    /// No successful CONNACK arrived within the connect timeout
    Connect,

    /// No PINGRESP (or any other packet) arrived within the ping timeout
    PingResponse,

    /// An operation's own acknowledgement timeout elapsed
    Acknowledgement,
}

/// Additional details about a Timeout error variant
#[derive(Debug, Clone)]
pub struct TimeoutContext {

    /// what timed out
    pub kind: TimeoutKind,
}

/// Additional details about a CapacityExceeded error variant
#[derive(Debug, Clone)]
pub struct CapacityExceededContext {
    source: ErrorSource
}

/// Additional details about a StoreClosed error variant
#[derive(Debug, Clone)]
pub struct StoreClosedContext {
}

/// Additional details about a DuplicateAck error variant
#[derive(Debug, Clone)]
pub struct DuplicateAckContext {

    /// type of the unmatched acknowledgement
    pub packet_type: PacketType,

    /// packet id the acknowledgement carried
    pub packet_id: u16,
}

/// Additional details about a NotConnected error variant
#[derive(Debug, Clone)]
pub struct NotConnectedContext {
}

/// Additional details about a ConnectionClosed error variant
#[derive(Debug, Clone)]
pub struct ConnectionClosedContext {
    source: ErrorSource
}

/// Additional details about a ConnectionEstablishmentFailure error variant
#[derive(Debug, Clone)]
pub struct ConnectionEstablishmentFailureContext {
    source: ErrorSource
}

/// Additional details about a UserInitiatedDisconnect error variant
#[derive(Debug, Clone)]
pub struct UserInitiatedDisconnectContext {
}

/// Additional details about an InvalidConfiguration error variant
#[derive(Debug, Clone)]
pub struct InvalidConfigurationContext {
    source: ErrorSource
}

/// Additional details about a PacketValidation error variant
#[derive(Debug, Clone)]
pub struct PacketValidationContext {

    /// type of packet that failed validation
    pub packet_type: PacketType,

    source: ErrorSource
}

/// Additional details about an EncodingFailure error variant
#[derive(Debug, Clone)]
pub struct EncodingFailureContext {
    source: ErrorSource
}

/// Additional details about an OperationChannelFailure error variant
#[derive(Debug, Clone)]
pub struct OperationChannelFailureContext {
    source: ErrorSource
}

/// Additional details about an InternalStateError error variant
#[derive(Debug, Clone)]
pub struct InternalStateErrorContext {
    source: ErrorSource
}

/// Additional details about a StdIoError error variant
#[derive(Debug, Clone)]
pub struct StdIoErrorContext {
    source: ErrorSource
}

/// Additional details about a TlsError error variant
#[derive(Debug, Clone)]
pub struct TlsErrorContext {
    source: ErrorSource
}

/// Additional details about a TransportError error variant
#[derive(Debug, Clone)]
pub struct TransportErrorContext {
    source: ErrorSource
}

/// Basic error type for the entire gneiss-session crate.
///
/// Errors are cheaply cloneable so that a single failure (a refused connection, a forced
/// close) can be reported to every operation and waiter it affects.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum MqttError {

    /// The broker sent something malformed or disallowed by the MQTT specification.  The
    /// connection is closed.
    ProtocolViolation(ProtocolViolationContext),

    /// The broker answered the CONNECT with a failing CONNACK.  Terminal for the connection
    /// attempt; the reconnect policy still applies.
    ConnectionRefused(ConnectionRefusedContext),

    /// A CONNACK, PINGRESP, or operation acknowledgement did not arrive in time.
    Timeout(TimeoutContext),

    /// The packet identifier space is exhausted or the in-flight bound was reached under a
    /// rejecting policy.
    CapacityExceeded(CapacityExceededContext),

    /// A message store operation was attempted after the store was closed.
    StoreClosed(StoreClosedContext),

    /// An acknowledgement arrived for a packet id with no matching in-flight exchange.
    /// Logged and otherwise ignored.
    DuplicateAck(DuplicateAckContext),

    /// The operation was rejected because the client is offline and the offline queue policy
    /// does not retain it.
    NotConnected(NotConnectedContext),

    /// An established connection was closed, or the session was ended while the operation
    /// was still pending.
    ConnectionClosed(ConnectionClosedContext),

    /// A connection attempt ended before a successful CONNACK was received for a transport
    /// reason.
    ConnectionEstablishmentFailure(ConnectionEstablishmentFailureContext),

    /// The connection was shut down after a user-requested DISCONNECT was flushed.  Does not
    /// indicate an actual failure.
    UserInitiatedDisconnect(UserInitiatedDisconnectContext),

    /// Session or connect configuration is invalid.
    InvalidConfiguration(InvalidConfigurationContext),

    /// A user-submitted operation contains a value that violates the MQTT specification.
    PacketValidation(PacketValidationContext),

    /// The codec failed to encode an outbound packet.
    EncodingFailure(EncodingFailureContext),

    /// Failure encountered while sending/receiving on an operation channel between the client
    /// handle and its runtime task.
    OperationChannelFailure(OperationChannelFailureContext),

    /// Something happened that should never happen.  Always indicates a bug in the client.
    InternalStateError(InternalStateErrorContext),

    /// Generic error wrapping std::io::Error
    StdIoError(StdIoErrorContext),

    /// Error associated with TLS configuration or handshakes
    TlsError(TlsErrorContext),

    /// Error associated with feature-selected transports, mostly websocket errors
    TransportError(TransportErrorContext),
}

impl MqttError {

    pub(crate) fn new_protocol_violation(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        MqttError::ProtocolViolation(
            ProtocolViolationContext {
                source : to_source(source)
            }
        )
    }

    pub(crate) fn new_connection_refused(reason_code: ConnectReasonCode) -> Self {
        MqttError::ConnectionRefused(
            ConnectionRefusedContext {
                reason_code
            }
        )
    }

    pub(crate) fn new_timeout(kind: TimeoutKind) -> Self {
        MqttError::Timeout(
            TimeoutContext {
                kind
            }
        )
    }

    pub(crate) fn new_capacity_exceeded(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        MqttError::CapacityExceeded(
            CapacityExceededContext {
                source : to_source(source)
            }
        )
    }

    /// Constructs a StoreClosed variant.  Public so that external message store
    /// implementations can honor the store contract.
    pub fn new_store_closed() -> Self {
        MqttError::StoreClosed(
            StoreClosedContext {
            }
        )
    }

    pub(crate) fn new_duplicate_ack(packet_type: PacketType, packet_id: u16) -> Self {
        MqttError::DuplicateAck(
            DuplicateAckContext {
                packet_type,
                packet_id
            }
        )
    }

    pub(crate) fn new_not_connected() -> Self {
        MqttError::NotConnected(
            NotConnectedContext {
            }
        )
    }

    pub(crate) fn new_connection_closed(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        MqttError::ConnectionClosed(
            ConnectionClosedContext {
                source : to_source(source)
            }
        )
    }

    pub(crate) fn new_connection_establishment_failure(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        MqttError::ConnectionEstablishmentFailure(
            ConnectionEstablishmentFailureContext {
                source : to_source(source)
            }
        )
    }

    pub(crate) fn new_user_initiated_disconnect() -> Self {
        MqttError::UserInitiatedDisconnect(
            UserInitiatedDisconnectContext {
            }
        )
    }

    pub(crate) fn new_invalid_configuration(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        MqttError::InvalidConfiguration(
            InvalidConfigurationContext {
                source : to_source(source)
            }
        )
    }

    pub(crate) fn new_packet_validation(packet_type: PacketType, source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        MqttError::PacketValidation(
            PacketValidationContext {
                packet_type,
                source : to_source(source)
            }
        )
    }

    /// Constructs an EncodingFailure variant.  Intended for codec implementations.
    pub fn new_encoding_failure(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        MqttError::EncodingFailure(
            EncodingFailureContext {
                source : to_source(source)
            }
        )
    }

    /// Constructs a ProtocolViolation variant for malformed inbound data.  Intended for codec
    /// implementations.
    pub fn new_malformed_packet(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        MqttError::new_protocol_violation(source)
    }

    pub(crate) fn new_operation_channel_failure(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        MqttError::OperationChannelFailure(
            OperationChannelFailureContext {
                source : to_source(source)
            }
        )
    }

    pub(crate) fn new_internal_state_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        MqttError::InternalStateError(
            InternalStateErrorContext {
                source : to_source(source)
            }
        )
    }

    /// Constructs a StdIoError variant from an existing error.  Typically this should be a
    /// std::io::Error
    #[doc(hidden)]
    pub fn new_std_io_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        MqttError::StdIoError(
            StdIoErrorContext {
                source : to_source(source)
            }
        )
    }

    /// Constructs a new TlsError variant from an existing error.
    #[doc(hidden)]
    pub fn new_tls_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        MqttError::TlsError(
            TlsErrorContext {
                source : to_source(source)
            }
        )
    }

    /// Constructs a new TransportError variant from an existing error.
    #[doc(hidden)]
    pub fn new_transport_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        MqttError::TransportError(
            TransportErrorContext {
                source : to_source(source)
            }
        )
    }
}

impl Error for MqttError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MqttError::ProtocolViolation(context) => {
                Some(context.source.as_ref())
            }
            MqttError::CapacityExceeded(context) => {
                Some(context.source.as_ref())
            }
            MqttError::ConnectionClosed(context) => {
                Some(context.source.as_ref())
            }
            MqttError::ConnectionEstablishmentFailure(context) => {
                Some(context.source.as_ref())
            }
            MqttError::InvalidConfiguration(context) => {
                Some(context.source.as_ref())
            }
            MqttError::PacketValidation(context) => {
                Some(context.source.as_ref())
            }
            MqttError::EncodingFailure(context) => {
                Some(context.source.as_ref())
            }
            MqttError::OperationChannelFailure(context) => {
                Some(context.source.as_ref())
            }
            MqttError::InternalStateError(context) => {
                Some(context.source.as_ref())
            }
            MqttError::StdIoError(context) => {
                Some(context.source.as_ref())
            }
            MqttError::TlsError(context) => {
                Some(context.source.as_ref())
            }
            MqttError::TransportError(context) => {
                Some(context.source.as_ref())
            }
            _ => { None }
        }
    }
}

impl fmt::Display for MqttError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MqttError::ProtocolViolation(context) => {
                write!(f, "broker behavior disallowed by the mqtt spec: {}", context.source)
            }
            MqttError::ConnectionRefused(context) => {
                write!(f, "connection refused by the broker with reason code {:?}", context.reason_code)
            }
            MqttError::Timeout(context) => {
                match context.kind {
                    TimeoutKind::Connect => { write!(f, "timed out waiting for a successful connack") }
                    TimeoutKind::PingResponse => { write!(f, "timed out waiting for a pingresp") }
                    TimeoutKind::Acknowledgement => { write!(f, "the operation's timeout triggered prior to receiving an ack from the broker") }
                }
            }
            MqttError::CapacityExceeded(context) => {
                write!(f, "capacity exceeded: {}", context.source)
            }
            MqttError::StoreClosed(_) => {
                write!(f, "message store operation attempted after the store was closed")
            }
            MqttError::DuplicateAck(context) => {
                write!(f, "{} received for unknown packet id {}", context.packet_type, context.packet_id)
            }
            MqttError::NotConnected(_) => {
                write!(f, "operation failed because the client is not connected and the offline queue policy rejects it")
            }
            MqttError::ConnectionClosed(context) => {
                write!(f, "{}", context.source)
            }
            MqttError::ConnectionEstablishmentFailure(_) => {
                write!(f, "failed to establish an MQTT connection to the broker")
            }
            MqttError::UserInitiatedDisconnect(_) => {
                write!(f, "connection was shut down by user action")
            }
            MqttError::InvalidConfiguration(context) => {
                write!(f, "invalid configuration: {}", context.source)
            }
            MqttError::PacketValidation(context) => {
                write!(f, "{} contains a value that violates the mqtt spec: {}", context.packet_type, context.source)
            }
            MqttError::EncodingFailure(_) => {
                write!(f, "failure encountered while encoding an outbound MQTT packet")
            }
            MqttError::OperationChannelFailure(_) => {
                write!(f, "failure encountered while sending/receiving on an MQTT operation-related channel")
            }
            MqttError::InternalStateError(_) => {
                write!(f, "client reached an invalid internal state; almost certainly a client bug")
            }
            MqttError::StdIoError(_) => {
                write!(f, "generic error wrapper for std::io::Error; source contains further details")
            }
            MqttError::TlsError(_) => {
                write!(f, "generic error when setting up a tls context")
            }
            MqttError::TransportError(_) => {
                write!(f, "transport error; source contains further details")
            }
        }
    }
}

/// Crate-wide result type for functions that can fail
pub type MqttResult<T> = Result<T, MqttError>;

pub(crate) fn fold_mqtt_result<T>(base: MqttResult<T>, new_result: MqttResult<T>) -> MqttResult<T> {
    new_result?;
    base
}

impl From<std::io::Error> for MqttError {
    fn from(error: std::io::Error) -> Self {
        MqttError::new_std_io_error(error)
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for MqttError {
    fn from(error: tokio::sync::oneshot::error::RecvError) -> Self {
        MqttError::new_operation_channel_failure(error)
    }
}

#[cfg(feature = "tokio-rustls")]
impl From<rustls_pki_types::InvalidDnsNameError> for MqttError {
    fn from(err: rustls_pki_types::InvalidDnsNameError) -> Self {
        MqttError::new_connection_establishment_failure(err)
    }
}

#[cfg(feature = "tokio-rustls")]
impl From<rustls::Error> for MqttError {
    fn from(err: rustls::Error) -> Self {
        MqttError::new_tls_error(err)
    }
}

#[cfg(feature = "tokio-websockets")]
impl From<tungstenite::error::Error> for MqttError {
    fn from(err: tungstenite::error::Error) -> Self {
        MqttError::new_transport_error(err)
    }
}

impl From<http::Error> for MqttError {
    fn from(err: http::Error) -> Self {
        MqttError::new_invalid_configuration(err)
    }
}

impl From<http::uri::InvalidUri> for MqttError {
    fn from(err: http::uri::InvalidUri) -> Self {
        MqttError::new_invalid_configuration(err)
    }
}
