/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Boundary between the session engine and MQTT wire encoding.

The session engine never sees bytes.  Outbound packets are handed to a [`Codec`] for encoding
and inbound bytes are handed to it for decoding; the codec reports one packet at a time so that
the engine can process packets strictly in arrival order.
 */

use crate::error::MqttResult;
use crate::mqtt::{MqttPacket, ProtocolVersion};

/// Result of one decode attempt
#[derive(Debug, Eq, PartialEq)]
pub enum DecodeOutcome {

    /// A complete packet was decoded from the front of the input
    Packet {

        /// the decoded packet
        packet: Box<MqttPacket>,

        /// number of input bytes the packet occupied
        consumed: usize,
    },

    /// The input holds only part of a packet; more bytes are needed
    Incomplete,
}

/// MQTT control packet encoder/decoder used by a session's runtime.
///
/// A codec instance is owned by exactly one session.  It is reset at the start of every
/// connection so that any per-connection state (partially decoded data, negotiated protocol
/// version) does not leak across connections.
pub trait Codec : Send {

    /// Prepares the codec for a fresh connection speaking the given protocol version
    fn reset_for_new_connection(&mut self, protocol_version: ProtocolVersion);

    /// Appends the wire form of a packet to `dest`.  Fails with
    /// [`MqttError::EncodingFailure`](crate::error::MqttError::EncodingFailure) if the packet
    /// cannot be represented.
    fn encode(&mut self, packet: &MqttPacket, dest: &mut Vec<u8>) -> MqttResult<()>;

    /// Attempts to decode one packet from the front of `bytes`.  Malformed input fails with
    /// [`MqttError::ProtocolViolation`](crate::error::MqttError::ProtocolViolation).
    fn decode(&mut self, bytes: &[u8]) -> MqttResult<DecodeOutcome>;
}
