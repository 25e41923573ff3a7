/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing miscellaneous conversion functions related to the MQTT specification.
 */

use crate::error::{MqttError, MqttResult};
use crate::mqtt::*;

/// Converts an integer to a QualityOfService value, failing on anything outside [0, 2]
pub fn convert_u8_to_quality_of_service(value: u8) -> MqttResult<QualityOfService> {
    match value {
        0 => { Ok(QualityOfService::AtMostOnce) }
        1 => { Ok(QualityOfService::AtLeastOnce) }
        2 => { Ok(QualityOfService::ExactlyOnce) }
        _ => { Err(MqttError::new_malformed_packet(format!("invalid quality of service value {}", value))) }
    }
}

/// Maps an MQTT 3.1/3.1.1 CONNACK return code onto the MQTT5 reason code with the same meaning.
pub fn convert_connect_return_code_311(return_code: u8) -> MqttResult<ConnectReasonCode> {
    match return_code {
        0 => { Ok(ConnectReasonCode::Success) }
        1 => { Ok(ConnectReasonCode::UnsupportedProtocolVersion) }
        2 => { Ok(ConnectReasonCode::ClientIdentifierNotValid) }
        3 => { Ok(ConnectReasonCode::ServerUnavailable) }
        4 => { Ok(ConnectReasonCode::BadUsernameOrPassword) }
        5 => { Ok(ConnectReasonCode::NotAuthorized) }
        _ => { Err(MqttError::new_malformed_packet(format!("invalid connack return code {}", return_code))) }
    }
}

pub(crate) fn quality_of_service_to_str (qos: QualityOfService) -> &'static str {
    match qos {
        QualityOfService::AtMostOnce => { "AtMostOnce (0)" }
        QualityOfService::AtLeastOnce => { "AtLeastOnce (1)" }
        QualityOfService::ExactlyOnce => { "ExactlyOnce (2)" }
    }
}

pub(crate) fn protocol_version_to_str(version: ProtocolVersion) -> &'static str {
    match version {
        ProtocolVersion::Mqtt31 => { "3.1" }
        ProtocolVersion::Mqtt311 => { "3.1.1" }
        ProtocolVersion::Mqtt5 => { "5.0" }
    }
}

/// Returns the kind of an MQTT packet
pub fn mqtt_packet_to_packet_type(packet: &MqttPacket) -> PacketType {
    match packet {
        MqttPacket::Connect(_) => { PacketType::Connect }
        MqttPacket::Connack(_) => { PacketType::Connack }
        MqttPacket::Publish(_) => { PacketType::Publish}
        MqttPacket::Puback(_) => { PacketType::Puback }
        MqttPacket::Pubrec(_) => { PacketType::Pubrec }
        MqttPacket::Pubrel(_) => { PacketType::Pubrel }
        MqttPacket::Pubcomp(_) => { PacketType::Pubcomp }
        MqttPacket::Subscribe(_) => { PacketType::Subscribe }
        MqttPacket::Suback(_) => { PacketType::Suback }
        MqttPacket::Unsubscribe(_) => { PacketType::Unsubscribe }
        MqttPacket::Unsuback(_) => { PacketType::Unsuback }
        MqttPacket::Pingreq(_) => { PacketType::Pingreq }
        MqttPacket::Pingresp(_) => { PacketType::Pingresp }
        MqttPacket::Disconnect(_) => { PacketType::Disconnect }
    }
}

pub(crate) fn mqtt_packet_to_str(packet: &MqttPacket) -> &'static str {
    match packet {
        MqttPacket::Connect(_) => { "CONNECT" }
        MqttPacket::Connack(_) => { "CONNACK" }
        MqttPacket::Publish(_) => { "PUBLISH" }
        MqttPacket::Puback(_) => { "PUBACK" }
        MqttPacket::Pubrec(_) => { "PUBREC" }
        MqttPacket::Pubrel(_) => { "PUBREL" }
        MqttPacket::Pubcomp(_) => { "PUBCOMP" }
        MqttPacket::Subscribe(_) => { "SUBSCRIBE" }
        MqttPacket::Suback(_) => { "SUBACK" }
        MqttPacket::Unsubscribe(_) => { "UNSUBSCRIBE" }
        MqttPacket::Unsuback(_) => { "UNSUBACK" }
        MqttPacket::Pingreq(_) => { "PINGREQ" }
        MqttPacket::Pingresp(_) => { "PINGRESP" }
        MqttPacket::Disconnect(_) => { "DISCONNECT" }
    }
}

/// Returns the packet id of packets that carry one; zero otherwise
#[cfg(test)]
pub(crate) fn get_packet_id_for_packet(packet: &MqttPacket) -> u16 {
    match packet {
        MqttPacket::Publish(publish) => { publish.packet_id }
        MqttPacket::Puback(puback) => { puback.packet_id }
        MqttPacket::Pubrec(pubrec) => { pubrec.packet_id }
        MqttPacket::Pubrel(pubrel) => { pubrel.packet_id }
        MqttPacket::Pubcomp(pubcomp) => { pubcomp.packet_id }
        MqttPacket::Subscribe(subscribe) => { subscribe.packet_id }
        MqttPacket::Suback(suback) => { suback.packet_id }
        MqttPacket::Unsubscribe(unsubscribe) => { unsubscribe.packet_id }
        MqttPacket::Unsuback(unsuback) => { unsuback.packet_id }
        _ => { 0 }
    }
}
