/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::config::{ConnectOptions, SessionOptions};
use crate::error::{MqttError, MqttResult};
use crate::mqtt::*;
use crate::mqtt::utils::mqtt_packet_to_str;

use log::*;

pub(crate) const MAXIMUM_STRING_PROPERTY_LENGTH : usize = 65535;

pub(crate) fn is_valid_topic(topic: &str) -> bool {
    if topic.is_empty() || topic.len() > MAXIMUM_STRING_PROPERTY_LENGTH {
        return false;
    }

    if topic.contains(['#', '+']) {
        return false;
    }

    true
}

pub(crate) fn is_valid_topic_filter(filter: &str) -> bool {
    if filter.is_empty() || filter.len() > MAXIMUM_STRING_PROPERTY_LENGTH {
        return false;
    }

    let mut seen_mlw = false;
    for segment in filter.split('/') {
        if seen_mlw {
            return false;
        }

        if segment.len() == 1 {
            if segment == "#" {
                seen_mlw = true;
            }
        } else if segment.contains(['#', '+']) {
            return false;
        }
    }

    true
}

/// Validates a user-submitted publish before it is handed to the session
pub(crate) fn validate_publish_outbound(publish: &PublishPacket) -> MqttResult<()> {
    if !is_valid_topic(&publish.topic) {
        error!("Publish validation - invalid topic: \"{}\"", publish.topic);
        return Err(MqttError::new_packet_validation(PacketType::Publish, "invalid topic"));
    }

    Ok(())
}

/// Validates a user-submitted subscribe before it is handed to the session
pub(crate) fn validate_subscribe_outbound(subscribe: &SubscribePacket) -> MqttResult<()> {
    if subscribe.subscriptions.is_empty() {
        error!("Subscribe validation - empty subscription set");
        return Err(MqttError::new_packet_validation(PacketType::Subscribe, "empty subscription set"));
    }

    for subscription in &subscribe.subscriptions {
        if !is_valid_topic_filter(&subscription.topic_filter) {
            error!("Subscribe validation - invalid topic filter: \"{}\"", subscription.topic_filter);
            return Err(MqttError::new_packet_validation(PacketType::Subscribe, "invalid topic filter"));
        }
    }

    Ok(())
}

/// Validates a user-submitted unsubscribe before it is handed to the session
pub(crate) fn validate_unsubscribe_outbound(unsubscribe: &UnsubscribePacket) -> MqttResult<()> {
    if unsubscribe.topic_filters.is_empty() {
        error!("Unsubscribe validation - empty topic filter set");
        return Err(MqttError::new_packet_validation(PacketType::Unsubscribe, "empty topic filter set"));
    }

    for filter in &unsubscribe.topic_filters {
        if !is_valid_topic_filter(filter) {
            error!("Unsubscribe validation - invalid topic filter: \"{}\"", filter);
            return Err(MqttError::new_packet_validation(PacketType::Unsubscribe, "invalid topic filter"));
        }
    }

    Ok(())
}

pub(crate) fn validate_connect_options(options: &ConnectOptions) -> MqttResult<()> {
    if !options.clean_session && options.client_id.is_none() {
        error!("ConnectOptions validation - resuming a session requires an explicit client id");
        return Err(MqttError::new_invalid_configuration("clean session false requires a client id"));
    }

    if let Some(client_id) = &options.client_id {
        if client_id.len() > MAXIMUM_STRING_PROPERTY_LENGTH {
            return Err(MqttError::new_invalid_configuration("client id too long"));
        }
    }

    if let Some(username) = &options.username {
        if username.len() > MAXIMUM_STRING_PROPERTY_LENGTH {
            return Err(MqttError::new_invalid_configuration("username too long"));
        }
    }

    if let Some(will) = &options.will {
        if !is_valid_topic(&will.topic) {
            error!("ConnectOptions validation - invalid will topic: \"{}\"", will.topic);
            return Err(MqttError::new_invalid_configuration("invalid will topic"));
        }
    }

    if options.receive_maximum == Some(0) {
        return Err(MqttError::new_invalid_configuration("receive maximum must be non-zero"));
    }

    Ok(())
}

pub(crate) fn validate_session_options(options: &SessionOptions) -> MqttResult<()> {
    if options.max_inflight == 0 {
        error!("SessionOptions validation - max inflight is zero");
        return Err(MqttError::new_invalid_configuration("max inflight must be non-zero"));
    }

    if options.connect_timeout.is_zero() {
        return Err(MqttError::new_invalid_configuration("connect timeout must be non-zero"));
    }

    Ok(())
}

fn validate_nonzero_packet_id(packet: &MqttPacket, packet_id: u16) -> MqttResult<()> {
    if packet_id == 0 {
        error!("Inbound validation - {} with zero packet id", mqtt_packet_to_str(packet));
        return Err(MqttError::new_protocol_violation(format!("{} with zero packet id", mqtt_packet_to_str(packet))));
    }

    Ok(())
}

/// Validates a decoded server packet.  The codec guarantees well-formed fields, so only the
/// constraints that cross fields or depend on direction are checked here.
pub(crate) fn validate_packet_inbound(packet: &MqttPacket) -> MqttResult<()> {
    match packet {
        MqttPacket::Connack(connack) => {
            if connack.session_present && !connack.reason_code.is_success() {
                return Err(MqttError::new_protocol_violation("failed connack with session present set"));
            }
            Ok(())
        }
        MqttPacket::Publish(publish) => {
            if !is_valid_topic(&publish.topic) {
                error!("Inbound validation - publish with invalid topic: \"{}\"", publish.topic);
                return Err(MqttError::new_protocol_violation("publish with invalid topic"));
            }

            match publish.qos {
                QualityOfService::AtMostOnce => {
                    if publish.packet_id != 0 {
                        return Err(MqttError::new_protocol_violation("qos 0 publish with packet id"));
                    }
                    Ok(())
                }
                _ => { validate_nonzero_packet_id(packet, publish.packet_id) }
            }
        }
        MqttPacket::Puback(puback) => { validate_nonzero_packet_id(packet, puback.packet_id) }
        MqttPacket::Pubrec(pubrec) => { validate_nonzero_packet_id(packet, pubrec.packet_id) }
        MqttPacket::Pubrel(pubrel) => { validate_nonzero_packet_id(packet, pubrel.packet_id) }
        MqttPacket::Pubcomp(pubcomp) => { validate_nonzero_packet_id(packet, pubcomp.packet_id) }
        MqttPacket::Suback(suback) => {
            if suback.reason_codes.is_empty() {
                return Err(MqttError::new_protocol_violation("suback with no reason codes"));
            }
            validate_nonzero_packet_id(packet, suback.packet_id)
        }
        MqttPacket::Unsuback(unsuback) => { validate_nonzero_packet_id(packet, unsuback.packet_id) }
        MqttPacket::Pingresp(_) | MqttPacket::Disconnect(_) => { Ok(()) }
        _ => {
            error!("Inbound validation - unexpected {} from server", mqtt_packet_to_str(packet));
            Err(MqttError::new_protocol_violation(format!("{} is not a server packet", mqtt_packet_to_str(packet))))
        }
    }
}
