/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::mqtt::*;
use crate::mqtt::utils::*;
use log::*;
use std::fmt;

macro_rules! log_primitive_value {
    ($integral_value: expr, $formatter: expr, $log_field: expr) => {
        write!($formatter, " {}:{}", $log_field, $integral_value)?;
    };
}

macro_rules! log_optional_primitive_value {
    ($optional_integral_value: expr, $formatter: expr, $log_field: expr, $value: ident) => {
        if let Some($value) = &$optional_integral_value {
            write!($formatter, " {}:{}", $log_field, $value)?;
        }
    };
}

macro_rules! log_enum {
    ($enum_value: expr, $formatter: expr, $log_field: expr) => {
        write!($formatter, " {}:{:?}", $log_field, $enum_value)?;
    };
}

macro_rules! log_string {
    ($value: expr, $formatter: expr, $log_field: expr) => {
        write!($formatter, " {}:\"{}\"", $log_field, $value)?;
    };
}

macro_rules! log_optional_string {
    ($optional_string: expr, $formatter: expr, $log_field: expr, $value:ident) => {
        if let Some($value) = &$optional_string {
            write!($formatter, " {}:\"{}\"", $log_field, $value)?;
        }
    };
}

macro_rules! log_optional_sensitive {
    ($optional_value: expr, $formatter: expr, $log_field: expr) => {
        if $optional_value.is_some() {
            write!($formatter, " {}:<...redacted>", $log_field)?;
        }
    };
}

macro_rules! log_optional_binary_data {
    ($optional_data: expr, $formatter: expr, $log_field: expr, $value:ident) => {
        if let Some($value) = &$optional_data {
            write!($formatter, " {}:<{} Bytes>",  $log_field, $value.len())?;
        }
    };
}

macro_rules! define_ack_packet_display_trait {
    ($packet_type: ident, $packet_name: expr) => {
        impl fmt::Display for $packet_type {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{} {{", $packet_name)?;
                log_primitive_value!(self.packet_id, f, "packet_id");
                log_enum!(self.reason_code, f, "reason_code");
                write!(f, " }}")
            }
        }
    };
}

define_ack_packet_display_trait!(PubackPacket, "PubackPacket");
define_ack_packet_display_trait!(PubrecPacket, "PubrecPacket");
define_ack_packet_display_trait!(PubrelPacket, "PubrelPacket");
define_ack_packet_display_trait!(PubcompPacket, "PubcompPacket");

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", protocol_version_to_str(*self))
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(\"{}\", {})", self.topic_filter, quality_of_service_to_str(self.qos))
    }
}

impl fmt::Display for ConnectPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ConnectPacket {{")?;
        log_string!(self.protocol_version, f, "protocol_version");
        log_primitive_value!(self.keep_alive_interval_seconds, f, "keep_alive_interval_seconds");
        log_primitive_value!(self.clean_start, f, "clean_start");
        log_string!(self.client_id, f, "client_id");
        log_optional_string!(self.username, f, "username", value);
        log_optional_sensitive!(self.password, f, "password");
        log_optional_primitive_value!(self.receive_maximum, f, "receive_maximum", value);
        if let Some(will) = &self.will {
            write!(f, " will: {}", will)?;
        }
        write!(f, " }}")
    }
}

impl fmt::Display for ConnackPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ConnackPacket {{")?;
        log_primitive_value!(self.session_present, f, "session_present");
        log_enum!(self.reason_code, f, "reason_code");
        log_optional_string!(self.assigned_client_identifier, f, "assigned_client_identifier", value);
        log_optional_primitive_value!(self.server_keep_alive, f, "server_keep_alive", value);
        log_optional_primitive_value!(self.receive_maximum, f, "receive_maximum", value);
        if let Some(maximum_qos) = self.maximum_qos {
            write!(f, " maximum_qos:{}", quality_of_service_to_str(maximum_qos))?;
        }
        log_optional_string!(self.reason_string, f, "reason_string", value);
        write!(f, " }}")
    }
}

impl fmt::Display for PublishPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PublishPacket {{")?;
        if self.packet_id != 0 {
            log_primitive_value!(self.packet_id, f, "packet_id");
        }
        log_string!(self.topic, f, "topic");
        write!(f, " qos:{}", quality_of_service_to_str(self.qos))?;
        log_primitive_value!(self.duplicate, f, "duplicate");
        log_primitive_value!(self.retain, f, "retain");
        log_optional_binary_data!(self.payload, f, "payload", value);
        write!(f, " }}")
    }
}

impl fmt::Display for SubscribePacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SubscribePacket {{")?;
        log_primitive_value!(self.packet_id, f, "packet_id");
        write!(f, " subscriptions: [")?;
        for subscription in &self.subscriptions {
            write!(f, " {}", subscription)?;
        }
        write!(f, " ] }}")
    }
}

impl fmt::Display for SubackPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SubackPacket {{")?;
        log_primitive_value!(self.packet_id, f, "packet_id");
        log_enum!(self.reason_codes, f, "reason_codes");
        write!(f, " }}")
    }
}

impl fmt::Display for UnsubscribePacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "UnsubscribePacket {{")?;
        log_primitive_value!(self.packet_id, f, "packet_id");
        log_enum!(self.topic_filters, f, "topic_filters");
        write!(f, " }}")
    }
}

impl fmt::Display for UnsubackPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "UnsubackPacket {{")?;
        log_primitive_value!(self.packet_id, f, "packet_id");
        log_enum!(self.reason_codes, f, "reason_codes");
        write!(f, " }}")
    }
}

impl fmt::Display for PingreqPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PingreqPacket {{}}")
    }
}

impl fmt::Display for PingrespPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PingrespPacket {{}}")
    }
}

impl fmt::Display for DisconnectPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DisconnectPacket {{")?;
        log_enum!(self.reason_code, f, "reason_code");
        log_optional_string!(self.reason_string, f, "reason_string", value);
        write!(f, " }}")
    }
}

impl fmt::Display for MqttPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MqttPacket::Connect(packet) => { packet.fmt(f) }
            MqttPacket::Connack(packet) => { packet.fmt(f) }
            MqttPacket::Publish(packet) => { packet.fmt(f) }
            MqttPacket::Puback(packet) => { packet.fmt(f) }
            MqttPacket::Pubrec(packet) => { packet.fmt(f) }
            MqttPacket::Pubrel(packet) => { packet.fmt(f) }
            MqttPacket::Pubcomp(packet) => { packet.fmt(f) }
            MqttPacket::Subscribe(packet) => { packet.fmt(f) }
            MqttPacket::Suback(packet) => { packet.fmt(f) }
            MqttPacket::Unsubscribe(packet) => { packet.fmt(f) }
            MqttPacket::Unsuback(packet) => { packet.fmt(f) }
            MqttPacket::Pingreq(packet) => { packet.fmt(f) }
            MqttPacket::Pingresp(packet) => { packet.fmt(f) }
            MqttPacket::Disconnect(packet) => { packet.fmt(f) }
        }
    }
}

pub(crate) fn log_packet(prefix: &str, packet: &MqttPacket) {
    let level = log::max_level();
    match level {
        LevelFilter::Info => {
            info!("{}{}", prefix, mqtt_packet_to_str(packet));
        }
        LevelFilter::Debug | LevelFilter::Trace => {
            debug!("{}{}", prefix, packet);
        }
        _ => {}
    }
}
