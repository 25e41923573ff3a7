/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Client-side MQTT session engine.

This crate keeps an MQTT client session alive across connections: it issues packet
identifiers, tracks unfinished QoS 1 and QoS 2 exchanges in a pluggable [`store::MessageStore`],
retransmits them when a session is resumed, suppresses duplicate inbound QoS 2 deliveries,
runs keep alive, and reconnects with backoff.  Wire encoding is left to a caller-supplied
[`codec::Codec`]; connections are produced by a caller-supplied factory, with ready-made TCP,
TLS and websocket factories in [`transport`].

The entry point is [`client::SessionClient`].
 */

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
mod flow;
mod logging;
pub mod mqtt;
pub mod packet_id;
mod protocol;
pub mod store;
pub mod transport;
mod validate;

#[cfg(test)]
mod testing;

pub use client::*;
pub use codec::{Codec, DecodeOutcome};
pub use config::{BrokerEndpoint, ConnectOptions, ConnectOptionsBuilder, InflightLimitPolicy, OfflineQueuePolicy, SessionOptions, SessionOptionsBuilder, TransportKind};
pub use error::{MqttError, MqttResult};
pub use mqtt::*;
pub use packet_id::PacketIdPolicy;
pub use store::{DeliveryState, MemoryMessageStore, MessageDirection, MessageStore, StoredMessage};
