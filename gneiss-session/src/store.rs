/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Message store contract and the default in-memory implementation.

A session owns two stores: one for client-initiated QoS 1/2 publishes that have not completed
their acknowledgement handshake, and one for broker-initiated QoS 2 exchanges the client has
answered with PUBREC but that have not yet been released.  Persistent backends can be plugged in
by implementing [`MessageStore`].

`put` on an identifier that is already present replaces the stored message in place; the entry
keeps its original position in snapshot order.
 */

use crate::error::{MqttError, MqttResult};
use crate::mqtt::*;

use std::collections::{BTreeMap, HashMap};

/// Which side initiated the exchange a stored message belongs to
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MessageDirection {

    /// A client-initiated publish
    Outbound,

    /// A broker-initiated QoS 2 publish
    Inbound,
}

/// Acknowledgement handshake progress of a stored message
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DeliveryState {

    /// Outbound QoS 1 publish sent; waiting on PUBACK
    AwaitingAck,

    /// Outbound QoS 2 publish sent; waiting on PUBREC
    AwaitingRec,

    /// Outbound QoS 2 publish received; PUBREL sent, waiting on PUBCOMP
    AwaitingComp,

    /// Inbound QoS 2 publish answered with PUBREC; waiting on PUBREL
    SentRec,
}

/// A QoS 1/2 exchange that has started but not finished
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredMessage {

    /// Identifier of the exchange.  Never zero.
    pub packet_id: u16,

    /// Which side started the exchange
    pub direction: MessageDirection,

    /// Delivery quality of service; never AtMostOnce
    pub qos: QualityOfService,

    /// Topic of the publish
    pub topic: String,

    /// Publish payload.  Dropped once an outbound QoS 2 publish reaches AwaitingComp; never
    /// kept for inbound exchanges.
    pub payload: Option<Vec<u8>>,

    /// Retain flag of the publish
    pub retain: bool,

    /// Whether the publish has been transmitted at least once already
    pub duplicate: bool,

    /// Handshake progress
    pub state: DeliveryState,
}

impl StoredMessage {

    /// Creates a store entry for an outbound publish that has just been assigned a packet id
    pub fn new_outbound(publish: &PublishPacket) -> Self {
        StoredMessage {
            packet_id: publish.packet_id,
            direction: MessageDirection::Outbound,
            qos: publish.qos,
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            retain: publish.retain,
            duplicate: publish.duplicate,
            state: if publish.qos == QualityOfService::ExactlyOnce { DeliveryState::AwaitingRec } else { DeliveryState::AwaitingAck },
        }
    }

    /// Creates a store entry tracking an inbound QoS 2 publish that has been answered with
    /// PUBREC
    pub fn new_inbound(publish: &PublishPacket) -> Self {
        StoredMessage {
            packet_id: publish.packet_id,
            direction: MessageDirection::Inbound,
            qos: publish.qos,
            topic: publish.topic.clone(),
            payload: None,
            retain: publish.retain,
            duplicate: publish.duplicate,
            state: DeliveryState::SentRec,
        }
    }

    /// Rebuilds the publish packet this entry records
    pub fn to_publish(&self) -> PublishPacket {
        PublishPacket {
            packet_id: self.packet_id,
            topic: self.topic.clone(),
            qos: self.qos,
            duplicate: self.duplicate,
            retain: self.retain,
            payload: self.payload.clone(),
        }
    }
}

/// Capability interface for message persistence.
///
/// All operations take effect atomically with respect to each other; the session only calls a
/// store from its own event loop.  Once `close` has been called every other operation must
/// fail with [`MqttError::StoreClosed`].
pub trait MessageStore : Send {

    /// Inserts a message, replacing any existing message with the same packet id.  A replaced
    /// message keeps its snapshot position.
    fn put(&mut self, packet_id: u16, message: StoredMessage) -> MqttResult<()>;

    /// Looks up a message by packet id
    fn get(&self, packet_id: u16) -> MqttResult<Option<StoredMessage>>;

    /// Removes a message, returning it if present.  Removing an absent id is not an error.
    fn remove(&mut self, packet_id: u16) -> MqttResult<Option<StoredMessage>>;

    /// Returns every stored message in insertion order
    fn snapshot(&self) -> MqttResult<Vec<StoredMessage>>;

    /// Releases all resources.  Closing an already-closed store is a no-op.
    fn close(&mut self) -> MqttResult<()>;

    /// Number of stored messages
    fn len(&self) -> MqttResult<usize> {
        Ok(self.snapshot()?.len())
    }

    /// Whether the store holds no messages
    fn is_empty(&self) -> MqttResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Removes every stored message
    fn clear(&mut self) -> MqttResult<()> {
        for message in self.snapshot()? {
            self.remove(message.packet_id)?;
        }

        Ok(())
    }
}

/// Process-lifetime message store.  The default for both session stores.
#[derive(Default)]
pub struct MemoryMessageStore {
    messages: HashMap<u16, (u64, StoredMessage)>,
    insertion_order: BTreeMap<u64, u16>,
    next_sequence: u64,
    closed: bool,
}

impl MemoryMessageStore {

    /// Creates a new, empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> MqttResult<()> {
        if self.closed {
            return Err(MqttError::new_store_closed());
        }

        Ok(())
    }
}

impl MessageStore for MemoryMessageStore {
    fn put(&mut self, packet_id: u16, message: StoredMessage) -> MqttResult<()> {
        self.check_open()?;

        if let Some((_, existing)) = self.messages.get_mut(&packet_id) {
            *existing = message;
            return Ok(());
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.insertion_order.insert(sequence, packet_id);
        self.messages.insert(packet_id, (sequence, message));

        Ok(())
    }

    fn get(&self, packet_id: u16) -> MqttResult<Option<StoredMessage>> {
        self.check_open()?;

        Ok(self.messages.get(&packet_id).map(|(_, message)| message.clone()))
    }

    fn remove(&mut self, packet_id: u16) -> MqttResult<Option<StoredMessage>> {
        self.check_open()?;

        if let Some((sequence, message)) = self.messages.remove(&packet_id) {
            self.insertion_order.remove(&sequence);
            return Ok(Some(message));
        }

        Ok(None)
    }

    fn snapshot(&self) -> MqttResult<Vec<StoredMessage>> {
        self.check_open()?;

        Ok(self.insertion_order.values()
            .filter_map(|packet_id| self.messages.get(packet_id))
            .map(|(_, message)| message.clone())
            .collect())
    }

    fn close(&mut self) -> MqttResult<()> {
        self.messages.clear();
        self.insertion_order.clear();
        self.closed = true;

        Ok(())
    }

    fn len(&self) -> MqttResult<usize> {
        self.check_open()?;

        Ok(self.messages.len())
    }

    fn clear(&mut self) -> MqttResult<()> {
        self.check_open()?;

        self.messages.clear();
        self.insertion_order.clear();

        Ok(())
    }
}
