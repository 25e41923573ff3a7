/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
QoS acknowledgement flow control.

The flow controller owns the session's packet id provider and both message stores, and is the
only component that mutates them.  Every method that touches the provider and a store does so
as one step: an identifier is never issued without a store entry behind it (for publishes) and
a store entry is never removed without its identifier being released.
 */

use crate::error::{MqttError, MqttResult};
use crate::mqtt::*;
use crate::packet_id::PacketIdProvider;
use crate::store::{DeliveryState, MessageStore, StoredMessage};

use log::*;

/// What the session should do after a PUBREC arrives
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum PubrecDisposition {

    /// First successful PUBREC: send the PUBREL and wait on PUBCOMP
    Release(PubrelPacket),

    /// PUBREC repeated for an exchange already awaiting PUBCOMP: send the PUBREL again
    Repeat(PubrelPacket),

    /// Failing PUBREC: the exchange is over and the identifier has been released
    Rejected,
}

/// What the session should do after an inbound PUBLISH arrives
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct InboundPublishDisposition {

    /// Whether the publish should be handed to the application
    pub deliver: bool,

    /// Acknowledgement to send back, if the QoS requires one
    pub response: Option<MqttPacket>,
}

pub(crate) struct QosFlowController {
    packet_ids: Box<dyn PacketIdProvider>,
    outgoing: Box<dyn MessageStore>,
    incoming: Box<dyn MessageStore>,
}

impl QosFlowController {

    /// Builds a controller around externally-supplied stores.  Identifiers of any exchanges
    /// already in the outgoing store are registered so they are not issued again.
    pub(crate) fn new(packet_ids: Box<dyn PacketIdProvider>, outgoing: Box<dyn MessageStore>, incoming: Box<dyn MessageStore>) -> MqttResult<Self> {
        let mut controller = QosFlowController {
            packet_ids,
            outgoing,
            incoming
        };

        for message in controller.outgoing.snapshot()? {
            if !controller.packet_ids.register(message.packet_id) {
                return Err(MqttError::new_invalid_configuration(format!("outgoing message store holds duplicate or invalid packet id {}", message.packet_id)));
            }
        }

        Ok(controller)
    }

    pub(crate) fn begin_outbound_publish(&mut self, publish: &mut PublishPacket) -> MqttResult<u16> {
        if publish.qos == QualityOfService::AtMostOnce {
            return Err(MqttError::new_internal_state_error("qos 0 publishes do not take part in acknowledgement flow"));
        }

        let packet_id = self.acquire_packet_id()?;
        publish.packet_id = packet_id;

        if let Err(error) = self.outgoing.put(packet_id, StoredMessage::new_outbound(publish)) {
            self.packet_ids.deallocate(packet_id);
            publish.packet_id = 0;
            return Err(error);
        }

        Ok(packet_id)
    }

    pub(crate) fn handle_puback(&mut self, puback: &PubackPacket) -> MqttResult<()> {
        let packet_id = puback.packet_id;
        match self.outgoing.get(packet_id)? {
            Some(StoredMessage { state: DeliveryState::AwaitingAck, .. }) => {
                self.complete_outbound(packet_id)
            }
            _ => {
                Err(MqttError::new_duplicate_ack(PacketType::Puback, packet_id))
            }
        }
    }

    pub(crate) fn handle_pubrec(&mut self, pubrec: &PubrecPacket) -> MqttResult<PubrecDisposition> {
        let packet_id = pubrec.packet_id;
        let pubrel = PubrelPacket {
            packet_id,
            ..Default::default()
        };

        match self.outgoing.get(packet_id)? {
            Some(mut message) if message.state == DeliveryState::AwaitingRec => {
                if !pubrec.reason_code.is_success() {
                    debug!("QosFlowController::handle_pubrec - pubrec for packet id {} failed with {:?}", packet_id, pubrec.reason_code);
                    self.complete_outbound(packet_id)?;
                    return Ok(PubrecDisposition::Rejected);
                }

                message.state = DeliveryState::AwaitingComp;
                message.payload = None;
                self.outgoing.put(packet_id, message)?;

                Ok(PubrecDisposition::Release(pubrel))
            }
            Some(StoredMessage { state: DeliveryState::AwaitingComp, .. }) => {
                Ok(PubrecDisposition::Repeat(pubrel))
            }
            _ => {
                Err(MqttError::new_duplicate_ack(PacketType::Pubrec, packet_id))
            }
        }
    }

    pub(crate) fn handle_pubcomp(&mut self, pubcomp: &PubcompPacket) -> MqttResult<()> {
        let packet_id = pubcomp.packet_id;
        match self.outgoing.get(packet_id)? {
            Some(StoredMessage { state: DeliveryState::AwaitingComp, .. }) => {
                self.complete_outbound(packet_id)
            }
            _ => {
                Err(MqttError::new_duplicate_ack(PacketType::Pubcomp, packet_id))
            }
        }
    }

    pub(crate) fn handle_inbound_publish(&mut self, publish: &PublishPacket) -> MqttResult<InboundPublishDisposition> {
        match publish.qos {
            QualityOfService::AtMostOnce => {
                Ok(InboundPublishDisposition {
                    deliver: true,
                    response: None
                })
            }
            QualityOfService::AtLeastOnce => {
                Ok(InboundPublishDisposition {
                    deliver: true,
                    response: Some(MqttPacket::Puback(PubackPacket {
                        packet_id: publish.packet_id,
                        ..Default::default()
                    }))
                })
            }
            QualityOfService::ExactlyOnce => {
                let already_received = self.incoming.get(publish.packet_id)?.is_some();
                if already_received {
                    debug!("QosFlowController::handle_inbound_publish - suppressing redelivery of qos 2 publish with packet id {}", publish.packet_id);
                } else {
                    self.incoming.put(publish.packet_id, StoredMessage::new_inbound(publish))?;
                }

                Ok(InboundPublishDisposition {
                    deliver: !already_received,
                    response: Some(MqttPacket::Pubrec(PubrecPacket {
                        packet_id: publish.packet_id,
                        ..Default::default()
                    }))
                })
            }
        }
    }

    pub(crate) fn handle_pubrel(&mut self, pubrel: &PubrelPacket) -> MqttResult<PubcompPacket> {
        let packet_id = pubrel.packet_id;
        let mut pubcomp = PubcompPacket {
            packet_id,
            ..Default::default()
        };

        if self.incoming.remove(packet_id)?.is_none() {
            warn!("QosFlowController::handle_pubrel - pubrel received for unknown packet id {}", packet_id);
            pubcomp.reason_code = PubcompReasonCode::PacketIdentifierNotFound;
        }

        Ok(pubcomp)
    }

    /// Packets to retransmit, in store order, when a session is resumed.  Publishes are marked
    /// duplicate; exchanges past PUBREC are resumed with PUBREL.
    pub(crate) fn resubmission_packets(&mut self) -> MqttResult<Vec<MqttPacket>> {
        let mut packets = Vec::new();
        for mut message in self.outgoing.snapshot()? {
            match message.state {
                DeliveryState::AwaitingAck | DeliveryState::AwaitingRec => {
                    if !message.duplicate {
                        message.duplicate = true;
                        self.outgoing.put(message.packet_id, message.clone())?;
                    }

                    packets.push(MqttPacket::Publish(message.to_publish()));
                }
                DeliveryState::AwaitingComp => {
                    packets.push(MqttPacket::Pubrel(PubrelPacket {
                        packet_id: message.packet_id,
                        ..Default::default()
                    }));
                }
                DeliveryState::SentRec => {
                    return Err(MqttError::new_internal_state_error("inbound exchange found in outgoing message store"));
                }
            }
        }

        Ok(packets)
    }

    pub(crate) fn outbound_messages(&self) -> MqttResult<Vec<StoredMessage>> {
        self.outgoing.snapshot()
    }

    #[cfg(test)]
    pub(crate) fn outbound_state(&self, packet_id: u16) -> MqttResult<Option<DeliveryState>> {
        Ok(self.outgoing.get(packet_id)?.map(|message| message.state))
    }

    pub(crate) fn outbound_inflight_count(&self) -> MqttResult<usize> {
        self.outgoing.len()
    }

    /// Discards all session state: both stores and every issued identifier
    pub(crate) fn reset_session(&mut self) -> MqttResult<()> {
        self.outgoing.clear()?;
        self.incoming.clear()?;
        self.packet_ids.clear();

        Ok(())
    }

    pub(crate) fn acquire_packet_id(&mut self) -> MqttResult<u16> {
        self.packet_ids.allocate().ok_or_else(|| MqttError::new_capacity_exceeded("packet id space exhausted"))
    }

    pub(crate) fn release_packet_id(&mut self, packet_id: u16) {
        self.packet_ids.deallocate(packet_id);
    }

    pub(crate) fn close_stores(&mut self) -> MqttResult<()> {
        let outgoing_result = self.outgoing.close();
        let incoming_result = self.incoming.close();

        outgoing_result.and(incoming_result)
    }

    fn complete_outbound(&mut self, packet_id: u16) -> MqttResult<()> {
        self.outgoing.remove(packet_id)?;
        self.packet_ids.deallocate(packet_id);

        Ok(())
    }
}
