/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

// Test-only broker simulation.  Broker behavior is expressed as a set of per-packet-type handlers
// that turn one received packet into zero or more responses; the same handlers drive both the
// packet-level protocol fixture and the loopback broker used by runtime tests.
//
// The loopback codec carries packets rather than bytes: encoding a packet queues it for the peer
// and writes a single marker byte, decoding a marker byte pops the next queued packet.  That keeps
// the runtime's real read/write/flush path in play without an MQTT wire format.

pub(crate) mod protocol;

use crate::codec::*;
use crate::error::{MqttError, MqttResult};
use crate::mqtt::*;
use crate::mqtt::utils::mqtt_packet_to_packet_type;

use log::*;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const LOOPBACK_MARKER: u8 = 0xA5;
const LOOPBACK_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Default)]
pub(crate) struct BrokerTestContext {
    pub(crate) connect_count: usize,
}

pub(crate) type BrokerPacketHandler = Box<dyn Fn(&MqttPacket, &mut VecDeque<Box<MqttPacket>>, &mut BrokerTestContext) -> MqttResult<()> + Send + Sync + 'static>;
pub(crate) type BrokerPacketHandlerSet = HashMap<PacketType, BrokerPacketHandler>;

pub(crate) fn handle_connect_with_success(packet: &MqttPacket, response_packets: &mut VecDeque<Box<MqttPacket>>, context: &mut BrokerTestContext) -> MqttResult<()> {
    if let MqttPacket::Connect(_) = packet {
        context.connect_count += 1;
        response_packets.push_back(Box::new(MqttPacket::Connack(ConnackPacket::default())));

        return Ok(());
    }

    panic!("Invalid packet handler state")
}

pub(crate) fn handle_connect_with_session_resumption(packet: &MqttPacket, response_packets: &mut VecDeque<Box<MqttPacket>>, context: &mut BrokerTestContext) -> MqttResult<()> {
    if let MqttPacket::Connect(connect) = packet {
        context.connect_count += 1;
        response_packets.push_back(Box::new(MqttPacket::Connack(ConnackPacket {
            session_present: !connect.clean_start,
            ..Default::default()
        })));

        return Ok(());
    }

    panic!("Invalid packet handler state")
}

pub(crate) fn handle_connect_with_refusal(packet: &MqttPacket, response_packets: &mut VecDeque<Box<MqttPacket>>, context: &mut BrokerTestContext) -> MqttResult<()> {
    if let MqttPacket::Connect(_) = packet {
        context.connect_count += 1;
        response_packets.push_back(Box::new(MqttPacket::Connack(ConnackPacket {
            reason_code: ConnectReasonCode::NotAuthorized,
            ..Default::default()
        })));

        return Ok(());
    }

    panic!("Invalid packet handler state")
}

pub(crate) fn handle_connect_with_receive_maximum_one(packet: &MqttPacket, response_packets: &mut VecDeque<Box<MqttPacket>>, context: &mut BrokerTestContext) -> MqttResult<()> {
    if let MqttPacket::Connect(_) = packet {
        context.connect_count += 1;
        response_packets.push_back(Box::new(MqttPacket::Connack(ConnackPacket {
            receive_maximum: Some(1),
            ..Default::default()
        })));

        return Ok(());
    }

    panic!("Invalid packet handler state")
}

pub(crate) fn handle_connect_with_keep_alive(packet: &MqttPacket, response_packets: &mut VecDeque<Box<MqttPacket>>, context: &mut BrokerTestContext) -> MqttResult<()> {
    if let MqttPacket::Connect(_) = packet {
        context.connect_count += 1;
        response_packets.push_back(Box::new(MqttPacket::Connack(ConnackPacket {
            server_keep_alive: Some(10),
            ..Default::default()
        })));

        return Ok(());
    }

    panic!("Invalid packet handler state")
}

pub(crate) fn handle_publish_with_success(packet: &MqttPacket, response_packets: &mut VecDeque<Box<MqttPacket>>, _: &mut BrokerTestContext) -> MqttResult<()> {
    if let MqttPacket::Publish(publish) = packet {
        match publish.qos {
            QualityOfService::AtMostOnce => {}
            QualityOfService::AtLeastOnce => {
                response_packets.push_back(Box::new(MqttPacket::Puback(PubackPacket {
                    packet_id: publish.packet_id,
                    ..Default::default()
                })));
            }
            QualityOfService::ExactlyOnce => {
                response_packets.push_back(Box::new(MqttPacket::Pubrec(PubrecPacket {
                    packet_id: publish.packet_id,
                    ..Default::default()
                })));
            }
        }

        return Ok(());
    }

    panic!("Invalid packet handler state")
}

pub(crate) fn handle_pubrec_with_pubrel(packet: &MqttPacket, response_packets: &mut VecDeque<Box<MqttPacket>>, _: &mut BrokerTestContext) -> MqttResult<()> {
    if let MqttPacket::Pubrec(pubrec) = packet {
        response_packets.push_back(Box::new(MqttPacket::Pubrel(PubrelPacket {
            packet_id: pubrec.packet_id,
            ..Default::default()
        })));

        return Ok(());
    }

    panic!("Invalid packet handler state")
}

pub(crate) fn handle_pubrel_with_pubcomp(packet: &MqttPacket, response_packets: &mut VecDeque<Box<MqttPacket>>, _: &mut BrokerTestContext) -> MqttResult<()> {
    if let MqttPacket::Pubrel(pubrel) = packet {
        response_packets.push_back(Box::new(MqttPacket::Pubcomp(PubcompPacket {
            packet_id: pubrel.packet_id,
            ..Default::default()
        })));

        return Ok(());
    }

    panic!("Invalid packet handler state")
}

fn build_suback_for(subscribe: &SubscribePacket) -> SubackPacket {
    SubackPacket {
        packet_id: subscribe.packet_id,
        reason_codes: subscribe.subscriptions.iter().map(|subscription| {
            match subscription.qos {
                QualityOfService::AtMostOnce => { SubackReasonCode::GrantedQos0 }
                QualityOfService::AtLeastOnce => { SubackReasonCode::GrantedQos1 }
                QualityOfService::ExactlyOnce => { SubackReasonCode::GrantedQos2 }
            }
        }).collect(),
    }
}

pub(crate) fn handle_subscribe_with_success(packet: &MqttPacket, response_packets: &mut VecDeque<Box<MqttPacket>>, _: &mut BrokerTestContext) -> MqttResult<()> {
    if let MqttPacket::Subscribe(subscribe) = packet {
        response_packets.push_back(Box::new(MqttPacket::Suback(build_suback_for(subscribe))));

        return Ok(());
    }

    panic!("Invalid packet handler state")
}

// Grants the subscription and then delivers one QoS 2 publish to its first filter, twice: the
// second copy reuses the packet id and carries the duplicate flag, as a broker resending after a
// lost PUBREC would.
pub(crate) fn handle_subscribe_with_qos2_delivery(packet: &MqttPacket, response_packets: &mut VecDeque<Box<MqttPacket>>, _: &mut BrokerTestContext) -> MqttResult<()> {
    if let MqttPacket::Subscribe(subscribe) = packet {
        response_packets.push_back(Box::new(MqttPacket::Suback(build_suback_for(subscribe))));

        let topic = subscribe.subscriptions.first().map(|subscription| subscription.topic_filter.clone()).unwrap_or_default();
        let publish = PublishPacket {
            packet_id: 7,
            topic,
            qos: QualityOfService::ExactlyOnce,
            payload: Some("delivered".as_bytes().to_vec()),
            ..Default::default()
        };

        response_packets.push_back(Box::new(MqttPacket::Publish(publish.clone())));
        response_packets.push_back(Box::new(MqttPacket::Publish(PublishPacket {
            duplicate: true,
            ..publish
        })));

        return Ok(());
    }

    panic!("Invalid packet handler state")
}

pub(crate) fn handle_unsubscribe_with_success(packet: &MqttPacket, response_packets: &mut VecDeque<Box<MqttPacket>>, _: &mut BrokerTestContext) -> MqttResult<()> {
    if let MqttPacket::Unsubscribe(unsubscribe) = packet {
        response_packets.push_back(Box::new(MqttPacket::Unsuback(UnsubackPacket {
            packet_id: unsubscribe.packet_id,
            reason_codes: vec![UnsubackReasonCode::Success; unsubscribe.topic_filters.len()],
        })));

        return Ok(());
    }

    panic!("Invalid packet handler state")
}

pub(crate) fn handle_pingreq_with_pingresp(packet: &MqttPacket, response_packets: &mut VecDeque<Box<MqttPacket>>, _: &mut BrokerTestContext) -> MqttResult<()> {
    if let MqttPacket::Pingreq(_) = packet {
        response_packets.push_back(Box::new(MqttPacket::Pingresp(PingrespPacket {})));

        return Ok(());
    }

    panic!("Invalid packet handler state")
}

pub(crate) fn handle_with_nothing(_: &MqttPacket, _: &mut VecDeque<Box<MqttPacket>>, _: &mut BrokerTestContext) -> MqttResult<()> {
    Ok(())
}

pub(crate) fn default_broker_handlers() -> BrokerPacketHandlerSet {
    let mut handlers : BrokerPacketHandlerSet = HashMap::new();

    handlers.insert(PacketType::Connect, Box::new(handle_connect_with_success));
    handlers.insert(PacketType::Publish, Box::new(handle_publish_with_success));
    handlers.insert(PacketType::Puback, Box::new(handle_with_nothing));
    handlers.insert(PacketType::Pubrec, Box::new(handle_pubrec_with_pubrel));
    handlers.insert(PacketType::Pubrel, Box::new(handle_pubrel_with_pubcomp));
    handlers.insert(PacketType::Pubcomp, Box::new(handle_with_nothing));
    handlers.insert(PacketType::Subscribe, Box::new(handle_subscribe_with_success));
    handlers.insert(PacketType::Unsubscribe, Box::new(handle_unsubscribe_with_success));
    handlers.insert(PacketType::Pingreq, Box::new(handle_pingreq_with_pingresp));
    handlers.insert(PacketType::Disconnect, Box::new(handle_with_nothing));

    handlers
}

pub(crate) fn apply_broker_handlers(handlers: &BrokerPacketHandlerSet, packet: &MqttPacket, response_packets: &mut VecDeque<Box<MqttPacket>>, context: &mut BrokerTestContext) -> MqttResult<()> {
    let packet_type = mqtt_packet_to_packet_type(packet);
    let Some(handler) = handlers.get(&packet_type) else {
        return Err(MqttError::new_protocol_violation(format!("no broker handler for {} packets", packet_type)));
    };

    handler(packet, response_packets, context)
}

type PacketQueue = Arc<Mutex<VecDeque<MqttPacket>>>;

pub(crate) struct LoopbackCodec {
    outbound: PacketQueue,
    inbound: PacketQueue,
}

impl Codec for LoopbackCodec {
    fn reset_for_new_connection(&mut self, _: ProtocolVersion) {
        if let Ok(mut outbound) = self.outbound.lock() {
            outbound.clear();
        }

        if let Ok(mut inbound) = self.inbound.lock() {
            inbound.clear();
        }
    }

    fn encode(&mut self, packet: &MqttPacket, dest: &mut Vec<u8>) -> MqttResult<()> {
        let mut outbound = self.outbound.lock().map_err(|_| MqttError::new_encoding_failure("loopback queue poisoned"))?;
        outbound.push_back(packet.clone());
        dest.push(LOOPBACK_MARKER);

        Ok(())
    }

    fn decode(&mut self, bytes: &[u8]) -> MqttResult<DecodeOutcome> {
        let Some(marker) = bytes.first() else {
            return Ok(DecodeOutcome::Incomplete);
        };

        if *marker != LOOPBACK_MARKER {
            return Err(MqttError::new_malformed_packet("unexpected byte on loopback stream"));
        }

        let mut inbound = self.inbound.lock().map_err(|_| MqttError::new_malformed_packet("loopback queue poisoned"))?;
        let Some(packet) = inbound.pop_front() else {
            return Err(MqttError::new_malformed_packet("loopback marker without a queued packet"));
        };

        Ok(DecodeOutcome::Packet {
            packet: Box::new(packet),
            consumed: 1,
        })
    }
}

// (client side, broker side)
pub(crate) fn create_loopback_codec_pair() -> (LoopbackCodec, LoopbackCodec) {
    let to_broker : PacketQueue = Arc::new(Mutex::new(VecDeque::new()));
    let to_client : PacketQueue = Arc::new(Mutex::new(VecDeque::new()));

    let client_codec = LoopbackCodec {
        outbound: to_broker.clone(),
        inbound: to_client.clone(),
    };

    let broker_codec = LoopbackCodec {
        outbound: to_client,
        inbound: to_broker,
    };

    (client_codec, broker_codec)
}

struct LoopbackBrokerState {
    codec: Mutex<LoopbackCodec>,
    handlers: BrokerPacketHandlerSet,
    context: Mutex<BrokerTestContext>,
    received: Mutex<Vec<MqttPacket>>,
}

// Broker half of an in-process connection.  Each accepted connection gets its own duplex pipe
// and its own task; every packet the broker receives is recorded in arrival order.
#[derive(Clone)]
pub(crate) struct LoopbackBroker {
    state: Arc<LoopbackBrokerState>,
}

impl LoopbackBroker {
    pub(crate) fn new(codec: LoopbackCodec, handlers: BrokerPacketHandlerSet) -> Self {
        LoopbackBroker {
            state: Arc::new(LoopbackBrokerState {
                codec: Mutex::new(codec),
                handlers,
                context: Mutex::new(BrokerTestContext::default()),
                received: Mutex::new(Vec::new()),
            })
        }
    }

    // Must be called from within a tokio runtime
    pub(crate) fn accept_connection(&self) -> DuplexStream {
        let (client_stream, broker_stream) = tokio::io::duplex(LOOPBACK_BUFFER_SIZE);

        if let Ok(mut codec) = self.state.codec.lock() {
            codec.reset_for_new_connection(ProtocolVersion::Mqtt5);
        }

        let state = self.state.clone();
        tokio::spawn(async move {
            if let Err(error) = run_loopback_connection(state, broker_stream).await {
                debug!("loopback broker - connection ended: {}", error);
            }
        });

        client_stream
    }

    pub(crate) fn received_packets(&self) -> Vec<MqttPacket> {
        self.state.received.lock().unwrap().clone()
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.state.context.lock().unwrap().connect_count
    }

    pub(crate) async fn wait_for_received<F>(&self, predicate: F) where F : Fn(&[MqttPacket]) -> bool {
        let wait = async {
            loop {
                if predicate(self.received_packets().as_slice()) {
                    return;
                }

                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };

        tokio::time::timeout(Duration::from_secs(5), wait).await.unwrap();
    }
}

async fn run_loopback_connection(state: Arc<LoopbackBrokerState>, mut stream: DuplexStream) -> MqttResult<()> {
    let mut inbound_data = [0u8; 4096];
    let mut inbound_buffer : Vec<u8> = Vec::new();

    loop {
        let bytes_read = stream.read(&mut inbound_data).await?;
        if bytes_read == 0 {
            return Ok(());
        }

        inbound_buffer.extend_from_slice(&inbound_data[..bytes_read]);

        let mut outbound_data : Vec<u8> = Vec::new();
        {
            let mut codec = state.codec.lock().unwrap();
            loop {
                let (packet, consumed) =
                    match codec.decode(inbound_buffer.as_slice())? {
                        DecodeOutcome::Packet { packet, consumed } => { (packet, consumed) }
                        DecodeOutcome::Incomplete => { break; }
                    };

                inbound_buffer.drain(..consumed);
                state.received.lock().unwrap().push((*packet).clone());

                let mut responses = VecDeque::new();
                {
                    let mut context = state.context.lock().unwrap();
                    apply_broker_handlers(&state.handlers, &packet, &mut responses, &mut context)?;
                }

                for response in responses {
                    codec.encode(&response, &mut outbound_data)?;
                }
            }
        }

        if !outbound_data.is_empty() {
            stream.write_all(&outbound_data).await?;
            stream.flush().await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn loopback_codec_pair_carries_packets_in_order() {
        let (mut client_codec, mut broker_codec) = create_loopback_codec_pair();

        let mut bytes = Vec::new();
        client_codec.encode(&MqttPacket::Pingreq(PingreqPacket {}), &mut bytes).unwrap();
        client_codec.encode(&MqttPacket::Disconnect(DisconnectPacket::default()), &mut bytes).unwrap();
        assert_eq!(2, bytes.len());

        assert_matches!(broker_codec.decode(&bytes), Ok(DecodeOutcome::Packet { packet, consumed: 1 }) => {
            assert_eq!(MqttPacket::Pingreq(PingreqPacket {}), *packet);
        });
        assert_matches!(broker_codec.decode(&bytes[1..]), Ok(DecodeOutcome::Packet { packet, consumed: 1 }) => {
            assert_matches!(*packet, MqttPacket::Disconnect(_));
        });
        assert_matches!(broker_codec.decode(&[]), Ok(DecodeOutcome::Incomplete));
        assert_matches!(broker_codec.decode(&bytes[1..]), Err(MqttError::ProtocolViolation(_)));
    }

    #[test]
    fn loopback_codec_reset_discards_stale_packets() {
        let (mut client_codec, mut broker_codec) = create_loopback_codec_pair();

        let mut bytes = Vec::new();
        broker_codec.encode(&MqttPacket::Pingresp(PingrespPacket {}), &mut bytes).unwrap();
        client_codec.reset_for_new_connection(ProtocolVersion::Mqtt311);

        assert_matches!(client_codec.decode(&bytes), Err(MqttError::ProtocolViolation(_)));
    }

    #[test]
    fn default_handlers_answer_qos_publishes() {
        let handlers = default_broker_handlers();
        let mut context = BrokerTestContext::default();
        let mut responses = VecDeque::new();

        let publish = MqttPacket::Publish(PublishPacket {
            packet_id: 3,
            topic: "a/b".to_string(),
            qos: QualityOfService::ExactlyOnce,
            ..Default::default()
        });

        apply_broker_handlers(&handlers, &publish, &mut responses, &mut context).unwrap();
        assert_eq!(1, responses.len());
        assert_matches!(&*responses[0], MqttPacket::Pubrec(pubrec) => {
            assert_eq!(3, pubrec.packet_id);
        });

        let mut no_handlers : BrokerPacketHandlerSet = HashMap::new();
        no_handlers.insert(PacketType::Connect, Box::new(handle_connect_with_success));
        assert_matches!(apply_broker_handlers(&no_handlers, &publish, &mut responses, &mut context), Err(MqttError::ProtocolViolation(_)));
    }
}
