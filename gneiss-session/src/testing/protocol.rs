/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::client::*;
use crate::config::*;
use crate::error::{MqttError, MqttResult, TimeoutKind};
use crate::mqtt::*;
use crate::mqtt::utils::mqtt_packet_to_packet_type;
use crate::packet_id::PacketIdPolicy;
use crate::protocol::*;
use crate::store::*;
use crate::testing::*;

use assert_matches::assert_matches;
use std::collections::VecDeque;
use std::sync::mpsc;
use std::time::{Duration, Instant};

const CONNACK_TIMEOUT_MILLIS: u64 = 10000;

fn build_standard_test_config() -> ProtocolStateConfig {
    ProtocolStateConfig {
        connect_options : ConnectOptions::builder().with_client_id("ProtocolTesting").with_keep_alive_interval_seconds(0).build(),
        client_id: "ProtocolTesting".to_string(),
        base_timestamp: Instant::now(),
        offline_queue_policy: OfflineQueuePolicy::PreserveAll,
        ping_timeout: Duration::from_millis(30000),
        max_inflight: 100,
        inflight_limit_policy: InflightLimitPolicy::Queue,
        packet_id_policy: PacketIdPolicy::SmallestFree,
    }
}

fn build_persistent_session_test_config() -> ProtocolStateConfig {
    let mut config = build_standard_test_config();
    config.connect_options = ConnectOptions::builder()
        .with_client_id("ProtocolTesting")
        .with_keep_alive_interval_seconds(0)
        .with_clean_session(false)
        .build();

    config
}

// Drives a ProtocolState at the packet level.  Packets the client writes are run through a set
// of broker handlers; the broker's responses are handed back to the test, which decides when
// (and whether) the client sees them.
pub(crate) struct ProtocolStateTestFixture {
    base_timestamp: Instant,

    broker_handlers: BrokerPacketHandlerSet,
    broker_context: BrokerTestContext,

    pub(crate) client_state: ProtocolState,
    pub(crate) client_packet_events: VecDeque<PacketEvent>,

    pub(crate) to_broker_packet_stream: VecDeque<Box<MqttPacket>>,
    pub(crate) to_client_packet_stream: VecDeque<Box<MqttPacket>>,
}

impl ProtocolStateTestFixture {
    pub(crate) fn new(config: ProtocolStateConfig) -> Self {
        Self::new_with_stores(config, Box::new(MemoryMessageStore::new()), Box::new(MemoryMessageStore::new()))
    }

    pub(crate) fn new_with_stores(config: ProtocolStateConfig, outgoing: Box<dyn MessageStore>, incoming: Box<dyn MessageStore>) -> Self {
        let base_timestamp = config.base_timestamp;
        ProtocolStateTestFixture {
            base_timestamp,
            broker_handlers: default_broker_handlers(),
            broker_context: BrokerTestContext::default(),
            client_state: ProtocolState::new(config, outgoing, incoming).unwrap(),
            client_packet_events: VecDeque::new(),
            to_broker_packet_stream: VecDeque::new(),
            to_client_packet_stream: VecDeque::new(),
        }
    }

    pub(crate) fn with_broker_handler(mut self, packet_type: PacketType, handler: BrokerPacketHandler) -> Self {
        self.broker_handlers.insert(packet_type, handler);
        self
    }

    fn timepoint(&self, elapsed_millis: u64) -> Instant {
        self.base_timestamp + Duration::from_millis(elapsed_millis)
    }

    // Services the client and returns what it wrote, without involving the broker
    pub(crate) fn service(&mut self, elapsed_millis: u64) -> MqttResult<VecDeque<Box<MqttPacket>>> {
        let mut to_socket = VecDeque::new();
        let mut service_context = ServiceContext {
            to_socket: &mut to_socket,
            current_time: self.timepoint(elapsed_millis),
        };

        self.client_state.service(&mut service_context)?;

        for packet in to_socket.iter() {
            self.to_broker_packet_stream.push_back(packet.clone());
        }

        Ok(to_socket)
    }

    // Services the client, hands everything it wrote to the broker and returns the broker's
    // responses.  The responses are not delivered to the client.
    pub(crate) fn service_with_drain(&mut self, elapsed_millis: u64) -> MqttResult<VecDeque<Box<MqttPacket>>> {
        let written = self.service(elapsed_millis)?;

        let mut responses = VecDeque::new();
        for packet in written.iter() {
            apply_broker_handlers(&self.broker_handlers, packet, &mut responses, &mut self.broker_context)?;
        }

        for response in responses.iter() {
            self.to_client_packet_stream.push_back(response.clone());
        }

        Ok(responses)
    }

    // Full write/ack cycle: service, complete the write, deliver the broker's responses
    pub(crate) fn service_round_trip(&mut self, service_time: u64, response_time: u64) -> MqttResult<()> {
        let responses = self.service_with_drain(service_time)?;
        if self.client_state.pending_write_completion {
            self.on_write_completion(service_time)?;
        }

        self.on_incoming_packets(response_time, responses)
    }

    fn handle_network_event(&mut self, event: NetworkEvent, elapsed_millis: u64) -> MqttResult<()> {
        let context = NetworkEventContext {
            event,
            current_time: self.timepoint(elapsed_millis),
            packet_events: &mut self.client_packet_events,
        };

        self.client_state.handle_network_event(context)
    }

    pub(crate) fn on_connection_opened(&mut self, elapsed_millis: u64) -> MqttResult<()> {
        let establishment_timeout = self.timepoint(elapsed_millis + CONNACK_TIMEOUT_MILLIS);
        self.handle_network_event(NetworkEvent::ConnectionOpened(ConnectionOpenedContext { establishment_timeout }), elapsed_millis)
    }

    pub(crate) fn on_write_completion(&mut self, elapsed_millis: u64) -> MqttResult<()> {
        self.handle_network_event(NetworkEvent::WriteCompletion, elapsed_millis)
    }

    pub(crate) fn on_connection_closed(&mut self, elapsed_millis: u64) -> MqttResult<()> {
        self.handle_network_event(NetworkEvent::ConnectionClosed, elapsed_millis)
    }

    pub(crate) fn on_incoming_packet(&mut self, elapsed_millis: u64, packet: MqttPacket) -> MqttResult<()> {
        self.handle_network_event(NetworkEvent::IncomingPacket(Box::new(packet)), elapsed_millis)
    }

    pub(crate) fn on_incoming_packets(&mut self, elapsed_millis: u64, packets: VecDeque<Box<MqttPacket>>) -> MqttResult<()> {
        for packet in packets {
            self.handle_network_event(NetworkEvent::IncomingPacket(packet), elapsed_millis)?;
        }

        Ok(())
    }

    pub(crate) fn get_next_service_time(&mut self, elapsed_millis: u64) -> Option<u64> {
        let current_time = self.timepoint(elapsed_millis);
        self.client_state.get_next_service_timepoint(&current_time).map(|timepoint| (timepoint - self.base_timestamp).as_millis() as u64)
    }

    pub(crate) fn reset(&mut self, elapsed_millis: u64) {
        let current_time = self.timepoint(elapsed_millis);
        self.client_state.reset(&current_time);
    }

    pub(crate) fn advance_disconnected_to_state(&mut self, state: ProtocolStateType, elapsed_millis: u64) -> MqttResult<()> {
        assert_eq!(ProtocolStateType::Disconnected, self.client_state.state());

        self.on_connection_opened(elapsed_millis)?;
        match state {
            ProtocolStateType::PendingConnack => {
                self.service(elapsed_millis)?;
                self.on_write_completion(elapsed_millis)
            }
            ProtocolStateType::Connected => {
                self.service_round_trip(elapsed_millis, elapsed_millis)
            }
            _ => {
                panic!("Unsupported target state")
            }
        }
    }

    pub(crate) fn publish(&mut self, elapsed_millis: u64, publish: PublishPacket, options: PublishOptions) -> mpsc::Receiver<PublishResult> {
        let (sender, receiver) = mpsc::channel();
        let internal_options = PublishOptionsInternal {
            options,
            response_handler: Some(Box::new(move |result| {
                let _ = sender.send(result);
                Ok(())
            })),
        };

        let context = UserEventContext {
            event: UserEvent::Publish(Box::new(MqttPacket::Publish(publish)), internal_options),
            current_time: self.timepoint(elapsed_millis),
        };

        self.client_state.handle_user_event(context);

        receiver
    }

    pub(crate) fn subscribe(&mut self, elapsed_millis: u64, subscribe: SubscribePacket, options: SubscribeOptions) -> mpsc::Receiver<SubscribeResult> {
        let (sender, receiver) = mpsc::channel();
        let internal_options = SubscribeOptionsInternal {
            options,
            response_handler: Some(Box::new(move |result| {
                let _ = sender.send(result);
                Ok(())
            })),
        };

        let context = UserEventContext {
            event: UserEvent::Subscribe(Box::new(MqttPacket::Subscribe(subscribe)), internal_options),
            current_time: self.timepoint(elapsed_millis),
        };

        self.client_state.handle_user_event(context);

        receiver
    }

    pub(crate) fn unsubscribe(&mut self, elapsed_millis: u64, unsubscribe: UnsubscribePacket, options: UnsubscribeOptions) -> mpsc::Receiver<UnsubscribeResult> {
        let (sender, receiver) = mpsc::channel();
        let internal_options = UnsubscribeOptionsInternal {
            options,
            response_handler: Some(Box::new(move |result| {
                let _ = sender.send(result);
                Ok(())
            })),
        };

        let context = UserEventContext {
            event: UserEvent::Unsubscribe(Box::new(MqttPacket::Unsubscribe(unsubscribe)), internal_options),
            current_time: self.timepoint(elapsed_millis),
        };

        self.client_state.handle_user_event(context);

        receiver
    }

    pub(crate) fn disconnect(&mut self, elapsed_millis: u64, disconnect: DisconnectPacket) {
        let context = UserEventContext {
            event: UserEvent::Disconnect(Box::new(MqttPacket::Disconnect(disconnect))),
            current_time: self.timepoint(elapsed_millis),
        };

        self.client_state.handle_user_event(context);
    }
}

pub(crate) fn find_nth_packet_of_type<'a, T>(packets: T, packet_type: PacketType, count: usize) -> Option<&'a MqttPacket> where T : Iterator<Item = &'a Box<MqttPacket>> {
    packets.filter(|packet| mqtt_packet_to_packet_type(packet) == packet_type).nth(count).map(|packet| &**packet)
}

pub(crate) fn count_packets_of_type<'a, T>(packets: T, packet_type: PacketType) -> usize where T : Iterator<Item = &'a Box<MqttPacket>> {
    packets.filter(|packet| mqtt_packet_to_packet_type(packet) == packet_type).count()
}

pub(crate) fn verify_packet_type_sequence<'a, T>(packets: T, expected: &[PacketType]) where T : Iterator<Item = &'a Box<MqttPacket>> {
    let packet_types : Vec<PacketType> = packets.map(|packet| mqtt_packet_to_packet_type(packet)).collect();
    assert_eq!(expected, packet_types.as_slice());
}

fn verify_protocol_state_empty(fixture: &ProtocolStateTestFixture) {
    let state = &fixture.client_state;

    assert_eq!(0, state.operations.len());
    assert_eq!(0, state.user_operation_queue.len());
    assert_eq!(0, state.resubmit_operation_queue.len());
    assert_eq!(0, state.high_priority_operation_queue.len());
    assert_eq!(0, state.inflight_publish_operations.len());
    assert_eq!(0, state.pending_non_publish_operations.len());
    assert_eq!(0, state.pending_write_completion_operations.len());
    assert_eq!(0, state.flow.outbound_inflight_count().unwrap());
}

fn build_publish(topic: &str, qos: QualityOfService) -> PublishPacket {
    PublishPacket {
        topic: topic.to_string(),
        qos,
        payload: Some("payload".as_bytes().to_vec()),
        ..Default::default()
    }
}

fn build_subscribe(topic_filter: &str) -> SubscribePacket {
    SubscribePacket {
        subscriptions: vec![Subscription::new(topic_filter, QualityOfService::AtLeastOnce)],
        ..Default::default()
    }
}

fn handle_connect_with_session_always_present(packet: &MqttPacket, response_packets: &mut VecDeque<Box<MqttPacket>>, _: &mut BrokerTestContext) -> MqttResult<()> {
    if let MqttPacket::Connect(_) = packet {
        response_packets.push_back(Box::new(MqttPacket::Connack(ConnackPacket {
            session_present: true,
            ..Default::default()
        })));

        return Ok(());
    }

    panic!("Invalid packet handler state")
}

fn handle_connect_with_maximum_qos1(packet: &MqttPacket, response_packets: &mut VecDeque<Box<MqttPacket>>, _: &mut BrokerTestContext) -> MqttResult<()> {
    if let MqttPacket::Connect(_) = packet {
        response_packets.push_back(Box::new(MqttPacket::Connack(ConnackPacket {
            maximum_qos: Some(QualityOfService::AtLeastOnce),
            ..Default::default()
        })));

        return Ok(());
    }

    panic!("Invalid packet handler state")
}

#[test]
fn connection_opened_sends_connect_and_connack_connects() {
    let mut fixture = ProtocolStateTestFixture::new(build_standard_test_config());

    fixture.on_connection_opened(0).unwrap();
    assert_eq!(ProtocolStateType::PendingConnack, fixture.client_state.state());

    let responses = fixture.service_with_drain(0).unwrap();
    verify_packet_type_sequence(fixture.to_broker_packet_stream.iter(), &[PacketType::Connect]);
    assert_matches!(&*fixture.to_broker_packet_stream[0], MqttPacket::Connect(connect) => {
        assert_eq!("ProtocolTesting", connect.client_id);
        assert!(connect.clean_start);
    });

    fixture.on_write_completion(0).unwrap();
    fixture.on_incoming_packets(0, responses).unwrap();

    assert_eq!(ProtocolStateType::Connected, fixture.client_state.state());
    assert_matches!(fixture.client_packet_events.front(), Some(PacketEvent::Connack(_)));
    assert_matches!(fixture.client_state.get_negotiated_settings(), Some(settings) => {
        assert!(!settings.rejoined_session);
        assert_eq!("ProtocolTesting", settings.client_id);
    });

    verify_protocol_state_empty(&fixture);
}

#[test]
fn packet_before_connect_written_is_a_protocol_violation() {
    let mut fixture = ProtocolStateTestFixture::new(build_standard_test_config());
    fixture.on_connection_opened(0).unwrap();

    let result = fixture.on_incoming_packet(0, MqttPacket::Connack(ConnackPacket::default()));
    assert_matches!(result, Err(MqttError::ProtocolViolation(_)));
    assert_eq!(ProtocolStateType::Halted, fixture.client_state.state());
}

#[test]
fn first_packet_other_than_connack_is_a_protocol_violation() {
    let mut fixture = ProtocolStateTestFixture::new(build_standard_test_config());
    fixture.advance_disconnected_to_state(ProtocolStateType::PendingConnack, 0).unwrap();

    let result = fixture.on_incoming_packet(0, MqttPacket::Puback(PubackPacket { packet_id: 1, ..Default::default() }));
    assert_matches!(result, Err(MqttError::ProtocolViolation(_)));
    assert_eq!(ProtocolStateType::Halted, fixture.client_state.state());
}

#[test]
fn connack_timeout() {
    let mut fixture = ProtocolStateTestFixture::new(build_standard_test_config());
    fixture.advance_disconnected_to_state(ProtocolStateType::PendingConnack, 0).unwrap();

    assert_eq!(Some(CONNACK_TIMEOUT_MILLIS), fixture.get_next_service_time(0));
    assert!(fixture.service(CONNACK_TIMEOUT_MILLIS - 1).is_ok());

    let result = fixture.service(CONNACK_TIMEOUT_MILLIS);
    assert_matches!(result, Err(MqttError::Timeout(context)) => {
        assert_eq!(TimeoutKind::Connect, context.kind);
    });
}

#[test]
fn connack_refusal_fails_with_reason_code() {
    let mut fixture = ProtocolStateTestFixture::new(build_standard_test_config())
        .with_broker_handler(PacketType::Connect, Box::new(handle_connect_with_refusal));

    let result = fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0);
    assert_matches!(result, Err(MqttError::ConnectionRefused(context)) => {
        assert_eq!(ConnectReasonCode::NotAuthorized, context.reason_code);
    });

    assert_eq!(ProtocolStateType::Halted, fixture.client_state.state());
    assert_matches!(fixture.client_packet_events.front(), Some(PacketEvent::Connack(connack)) => {
        assert_eq!(ConnectReasonCode::NotAuthorized, connack.reason_code);
    });
}

#[test]
fn session_present_on_clean_session_is_a_protocol_violation() {
    let mut fixture = ProtocolStateTestFixture::new(build_standard_test_config())
        .with_broker_handler(PacketType::Connect, Box::new(handle_connect_with_session_always_present));

    let result = fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0);
    assert_matches!(result, Err(MqttError::ProtocolViolation(_)));
}

#[test]
fn qos1_publish_completes_with_puback() {
    let mut fixture = ProtocolStateTestFixture::new(build_standard_test_config());
    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).unwrap();

    let publish_receiver = fixture.publish(0, build_publish("hello/world", QualityOfService::AtLeastOnce), PublishOptions::default());
    fixture.service_round_trip(0, 0).unwrap();

    let result = publish_receiver.try_recv().unwrap();
    assert_matches!(result, Ok(PublishResponse::Qos1(puback)) => {
        assert_eq!(1, puback.packet_id);
    });

    verify_protocol_state_empty(&fixture);
}

#[test]
fn qos2_publish_completes_with_pubcomp() {
    let mut fixture = ProtocolStateTestFixture::new(build_standard_test_config());
    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).unwrap();

    let publish_receiver = fixture.publish(0, build_publish("hello/world", QualityOfService::ExactlyOnce), PublishOptions::default());
    fixture.service_round_trip(0, 0).unwrap();
    assert!(publish_receiver.try_recv().is_err());
    assert_eq!(Some(DeliveryState::AwaitingComp), fixture.client_state.flow.outbound_state(1).unwrap());

    fixture.service_round_trip(0, 0).unwrap();

    let result = publish_receiver.try_recv().unwrap();
    assert_matches!(result, Ok(PublishResponse::Qos2(Qos2Response::Pubcomp(_))));

    verify_packet_type_sequence(fixture.to_broker_packet_stream.iter(), &[PacketType::Connect, PacketType::Publish, PacketType::Pubrel]);
    verify_protocol_state_empty(&fixture);
}

#[test]
fn qos0_publish_completes_on_write() {
    let mut fixture = ProtocolStateTestFixture::new(build_standard_test_config());
    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).unwrap();

    let publish_receiver = fixture.publish(0, build_publish("hello/world", QualityOfService::AtMostOnce), PublishOptions::default());
    fixture.service_with_drain(0).unwrap();
    assert!(publish_receiver.try_recv().is_err());

    fixture.on_write_completion(0).unwrap();
    assert_matches!(publish_receiver.try_recv().unwrap(), Ok(PublishResponse::Qos0));

    assert_matches!(find_nth_packet_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Publish, 0), Some(MqttPacket::Publish(publish)) => {
        assert_eq!(0, publish.packet_id);
    });
}

#[test]
fn subscribe_and_unsubscribe_complete_with_acks() {
    let mut fixture = ProtocolStateTestFixture::new(build_standard_test_config());
    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).unwrap();

    let subscribe_receiver = fixture.subscribe(0, build_subscribe("a/b"), SubscribeOptions::default());
    let unsubscribe_receiver = fixture.unsubscribe(0, UnsubscribePacket { topic_filters: vec!["a/b".to_string()], ..Default::default() }, UnsubscribeOptions::default());
    fixture.service_round_trip(0, 0).unwrap();

    assert_matches!(subscribe_receiver.try_recv().unwrap(), Ok(suback) => {
        assert_eq!(vec![SubackReasonCode::GrantedQos1], suback.reason_codes);
    });
    assert_matches!(unsubscribe_receiver.try_recv().unwrap(), Ok(unsuback) => {
        assert_eq!(1, unsuback.reason_codes.len());
    });

    // both were written before either was acknowledged
    assert_matches!(find_nth_packet_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Unsubscribe, 0), Some(MqttPacket::Unsubscribe(unsubscribe)) => {
        assert_eq!(2, unsubscribe.packet_id);
    });

    verify_protocol_state_empty(&fixture);
}

#[test]
fn qos1_publish_resent_as_duplicate_on_resumed_session() {
    let mut fixture = ProtocolStateTestFixture::new(build_persistent_session_test_config())
        .with_broker_handler(PacketType::Connect, Box::new(handle_connect_with_session_resumption));
    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).unwrap();

    let publish_receiver = fixture.publish(0, build_publish("resume/me", QualityOfService::AtLeastOnce), PublishOptions::default());
    fixture.service_with_drain(0).unwrap();
    fixture.on_write_completion(0).unwrap();
    fixture.on_connection_closed(0).unwrap();

    assert!(publish_receiver.try_recv().is_err());
    assert_eq!(Some(DeliveryState::AwaitingAck), fixture.client_state.flow.outbound_state(1).unwrap());

    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 10).unwrap();
    assert_matches!(fixture.client_state.get_negotiated_settings(), Some(settings) => {
        assert!(settings.rejoined_session);
    });

    fixture.service_round_trip(10, 10).unwrap();

    assert_matches!(publish_receiver.try_recv().unwrap(), Ok(PublishResponse::Qos1(puback)) => {
        assert_eq!(1, puback.packet_id);
    });

    assert_matches!(find_nth_packet_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Publish, 0), Some(MqttPacket::Publish(publish)) => {
        assert_eq!(1, publish.packet_id);
        assert!(!publish.duplicate);
    });
    assert_matches!(find_nth_packet_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Publish, 1), Some(MqttPacket::Publish(publish)) => {
        assert_eq!(1, publish.packet_id);
        assert!(publish.duplicate);
        assert_eq!(Some("payload".as_bytes()), publish.payload());
    });

    verify_protocol_state_empty(&fixture);
}

#[test]
fn qos2_exchange_resumed_with_pubrel() {
    let mut fixture = ProtocolStateTestFixture::new(build_persistent_session_test_config())
        .with_broker_handler(PacketType::Connect, Box::new(handle_connect_with_session_resumption));
    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).unwrap();

    let publish_receiver = fixture.publish(0, build_publish("resume/me", QualityOfService::ExactlyOnce), PublishOptions::default());

    // PUBREC arrives; the PUBREL is queued but never written
    fixture.service_round_trip(0, 0).unwrap();
    fixture.on_connection_closed(0).unwrap();
    assert_eq!(Some(DeliveryState::AwaitingComp), fixture.client_state.flow.outbound_state(1).unwrap());

    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 10).unwrap();
    fixture.service_round_trip(10, 10).unwrap();

    assert_matches!(publish_receiver.try_recv().unwrap(), Ok(PublishResponse::Qos2(Qos2Response::Pubcomp(pubcomp))) => {
        assert_eq!(1, pubcomp.packet_id);
    });

    verify_packet_type_sequence(fixture.to_broker_packet_stream.iter(), &[PacketType::Connect, PacketType::Publish, PacketType::Connect, PacketType::Pubrel]);
    verify_protocol_state_empty(&fixture);
}

#[test]
fn stored_exchanges_resumed_without_a_live_operation() {
    let config = build_persistent_session_test_config();

    let mut outgoing = MemoryMessageStore::new();
    let mut publish = build_publish("from/store", QualityOfService::AtLeastOnce);
    publish.packet_id = 12;
    outgoing.put(12, StoredMessage::new_outbound(&publish)).unwrap();

    let mut fixture = ProtocolStateTestFixture::new_with_stores(config, Box::new(outgoing), Box::new(MemoryMessageStore::new()))
        .with_broker_handler(PacketType::Connect, Box::new(handle_connect_with_session_resumption));
    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).unwrap();

    // a new publish must not collide with the stored identifier
    let _ = fixture.publish(0, build_publish("fresh", QualityOfService::AtLeastOnce), PublishOptions::default());
    fixture.service_round_trip(0, 0).unwrap();

    assert_matches!(find_nth_packet_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Publish, 0), Some(MqttPacket::Publish(publish)) => {
        assert_eq!(12, publish.packet_id);
        assert!(publish.duplicate);
    });
    assert_matches!(find_nth_packet_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Publish, 1), Some(MqttPacket::Publish(publish)) => {
        assert_eq!(1, publish.packet_id);
        assert!(!publish.duplicate);
    });

    verify_protocol_state_empty(&fixture);
}

#[test]
fn unfinished_publishes_restart_when_no_session_is_present() {
    let mut fixture = ProtocolStateTestFixture::new(build_standard_test_config());
    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).unwrap();

    let qos2_receiver = fixture.publish(0, build_publish("restart/qos2", QualityOfService::ExactlyOnce), PublishOptions::default());
    fixture.service_round_trip(0, 0).unwrap();

    let qos1_receiver = fixture.publish(0, build_publish("restart/qos1", QualityOfService::AtLeastOnce), PublishOptions::default());
    fixture.service_with_drain(0).unwrap();
    fixture.on_write_completion(0).unwrap();
    fixture.on_connection_closed(0).unwrap();

    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 10).unwrap();

    // the broker already accepted the qos 2 publish, so it completes with the PUBREC
    assert_matches!(qos2_receiver.try_recv().unwrap(), Ok(PublishResponse::Qos2(Qos2Response::Pubrec(_))));
    assert_eq!(0, fixture.client_state.flow.outbound_inflight_count().unwrap());

    fixture.service_round_trip(10, 10).unwrap();
    assert_matches!(qos1_receiver.try_recv().unwrap(), Ok(PublishResponse::Qos1(puback)) => {
        assert_eq!(1, puback.packet_id);
    });

    assert_matches!(find_nth_packet_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Publish, 2), Some(MqttPacket::Publish(publish)) => {
        assert_eq!("restart/qos1", publish.topic);
        assert!(!publish.duplicate);
    });

    verify_protocol_state_empty(&fixture);
}

#[test]
fn inbound_qos2_publish_delivered_once() {
    let mut fixture = ProtocolStateTestFixture::new(build_standard_test_config());
    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).unwrap();
    fixture.client_packet_events.clear();

    let publish = PublishPacket {
        packet_id: 5,
        topic: "inbound".to_string(),
        qos: QualityOfService::ExactlyOnce,
        ..Default::default()
    };

    fixture.on_incoming_packet(0, MqttPacket::Publish(publish.clone())).unwrap();
    fixture.on_incoming_packet(0, MqttPacket::Publish(PublishPacket { duplicate: true, ..publish.clone() })).unwrap();
    assert_eq!(1, fixture.client_packet_events.len());

    fixture.service_with_drain(0).unwrap();
    fixture.on_write_completion(0).unwrap();
    assert_eq!(2, count_packets_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Pubrec));

    fixture.on_incoming_packet(0, MqttPacket::Pubrel(PubrelPacket { packet_id: 5, ..Default::default() })).unwrap();
    fixture.service_with_drain(0).unwrap();
    fixture.on_write_completion(0).unwrap();
    assert_matches!(fixture.to_broker_packet_stream.back().map(|packet| &**packet), Some(MqttPacket::Pubcomp(pubcomp)) => {
        assert_eq!(PubcompReasonCode::Success, pubcomp.reason_code);
    });

    // released, so the identifier now starts a new exchange
    fixture.on_incoming_packet(0, MqttPacket::Publish(publish)).unwrap();
    assert_eq!(2, fixture.client_packet_events.len());
}

#[test]
fn unknown_pubrel_answered_with_not_found() {
    let mut fixture = ProtocolStateTestFixture::new(build_standard_test_config());
    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).unwrap();

    fixture.on_incoming_packet(0, MqttPacket::Pubrel(PubrelPacket { packet_id: 9, ..Default::default() })).unwrap();
    fixture.service_with_drain(0).unwrap();

    assert_matches!(fixture.to_broker_packet_stream.back().map(|packet| &**packet), Some(MqttPacket::Pubcomp(pubcomp)) => {
        assert_eq!(9, pubcomp.packet_id);
        assert_eq!(PubcompReasonCode::PacketIdentifierNotFound, pubcomp.reason_code);
    });
}

#[test]
fn inbound_qos1_publish_acknowledged() {
    let mut fixture = ProtocolStateTestFixture::new(build_standard_test_config());
    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).unwrap();
    fixture.client_packet_events.clear();

    fixture.on_incoming_packet(0, MqttPacket::Publish(PublishPacket {
        packet_id: 3,
        topic: "inbound".to_string(),
        qos: QualityOfService::AtLeastOnce,
        ..Default::default()
    })).unwrap();
    fixture.service_with_drain(0).unwrap();

    assert_matches!(fixture.client_packet_events.front(), Some(PacketEvent::Publish(_)));
    assert_matches!(fixture.to_broker_packet_stream.back().map(|packet| &**packet), Some(MqttPacket::Puback(puback)) => {
        assert_eq!(3, puback.packet_id);
    });
}

#[test]
fn duplicate_acks_surface_as_events() {
    let mut fixture = ProtocolStateTestFixture::new(build_standard_test_config());
    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).unwrap();
    fixture.client_packet_events.clear();

    fixture.on_incoming_packet(0, MqttPacket::Puback(PubackPacket { packet_id: 9, ..Default::default() })).unwrap();
    fixture.on_incoming_packet(0, MqttPacket::Pubcomp(PubcompPacket { packet_id: 4, ..Default::default() })).unwrap();
    fixture.on_incoming_packet(0, MqttPacket::Suback(SubackPacket { packet_id: 3, reason_codes: vec![SubackReasonCode::GrantedQos0] })).unwrap();

    let events : Vec<PacketEvent> = fixture.client_packet_events.iter().cloned().collect();
    assert_eq!(vec![
        PacketEvent::DuplicateAck(PacketType::Puback, 9),
        PacketEvent::DuplicateAck(PacketType::Pubcomp, 4),
        PacketEvent::DuplicateAck(PacketType::Suback, 3),
    ], events);
    assert_eq!(ProtocolStateType::Connected, fixture.client_state.state());
}

#[test]
fn unsolicited_pingresp_is_accepted() {
    let mut fixture = ProtocolStateTestFixture::new(build_standard_test_config());
    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).unwrap();

    assert!(fixture.on_incoming_packet(0, MqttPacket::Pingresp(PingrespPacket {})).is_ok());
    assert_eq!(ProtocolStateType::Connected, fixture.client_state.state());
}

#[test]
fn keep_alive_sends_pingreq_on_schedule() {
    let mut fixture = ProtocolStateTestFixture::new(build_standard_test_config())
        .with_broker_handler(PacketType::Connect, Box::new(handle_connect_with_keep_alive));
    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).unwrap();

    assert_eq!(Some(10000), fixture.get_next_service_time(0));
    fixture.service_round_trip(10000, 10000).unwrap();
    assert_eq!(1, count_packets_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Pingreq));

    assert_eq!(Some(20000), fixture.get_next_service_time(10000));
    fixture.service_round_trip(20000, 20000).unwrap();
    assert_eq!(2, count_packets_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Pingreq));
}

#[test]
fn outbound_traffic_pushes_back_the_next_ping() {
    let mut fixture = ProtocolStateTestFixture::new(build_standard_test_config())
        .with_broker_handler(PacketType::Connect, Box::new(handle_connect_with_keep_alive));
    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).unwrap();

    let _ = fixture.publish(4000, build_publish("keep/alive", QualityOfService::AtMostOnce), PublishOptions::default());
    fixture.service_round_trip(4000, 4000).unwrap();

    assert_eq!(Some(14000), fixture.get_next_service_time(4000));
}

#[test]
fn missing_pingresp_times_out() {
    let mut fixture = ProtocolStateTestFixture::new(build_standard_test_config())
        .with_broker_handler(PacketType::Connect, Box::new(handle_connect_with_keep_alive));
    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).unwrap();

    fixture.service_with_drain(10000).unwrap();
    fixture.on_write_completion(10000).unwrap();

    // half the keep alive is shorter than the configured ping timeout
    assert_eq!(Some(15000), fixture.get_next_service_time(10000));

    let result = fixture.service(15000);
    assert_matches!(result, Err(MqttError::Timeout(context)) => {
        assert_eq!(TimeoutKind::PingResponse, context.kind);
    });
}

#[test]
fn offline_operations_sent_in_submission_order() {
    let mut fixture = ProtocolStateTestFixture::new(build_standard_test_config());

    let _ = fixture.publish(0, build_publish("first", QualityOfService::AtLeastOnce), PublishOptions::default());
    let _ = fixture.subscribe(0, build_subscribe("second"), SubscribeOptions::default());
    let _ = fixture.publish(0, build_publish("third", QualityOfService::AtMostOnce), PublishOptions::default());

    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).unwrap();
    fixture.service_round_trip(0, 0).unwrap();

    verify_packet_type_sequence(fixture.to_broker_packet_stream.iter(), &[PacketType::Connect, PacketType::Publish, PacketType::Subscribe, PacketType::Publish]);
    verify_protocol_state_empty(&fixture);
}

#[test]
fn offline_qos0_publish_rejected_by_policy() {
    let mut config = build_standard_test_config();
    config.offline_queue_policy = OfflineQueuePolicy::PreserveAcknowledged;
    let mut fixture = ProtocolStateTestFixture::new(config);

    let qos0_receiver = fixture.publish(0, build_publish("offline", QualityOfService::AtMostOnce), PublishOptions::default());
    let qos1_receiver = fixture.publish(0, build_publish("offline", QualityOfService::AtLeastOnce), PublishOptions::default());

    assert_matches!(qos0_receiver.try_recv().unwrap(), Err(MqttError::NotConnected(_)));
    assert!(qos1_receiver.try_recv().is_err());
    assert_eq!(1, fixture.client_state.user_operation_queue.len());
}

#[test]
fn connection_loss_applies_offline_policy_to_queued_operations() {
    let mut config = build_standard_test_config();
    config.offline_queue_policy = OfflineQueuePolicy::PreserveNothing;
    let mut fixture = ProtocolStateTestFixture::new(config);
    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).unwrap();

    let subscribe_receiver = fixture.subscribe(0, build_subscribe("a/b"), SubscribeOptions::default());
    fixture.on_connection_closed(0).unwrap();

    assert_matches!(subscribe_receiver.try_recv().unwrap(), Err(MqttError::NotConnected(_)));
    verify_protocol_state_empty(&fixture);
}

#[test]
fn unacknowledged_subscribe_resent_after_reconnect() {
    let mut fixture = ProtocolStateTestFixture::new(build_standard_test_config());
    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).unwrap();

    let subscribe_receiver = fixture.subscribe(0, build_subscribe("a/b"), SubscribeOptions::default());
    fixture.service_with_drain(0).unwrap();
    fixture.on_write_completion(0).unwrap();
    fixture.on_connection_closed(0).unwrap();

    assert_eq!(1, fixture.client_state.user_operation_queue.len());
    assert!(fixture.client_state.pending_non_publish_operations.is_empty());

    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 10).unwrap();
    fixture.service_round_trip(10, 10).unwrap();

    assert_matches!(subscribe_receiver.try_recv().unwrap(), Ok(_));
    assert_eq!(2, count_packets_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Subscribe));
    verify_protocol_state_empty(&fixture);
}

#[test]
fn inflight_limit_queues_publishes() {
    let mut config = build_standard_test_config();
    config.max_inflight = 1;
    let mut fixture = ProtocolStateTestFixture::new(config);
    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).unwrap();

    let first_receiver = fixture.publish(0, build_publish("first", QualityOfService::AtLeastOnce), PublishOptions::default());
    let second_receiver = fixture.publish(0, build_publish("second", QualityOfService::AtLeastOnce), PublishOptions::default());

    let responses = fixture.service_with_drain(0).unwrap();
    assert_eq!(1, count_packets_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Publish));
    assert_eq!(None, fixture.get_next_service_time(0));

    fixture.on_write_completion(0).unwrap();
    assert_eq!(None, fixture.get_next_service_time(0));

    fixture.on_incoming_packets(0, responses).unwrap();
    assert_matches!(first_receiver.try_recv().unwrap(), Ok(PublishResponse::Qos1(_)));
    assert_eq!(Some(0), fixture.get_next_service_time(0));

    fixture.service_round_trip(0, 0).unwrap();
    assert_matches!(second_receiver.try_recv().unwrap(), Ok(PublishResponse::Qos1(_)));
    verify_protocol_state_empty(&fixture);
}

#[test]
fn broker_receive_maximum_bounds_inflight_publishes() {
    let mut fixture = ProtocolStateTestFixture::new(build_standard_test_config())
        .with_broker_handler(PacketType::Connect, Box::new(handle_connect_with_receive_maximum_one));
    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).unwrap();

    let _ = fixture.publish(0, build_publish("first", QualityOfService::ExactlyOnce), PublishOptions::default());
    let _ = fixture.publish(0, build_publish("second", QualityOfService::AtLeastOnce), PublishOptions::default());

    fixture.service_with_drain(0).unwrap();
    assert_eq!(1, count_packets_of_type(fixture.to_broker_packet_stream.iter(), PacketType::Publish));
}

#[test]
fn inflight_limit_rejects_publishes() {
    let mut config = build_standard_test_config();
    config.max_inflight = 1;
    config.inflight_limit_policy = InflightLimitPolicy::Reject;
    let mut fixture = ProtocolStateTestFixture::new(config);
    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).unwrap();

    let first_receiver = fixture.publish(0, build_publish("first", QualityOfService::AtLeastOnce), PublishOptions::default());
    let second_receiver = fixture.publish(0, build_publish("second", QualityOfService::AtLeastOnce), PublishOptions::default());
    let qos0_receiver = fixture.publish(0, build_publish("third", QualityOfService::AtMostOnce), PublishOptions::default());

    assert_matches!(second_receiver.try_recv().unwrap(), Err(MqttError::CapacityExceeded(_)));

    fixture.service_round_trip(0, 0).unwrap();
    assert_matches!(first_receiver.try_recv().unwrap(), Ok(PublishResponse::Qos1(_)));
    assert_matches!(qos0_receiver.try_recv().unwrap(), Ok(PublishResponse::Qos0));
}

#[test]
fn publish_above_broker_maximum_qos_fails() {
    let mut fixture = ProtocolStateTestFixture::new(build_standard_test_config())
        .with_broker_handler(PacketType::Connect, Box::new(handle_connect_with_maximum_qos1));
    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).unwrap();

    let publish_receiver = fixture.publish(0, build_publish("too/high", QualityOfService::ExactlyOnce), PublishOptions::default());
    fixture.service(0).unwrap();

    assert_matches!(publish_receiver.try_recv().unwrap(), Err(MqttError::PacketValidation(context)) => {
        assert_eq!(PacketType::Publish, context.packet_type);
    });
    verify_protocol_state_empty(&fixture);
}

#[test]
fn subscribe_ack_timeout() {
    let mut fixture = ProtocolStateTestFixture::new(build_standard_test_config());
    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).unwrap();

    let options = SubscribeOptions::builder().with_ack_timeout(Duration::from_secs(5)).build();
    let subscribe_receiver = fixture.subscribe(0, build_subscribe("slow/ack"), options);

    let late_responses = fixture.service_with_drain(0).unwrap();
    fixture.on_write_completion(0).unwrap();
    assert_eq!(Some(5000), fixture.get_next_service_time(0));

    fixture.service(4999).unwrap();
    assert!(subscribe_receiver.try_recv().is_err());

    fixture.service(5000).unwrap();
    assert_matches!(subscribe_receiver.try_recv().unwrap(), Err(MqttError::Timeout(context)) => {
        assert_eq!(TimeoutKind::Acknowledgement, context.kind);
    });

    fixture.client_packet_events.clear();
    fixture.on_incoming_packets(5001, late_responses).unwrap();
    assert_matches!(fixture.client_packet_events.front(), Some(PacketEvent::DuplicateAck(PacketType::Suback, 1)));
    verify_protocol_state_empty(&fixture);
}

#[test]
fn reset_fails_every_operation_and_keeps_stored_exchanges() {
    let mut fixture = ProtocolStateTestFixture::new(build_standard_test_config());
    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).unwrap();

    let publish_receiver = fixture.publish(0, build_publish("inflight", QualityOfService::AtLeastOnce), PublishOptions::default());
    fixture.service(0).unwrap();
    let subscribe_receiver = fixture.subscribe(0, build_subscribe("queued"), SubscribeOptions::default());

    fixture.reset(0);

    assert_matches!(publish_receiver.try_recv().unwrap(), Err(MqttError::ConnectionClosed(_)));
    assert_matches!(subscribe_receiver.try_recv().unwrap(), Err(MqttError::ConnectionClosed(_)));
    assert_eq!(ProtocolStateType::Halted, fixture.client_state.state());
    assert_eq!(0, fixture.client_state.operations.len());
    assert_eq!(1, fixture.client_state.flow.outbound_inflight_count().unwrap());
}

#[test]
fn user_disconnect_flushes_and_halts() {
    let mut fixture = ProtocolStateTestFixture::new(build_standard_test_config());
    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).unwrap();

    let publish_receiver = fixture.publish(0, build_publish("left/behind", QualityOfService::AtLeastOnce), PublishOptions::default());
    fixture.disconnect(0, DisconnectPacket::default());

    fixture.service_with_drain(0).unwrap();
    assert_eq!(ProtocolStateType::PendingDisconnect, fixture.client_state.state());
    verify_packet_type_sequence(fixture.to_broker_packet_stream.iter(), &[PacketType::Connect, PacketType::Disconnect]);

    let result = fixture.on_write_completion(0);
    assert_matches!(result, Err(MqttError::UserInitiatedDisconnect(_)));
    assert!(publish_receiver.try_recv().is_err());
}

#[test]
fn server_disconnect_requires_mqtt5() {
    let mut fixture = ProtocolStateTestFixture::new(build_standard_test_config());
    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).unwrap();

    let result = fixture.on_incoming_packet(0, MqttPacket::Disconnect(DisconnectPacket::default()));
    assert_matches!(result, Err(MqttError::ProtocolViolation(_)));

    let mut config = build_standard_test_config();
    config.connect_options = ConnectOptions::builder()
        .with_protocol_version(ProtocolVersion::Mqtt5)
        .with_client_id("ProtocolTesting")
        .with_keep_alive_interval_seconds(0)
        .build();

    let mut fixture = ProtocolStateTestFixture::new(config);
    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).unwrap();
    fixture.client_packet_events.clear();

    let result = fixture.on_incoming_packet(0, MqttPacket::Disconnect(DisconnectPacket::default()));
    assert_matches!(result, Err(MqttError::ConnectionClosed(_)));
    assert_matches!(fixture.client_packet_events.front(), Some(PacketEvent::Disconnect(_)));
}

#[test]
fn client_only_packet_from_server_is_a_protocol_violation() {
    let mut fixture = ProtocolStateTestFixture::new(build_standard_test_config());
    fixture.advance_disconnected_to_state(ProtocolStateType::Connected, 0).unwrap();

    let result = fixture.on_incoming_packet(0, MqttPacket::Pingreq(PingreqPacket {}));
    assert_matches!(result, Err(MqttError::ProtocolViolation(_)));
    assert_eq!(ProtocolStateType::Halted, fixture.client_state.state());
}
