/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

// Internal module that implements the client side of an MQTT session with no knowledge of
// sockets, bytes or wall-clock time.  The containing runtime feeds it decoded packets, user
// operations and the current time; it answers with packets to write and events to surface.

use crate::client::*;
use crate::config::*;
use crate::error::{fold_mqtt_result, MqttError, MqttResult, TimeoutKind};
use crate::flow::*;
use crate::logging::log_packet;
use crate::mqtt::*;
use crate::mqtt::utils::*;
use crate::packet_id::create_packet_id_provider;
use crate::store::*;
use crate::validate::*;

use log::*;

use std::cmp::{Ordering, Reverse};
use std::collections::*;
use std::fmt::*;
use std::mem;
use std::time::*;

pub(crate) enum ClientOperationOptions {
    Publish(PublishOptionsInternal),
    Subscribe(SubscribeOptionsInternal),
    Unsubscribe(UnsubscribeOptionsInternal),
}

// Every outbound packet corresponds to an operation.  User operations carry a response handler,
// internal ones (connect, acks, pings, pubrels, resubmitted publishes with no live waiter) do not.
pub(crate) struct ClientOperation {

    // Unique and monotonically increasing with submission time, so restoring submission order
    // is a sort.
    id: u64,

    pub(crate) packet: Box<MqttPacket>,

    // Packet id bound to this operation, if any.  Binding is also reflected in the packet.
    packet_id: Option<u16>,

    options: Option<ClientOperationOptions>,
}

impl ClientOperation {
    fn bind_packet_id(&mut self, packet_id: u16) {
        debug!("{} operation {} binding to packet id {}", mqtt_packet_to_str(&self.packet), self.id, packet_id);
        self.packet_id = Some(packet_id);
        match &mut *self.packet {
            MqttPacket::Subscribe(subscribe) => { subscribe.packet_id = packet_id; }
            MqttPacket::Unsubscribe(unsubscribe) => { unsubscribe.packet_id = packet_id; }
            MqttPacket::Publish(publish) => { publish.packet_id = packet_id; }
            _ => {}
        }
    }

    fn unbind_packet_id(&mut self) {
        debug!("{} operation {} unbinding packet id", mqtt_packet_to_str(&self.packet), self.id);
        self.packet_id = None;
        match &mut *self.packet {
            MqttPacket::Subscribe(subscribe) => { subscribe.packet_id = 0; }
            MqttPacket::Unsubscribe(unsubscribe) => { unsubscribe.packet_id = 0; }
            MqttPacket::Publish(publish) => {
                publish.packet_id = 0;
                publish.duplicate = false;
            }
            _ => {}
        }
    }

    fn is_internal(&self) -> bool {
        self.options.is_none()
    }

    fn ack_timeout(&self) -> Option<Duration> {
        match &self.options {
            Some(ClientOperationOptions::Publish(publish_options)) => { publish_options.options.ack_timeout }
            Some(ClientOperationOptions::Subscribe(subscribe_options)) => { subscribe_options.options.ack_timeout }
            Some(ClientOperationOptions::Unsubscribe(unsubscribe_options)) => { unsubscribe_options.options.ack_timeout }
            None => { None }
        }
    }
}

// Received packets and anomalies that the containing client surfaces to the user.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum PacketEvent {
    Connack(ConnackPacket),
    Publish(PublishPacket),
    Disconnect(DisconnectPacket),
    DuplicateAck(PacketType, u16),
}

pub(crate) struct ConnectionOpenedContext {
    pub(crate) establishment_timeout: Instant,
}

pub(crate) enum NetworkEvent {
    ConnectionOpened(ConnectionOpenedContext),
    ConnectionClosed,
    IncomingPacket(Box<MqttPacket>),
    WriteCompletion
}

pub(crate) struct NetworkEventContext<'a> {
    pub(crate) event: NetworkEvent,
    pub(crate) current_time: Instant,

    // output field for packets that the client is interested in
    pub(crate) packet_events: &'a mut VecDeque<PacketEvent>,
}

pub(crate) enum UserEvent {
    Publish(Box<MqttPacket>, PublishOptionsInternal),
    Subscribe(Box<MqttPacket>, SubscribeOptionsInternal),
    Unsubscribe(Box<MqttPacket>, UnsubscribeOptionsInternal),
    Disconnect(Box<MqttPacket>)
}

pub(crate) struct UserEventContext {
    pub(crate) event: UserEvent,
    pub(crate) current_time: Instant,
}

pub(crate) struct ServiceContext<'a> {
    // output field for all packets that should be encoded and written to the socket.  Nothing
    // more is produced until the runtime reports write completion for the current batch.
    pub(crate) to_socket: &'a mut VecDeque<Box<MqttPacket>>,
    pub(crate) current_time: Instant,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum ProtocolStateType {
    Disconnected,
    PendingConnack,
    Connected,
    PendingDisconnect,
    Halted
}

impl Display for ProtocolStateType {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            ProtocolStateType::Disconnected => { write!(f, "Disconnected") }
            ProtocolStateType::PendingConnack => { write!(f, "PendingConnack") }
            ProtocolStateType::Connected => { write!(f, "Connected") }
            ProtocolStateType::PendingDisconnect => { write!(f, "PendingDisconnect") }
            ProtocolStateType::Halted => { write!(f, "Halted") }
        }
    }
}

pub(crate) struct ProtocolStateConfig {
    pub connect_options: ConnectOptions,

    // fully-resolved client id; generated by the caller when the options leave it unset
    pub client_id: String,

    pub base_timestamp: Instant,

    pub offline_queue_policy: OfflineQueuePolicy,

    pub ping_timeout: Duration,

    pub max_inflight: u16,

    pub inflight_limit_policy: InflightLimitPolicy,

    pub packet_id_policy: PacketIdPolicy,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum ProtocolQueueType {
    User,
    HighPriority,
}

impl Display for ProtocolQueueType {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            ProtocolQueueType::User => { write!(f, "User") }
            ProtocolQueueType::HighPriority => { write!(f, "HighPriority") }
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum ProtocolQueueServiceMode {
    All,
    HighPriorityOnly,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum ProtocolEnqueuePosition {
    Front,
    Back
}

impl Display for ProtocolEnqueuePosition {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            ProtocolEnqueuePosition::Front => { write!(f, "Front") }
            ProtocolEnqueuePosition::Back => { write!(f, "Back") }
        }
    }
}

enum OperationResponse {
    Publish(PublishResponse),
    Subscribe(SubackPacket),
    Unsubscribe(UnsubackPacket),
}

#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) struct OperationTimeoutRecord {
    id: u64,
    timeout: Instant
}

impl PartialOrd for OperationTimeoutRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OperationTimeoutRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timeout.cmp(&other.timeout)
    }
}

// Result of getting an operation ready to be written
enum OperationPreparation {
    Ready(Box<MqttPacket>),
    Failed(MqttError),
    Skipped,
}

pub(crate) struct ProtocolState {
    pub(crate) config: ProtocolStateConfig,

    pub(crate) state: ProtocolStateType,

    // Time is injected by the caller and tracked as elapsed milliseconds since creation, which
    // lets tests drive the state through arbitrary amounts of time instantly.
    pub(crate) current_time: Instant,
    pub(crate) elapsed_time_ms: u128,

    // Set after service hands packets to the runtime; cleared when the runtime reports that
    // the socket has accepted all of them.  Nothing new is produced while set.
    pub(crate) pending_write_completion: bool,

    // All incomplete operations tracked by the client
    pub(crate) operations: HashMap<u64, ClientOperation>,

    // Acknowledgement deadlines for written operations that asked for one
    pub(crate) operation_ack_timeouts: BinaryHeap<Reverse<OperationTimeoutRecord>>,

    // lowest priority queue; all user operations are added to the end on submission
    pub(crate) user_operation_queue: VecDeque<u64>,

    // publishes and pubrels of a resumed session; they go out before any new user operation
    pub(crate) resubmit_operation_queue: VecDeque<u64>,

    // highest priority queue; connect, acks, pings, disconnect
    pub(crate) high_priority_operation_queue: VecDeque<u64>,

    // { packet id -> operation id } for qos1+ publishes with an exchange in the outgoing store.
    // Survives disconnects so a resumed session can complete the original operation.
    pub(crate) inflight_publish_operations: HashMap<u16, u64>,

    // { packet id -> operation id } for written subscribes and unsubscribes
    pub(crate) pending_non_publish_operations: HashMap<u16, u64>,

    // Written operations that complete as soon as the socket accepts them
    pub(crate) pending_write_completion_operations: VecDeque<u64>,

    // Connection-scoped set of negotiated protocol values
    pub(crate) current_settings: Option<NegotiatedSettings>,

    pub(crate) next_operation_id: u64,

    // Client id sent in CONNECT; replaced by a broker-assigned id when one is received
    pub(crate) client_id: String,

    // Packet ids and both message stores
    pub(crate) flow: QosFlowController,

    // Point in time we should send another ping.  None while a ping is queued or in flight, or
    // when keep alive is disabled.
    pub(crate) next_ping_timepoint: Option<Instant>,

    // Point in time that the current ping times out.  Any inbound packet clears it.
    pub(crate) ping_timeout_timepoint: Option<Instant>,

    // Point in time that the connection attempt is considered to have failed
    pub(crate) connack_timeout_timepoint: Option<Instant>,
}

impl Display for ProtocolState {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        let level = log::max_level();
        match level {
            LevelFilter::Debug => {
                self.log_debug(f)
            }
            LevelFilter::Trace => {
                self.log_trace(f)
            }
            _ => { Ok(()) }
        }
    }
}

impl ProtocolState {

    // Crate-public API

    pub(crate) fn new(config: ProtocolStateConfig, outgoing_store: Box<dyn MessageStore>, incoming_store: Box<dyn MessageStore>) -> MqttResult<ProtocolState> {
        let flow = QosFlowController::new(create_packet_id_provider(config.packet_id_policy), outgoing_store, incoming_store)?;
        let base_time = config.base_timestamp;
        let client_id = config.client_id.clone();

        Ok(ProtocolState {
            config,
            state: ProtocolStateType::Disconnected,
            current_time: base_time,
            elapsed_time_ms: 0,
            pending_write_completion : false,
            operations: HashMap::new(),
            operation_ack_timeouts: BinaryHeap::new(),
            user_operation_queue: VecDeque::new(),
            resubmit_operation_queue: VecDeque::new(),
            high_priority_operation_queue: VecDeque::new(),
            inflight_publish_operations: HashMap::new(),
            pending_non_publish_operations: HashMap::new(),
            pending_write_completion_operations: VecDeque::new(),
            current_settings: None,
            next_operation_id : 1,
            client_id,
            flow,
            next_ping_timepoint: None,
            ping_timeout_timepoint: None,
            connack_timeout_timepoint: None,
        })
    }

    pub(crate) fn state(&self) -> ProtocolStateType {
        self.state
    }

    pub(crate) fn handle_network_event(&mut self, context: NetworkEventContext) -> MqttResult<()> {
        let NetworkEventContext { event, current_time, packet_events } = context;
        self.update_internal_clock(&current_time);

        let result =
            match event {
                NetworkEvent::ConnectionOpened(opened_context) => { self.handle_network_event_connection_opened(opened_context) }
                NetworkEvent::ConnectionClosed => { self.handle_network_event_connection_closed() }
                NetworkEvent::WriteCompletion => { self.handle_network_event_write_completion() }
                NetworkEvent::IncomingPacket(packet) => { self.handle_network_event_incoming_packet(packet, packet_events) }
            };

        self.log_state();

        // Any error halts the state.  A flushed DISCONNECT also surfaces as an error so that the
        // containing client tears the connection down.
        if result.is_err() {
            error!("[{} ms] handle_network_event - final result: {:?}", self.elapsed_time_ms, result);
            self.change_state(ProtocolStateType::Halted);
        } else {
            debug!("[{} ms] handle_network_event - final result: {:?}", self.elapsed_time_ms, result);
        }

        result
    }

    pub(crate) fn service(&mut self, context: &mut ServiceContext) -> MqttResult<()> {
        self.update_internal_clock(&context.current_time);

        let result =
            match self.state {
                ProtocolStateType::Disconnected => { self.service_disconnected(context) }
                ProtocolStateType::PendingConnack => { self.service_pending_connack(context) }
                ProtocolStateType::Connected => { self.service_connected(context) }
                ProtocolStateType::PendingDisconnect => { self.service_pending_disconnect(context) }
                ProtocolStateType::Halted => { Err(MqttError::new_internal_state_error("protocol state previously halted")) }
            };

        self.log_state();

        if result.is_err() {
            error!("[{} ms] service - final result: {:?}", self.elapsed_time_ms, result);
            self.change_state(ProtocolStateType::Halted);
        } else {
            debug!("[{} ms] service - final result: {:?}", self.elapsed_time_ms, result);
        }

        result
    }

    pub(crate) fn handle_user_event(&mut self, context: UserEventContext) {
        self.update_internal_clock(&context.current_time);

        let (op_id, queue, position) =
            match context.event {
                UserEvent::Subscribe(packet, subscribe_options) => {
                    (self.create_operation(packet, Some(ClientOperationOptions::Subscribe(subscribe_options))), ProtocolQueueType::User, ProtocolEnqueuePosition::Back)
                }
                UserEvent::Unsubscribe(packet, unsubscribe_options) => {
                    (self.create_operation(packet, Some(ClientOperationOptions::Unsubscribe(unsubscribe_options))), ProtocolQueueType::User, ProtocolEnqueuePosition::Back)
                }
                UserEvent::Publish(packet, publish_options) => {
                    (self.create_operation(packet, Some(ClientOperationOptions::Publish(publish_options))), ProtocolQueueType::User, ProtocolEnqueuePosition::Back)
                }
                UserEvent::Disconnect(disconnect) => {
                    (self.create_operation(disconnect, None), ProtocolQueueType::HighPriority, ProtocolEnqueuePosition::Front)
                }
            };

        if let Err(error) = self.check_operation_admission(op_id) {
            debug!("[{} ms] handle_user_event - operation {} rejected: {}", self.elapsed_time_ms, op_id, error);
            let _ = self.complete_operation_as_failure(op_id, error);
            return;
        }

        debug!("[{} ms] handle_user_event - queuing operation with id {} into {} of {} queue", self.elapsed_time_ms, op_id, position, queue);
        self.enqueue_operation(op_id, queue, position);

        self.log_state();
    }

    pub(crate) fn get_next_service_timepoint(&mut self, current_time: &Instant) -> Option<Instant> {
        self.update_internal_clock(current_time);

        let next_service_time =
            match self.state {
                ProtocolStateType::Disconnected => { None }
                ProtocolStateType::PendingConnack => { self.get_next_service_timepoint_pending_connack() }
                ProtocolStateType::Connected => { self.get_next_service_timepoint_connected() }
                ProtocolStateType::PendingDisconnect => { self.get_next_service_timepoint_pending_disconnect() }
                ProtocolStateType::Halted => { None }
            };

        if let Some(next_timepoint) = &next_service_time {
            debug!("[{} ms] get_next_service_timepoint - state {}, target_elapsed_time: {} ms", self.elapsed_time_ms, self.state, self.get_elapsed_millis(next_timepoint));
        } else {
            debug!("[{} ms] get_next_service_timepoint - state {}, target_elapsed_time: NEVER", self.elapsed_time_ms, self.state);
        }

        next_service_time
    }

    // Fails every incomplete operation and forgets all connection-scoped state.  Store contents
    // and the packet ids that back them are kept.
    pub(crate) fn reset(&mut self, current_time: &Instant) {
        self.update_internal_clock(current_time);

        if self.state != ProtocolStateType::Disconnected {
            self.change_state(ProtocolStateType::Halted);
        }

        let mut operations : Vec<u64> = self.operations.keys().copied().collect();
        operations.sort();
        for id in operations {
            let _ = self.complete_operation_as_failure(id, MqttError::new_connection_closed("connection closed"));
        }

        self.pending_write_completion = false;
        self.operations.clear();
        self.operation_ack_timeouts.clear();
        self.user_operation_queue.clear();
        self.resubmit_operation_queue.clear();
        self.high_priority_operation_queue.clear();
        self.inflight_publish_operations.clear();
        self.pending_non_publish_operations.clear();
        self.pending_write_completion_operations.clear();
        self.current_settings = None;
        self.next_ping_timepoint = None;
        self.ping_timeout_timepoint = None;
        self.connack_timeout_timepoint = None;
    }

    pub(crate) fn close_stores(&mut self) -> MqttResult<()> {
        self.flow.close_stores()
    }

    pub(crate) fn get_negotiated_settings(&self) -> &Option<NegotiatedSettings> {
        &self.current_settings
    }

    // Private Implementation

    fn check_operation_admission(&self, id: u64) -> MqttResult<()> {
        let Some(operation) = self.operations.get(&id) else {
            return Err(MqttError::new_internal_state_error("admission check on an operation that does not exist"));
        };

        if self.state != ProtocolStateType::Connected && !does_packet_pass_offline_queue_policy(&operation.packet, &self.config.offline_queue_policy) {
            return Err(MqttError::new_not_connected());
        }

        if self.config.inflight_limit_policy == InflightLimitPolicy::Reject && is_qos1plus_publish(&operation.packet) {
            let queued = self.user_operation_queue.iter()
                .filter_map(|queued_id| self.operations.get(queued_id))
                .filter(|queued| is_qos1plus_publish(&queued.packet))
                .count();

            if self.flow.outbound_inflight_count()? + queued >= self.effective_max_inflight() {
                return Err(MqttError::new_capacity_exceeded("maximum number of in-flight publishes reached"));
            }
        }

        Ok(())
    }

    fn effective_max_inflight(&self) -> usize {
        let mut max_inflight = self.config.max_inflight;
        if let Some(settings) = &self.current_settings {
            max_inflight = max_inflight.min(settings.receive_maximum_from_server);
        }

        max_inflight as usize
    }

    fn log_debug(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "ProtocolState: {{")?;
        write!(f, " state:{},", self.state)?;
        write!(f, " elapsed_time_ms:{},", self.elapsed_time_ms)?;
        write!(f, " pending_write_completion:{},", self.pending_write_completion)?;
        write!(f, " operations:{} items,", self.operations.len())?;
        write!(f, " operation_ack_timeouts:{} timeouts pending,", self.operation_ack_timeouts.len())?;
        write!(f, " user_operation_queue:{} items,", self.user_operation_queue.len())?;
        write!(f, " resubmit_operation_queue:{} items,", self.resubmit_operation_queue.len())?;
        write!(f, " high_priority_operation_queue:{} items,", self.high_priority_operation_queue.len())?;
        write!(f, " inflight_publish_operations:{} operations,", self.inflight_publish_operations.len())?;
        write!(f, " pending_non_publish_operations:{} operations,", self.pending_non_publish_operations.len())?;
        write!(f, " pending_write_completion_operations:{} operations,", self.pending_write_completion_operations.len())?;
        write!(f, " next_operation_id:{}", self.next_operation_id)?;
        write!(f, " }}")?;

        Ok(())
    }

    fn log_trace(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "ProtocolState: {{")?;
        write!(f, " state:{},", self.state)?;
        write!(f, " elapsed_time_ms:{},", self.elapsed_time_ms)?;
        write!(f, " pending_write_completion:{},", self.pending_write_completion)?;
        write!(f, " operations:{{")?;
        self.operations.iter().for_each(|(id, operation)| {
            let _ = write!(f, " ({},{})", *id, mqtt_packet_to_str(&operation.packet));
        });
        write!(f, " }},")?;
        write!(f, " operation_ack_timeouts:{} timeouts pending,", self.operation_ack_timeouts.len())?;
        write!(f, " user_operation_queue:{:?},", self.user_operation_queue)?;
        write!(f, " resubmit_operation_queue: {:?},", self.resubmit_operation_queue)?;
        write!(f, " high_priority_operation_queue: {:?},", self.high_priority_operation_queue)?;
        write!(f, " inflight_publish_operations: {:?},", self.inflight_publish_operations)?;
        write!(f, " pending_non_publish_operations: {:?},", self.pending_non_publish_operations)?;
        write!(f, " pending_write_completion_operations: {:?},", self.pending_write_completion_operations)?;
        write!(f, " next_operation_id: {}", self.next_operation_id)?;
        write!(f, " }}")?;

        Ok(())
    }

    fn log_state(&self) {
        let level = log::max_level();
        match level {
            LevelFilter::Debug => {
                debug!("{}", self);
            }
            LevelFilter::Trace => {
                trace!("{}", self);
            }
            _ => {}
        }
    }

    fn update_internal_clock(&mut self, current_time: &Instant) {
        self.current_time = *current_time;
        self.elapsed_time_ms = current_time.saturating_duration_since(self.config.base_timestamp).as_millis();
    }

    fn get_elapsed_millis(&self, timepoint: &Instant) -> u128 {
        timepoint.saturating_duration_since(self.config.base_timestamp).as_millis()
    }

    fn partition_operation_queue_by_queue_policy(&self, queue: &VecDeque<u64>, policy: &OfflineQueuePolicy) -> (VecDeque<u64>, VecDeque<u64>) {
        partition_operations_by_queue_policy(queue.iter().filter_map(|id| {
            self.operations.get(id).map(|operation| (*id, &*operation.packet))
        }), policy)
    }

    // Drops whatever connection-scoped bookkeeping still refers to an operation that is being
    // completed.  Subscribe and unsubscribe ids are released here; publish ids are owned by
    // the outgoing store and released by the flow controller.
    fn release_operation_bindings(&mut self, operation: &ClientOperation) {
        if let Some(packet_id) = operation.packet_id {
            match &*operation.packet {
                MqttPacket::Publish(_) => {
                    if self.inflight_publish_operations.get(&packet_id) == Some(&operation.id) {
                        self.inflight_publish_operations.remove(&packet_id);
                    }
                }
                MqttPacket::Subscribe(_) | MqttPacket::Unsubscribe(_) => {
                    if self.pending_non_publish_operations.get(&packet_id) == Some(&operation.id) {
                        self.pending_non_publish_operations.remove(&packet_id);
                    }
                    self.flow.release_packet_id(packet_id);
                }
                _ => {}
            }
        }
    }

    fn complete_operation_as_success(&mut self, id : u64, completion_result: Option<OperationResponse>) -> MqttResult<()> {
        let Some(mut operation) = self.operations.remove(&id) else {
            error!("[{} ms] complete_operation_as_success - operation id {} does not exist", self.elapsed_time_ms, id);
            return Err(MqttError::new_internal_state_error("cannot complete an operation that does not exist"));
        };

        self.release_operation_bindings(&operation);

        if let MqttPacket::Disconnect(_) = &*operation.packet {
            info!("[{} ms] complete_operation_as_success - user-requested disconnect operation {} completed", self.elapsed_time_ms, id);
            return Err(MqttError::new_user_initiated_disconnect());
        }

        match operation.options.take() {
            None => {
                debug!("[{} ms] complete_operation_as_success - internal {} operation {} completed", self.elapsed_time_ms, mqtt_packet_to_str(&operation.packet), id);
                Ok(())
            }
            Some(options) => {
                info!("[{} ms] complete_operation_as_success - user {} operation {} completed", self.elapsed_time_ms, mqtt_packet_to_str(&operation.packet), id);
                complete_operation_with_result(options, completion_result)
            }
        }
    }

    fn complete_operation_as_failure(&mut self, id : u64, error: MqttError) -> MqttResult<()> {
        let Some(mut operation) = self.operations.remove(&id) else {
            // not fatal; a timeout record can outlive the operation it refers to
            warn!("[{} ms] complete_operation_as_failure ({}) - operation id {} does not exist", self.elapsed_time_ms, error, id);
            return Ok(())
        };

        self.release_operation_bindings(&operation);

        match operation.options.take() {
            None => {
                debug!("[{} ms] complete_operation_as_failure ({}) - internal {} operation {} completed", self.elapsed_time_ms, error, mqtt_packet_to_str(&operation.packet), id);
                Ok(())
            }
            Some(options) => {
                info!("[{} ms] complete_operation_as_failure ({}) - user {} operation {} completed", self.elapsed_time_ms, error, mqtt_packet_to_str(&operation.packet), id);
                complete_operation_with_error(options, error);
                Ok(())
            }
        }
    }

    fn complete_operation_sequence_as_failure<T>(&mut self, iterator: T, error_fn: fn() -> MqttError) -> MqttResult<()> where T : Iterator<Item = u64> {
        #[allow(clippy::manual_try_fold)]
        iterator.fold(
            Ok(()),
            |res, item| {
                fold_mqtt_result(res, self.complete_operation_as_failure(item, error_fn()))
            }
        )
    }

    fn complete_operation_sequence_as_empty_success<T>(&mut self, iterator: T) -> MqttResult<()> where T : Iterator<Item = u64> {
        #[allow(clippy::manual_try_fold)]
        iterator.fold(
            Ok(()),
            |res, item| {
                fold_mqtt_result(res, self.complete_operation_as_success(item, None))
            }
        )
    }

    fn handle_network_event_connection_opened(&mut self, context: ConnectionOpenedContext) -> MqttResult<()> {
        if self.state != ProtocolStateType::Disconnected {
            error!("[{} ms] handle_network_event_connection_opened - called in invalid state", self.elapsed_time_ms);
            return Err(MqttError::new_internal_state_error("connection opened in an invalid state"));
        }

        info!("[{} ms] handle_network_event_connection_opened", self.elapsed_time_ms);
        self.change_state(ProtocolStateType::PendingConnack);
        self.pending_write_completion = false;

        let connect = Box::new(MqttPacket::Connect(self.config.connect_options.to_connect_packet(&self.client_id)));
        let connect_op_id = self.create_operation(connect, None);
        self.enqueue_operation(connect_op_id, ProtocolQueueType::HighPriority, ProtocolEnqueuePosition::Front);

        debug!("[{} ms] handle_network_event_connection_opened - setting connack timeout to {} ms", self.elapsed_time_ms, self.get_elapsed_millis(&context.establishment_timeout));
        self.connack_timeout_timepoint = Some(context.establishment_timeout);

        Ok(())
    }

    fn handle_network_event_connection_closed(&mut self) -> MqttResult<()> {
        if self.state == ProtocolStateType::Disconnected {
            error!("[{} ms] handle_network_event_connection_closed - called in invalid state", self.elapsed_time_ms);
            return Err(MqttError::new_internal_state_error("connection closed in an invalid state"));
        }

        info!("[{} ms] handle_network_event_connection_closed", self.elapsed_time_ms);
        self.change_state(ProtocolStateType::Disconnected);
        self.pending_write_completion = false;
        self.connack_timeout_timepoint = None;
        self.next_ping_timepoint = None;
        self.ping_timeout_timepoint = None;
        self.operation_ack_timeouts.clear();

        let mut result : MqttResult<()> = Ok(());

        /*
         * connect, acks, pings, pubrels and disconnect are all connection-scoped and internal
         */
        let high_priority = mem::take(&mut self.high_priority_operation_queue);
        for id in high_priority {
            self.operations.remove(&id);
        }

        /*
         * written-but-not-yet-confirmed operations: qos 0 publishes get the offline policy applied,
         * everything else is internal and dropped
         */
        let written = mem::take(&mut self.pending_write_completion_operations);
        for id in written {
            let is_user_publish = self.operations.get(&id).map(|operation| {
                !operation.is_internal() && matches!(&*operation.packet, MqttPacket::Publish(_))
            }).unwrap_or(false);

            if is_user_publish {
                self.user_operation_queue.push_back(id);
            } else {
                self.operations.remove(&id);
            }
        }

        /*
         * unacknowledged subscribes and unsubscribes start over with a fresh packet id
         */
        let unacked_sub_unsub = mem::take(&mut self.pending_non_publish_operations);
        for (packet_id, id) in unacked_sub_unsub {
            self.flow.release_packet_id(packet_id);
            if let Some(operation) = self.operations.get_mut(&id) {
                operation.unbind_packet_id();
                self.user_operation_queue.push_back(id);
            }
        }

        /*
         * resubmission is rebuilt from the outgoing store on the next connack, so internal
         * resubmission operations are dropped.  User publishes keep their in-flight binding.
         */
        let resubmit = mem::take(&mut self.resubmit_operation_queue);
        for id in resubmit {
            if self.operations.get(&id).map(|operation| operation.is_internal()).unwrap_or(false) {
                self.operations.remove(&id);
            }
        }

        let operations = &mut self.operations;
        self.inflight_publish_operations.retain(|_, id| {
            let keep = operations.get(id).map(|operation| !operation.is_internal()).unwrap_or(false);
            if !keep {
                operations.remove(id);
            }

            keep
        });

        /*
         * apply the offline policy to everything waiting in the user queue
         */
        let user_queue = mem::take(&mut self.user_operation_queue);
        let (mut retained, rejected) = self.partition_operation_queue_by_queue_policy(&user_queue, &self.config.offline_queue_policy);
        result = fold_mqtt_result(result, self.complete_operation_sequence_as_failure(rejected.into_iter(), generate_offline_queue_policy_failed_error));

        sort_operation_deque(&mut retained);
        self.user_operation_queue = retained;

        result
    }

    fn handle_network_event_write_completion(&mut self) -> MqttResult<()> {
        if self.state == ProtocolStateType::Halted || self.state == ProtocolStateType::Disconnected {
            error!("[{} ms] handle_network_event_write_completion - called in invalid state", self.elapsed_time_ms);
            return Err(MqttError::new_internal_state_error("write completion in an invalid state"));
        }

        if !self.pending_write_completion {
            error!("[{} ms] handle_network_event_write_completion - called with no pending completion", self.elapsed_time_ms);
            return Err(MqttError::new_internal_state_error("write completion called with no pending completion"));
        }

        debug!("[{} ms] handle_network_event - write completion", self.elapsed_time_ms);

        self.pending_write_completion = false;

        let completions = mem::take(&mut self.pending_write_completion_operations);
        self.complete_operation_sequence_as_empty_success(completions.into_iter())
    }

    fn change_state(&mut self, next_state: ProtocolStateType) {
        debug!("[{} ms] change_state - transitioning from {} to {}", self.elapsed_time_ms, self.state, next_state);
        self.state = next_state;
    }

    fn is_connect_in_queue(&self) -> bool {
        self.high_priority_operation_queue.iter().any(|id| {
            self.operations.get(id).map(|operation| mqtt_packet_to_packet_type(&operation.packet) == PacketType::Connect).unwrap_or(false)
        })
    }

    fn handle_network_event_incoming_packet(&mut self, packet: Box<MqttPacket>, packet_events: &mut VecDeque<PacketEvent>) -> MqttResult<()> {
        if self.state == ProtocolStateType::Disconnected || self.state == ProtocolStateType::Halted {
            error!("[{} ms] handle_network_event_incoming_packet - called in invalid state", self.elapsed_time_ms);
            return Err(MqttError::new_internal_state_error("incoming packet while in an invalid state"));
        }

        log_packet("Incoming packet: ", &packet);

        if self.state == ProtocolStateType::PendingConnack {
            if self.is_connect_in_queue() {
                error!("[{} ms] handle_network_event_incoming_packet - packet received before CONNECT sent", self.elapsed_time_ms);
                return Err(MqttError::new_protocol_violation("packet received before CONNECT sent"));
            }

            if mqtt_packet_to_packet_type(&packet) != PacketType::Connack {
                error!("[{} ms] handle_network_event_incoming_packet - first packet from the server was not a CONNACK", self.elapsed_time_ms);
                return Err(MqttError::new_protocol_violation("first packet from the server must be a connack"));
            }
        }

        validate_packet_inbound(&packet)?;

        // any traffic from the server proves the connection is alive
        let awaiting_pingresp = self.ping_timeout_timepoint.take().is_some();

        match *packet {
            MqttPacket::Connack(connack) => { self.handle_connack(connack, packet_events) }
            MqttPacket::Publish(publish) => { self.handle_publish(publish, packet_events) }
            MqttPacket::Pingresp(_) => { self.handle_pingresp(awaiting_pingresp) }
            MqttPacket::Disconnect(disconnect) => { self.handle_disconnect(disconnect, packet_events) }
            MqttPacket::Suback(suback) => { self.handle_suback(suback, packet_events) }
            MqttPacket::Unsuback(unsuback) => { self.handle_unsuback(unsuback, packet_events) }
            MqttPacket::Puback(puback) => { self.handle_puback(puback, packet_events) }
            MqttPacket::Pubrec(pubrec) => { self.handle_pubrec(pubrec, packet_events) }
            MqttPacket::Pubrel(pubrel) => { self.handle_pubrel(pubrel) }
            MqttPacket::Pubcomp(pubcomp) => { self.handle_pubcomp(pubcomp, packet_events) }
            packet => {
                error!("[{} ms] handle_network_event_incoming_packet - {} is not a valid packet for a server to send", self.elapsed_time_ms, mqtt_packet_to_str(&packet));
                Err(MqttError::new_protocol_violation(format!("server sent a {} packet", mqtt_packet_to_packet_type(&packet))))
            }
        }
    }

    fn is_blocked_by_inflight_limit(&self, id: u64) -> MqttResult<bool> {
        if let Some(operation) = self.operations.get(&id) {
            if is_qos1plus_publish(&operation.packet) {
                return Ok(self.flow.outbound_inflight_count()? >= self.effective_max_inflight());
            }
        }

        Ok(false)
    }

    fn dequeue_operation(&mut self, mode: ProtocolQueueServiceMode) -> MqttResult<Option<u64>> {
        if let Some(id) = self.high_priority_operation_queue.pop_front() {
            return Ok(Some(id));
        }

        if mode == ProtocolQueueServiceMode::HighPriorityOnly {
            return Ok(None);
        }

        // resumed-session traffic was admitted by the broker before; it is never throttled
        if let Some(id) = self.resubmit_operation_queue.pop_front() {
            return Ok(Some(id));
        }

        if let Some(head) = self.user_operation_queue.front() {
            if self.is_blocked_by_inflight_limit(*head)? {
                debug!("[{} ms] dequeue_operation - user queue blocked by in-flight limit", self.elapsed_time_ms);
                return Ok(None);
            }

            return Ok(self.user_operation_queue.pop_front());
        }

        Ok(None)
    }

    fn prepare_operation_for_write(&mut self, id: u64) -> MqttResult<OperationPreparation> {
        let Some(operation) = self.operations.get_mut(&id) else {
            warn!("[{} ms] prepare_operation_for_write - operation {} does not exist", self.elapsed_time_ms, id);
            return Ok(OperationPreparation::Skipped);
        };

        let preparation =
            match &mut *operation.packet {
                MqttPacket::Publish(publish) => {
                    let maximum_qos = self.current_settings.as_ref().map(|settings| settings.maximum_qos).unwrap_or(QualityOfService::ExactlyOnce);
                    if publish.qos > maximum_qos {
                        OperationPreparation::Failed(MqttError::new_packet_validation(PacketType::Publish, format!("qos {} exceeds the maximum qos supported by the broker", quality_of_service_to_str(publish.qos))))
                    } else if publish.qos == QualityOfService::AtMostOnce || operation.packet_id.is_some() {
                        OperationPreparation::Ready(operation.packet.clone())
                    } else {
                        match self.flow.begin_outbound_publish(publish) {
                            Ok(packet_id) => {
                                operation.packet_id = Some(packet_id);
                                self.inflight_publish_operations.insert(packet_id, id);
                                OperationPreparation::Ready(operation.packet.clone())
                            }
                            Err(MqttError::CapacityExceeded(context)) => {
                                OperationPreparation::Failed(MqttError::CapacityExceeded(context))
                            }
                            Err(error) => {
                                return Err(error);
                            }
                        }
                    }
                }
                MqttPacket::Subscribe(_) | MqttPacket::Unsubscribe(_) => {
                    match self.flow.acquire_packet_id() {
                        Ok(packet_id) => {
                            operation.bind_packet_id(packet_id);
                            self.pending_non_publish_operations.insert(packet_id, id);
                            OperationPreparation::Ready(operation.packet.clone())
                        }
                        Err(error) => {
                            OperationPreparation::Failed(error)
                        }
                    }
                }
                _ => {
                    OperationPreparation::Ready(operation.packet.clone())
                }
            };

        if let OperationPreparation::Failed(error) = preparation {
            warn!("[{} ms] prepare_operation_for_write - operation {} could not be sent: {}", self.elapsed_time_ms, id, error);
            self.complete_operation_as_failure(id, error)?;
            return Ok(OperationPreparation::Skipped);
        }

        Ok(preparation)
    }

    fn start_operation_ack_timeout(&mut self, id: u64, now: Instant) {
        let timeout_duration_option = self.operations.get(&id).and_then(|operation| operation.ack_timeout());

        if let Some(timeout_duration) = timeout_duration_option {
            let timeout_record = OperationTimeoutRecord {
                id,
                timeout: now + timeout_duration
            };

            self.operation_ack_timeouts.push(Reverse(timeout_record));
        }
    }

    fn on_operation_written(&mut self, id: u64, packet: &MqttPacket, now: Instant) {
        match packet {
            MqttPacket::Subscribe(_) | MqttPacket::Unsubscribe(_) => {
                self.start_operation_ack_timeout(id, now);
            }
            MqttPacket::Publish(publish) if publish.qos != QualityOfService::AtMostOnce => {
                self.start_operation_ack_timeout(id, now);
            }
            MqttPacket::Disconnect(_) => {
                self.change_state(ProtocolStateType::PendingDisconnect);
                self.pending_write_completion_operations.push_back(id);
            }
            _ => {
                self.pending_write_completion_operations.push_back(id);
            }
        }
    }

    fn get_next_ack_timeout(&self) -> Option<u64> {
        if let Some(reverse_record) = self.operation_ack_timeouts.peek() {
            let record = &reverse_record.0;
            if record.timeout <= self.current_time {
                return Some(record.id);
            }
        }

        None
    }

    fn process_ack_timeouts(&mut self) -> MqttResult<()> {
        let mut result = Ok(());

        while let Some(id) = self.get_next_ack_timeout() {
            self.operation_ack_timeouts.pop();
            info!("[{} ms] process_ack_timeouts - operation {} timed out waiting for an acknowledgement", self.elapsed_time_ms, id);
            result = fold_mqtt_result(result, self.complete_operation_as_failure(id, MqttError::new_timeout(TimeoutKind::Acknowledgement)));
        }

        result
    }

    fn service_disconnected(&mut self, _: &mut ServiceContext) -> MqttResult<()> {
        debug!("[{} ms] service_disconnected", self.elapsed_time_ms);
        Ok(())
    }

    fn service_queue(&mut self, context: &mut ServiceContext, mode: ProtocolQueueServiceMode) -> MqttResult<()> {
        if self.pending_write_completion {
            return Ok(());
        }

        let mut packets_written = 0;
        while self.state == ProtocolStateType::PendingConnack || self.state == ProtocolStateType::Connected {
            let Some(id) = self.dequeue_operation(mode)? else {
                debug!("[{} ms] service_queue - no operations ready for processing", self.elapsed_time_ms);
                break;
            };

            debug!("[{} ms] service_queue - operation {} dequeued for processing", self.elapsed_time_ms, id);
            if let OperationPreparation::Ready(packet) = self.prepare_operation_for_write(id)? {
                log_packet("Outbound packet: ", &packet);
                self.on_operation_written(id, &packet, context.current_time);
                context.to_socket.push_back(packet);
                packets_written += 1;
            }
        }

        if packets_written > 0 {
            self.pending_write_completion = true;

            // any outbound traffic satisfies keep alive
            if self.state == ProtocolStateType::Connected && self.ping_timeout_timepoint.is_none() {
                if let Some(keep_alive) = self.keep_alive_interval() {
                    self.next_ping_timepoint = Some(context.current_time + keep_alive);
                }
            }
        }

        Ok(())
    }

    fn keep_alive_interval(&self) -> Option<Duration> {
        let seconds = self.current_settings.as_ref().map(|settings| settings.keep_alive_interval_seconds).unwrap_or(0);
        if seconds > 0 {
            Some(Duration::from_secs(seconds as u64))
        } else {
            None
        }
    }

    fn service_pending_connack(&mut self, context: &mut ServiceContext) -> MqttResult<()> {
        debug!("[{} ms] service_pending_connack", self.elapsed_time_ms);

        if let Some(connack_timeout) = &self.connack_timeout_timepoint {
            if &context.current_time >= connack_timeout {
                error!("[{} ms] service_pending_connack - connack timeout exceeded", self.elapsed_time_ms);
                return Err(MqttError::new_timeout(TimeoutKind::Connect));
            }
        }

        self.service_queue(context, ProtocolQueueServiceMode::HighPriorityOnly)
    }

    fn service_keep_alive(&mut self, context: &mut ServiceContext) -> MqttResult<()> {
        if let Some(ping_timeout) = &self.ping_timeout_timepoint {
            if &context.current_time >= ping_timeout {
                error!("[{} ms] service_keep_alive - keep alive timeout exceeded", self.elapsed_time_ms);
                return Err(MqttError::new_timeout(TimeoutKind::PingResponse));
            }
        } else if let Some(next_ping) = &self.next_ping_timepoint {
            if &context.current_time >= next_ping {
                let Some(keep_alive) = self.keep_alive_interval() else {
                    self.next_ping_timepoint = None;
                    return Ok(());
                };

                debug!("[{} ms] service_keep_alive - next ping time reached, sending ping", self.elapsed_time_ms);
                let ping = Box::new(MqttPacket::Pingreq(PingreqPacket{}));
                let ping_op_id = self.create_operation(ping, None);

                self.enqueue_operation(ping_op_id, ProtocolQueueType::HighPriority, ProtocolEnqueuePosition::Front);

                // never wait longer than half the keep alive for the response
                let final_timeout = self.config.ping_timeout.min(keep_alive / 2);
                self.ping_timeout_timepoint = Some(context.current_time + final_timeout);
                self.next_ping_timepoint = Some(context.current_time + keep_alive);
            }
        }

        Ok(())
    }

    fn service_connected(&mut self, context: &mut ServiceContext) -> MqttResult<()> {
        debug!("[{} ms] service_connected", self.elapsed_time_ms);

        self.service_keep_alive(context)?;
        self.service_queue(context, ProtocolQueueServiceMode::All)?;
        self.process_ack_timeouts()?;

        Ok(())
    }

    fn service_pending_disconnect(&mut self, _: &mut ServiceContext) -> MqttResult<()> {
        debug!("[{} ms] service_pending_disconnect", self.elapsed_time_ms);

        self.process_ack_timeouts()
    }

    fn get_next_service_timepoint_protocol_queue(&self, mode: ProtocolQueueServiceMode) -> Option<Instant> {
        if self.pending_write_completion {
            return None;
        }

        if !self.high_priority_operation_queue.is_empty() {
            return Some(self.current_time);
        }

        if mode == ProtocolQueueServiceMode::All {
            if !self.resubmit_operation_queue.is_empty() {
                return Some(self.current_time);
            }

            if let Some(head) = self.user_operation_queue.front() {
                // a failing store check is surfaced by the next service call
                if !self.is_blocked_by_inflight_limit(*head).unwrap_or(false) {
                    return Some(self.current_time);
                }
            }
        }

        None
    }

    fn get_next_service_timepoint_pending_connack(&self) -> Option<Instant> {
        fold_optional_timepoint_min(&self.get_next_service_timepoint_protocol_queue(ProtocolQueueServiceMode::HighPriorityOnly), &self.connack_timeout_timepoint)
    }

    fn get_next_service_timepoint_connected(&self) -> Option<Instant> {
        let mut next_service_time: Option<Instant> = self.ping_timeout_timepoint;

        if let Some(ack_timeout) = self.operation_ack_timeouts.peek() {
            next_service_time = fold_timepoint(&next_service_time, &ack_timeout.0.timeout);
        }

        if self.ping_timeout_timepoint.is_none() {
            next_service_time = fold_optional_timepoint_min(&next_service_time, &self.next_ping_timepoint);
        }

        fold_optional_timepoint_min(&self.get_next_service_timepoint_protocol_queue(ProtocolQueueServiceMode::All), &next_service_time)
    }

    fn get_next_service_timepoint_pending_disconnect(&self) -> Option<Instant> {
        let mut next_service_time = None;

        if let Some(ack_timeout) = self.operation_ack_timeouts.peek() {
            next_service_time = fold_timepoint(&next_service_time, &ack_timeout.0.timeout);
        }

        next_service_time
    }

    fn find_inflight_publish_operation(&self, packet_id: u16) -> Option<u64> {
        self.inflight_publish_operations.get(&packet_id).copied().filter(|id| self.operations.contains_key(id))
    }

    fn apply_session_present_to_connection(&mut self, session_present: bool) -> MqttResult<()> {
        let mut result = Ok(());

        if session_present {
            info!("[{} ms] apply_session_present_to_connection - successfully rejoined a session", self.elapsed_time_ms);

            for packet in self.flow.resubmission_packets()? {
                match packet {
                    MqttPacket::Publish(publish) => {
                        let packet_id = publish.packet_id;
                        let id = match self.find_inflight_publish_operation(packet_id) {
                            Some(id) => { id }
                            None => {
                                let id = self.create_operation(Box::new(MqttPacket::Publish(publish.clone())), None);
                                self.inflight_publish_operations.insert(packet_id, id);
                                id
                            }
                        };

                        if let Some(operation) = self.operations.get_mut(&id) {
                            operation.packet = Box::new(MqttPacket::Publish(publish));
                            operation.packet_id = Some(packet_id);
                        }

                        self.resubmit_operation_queue.push_back(id);
                    }
                    MqttPacket::Pubrel(pubrel) => {
                        let id = self.create_operation(Box::new(MqttPacket::Pubrel(pubrel)), None);
                        self.resubmit_operation_queue.push_back(id);
                    }
                    _ => {
                        return Err(MqttError::new_internal_state_error("unexpected packet type in session resubmission"));
                    }
                }
            }

            sort_operation_deque(&mut self.user_operation_queue);
        } else {
            info!("[{} ms] apply_session_present_to_connection - no session present", self.elapsed_time_ms);

            /*
             * No session.  Unfinished publishes start over as new sends in their original order,
             * ahead of anything still queued.  A qos 2 publish that already got its PUBREC has
             * been accepted by the broker and completes now.
             */
            let mut restarted = VecDeque::new();
            for message in self.flow.outbound_messages()? {
                let existing = self.find_inflight_publish_operation(message.packet_id);
                match message.state {
                    DeliveryState::AwaitingComp => {
                        if let Some(id) = existing {
                            let pubrec = PubrecPacket {
                                packet_id: message.packet_id,
                                ..Default::default()
                            };

                            result = fold_mqtt_result(result, self.complete_operation_as_success(id, Some(OperationResponse::Publish(PublishResponse::Qos2(Qos2Response::Pubrec(pubrec))))));
                        }
                    }
                    _ => {
                        let id = match existing {
                            Some(id) => { id }
                            None => { self.create_operation(Box::new(MqttPacket::Publish(message.to_publish())), None) }
                        };

                        if let Some(operation) = self.operations.get_mut(&id) {
                            operation.unbind_packet_id();
                        }

                        restarted.push_back(id);
                    }
                }
            }

            self.inflight_publish_operations.clear();
            self.flow.reset_session()?;

            let mut user_queue = mem::take(&mut self.user_operation_queue);
            sort_operation_deque(&mut user_queue);
            restarted.append(&mut user_queue);
            self.user_operation_queue = restarted;
        }

        result
    }

    fn handle_connack(&mut self, connack: ConnackPacket, packet_events: &mut VecDeque<PacketEvent>) -> MqttResult<()> {
        info!("[{} ms] handle_connack - processing CONNACK packet", self.elapsed_time_ms);

        if self.state != ProtocolStateType::PendingConnack {
            error!("[{} ms] handle_connack - invalid state to receive a connack", self.elapsed_time_ms);
            return Err(MqttError::new_protocol_violation("invalid state for connack receipt"));
        }

        if !connack.reason_code.is_success() {
            error!("[{} ms] handle_connack - connection rejected with reason code {:?}", self.elapsed_time_ms, connack.reason_code);
            let reason_code = connack.reason_code;
            packet_events.push_back(PacketEvent::Connack(connack));
            return Err(MqttError::new_connection_refused(reason_code));
        }

        let clean_session = self.config.connect_options.clean_session;
        let session_present =
            match self.config.connect_options.protocol_version {
                // 3.1 has no session present flag
                ProtocolVersion::Mqtt31 => { !clean_session }
                _ => { connack.session_present }
            };

        if session_present && clean_session {
            error!("[{} ms] handle_connack - session present for a clean session", self.elapsed_time_ms);
            return Err(MqttError::new_protocol_violation("connack indicated a resumed session for a clean session connect"));
        }

        self.change_state(ProtocolStateType::Connected);
        self.connack_timeout_timepoint = None;

        if let Some(assigned_client_id) = &connack.assigned_client_identifier {
            info!("[{} ms] handle_connack - adopting broker-assigned client id {}", self.elapsed_time_ms, assigned_client_id);
            self.client_id = assigned_client_id.clone();
        }

        let settings = build_negotiated_settings(&self.config, &self.client_id, &connack, session_present);
        debug!("[{} ms] handle_connack - negotiated settings: {}", self.elapsed_time_ms, &settings);
        self.current_settings = Some(settings);

        self.ping_timeout_timepoint = None;
        self.next_ping_timepoint = self.keep_alive_interval().map(|keep_alive| self.current_time + keep_alive);

        let result = self.apply_session_present_to_connection(session_present);

        packet_events.push_back(PacketEvent::Connack(connack));

        result
    }

    fn handle_pingresp(&mut self, awaiting_pingresp: bool) -> MqttResult<()> {
        if awaiting_pingresp {
            debug!("[{} ms] handle_pingresp - ping round trip complete", self.elapsed_time_ms);
        } else {
            debug!("[{} ms] handle_pingresp - ignoring unsolicited PINGRESP", self.elapsed_time_ms);
        }

        Ok(())
    }

    fn report_duplicate_ack(&self, packet_type: PacketType, packet_id: u16, packet_events: &mut VecDeque<PacketEvent>) -> MqttResult<()> {
        warn!("[{} ms] report_duplicate_ack - {} received for unknown packet id {}", self.elapsed_time_ms, packet_type, packet_id);
        packet_events.push_back(PacketEvent::DuplicateAck(packet_type, packet_id));

        Ok(())
    }

    fn complete_inflight_publish(&mut self, packet_id: u16, response: PublishResponse) -> MqttResult<()> {
        if let Some(id) = self.inflight_publish_operations.remove(&packet_id) {
            if self.operations.contains_key(&id) {
                return self.complete_operation_as_success(id, Some(OperationResponse::Publish(response)));
            }
        }

        debug!("[{} ms] complete_inflight_publish - no live operation for packet id {}", self.elapsed_time_ms, packet_id);
        Ok(())
    }

    fn handle_suback(&mut self, suback: SubackPacket, packet_events: &mut VecDeque<PacketEvent>) -> MqttResult<()> {
        info!("[{} ms] handle_suback - processing SUBACK packet", self.elapsed_time_ms);

        let packet_id = suback.packet_id;
        let Some(id) = self.pending_non_publish_operations.get(&packet_id).copied() else {
            return self.report_duplicate_ack(PacketType::Suback, packet_id, packet_events);
        };

        let is_subscribe = self.operations.get(&id).map(|operation| matches!(&*operation.packet, MqttPacket::Subscribe(_))).unwrap_or(false);
        if !is_subscribe {
            error!("[{} ms] handle_suback - packet id {} belongs to a non-subscribe operation", self.elapsed_time_ms, packet_id);
            return Err(MqttError::new_protocol_violation("suback received for an unsubscribe"));
        }

        self.complete_operation_as_success(id, Some(OperationResponse::Subscribe(suback)))
    }

    fn handle_unsuback(&mut self, unsuback: UnsubackPacket, packet_events: &mut VecDeque<PacketEvent>) -> MqttResult<()> {
        info!("[{} ms] handle_unsuback - processing UNSUBACK packet", self.elapsed_time_ms);

        let packet_id = unsuback.packet_id;
        let Some(id) = self.pending_non_publish_operations.get(&packet_id).copied() else {
            return self.report_duplicate_ack(PacketType::Unsuback, packet_id, packet_events);
        };

        let is_unsubscribe = self.operations.get(&id).map(|operation| matches!(&*operation.packet, MqttPacket::Unsubscribe(_))).unwrap_or(false);
        if !is_unsubscribe {
            error!("[{} ms] handle_unsuback - packet id {} belongs to a non-unsubscribe operation", self.elapsed_time_ms, packet_id);
            return Err(MqttError::new_protocol_violation("unsuback received for a subscribe"));
        }

        self.complete_operation_as_success(id, Some(OperationResponse::Unsubscribe(unsuback)))
    }

    fn handle_puback(&mut self, puback: PubackPacket, packet_events: &mut VecDeque<PacketEvent>) -> MqttResult<()> {
        info!("[{} ms] handle_puback - processing PUBACK packet", self.elapsed_time_ms);

        match self.flow.handle_puback(&puback) {
            Ok(()) => {
                self.complete_inflight_publish(puback.packet_id, PublishResponse::Qos1(puback))
            }
            Err(MqttError::DuplicateAck(context)) => {
                self.report_duplicate_ack(context.packet_type, context.packet_id, packet_events)
            }
            Err(error) => { Err(error) }
        }
    }

    fn handle_pubrec(&mut self, pubrec: PubrecPacket, packet_events: &mut VecDeque<PacketEvent>) -> MqttResult<()> {
        info!("[{} ms] handle_pubrec - processing PUBREC packet", self.elapsed_time_ms);

        match self.flow.handle_pubrec(&pubrec) {
            Ok(PubrecDisposition::Release(pubrel)) | Ok(PubrecDisposition::Repeat(pubrel)) => {
                let pubrel_op_id = self.create_operation(Box::new(MqttPacket::Pubrel(pubrel)), None);
                self.enqueue_operation(pubrel_op_id, ProtocolQueueType::HighPriority, ProtocolEnqueuePosition::Back);
                Ok(())
            }
            Ok(PubrecDisposition::Rejected) => {
                self.complete_inflight_publish(pubrec.packet_id, PublishResponse::Qos2(Qos2Response::Pubrec(pubrec)))
            }
            Err(MqttError::DuplicateAck(context)) => {
                self.report_duplicate_ack(context.packet_type, context.packet_id, packet_events)
            }
            Err(error) => { Err(error) }
        }
    }

    fn handle_pubcomp(&mut self, pubcomp: PubcompPacket, packet_events: &mut VecDeque<PacketEvent>) -> MqttResult<()> {
        info!("[{} ms] handle_pubcomp - processing PUBCOMP packet", self.elapsed_time_ms);

        match self.flow.handle_pubcomp(&pubcomp) {
            Ok(()) => {
                self.complete_inflight_publish(pubcomp.packet_id, PublishResponse::Qos2(Qos2Response::Pubcomp(pubcomp)))
            }
            Err(MqttError::DuplicateAck(context)) => {
                self.report_duplicate_ack(context.packet_type, context.packet_id, packet_events)
            }
            Err(error) => { Err(error) }
        }
    }

    fn handle_pubrel(&mut self, pubrel: PubrelPacket) -> MqttResult<()> {
        info!("[{} ms] handle_pubrel - processing PUBREL packet", self.elapsed_time_ms);

        let pubcomp = self.flow.handle_pubrel(&pubrel)?;
        let pubcomp_op_id = self.create_operation(Box::new(MqttPacket::Pubcomp(pubcomp)), None);
        self.enqueue_operation(pubcomp_op_id, ProtocolQueueType::HighPriority, ProtocolEnqueuePosition::Back);

        Ok(())
    }

    fn handle_publish(&mut self, publish: PublishPacket, packet_events: &mut VecDeque<PacketEvent>) -> MqttResult<()> {
        info!("[{} ms] handle_publish - processing PUBLISH packet", self.elapsed_time_ms);

        let disposition = self.flow.handle_inbound_publish(&publish)?;
        if let Some(response) = disposition.response {
            let response_op_id = self.create_operation(Box::new(response), None);
            self.enqueue_operation(response_op_id, ProtocolQueueType::HighPriority, ProtocolEnqueuePosition::Back);
        }

        if disposition.deliver {
            packet_events.push_back(PacketEvent::Publish(publish));
        }

        Ok(())
    }

    fn handle_disconnect(&mut self, disconnect: DisconnectPacket, packet_events: &mut VecDeque<PacketEvent>) -> MqttResult<()> {
        info!("[{} ms] handle_disconnect - processing DISCONNECT packet", self.elapsed_time_ms);

        if self.config.connect_options.protocol_version != ProtocolVersion::Mqtt5 {
            error!("[{} ms] handle_disconnect - server-side disconnects require MQTT5", self.elapsed_time_ms);
            return Err(MqttError::new_protocol_violation("server-side disconnects are only allowed in MQTT5"));
        }

        packet_events.push_back(PacketEvent::Disconnect(disconnect));

        Err(MqttError::new_connection_closed("server-side disconnect received"))
    }

    fn get_queue(&mut self, queue_type: ProtocolQueueType) -> &mut VecDeque<u64> {
        match queue_type {
            ProtocolQueueType::User => { &mut self.user_operation_queue }
            ProtocolQueueType::HighPriority => { &mut self.high_priority_operation_queue }
        }
    }

    fn enqueue_operation(&mut self, id: u64, queue_type: ProtocolQueueType, position: ProtocolEnqueuePosition) {
        debug!("[{} ms] enqueue_operation - operation {} added to {} of queue {} ", self.elapsed_time_ms, id, position, queue_type);
        let queue = self.get_queue(queue_type);
        match position {
            ProtocolEnqueuePosition::Front => { queue.push_front(id); }
            ProtocolEnqueuePosition::Back => { queue.push_back(id); }
        }
    }

    fn create_operation(&mut self, packet: Box<MqttPacket>, options: Option<ClientOperationOptions>) -> u64 {
        let id = self.next_operation_id;
        self.next_operation_id += 1;

        info!("[{} ms] create_operation - building {} operation with id {}", self.elapsed_time_ms, mqtt_packet_to_str(&packet), id);
        debug!("[{} ms] create_operation - operation {}: {}", self.elapsed_time_ms, id, &packet);

        let operation = ClientOperation {
            id,
            packet,
            packet_id: None,
            options,
        };

        self.operations.insert(id, operation);

        id
    }
}

fn generate_offline_queue_policy_failed_error() -> MqttError {
    MqttError::new_not_connected()
}

fn is_qos1plus_publish(packet: &MqttPacket) -> bool {
    matches!(packet, MqttPacket::Publish(publish) if publish.qos != QualityOfService::AtMostOnce)
}

fn build_negotiated_settings(config: &ProtocolStateConfig, client_id: &str, connack: &ConnackPacket, rejoined_session: bool) -> NegotiatedSettings {
    let connect = &config.connect_options;

    NegotiatedSettings {
        protocol_version: connect.protocol_version,
        client_id: client_id.to_string(),
        keep_alive_interval_seconds: connack.server_keep_alive.unwrap_or(connect.keep_alive_interval_seconds),
        receive_maximum_from_server: connack.receive_maximum.unwrap_or(u16::MAX),
        maximum_qos: connack.maximum_qos.unwrap_or(QualityOfService::ExactlyOnce),
        rejoined_session,
    }
}

fn complete_operation_with_result(operation_options: ClientOperationOptions, completion_result: Option<OperationResponse>) -> MqttResult<()> {
    match operation_options {
        ClientOperationOptions::Publish(publish_options) => {
            let publish_response =
                match completion_result {
                    None => { PublishResponse::Qos0 }
                    Some(OperationResponse::Publish(publish_result)) => { publish_result }
                    Some(_) => {
                        return Err(MqttError::new_internal_state_error("invalid publish result"));
                    }
                };

            if let Some(handler) = publish_options.response_handler {
                let _ = handler(Ok(publish_response));
            }

            Ok(())
        }
        ClientOperationOptions::Subscribe(subscribe_options) => {
            if let Some(OperationResponse::Subscribe(suback)) = completion_result {
                if let Some(handler) = subscribe_options.response_handler {
                    let _ = handler(Ok(suback));
                }

                return Ok(());
            }

            Err(MqttError::new_internal_state_error("operation result does not match operation type"))
        }
        ClientOperationOptions::Unsubscribe(unsubscribe_options) => {
            if let Some(OperationResponse::Unsubscribe(unsuback)) = completion_result {
                if let Some(handler) = unsubscribe_options.response_handler {
                    let _ = handler(Ok(unsuback));
                }

                return Ok(());
            }

            Err(MqttError::new_internal_state_error("operation result does not match operation type"))
        }
    }
}

fn complete_operation_with_error(operation_options: ClientOperationOptions, error: MqttError) {
    match operation_options {
        ClientOperationOptions::Publish(publish_options) => {
            if let Some(handler) = publish_options.response_handler {
                let _ = handler(Err(error));
            }
        }
        ClientOperationOptions::Subscribe(subscribe_options) => {
            if let Some(handler) = subscribe_options.response_handler {
                let _ = handler(Err(error));
            }
        }
        ClientOperationOptions::Unsubscribe(unsubscribe_options) => {
            if let Some(handler) = unsubscribe_options.response_handler {
                let _ = handler(Err(error));
            }
        }
    }
}

pub(crate) fn does_packet_pass_offline_queue_policy(packet: &MqttPacket, policy: &OfflineQueuePolicy) -> bool {
    match packet {
        MqttPacket::Subscribe(_) | MqttPacket::Unsubscribe(_) => {
            !matches!(policy, OfflineQueuePolicy::PreserveQos1PlusPublishes | OfflineQueuePolicy::PreserveNothing)
        }
        MqttPacket::Publish(publish) => {
            match policy {
                OfflineQueuePolicy::PreserveNothing => { false }
                OfflineQueuePolicy::PreserveQos1PlusPublishes | OfflineQueuePolicy::PreserveAcknowledged => {
                    publish.qos != QualityOfService::AtMostOnce
                }
                _ => { true }
            }
        }
        _ => { false }
    }
}

fn partition_operations_by_queue_policy<'a, T>(iterator: T, policy: &OfflineQueuePolicy) -> (VecDeque<u64>, VecDeque<u64>) where T : Iterator<Item = (u64, &'a MqttPacket)> {
    let mut retained : VecDeque<u64> = VecDeque::new();
    let mut filtered : VecDeque<u64> = VecDeque::new();

    iterator.for_each(|(id, packet)| {
        if does_packet_pass_offline_queue_policy(packet, policy) {
            retained.push_back(id);
        } else {
            filtered.push_back(id);
        }
    });

    (retained, filtered)
}

fn sort_operation_deque(operations: &mut VecDeque<u64>) {
    operations.make_contiguous().sort();
}

fn fold_timepoint(base: &Option<Instant>, new: &Instant) -> Option<Instant> {
    if let Some(base_timepoint) = &base {
        if base_timepoint < new {
            return *base;
        }
    }

    Some(*new)
}

fn fold_optional_timepoint_min(base: &Option<Instant>, new: &Option<Instant>) -> Option<Instant> {
    if let Some(base_timepoint) = base {
        if let Some(new_timepoint) = new {
            if base_timepoint < new_timepoint {
                return *base;
            } else {
                return *new;
            }
        }

        return *base;
    }

    *new
}
