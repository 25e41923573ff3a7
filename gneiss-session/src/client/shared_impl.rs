/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::client::*;
use crate::config::*;
use crate::error::{MqttError, MqttResult};
use crate::mqtt::*;
use crate::protocol::*;
use crate::store::*;

use log::*;
use rand::Rng;
use std::collections::VecDeque;
use std::fmt;
use std::fmt::{Display, Formatter};
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};

pub(crate) enum OperationOptions {
    Publish(Box<MqttPacket>, PublishOptionsInternal),
    Subscribe(Box<MqttPacket>, SubscribeOptionsInternal),
    Unsubscribe(Box<MqttPacket>, UnsubscribeOptionsInternal),
    Connect(oneshot::Sender<MqttResult<()>>),
    End(bool, oneshot::Sender<MqttResult<()>>),
    AddListener(mpsc::UnboundedSender<Arc<ClientEvent>>),
}

#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub(crate) enum SessionImplState {
    Disconnected,
    Connecting,
    Connected,
    PendingReconnect,
    Closed,
    Shutdown,
}

impl Display for SessionImplState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SessionImplState::Disconnected => { write!(f, "Disconnected") }
            SessionImplState::Connecting => { write!(f, "Connecting") }
            SessionImplState::Connected => { write!(f, "Connected") }
            SessionImplState::PendingReconnect => { write!(f, "PendingReconnect") }
            SessionImplState::Closed => { write!(f, "Closed") }
            SessionImplState::Shutdown => { write!(f, "Shutdown") }
        }
    }
}

pub(crate) struct SessionImpl {
    protocol_state: ProtocolState,
    listeners: Vec<mpsc::UnboundedSender<Arc<ClientEvent>>>,

    current_state: SessionImplState,
    desired_state: SessionImplState,

    // DISCONNECT submitted; the connection stays up until it has been written
    graceful_disconnect_pending: bool,

    // a connect arrived while an end was in progress; it takes effect once Closed is reached
    connect_after_close: bool,

    connect_waiters: Vec<oneshot::Sender<MqttResult<()>>>,
    end_waiters: Vec<oneshot::Sender<MqttResult<()>>>,

    packet_events: VecDeque<PacketEvent>,

    last_connack: Option<ConnackPacket>,
    last_disconnect: Option<DisconnectPacket>,
    last_error: Option<MqttError>,

    successful_connect_time: Option<Instant>,
    connect_start_time: Option<Instant>,
    next_reconnect_period: Duration,
    consecutive_failed_attempts: u32,
    reconnect_options: ReconnectOptions,

    connect_timeout: Duration,

    state_sender: watch::Sender<ConnectionState>,
}

impl SessionImpl {

    pub(crate) fn new(connect_options: ConnectOptions, mut session_options: SessionOptions, state_sender: watch::Sender<ConnectionState>) -> MqttResult<Self> {
        debug!("Creating new MQTT session - connect options: {:?}", connect_options);
        debug!("Creating new MQTT session - session options: {:?}", session_options);

        let client_id = connect_options.client_id.clone().unwrap_or_else(generate_client_id);
        info!("Creating new MQTT session with client id {}", client_id);

        let outgoing_store = session_options.outgoing_store.take().unwrap_or_else(|| Box::new(MemoryMessageStore::new()));
        let incoming_store = session_options.incoming_store.take().unwrap_or_else(|| Box::new(MemoryMessageStore::new()));

        let state_config = ProtocolStateConfig {
            connect_options,
            client_id,
            base_timestamp: Instant::now(),
            offline_queue_policy: session_options.offline_queue_policy,
            ping_timeout: session_options.ping_timeout,
            max_inflight: session_options.max_inflight,
            inflight_limit_policy: session_options.inflight_limit_policy,
            packet_id_policy: session_options.packet_id_policy,
        };

        let mut reconnect_options = session_options.reconnect_options;
        reconnect_options.normalize();

        Ok(SessionImpl {
            protocol_state: ProtocolState::new(state_config, outgoing_store, incoming_store)?,
            listeners: Vec::new(),
            current_state: SessionImplState::Disconnected,
            desired_state: SessionImplState::Disconnected,
            graceful_disconnect_pending: false,
            connect_after_close: false,
            connect_waiters: Vec::new(),
            end_waiters: Vec::new(),
            packet_events: VecDeque::new(),
            last_connack: None,
            last_disconnect: None,
            last_error: None,
            successful_connect_time: None,
            connect_start_time: None,
            next_reconnect_period: reconnect_options.base_reconnect_period,
            consecutive_failed_attempts: 0,
            reconnect_options,
            connect_timeout: session_options.connect_timeout,
            state_sender,
        })
    }

    pub(crate) fn connect_timeout(&self) -> &Duration {
        &self.connect_timeout
    }

    pub(crate) fn get_current_state(&self) -> SessionImplState {
        self.current_state
    }

    pub(crate) fn is_connection_established(&self) -> bool {
        matches!(self.protocol_state.state(), ProtocolStateType::Connected | ProtocolStateType::PendingDisconnect)
    }

    fn broadcast_event(&mut self, event: Arc<ClientEvent>) {
        debug!("Broadcasting session event: {}", *event);

        // a dropped receiver unregisters its listener
        self.listeners.retain(|listener| listener.send(event.clone()).is_ok());
    }

    pub(crate) fn apply_error(&mut self, error: MqttError) {
        if self.last_error.is_none() {
            debug!("Applying error to session: {}", error);
            self.last_error = Some(error);
        } else {
            debug!("Ignoring additional session error: {}", error);
        }
    }

    pub(crate) fn handle_incoming_operation(&mut self, operation: OperationOptions, now: Instant) {
        match operation {
            OperationOptions::Publish(packet, internal_options) => {
                debug!("Submitting publish operation to protocol state");
                let user_event_context = UserEventContext {
                    event: UserEvent::Publish(packet, internal_options),
                    current_time: now
                };

                self.protocol_state.handle_user_event(user_event_context);
            }
            OperationOptions::Subscribe(packet, internal_options) => {
                debug!("Submitting subscribe operation to protocol state");
                let user_event_context = UserEventContext {
                    event: UserEvent::Subscribe(packet, internal_options),
                    current_time: now
                };

                self.protocol_state.handle_user_event(user_event_context);
            }
            OperationOptions::Unsubscribe(packet, internal_options) => {
                debug!("Submitting unsubscribe operation to protocol state");
                let user_event_context = UserEventContext {
                    event: UserEvent::Unsubscribe(packet, internal_options),
                    current_time: now
                };

                self.protocol_state.handle_user_event(user_event_context);
            }
            OperationOptions::Connect(waiter) => {
                self.handle_connect(waiter);
            }
            OperationOptions::End(force, waiter) => {
                self.handle_end(force, waiter, now);
            }
            OperationOptions::AddListener(listener) => {
                debug!("Adding listener to session events");
                self.listeners.push(listener);
            }
        }

        self.update_public_state();
    }

    // Every client handle is gone; nothing else can arrive.
    pub(crate) fn handle_operation_channel_closed(&mut self) {
        info!("Operation channel closed, shutting session down");
        self.desired_state = SessionImplState::Shutdown;
    }

    fn handle_connect(&mut self, waiter: oneshot::Sender<MqttResult<()>>) {
        if self.desired_state == SessionImplState::Shutdown {
            let _ = waiter.send(Err(MqttError::new_operation_channel_failure("session is shutting down")));
            return;
        }

        if self.current_state == SessionImplState::Connected && self.protocol_state.state() == ProtocolStateType::Connected && self.desired_state == SessionImplState::Connected {
            debug!("Connect requested while already connected");
            let _ = waiter.send(Ok(()));
            return;
        }

        self.connect_waiters.push(waiter);

        if self.desired_state == SessionImplState::Closed && !self.end_waiters.is_empty() {
            debug!("Connect requested while an end is in progress; deferring until closed");
            self.connect_after_close = true;
            return;
        }

        if self.desired_state != SessionImplState::Connected {
            self.reset_reconnect_backoff();
        }

        debug!("Updating desired state to Connected");
        self.desired_state = SessionImplState::Connected;
    }

    // A user connect starts a fresh run of attempts
    fn reset_reconnect_backoff(&mut self) {
        self.consecutive_failed_attempts = 0;
        self.next_reconnect_period = self.reconnect_options.base_reconnect_period;
    }

    fn handle_end(&mut self, force: bool, waiter: oneshot::Sender<MqttResult<()>>, now: Instant) {
        match self.current_state {
            SessionImplState::Closed | SessionImplState::Shutdown => {
                debug!("End requested on an already closed session");
                let _ = waiter.send(Ok(()));
                return;
            }
            _ => {}
        }

        if self.desired_state == SessionImplState::Shutdown {
            let _ = waiter.send(Ok(()));
            return;
        }

        self.end_waiters.push(waiter);
        self.connect_after_close = false;

        debug!("Updating desired state to Closed");
        self.desired_state = SessionImplState::Closed;

        if force {
            info!("Forced end; dropping connection and failing all pending operations");
            self.graceful_disconnect_pending = false;
            self.protocol_state.reset(&now);
        } else if !self.graceful_disconnect_pending && self.current_state == SessionImplState::Connected && self.protocol_state.state() == ProtocolStateType::Connected {
            debug!("Submitting disconnect operation to protocol state");
            let disconnect = DisconnectPacket {
                reason_code: DisconnectReasonCode::NormalDisconnection,
                ..Default::default()
            };

            let disconnect_context = UserEventContext {
                event: UserEvent::Disconnect(Box::new(MqttPacket::Disconnect(disconnect))),
                current_time: now
            };

            self.protocol_state.handle_user_event(disconnect_context);
            self.graceful_disconnect_pending = true;
        }
    }

    fn dispatch_packet_events(&mut self, now: Instant) {
        let events = mem::take(&mut self.packet_events);

        for event in events {
            match event {
                PacketEvent::Publish(publish) => {
                    debug!("dispatch_packet_events - publish packet");
                    let publish_event = PublishReceivedEvent {
                        publish,
                    };

                    self.broadcast_event(Arc::new(ClientEvent::PublishReceived(publish_event)));
                }
                PacketEvent::Disconnect(disconnect) => {
                    debug!("dispatch_packet_events - server-side disconnect packet");
                    self.last_disconnect = Some(disconnect);
                }
                PacketEvent::Connack(connack) => {
                    debug!("dispatch_packet_events - connack packet");
                    let success = connack.reason_code.is_success();
                    self.last_connack = Some(connack);
                    if success {
                        self.on_connection_success(now);
                    }
                }
                PacketEvent::DuplicateAck(packet_type, packet_id) => {
                    debug!("dispatch_packet_events - duplicate ack");
                    let duplicate_ack_event = DuplicateAckEvent {
                        packet_type,
                        packet_id,
                    };

                    self.broadcast_event(Arc::new(ClientEvent::DuplicateAck(duplicate_ack_event)));
                }
            }
        }
    }

    fn on_connection_success(&mut self, now: Instant) {
        self.successful_connect_time = Some(now);
        self.consecutive_failed_attempts = 0;
        self.emit_connection_success_event();

        self.update_public_state();
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn on_connection_failure(&mut self, error: &MqttError) {
        self.consecutive_failed_attempts = self.consecutive_failed_attempts.saturating_add(1);
        debug!("Connection attempt failed; {} consecutive failures", self.consecutive_failed_attempts);

        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    fn handle_network_event_result(&mut self, result: MqttResult<()>, now: Instant) -> MqttResult<()> {
        self.dispatch_packet_events(now);
        self.update_public_state();

        if let Err(error) = result {
            self.apply_error(error.clone());
            return Err(error);
        }

        Ok(())
    }

    pub(crate) fn handle_incoming_packet(&mut self, packet: Box<MqttPacket>, now: Instant) -> MqttResult<()> {
        debug!("session impl - handle_incoming_packet");
        let context = NetworkEventContext {
            event: NetworkEvent::IncomingPacket(packet),
            current_time: now,
            packet_events: &mut self.packet_events
        };

        let result = self.protocol_state.handle_network_event(context);
        self.handle_network_event_result(result, now)
    }

    pub(crate) fn handle_write_completion(&mut self, now: Instant) -> MqttResult<()> {
        debug!("session impl - handle_write_completion");
        let context = NetworkEventContext {
            event: NetworkEvent::WriteCompletion,
            current_time: now,
            packet_events: &mut self.packet_events
        };

        let result = self.protocol_state.handle_network_event(context);
        self.handle_network_event_result(result, now)
    }

    pub(crate) fn handle_service(&mut self, to_socket: &mut VecDeque<Box<MqttPacket>>, now: Instant) -> MqttResult<()> {
        debug!("session impl - handle_service");
        let mut context = ServiceContext {
            to_socket,
            current_time: now,
        };

        let result = self.protocol_state.service(&mut context);
        self.handle_network_event_result(result, now)
    }

    pub(crate) fn get_next_connected_service_time(&mut self, now: Instant) -> Option<Instant> {
        if self.current_state == SessionImplState::Connected {
            return self.protocol_state.get_next_service_timepoint(&now);
        }

        None
    }

    pub(crate) fn connection_protocol_version(&self) -> ProtocolVersion {
        self.protocol_state.config.connect_options.protocol_version
    }

    fn clamp_reconnect_period(&self, reconnect_period: Duration) -> Duration {
        reconnect_period.min(self.reconnect_options.max_reconnect_period)
    }

    fn compute_uniform_jitter_period(&self, max_nanos: u128) -> Duration {
        if max_nanos == 0 {
            return Duration::ZERO;
        }

        let mut rng = rand::thread_rng();
        let uniform_nanos = rng.gen_range(0..max_nanos);
        Duration::from_nanos(uniform_nanos as u64)
    }

    pub(crate) fn compute_reconnect_period(&mut self) -> Duration {
        let reconnect_period = self.next_reconnect_period;
        self.next_reconnect_period =
            match self.reconnect_options.backoff_type {
                ReconnectBackoffType::Exponential => { self.clamp_reconnect_period(self.next_reconnect_period * 2) }
                _ => { self.reconnect_options.base_reconnect_period }
            };

        let delay =
            match self.reconnect_options.reconnect_period_jitter {
                ExponentialBackoffJitterType::None => {
                    reconnect_period
                }
                ExponentialBackoffJitterType::Uniform => {
                    self.compute_uniform_jitter_period(reconnect_period.as_nanos())
                }
            };

        info!("Next connection attempt scheduled in {:?}", delay);
        self.emit_reconnect_scheduled_event(delay);

        delay
    }

    pub(crate) fn compute_optional_state_transition(&self) -> Option<SessionImplState> {
        match self.current_state {
            SessionImplState::Disconnected | SessionImplState::Closed => {
                match self.desired_state {
                    SessionImplState::Connected => {
                        return Some(SessionImplState::Connecting)
                    }
                    SessionImplState::Shutdown => {
                        return Some(SessionImplState::Shutdown)
                    }
                    SessionImplState::Closed => {
                        if self.current_state == SessionImplState::Disconnected {
                            return Some(SessionImplState::Closed)
                        }
                    }
                    _ => {}
                }
            }

            SessionImplState::Connecting | SessionImplState::PendingReconnect => {
                if self.desired_state != SessionImplState::Connected {
                    return Some(SessionImplState::Disconnected)
                }
            }

            SessionImplState::Connected => {
                if self.desired_state != SessionImplState::Connected && !self.graceful_disconnect_pending {
                    return Some(SessionImplState::Disconnected)
                }
            }

            _ => { }
        }

        None
    }

    fn is_reconnect_exhausted(&self) -> bool {
        if !self.reconnect_options.is_enabled() {
            return true;
        }

        if let Some(max_attempts) = self.reconnect_options.max_reconnect_attempts {
            return self.consecutive_failed_attempts >= max_attempts;
        }

        false
    }

    fn compute_public_state(&self) -> ConnectionState {
        match self.current_state {
            SessionImplState::Disconnected => { ConnectionState::Disconnected }
            SessionImplState::Connecting => { ConnectionState::Connecting }
            SessionImplState::Connected => {
                if self.desired_state != SessionImplState::Connected {
                    ConnectionState::Disconnecting
                } else if self.protocol_state.state() == ProtocolStateType::Connected {
                    ConnectionState::Connected
                } else {
                    ConnectionState::Connecting
                }
            }
            SessionImplState::PendingReconnect => { ConnectionState::Reconnecting }
            SessionImplState::Closed | SessionImplState::Shutdown => { ConnectionState::Closed }
        }
    }

    fn update_public_state(&self) {
        let public_state = self.compute_public_state();
        self.state_sender.send_if_modified(|state| {
            if *state != public_state {
                debug!("Session connection state changing from {} to {}", *state, public_state);
                *state = public_state;
                return true;
            }

            false
        });
    }

    fn emit_connection_attempt_event(&mut self) {
        let connection_attempt_event = ConnectionAttemptEvent {
        };

        self.broadcast_event(Arc::new(ClientEvent::ConnectionAttempt(connection_attempt_event)));
    }

    fn emit_connection_success_event(&mut self) {
        let Some(settings) = self.protocol_state.get_negotiated_settings().clone() else {
            error!("emit_connection_success_event - no negotiated settings after a successful connack");
            return;
        };

        let Some(connack) = self.last_connack.clone() else {
            error!("emit_connection_success_event - no connack after a successful connection");
            return;
        };

        let connection_success_event = ConnectionSuccessEvent {
            connack,
            settings,
        };

        self.broadcast_event(Arc::new(ClientEvent::ConnectionSuccess(connection_success_event)));
    }

    fn emit_connection_failure_event(&mut self) {
        let error = self.last_error.take().unwrap_or(MqttError::new_connection_establishment_failure("unknown failure source"));
        self.on_connection_failure(&error);

        let connection_failure_event = ConnectionFailureEvent {
            error,
            connack: self.last_connack.clone(),
        };

        self.broadcast_event(Arc::new(ClientEvent::ConnectionFailure(connection_failure_event)));
    }

    fn emit_disconnection_event(&mut self) {
        let disconnection_event = DisconnectionEvent {
            error: self.last_error.take().unwrap_or(MqttError::new_connection_closed("disconnection with no source error")),
            disconnect: self.last_disconnect.clone(),
        };

        self.broadcast_event(Arc::new(ClientEvent::Disconnection(disconnection_event)));
    }

    fn emit_reconnect_scheduled_event(&mut self, delay: Duration) {
        let reconnect_scheduled_event = ReconnectScheduledEvent {
            attempt: self.consecutive_failed_attempts.saturating_add(1),
            delay,
        };

        self.broadcast_event(Arc::new(ClientEvent::ReconnectScheduled(reconnect_scheduled_event)));
    }

    fn emit_closed_event(&mut self) {
        let closed_event = ClosedEvent {
        };

        self.broadcast_event(Arc::new(ClientEvent::Closed(closed_event)));
    }

    fn enter_closed(&mut self, now: Instant) {
        self.graceful_disconnect_pending = false;
        self.protocol_state.reset(&now);

        // end waiters observe the closed state as soon as they resume
        self.update_public_state();
        for waiter in self.end_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }

        if self.connect_after_close {
            debug!("Resuming deferred connect after close");
            self.connect_after_close = false;
            self.reset_reconnect_backoff();
            self.desired_state = SessionImplState::Connected;
        } else {
            for waiter in self.connect_waiters.drain(..) {
                let _ = waiter.send(Err(MqttError::new_user_initiated_disconnect()));
            }
        }

        self.emit_closed_event();
    }

    // Final teardown once the event loop has exited.  Pending operations fail and the stores
    // release their resources.
    pub(crate) fn shutdown(&mut self, now: Instant) {
        info!("Session shutting down");
        self.protocol_state.reset(&now);

        for waiter in self.end_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }

        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(MqttError::new_operation_channel_failure("session shut down")));
        }

        if let Err(error) = self.protocol_state.close_stores() {
            warn!("Failed to close message stores: {}", error);
        }

        self.current_state = SessionImplState::Shutdown;
        self.update_public_state();
    }

    pub(crate) fn transition_to_state(&mut self, mut new_state: SessionImplState, now: Instant) -> MqttResult<()> {
        let old_state = self.current_state;

        // A flushed DISCONNECT or a dead connection both land in PendingReconnect, which only
        // holds when a connection is still wanted and the reconnect policy allows another attempt.
        if new_state == SessionImplState::PendingReconnect && self.desired_state != SessionImplState::Connected {
            new_state = SessionImplState::Disconnected;
        }

        if new_state == SessionImplState::Disconnected && self.desired_state == SessionImplState::Closed {
            new_state = SessionImplState::Closed;
        }

        if (new_state == SessionImplState::Disconnected || new_state == SessionImplState::Closed) && self.desired_state == SessionImplState::Shutdown {
            new_state = SessionImplState::Shutdown;
        }

        if old_state == new_state {
            return Ok(());
        }

        debug!("session impl transition_to_state - old state: {}, new_state: {}", old_state, new_state);

        if new_state == SessionImplState::Connected {
            let establishment_timeout = self.connect_start_time.unwrap_or(now) + self.connect_timeout;
            let context = NetworkEventContext {
                event: NetworkEvent::ConnectionOpened(ConnectionOpenedContext { establishment_timeout }),
                current_time: now,
                packet_events: &mut self.packet_events
            };

            self.protocol_state.handle_network_event(context)?;
        } else if old_state == SessionImplState::Connected {
            let context = NetworkEventContext {
                event: NetworkEvent::ConnectionClosed,
                current_time: now,
                packet_events: &mut self.packet_events
            };

            self.protocol_state.handle_network_event(context)?;
            self.graceful_disconnect_pending = false;
        }

        if new_state == SessionImplState::Connecting {
            self.last_error = None;
            self.last_connack = None;
            self.last_disconnect = None;
            self.connect_start_time = Some(now);
            self.emit_connection_attempt_event();
        }

        if old_state == SessionImplState::Connecting && new_state != SessionImplState::Connected {
            self.emit_connection_failure_event();
        }

        if old_state == SessionImplState::Connected {
            let connected = self.last_connack.as_ref().map(|connack| connack.reason_code.is_success()).unwrap_or(false);
            if connected {
                self.emit_disconnection_event();
            } else {
                self.emit_connection_failure_event();
            }

            if let Some(successful_connect_timepoint) = self.successful_connect_time {
                if now.saturating_duration_since(successful_connect_timepoint) > self.reconnect_options.reconnect_stability_reset_period {
                    debug!("Connection was stable; resetting reconnect backoff");
                    self.next_reconnect_period = self.reconnect_options.base_reconnect_period;
                }
            }

            self.successful_connect_time = None;
        }

        if new_state == SessionImplState::PendingReconnect && self.is_reconnect_exhausted() {
            info!("Reconnection disabled or attempts exhausted after {} consecutive failures", self.consecutive_failed_attempts);
            self.desired_state = SessionImplState::Disconnected;
            new_state = SessionImplState::Disconnected;
        }

        self.current_state = new_state;
        if new_state == SessionImplState::Closed {
            self.enter_closed(now);
        }

        self.update_public_state();

        Ok(())
    }
}
