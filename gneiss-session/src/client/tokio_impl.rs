/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Functionality for using [`tokio`](https://crates.io/crates/tokio) as a session's async
runtime implementation.
 */

use crate::client::shared_impl::*;
use crate::codec::*;
use crate::error::{MqttError, MqttResult, TimeoutKind};
use crate::mqtt::MqttPacket;
use crate::mqtt::utils::mqtt_packet_to_str;

use log::*;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, split, WriteHalf};
use tokio::runtime;
use tokio::sync::mpsc;
use tokio::time::sleep;

/// Return type of a tokio connection factory
pub type TokioConnectionFactoryReturnType<T> = Pin<Box<dyn Future<Output = MqttResult<T>> + Send>>;

/// Tokio-specific session configuration
pub struct TokioSessionOptions<T> where T : AsyncRead + AsyncWrite + Send + Sync {

    /// Factory function for creating the final connection object.  Invoked once per connection
    /// attempt.  It might be a TcpStream, a TlsStream, a websocket stream, or some nested
    /// combination; it only has to implement AsyncRead and AsyncWrite.
    pub connection_factory: Box<dyn Fn() -> TokioConnectionFactoryReturnType<T> + Send + Sync>,

    /// Encoder/decoder for MQTT packets on the connection stream
    pub codec: Box<dyn Codec>,
}

impl<T> TokioSessionOptions<T> where T : AsyncRead + AsyncWrite + Send + Sync {

    /// Creates a new set of tokio session options
    pub fn new(connection_factory: Box<dyn Fn() -> TokioConnectionFactoryReturnType<T> + Send + Sync>, codec: Box<dyn Codec>) -> Self {
        TokioSessionOptions {
            connection_factory,
            codec
        }
    }
}

pub(crate) struct SessionRuntimeState<T> where T : AsyncRead + AsyncWrite + Send + Sync + 'static {
    tokio_config: TokioSessionOptions<T>,
    operation_receiver: mpsc::UnboundedReceiver<OperationOptions>,
    stream: Option<T>
}

impl<T> SessionRuntimeState<T> where T : AsyncRead + AsyncWrite + Send + Sync + 'static {

    fn handle_operation_result(client: &mut SessionImpl, operation_result: Option<OperationOptions>) {
        match operation_result {
            Some(operation_options) => {
                client.handle_incoming_operation(operation_options, Instant::now());
            }
            None => {
                client.handle_operation_channel_closed();
            }
        }
    }

    pub(crate) async fn process_idle(&mut self, client: &mut SessionImpl) -> MqttResult<SessionImplState> {
        loop {
            trace!("tokio - process_idle loop");

            if let Some(transition_state) = client.compute_optional_state_transition() {
                return Ok(transition_state);
            }

            let operation_result = self.operation_receiver.recv().await;
            debug!("tokio - process_idle - user operation received");
            Self::handle_operation_result(client, operation_result);
        }
    }

    pub(crate) async fn process_connecting(&mut self, client: &mut SessionImpl) -> MqttResult<SessionImplState> {
        let mut connect = (self.tokio_config.connection_factory)();

        let timeout = sleep(*client.connect_timeout());
        tokio::pin!(timeout);

        loop {
            trace!("tokio - process_connecting loop");

            tokio::select! {
                operation_result = self.operation_receiver.recv() => {
                    debug!("tokio - process_connecting - user operation received");
                    Self::handle_operation_result(client, operation_result);
                }
                () = &mut timeout => {
                    info!("tokio - process_connecting - connection establishment timeout exceeded");
                    client.apply_error(MqttError::new_timeout(TimeoutKind::Connect));
                    return Ok(SessionImplState::PendingReconnect);
                }
                connection_result = &mut connect => {
                    match connection_result {
                        Ok(stream) => {
                            info!("tokio - process_connecting - transport connection established successfully");
                            self.stream = Some(stream);
                            return Ok(SessionImplState::Connected);
                        }
                        Err(error) => {
                            info!("tokio - process_connecting - transport connection establishment failed: {}", error);
                            client.apply_error(MqttError::new_connection_establishment_failure(error));
                            return Ok(SessionImplState::PendingReconnect);
                        }
                    }
                }
            }

            if let Some(transition_state) = client.compute_optional_state_transition() {
                return Ok(transition_state);
            }
        }
    }

    fn decode_inbound_packets(&mut self, client: &mut SessionImpl, inbound_buffer: &mut Vec<u8>) -> MqttResult<()> {
        loop {
            match self.tokio_config.codec.decode(inbound_buffer.as_slice())? {
                DecodeOutcome::Packet { packet, consumed } => {
                    check_consumed_byte_count(consumed, inbound_buffer.len())?;
                    inbound_buffer.drain(..consumed);
                    client.handle_incoming_packet(packet, Instant::now())?;
                }
                DecodeOutcome::Incomplete => {
                    return Ok(());
                }
            }
        }
    }

    fn encode_outbound_packets(&mut self, packets: &mut VecDeque<Box<MqttPacket>>, outbound_data: &mut Vec<u8>) -> MqttResult<()> {
        while let Some(packet) = packets.pop_front() {
            trace!("tokio - encoding {} packet", mqtt_packet_to_str(&packet));
            self.tokio_config.codec.encode(&packet, outbound_data)?;
        }

        Ok(())
    }

    pub(crate) async fn process_connected(&mut self, client: &mut SessionImpl) -> MqttResult<SessionImplState> {
        let mut outbound_packets: VecDeque<Box<MqttPacket>> = VecDeque::new();
        let mut outbound_data: Vec<u8> = Vec::with_capacity(4096);
        let mut cumulative_bytes_written : usize = 0;

        let mut inbound_data: [u8; 4096] = [0; 4096];
        let mut inbound_buffer: Vec<u8> = Vec::with_capacity(4096);

        let Some(stream) = self.stream.take() else {
            return Err(MqttError::new_internal_state_error("connected state entered without a connection stream"));
        };

        self.tokio_config.codec.reset_for_new_connection(client.connection_protocol_version());

        let (stream_reader, mut stream_writer) = split(stream);
        tokio::pin!(stream_reader);

        let mut should_flush = false;
        let mut write_directive : Option<WriteDirective>;

        let mut next_state = None;
        while next_state.is_none() {
            trace!("tokio - process_connected loop");

            let now = Instant::now();
            let next_service_time_option = client.get_next_connected_service_time(now);
            let service_wait: Option<tokio::time::Sleep> = next_service_time_option.map(|next_service_time| sleep(next_service_time.saturating_duration_since(now)));

            let outbound_slice_option: Option<&[u8]> =
                if cumulative_bytes_written < outbound_data.len() {
                    Some(&outbound_data[cumulative_bytes_written..])
                } else {
                    None
                };

            if should_flush {
                debug!("tokio - process_connected - flushing previous write");
                write_directive = Some(WriteDirective::Flush);
            } else if let Some(outbound_slice) = outbound_slice_option {
                debug!("tokio - process_connected - {} bytes to write", outbound_slice.len());
                write_directive = Some(WriteDirective::Bytes(outbound_slice))
            } else {
                trace!("tokio - process_connected - nothing to write");
                write_directive = None;
            }

            tokio::select! {
                // incoming user operations future
                operation_result = self.operation_receiver.recv() => {
                    debug!("tokio - process_connected - user operation received");
                    Self::handle_operation_result(client, operation_result);
                }
                // incoming data on the socket future
                read_result = stream_reader.read(inbound_data.as_mut_slice()) => {
                    match read_result {
                        Ok(bytes_read) => {
                            debug!("tokio - process_connected - read {} bytes from connection stream", bytes_read);

                            if bytes_read == 0 {
                                info!("tokio - process_connected - connection closed for read (0 bytes)");
                                client.apply_error(MqttError::new_connection_closed("network stream closed"));
                                next_state = Some(SessionImplState::PendingReconnect);
                            } else {
                                inbound_buffer.extend_from_slice(&inbound_data[..bytes_read]);
                                if let Err(error) = self.decode_inbound_packets(client, &mut inbound_buffer) {
                                    info!("tokio - process_connected - error handling incoming bytes: {:?}", error);
                                    client.apply_error(error);
                                    next_state = Some(SessionImplState::PendingReconnect);
                                }
                            }
                        }
                        Err(error) => {
                            info!("tokio - process_connected - connection stream read failed: {:?}", error);
                            if client.is_connection_established() {
                                client.apply_error(MqttError::new_connection_closed(error));
                            } else {
                                client.apply_error(MqttError::new_connection_establishment_failure(error));
                            }
                            next_state = Some(SessionImplState::PendingReconnect);
                        }
                    }
                }
                // session service future (if relevant)
                Some(_) = conditional_wait(service_wait) => {
                    debug!("tokio - process_connected - running session service task");
                    let service_result =
                        match client.handle_service(&mut outbound_packets, Instant::now()) {
                            Ok(()) => { self.encode_outbound_packets(&mut outbound_packets, &mut outbound_data) }
                            Err(error) => { Err(error) }
                        };

                    if let Err(error) = service_result {
                        client.apply_error(error);
                        next_state = Some(SessionImplState::PendingReconnect);
                    }
                }
                // outbound data future (if relevant)
                Some(bytes_written_result) = conditional_write(write_directive, &mut stream_writer) => {
                    match bytes_written_result {
                        Ok(bytes_written) => {
                            debug!("tokio - process_connected - wrote {} bytes to connection stream", bytes_written);
                            if should_flush {
                                should_flush = false;
                                if let Err(error) = client.handle_write_completion(Instant::now()) {
                                    info!("tokio - process_connected - stream write completion handler failed: {:?}", error);
                                    client.apply_error(error);
                                    next_state = Some(SessionImplState::PendingReconnect);
                                }
                            } else {
                                cumulative_bytes_written += bytes_written;
                                if cumulative_bytes_written == outbound_data.len() {
                                    outbound_data.clear();
                                    cumulative_bytes_written = 0;
                                    should_flush = true;
                                }
                            }
                        }
                        Err(error) => {
                            info!("tokio - process_connected - connection stream write failed: {:?}", error);
                            if client.is_connection_established() {
                                client.apply_error(MqttError::new_connection_closed(error));
                            } else {
                                client.apply_error(MqttError::new_connection_establishment_failure(error));
                            }
                            next_state = Some(SessionImplState::PendingReconnect);
                        }
                    }
                }
            }

            if next_state.is_none() {
                next_state = client.compute_optional_state_transition();
            }
        }

        info!("tokio - process_connected - shutting down stream");
        let _ = stream_writer.shutdown().await;
        info!("tokio - process_connected - stream fully closed");

        Ok(next_state.unwrap_or(SessionImplState::PendingReconnect))
    }

    pub(crate) async fn process_pending_reconnect(&mut self, client: &mut SessionImpl, wait: Duration) -> MqttResult<SessionImplState> {
        let reconnect_timer = sleep(wait);
        tokio::pin!(reconnect_timer);

        loop {
            trace!("tokio - process_pending_reconnect loop");

            tokio::select! {
                operation_result = self.operation_receiver.recv() => {
                    debug!("tokio - process_pending_reconnect - user operation received");
                    Self::handle_operation_result(client, operation_result);
                }
                () = &mut reconnect_timer => {
                    info!("tokio - process_pending_reconnect - reconnect timer exceeded");
                    return Ok(SessionImplState::Connecting);
                }
            }

            if let Some(transition_state) = client.compute_optional_state_transition() {
                return Ok(transition_state);
            }
        }
    }
}

async fn conditional_wait(wait_option: Option<tokio::time::Sleep>) -> Option<()> {
    match wait_option {
        Some(timer) => {
            timer.await;
            Some(())
        },
        None => None,
    }
}

enum WriteDirective<'a> {
    Bytes(&'a[u8]),
    Flush
}

async fn conditional_write<'a, T>(directive: Option<WriteDirective<'a>>, writer: &mut WriteHalf<T>) -> Option<std::io::Result<usize>> where T : AsyncRead + AsyncWrite {
    match directive {
        Some(WriteDirective::Bytes(bytes)) => {
            Some(writer.write(bytes).await)
        }
        Some(WriteDirective::Flush) => {
            if let Err(error) = writer.flush().await {
                Some(Err(error))
            } else {
                Some(Ok(0))
            }
        }
        _ => { None }
    }
}

pub(crate) fn create_runtime_states<T>(tokio_config: TokioSessionOptions<T>) -> (mpsc::UnboundedSender<OperationOptions>, SessionRuntimeState<T>) where T : AsyncRead + AsyncWrite + Send + Sync + 'static {
    let (sender, receiver) = mpsc::unbounded_channel();

    let impl_state = SessionRuntimeState {
        tokio_config,
        operation_receiver: receiver,
        stream: None
    };

    (sender, impl_state)
}

async fn session_event_loop<T>(session_impl: &mut SessionImpl, async_state: &mut SessionRuntimeState<T>) where T : AsyncRead + AsyncWrite + Send + Sync + 'static {
    let mut done = false;
    while !done {
        let current_state = session_impl.get_current_state();
        let next_state_result =
            match current_state {
                SessionImplState::Disconnected | SessionImplState::Closed => { async_state.process_idle(session_impl).await }
                SessionImplState::Connecting => { async_state.process_connecting(session_impl).await }
                SessionImplState::Connected => { async_state.process_connected(session_impl).await }
                SessionImplState::PendingReconnect => {
                    let reconnect_wait = session_impl.compute_reconnect_period();
                    async_state.process_pending_reconnect(session_impl, reconnect_wait).await
                }
                SessionImplState::Shutdown => { Ok(SessionImplState::Shutdown) }
            };

        done = true;
        match next_state_result {
            Ok(next_state) => {
                match session_impl.transition_to_state(next_state, Instant::now()) {
                    Ok(()) => {
                        done = session_impl.get_current_state() == SessionImplState::Shutdown;
                    }
                    Err(error) => {
                        error!("tokio - session event loop - state transition failed: {}", error);
                    }
                }
            }
            Err(error) => {
                error!("tokio - session event loop - state processing failed: {}", error);
            }
        }
    }

    session_impl.shutdown(Instant::now());

    info!("tokio - session event loop exiting");
}

pub(crate) fn spawn_session_impl<T>(
    mut session_impl: SessionImpl,
    mut runtime_state: SessionRuntimeState<T>,
    runtime_handle: &runtime::Handle,
) where T : AsyncRead + AsyncWrite + Send + Sync + 'static {
    runtime_handle.spawn(async move {
        session_event_loop(&mut session_impl, &mut runtime_state).await;
    });
}

// A decoded packet must consume at least one byte and no more than were available
fn check_consumed_byte_count(consumed: usize, available: usize) -> MqttResult<()> {
    if consumed == 0 || consumed > available {
        error!("tokio - decode_inbound_packets - codec reported {} bytes consumed from a {} byte buffer", consumed, available);
        return Err(MqttError::new_protocol_violation("codec reported an invalid consumed byte count"));
    }

    Ok(())
}
