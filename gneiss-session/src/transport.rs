/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Connection factories that produce the byte streams a session runs over.

TCP is always available.  TLS (via [`rustls`](https://crates.io/crates/rustls)) is available with
the `tokio-rustls` feature, and websockets (via
[`tokio-tungstenite`](https://crates.io/crates/tokio-tungstenite)) with the `tokio-websockets`
feature.  Secure websockets need both.
 */

use crate::client::tokio_impl::{TokioConnectionFactoryReturnType, TokioSessionOptions};
use crate::codec::Codec;
use crate::config::{BrokerEndpoint, TransportKind};
use crate::error::{MqttError, MqttResult};

use log::*;
use std::future::Future;
use std::net::{SocketAddr, ToSocketAddrs};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

#[cfg(feature = "tokio-rustls")]
use std::fs::File;
#[cfg(feature = "tokio-rustls")]
use std::io::Read;
#[cfg(feature = "tokio-rustls")]
use std::sync::Arc;

#[cfg(feature = "tokio-websockets")]
use http::{Uri, Version};
#[cfg(feature = "tokio-websockets")]
use stream_ws::{tungstenite::WsMessageHandler, WsMessageHandle, WsByteStream};
#[cfg(feature = "tokio-websockets")]
use tokio_tungstenite::{client_async, WebSocketStream};
#[cfg(feature = "tokio-websockets")]
use tungstenite::{client::IntoClientRequest, handshake::client::generate_key, Message};

/// Any stream a session can run over
pub trait TransportStream : AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T> TransportStream for T where T : AsyncRead + AsyncWrite + Send + Sync + Unpin {}

/// Type-erased transport stream, used when the transport is chosen at runtime from a broker url
pub type BoxedTransportStream = Box<dyn TransportStream>;

type BoxedConnectionFactory = Box<dyn Fn() -> TokioConnectionFactoryReturnType<BoxedTransportStream> + Send + Sync>;

pub(crate) fn make_addr(host: &str, port: u16) -> MqttResult<SocketAddr> {
    let mut to_socket_addrs = (host.to_string(), port).to_socket_addrs()?;

    to_socket_addrs.next().ok_or_else(|| {
        MqttError::new_connection_establishment_failure(format!("no addresses resolved for {}:{}", host, port))
    })
}

/// Opens a TCP connection to the broker endpoint
pub async fn make_leaf_stream(endpoint: BrokerEndpoint) -> MqttResult<TcpStream> {
    let addr = make_addr(endpoint.host.as_str(), endpoint.port)?;
    debug!("make_leaf_stream - opening TCP stream to {}", addr);
    let stream = TcpStream::connect(&addr).await?;
    debug!("make_leaf_stream - TCP stream successfully established");

    Ok(stream)
}

async fn box_stream<S>(stream: Pin<Box<impl Future<Output=MqttResult<S>>+Sized>>) -> MqttResult<BoxedTransportStream> where S : TransportStream + 'static {
    let inner_stream = stream.await?;
    Ok(Box::new(inner_stream))
}

fn make_boxed_tcp_factory(endpoint: &BrokerEndpoint) -> BoxedConnectionFactory {
    let stream_endpoint = endpoint.clone();

    Box::new(move || {
        let tcp_stream = Box::pin(make_leaf_stream(stream_endpoint.clone()));
        Box::pin(box_stream(tcp_stream))
    })
}

/// Creates tokio session options whose connection factory follows the endpoint's transport.
///
/// Secure transports use a TLS configuration built from the system trust store.  Fails with
/// [`MqttError::InvalidConfiguration`] if the transport needs a feature that is not enabled.
pub fn make_session_options_for_endpoint(endpoint: &BrokerEndpoint, codec: Box<dyn Codec>) -> MqttResult<TokioSessionOptions<BoxedTransportStream>> {
    let connection_factory =
        match endpoint.transport {
            TransportKind::Tcp => { make_boxed_tcp_factory(endpoint) }
            TransportKind::Websocket => { make_boxed_websocket_factory(endpoint)? }
            TransportKind::Tls | TransportKind::SecureWebsocket => { make_default_secure_factory(endpoint)? }
        };

    info!("make_session_options_for_endpoint - {:?} to {}:{}", endpoint.transport, endpoint.host, endpoint.port);

    Ok(TokioSessionOptions {
        connection_factory,
        codec
    })
}

/// Creates tokio session options whose connection factory follows the endpoint's transport,
/// using the supplied TLS configuration for secure transports.
#[cfg(feature = "tokio-rustls")]
pub fn make_session_options_for_endpoint_with_tls(endpoint: &BrokerEndpoint, tls_options: TlsOptions, codec: Box<dyn Codec>) -> MqttResult<TokioSessionOptions<BoxedTransportStream>> {
    let connection_factory =
        match endpoint.transport {
            TransportKind::Tcp => { make_boxed_tcp_factory(endpoint) }
            TransportKind::Websocket => { make_boxed_websocket_factory(endpoint)? }
            TransportKind::Tls => { make_boxed_tls_factory(endpoint, tls_options) }
            TransportKind::SecureWebsocket => { make_boxed_secure_websocket_factory(endpoint, tls_options)? }
        };

    info!("make_session_options_for_endpoint_with_tls - {:?} to {}:{}", endpoint.transport, endpoint.host, endpoint.port);

    Ok(TokioSessionOptions {
        connection_factory,
        codec
    })
}

#[cfg(feature = "tokio-rustls")]
fn make_default_secure_factory(endpoint: &BrokerEndpoint) -> MqttResult<BoxedConnectionFactory> {
    let tls_options = TlsOptionsBuilder::new().build_rustls()?;

    match endpoint.transport {
        TransportKind::SecureWebsocket => { make_boxed_secure_websocket_factory(endpoint, tls_options) }
        _ => { Ok(make_boxed_tls_factory(endpoint, tls_options)) }
    }
}

#[cfg(not(feature = "tokio-rustls"))]
fn make_default_secure_factory(endpoint: &BrokerEndpoint) -> MqttResult<BoxedConnectionFactory> {
    Err(MqttError::new_invalid_configuration(format!("{:?} transport requires the tokio-rustls feature", endpoint.transport)))
}

/*****************************************************************************************/
/* TLS */

/// Opaque TLS configuration for secure transports
#[cfg(feature = "tokio-rustls")]
#[derive(Clone)]
pub struct TlsOptions {
    pub(crate) config: Arc<rustls::ClientConfig>
}

#[cfg(feature = "tokio-rustls")]
impl TlsOptions {

    /// Wraps a caller-built rustls client configuration
    pub fn from_rustls_config(config: Arc<rustls::ClientConfig>) -> Self {
        TlsOptions {
            config
        }
    }
}

#[cfg(feature = "tokio-rustls")]
fn load_file(filename: &str) -> std::io::Result<Vec<u8>> {
    let mut bytes_vec = Vec::new();
    let mut bytes_file = File::open(filename)?;
    bytes_file.read_to_end(&mut bytes_vec)?;
    Ok(bytes_vec)
}

/// Builder type for constructing TLS configuration.
#[cfg(feature = "tokio-rustls")]
#[derive(Default)]
pub struct TlsOptionsBuilder {
    root_ca_bytes: Option<Vec<u8>>,
    certificate_bytes: Option<Vec<u8>>,
    private_key_bytes: Option<Vec<u8>>,
    alpn: Option<String>
}

#[cfg(feature = "tokio-rustls")]
impl TlsOptionsBuilder {

    /// Creates a new builder object with default options: standard TLS against the system trust
    /// store.
    pub fn new() -> Self {
        TlsOptionsBuilder::default()
    }

    /// Configures the builder to create a mutual TLS context using an X509 certificate and a
    /// private key, by file path.
    pub fn new_with_mtls_from_path(certificate_path: &str, private_key_path: &str) -> MqttResult<Self> {
        let certificate_bytes = load_file(certificate_path)?;
        let private_key_bytes = load_file(private_key_path)?;

        Ok(TlsOptionsBuilder {
            certificate_bytes: Some(certificate_bytes),
            private_key_bytes: Some(private_key_bytes),
            ..Default::default()
        })
    }

    /// Configures the builder to create a mutual TLS context using an X509 certificate and a
    /// private key, from memory.
    pub fn new_with_mtls_from_memory(certificate_bytes: &[u8], private_key_bytes: &[u8]) -> Self {
        TlsOptionsBuilder {
            certificate_bytes: Some(certificate_bytes.to_vec()),
            private_key_bytes: Some(private_key_bytes.to_vec()),
            ..Default::default()
        }
    }

    /// Configures the builder to use a trust store that only contains the PEM certificates in
    /// a file.
    pub fn with_root_ca_from_path(&mut self, root_ca_path: &str) -> MqttResult<&mut Self> {
        self.root_ca_bytes = Some(load_file(root_ca_path)?);
        Ok(self)
    }

    /// Configures the builder to use a trust store that only contains the supplied PEM
    /// certificates.
    pub fn with_root_ca_from_memory(&mut self, root_ca_bytes: &[u8]) -> &mut Self {
        self.root_ca_bytes = Some(root_ca_bytes.to_vec());
        self
    }

    /// Sets an ALPN protocol to negotiate during the TLS handshake
    pub fn with_alpn(&mut self, alpn: &str) -> &mut Self {
        self.alpn = Some(alpn.to_string());
        self
    }

    /// Builds client TLS options using the `rustls` crate
    pub fn build_rustls(&self) -> MqttResult<TlsOptions> {
        let root_cert_store = build_root_ca_store(self.root_ca_bytes.as_deref())?;

        let builder = rustls::ClientConfig::builder().with_root_certificates(root_cert_store);
        let mut config =
            match (self.certificate_bytes.as_deref(), self.private_key_bytes.as_deref()) {
                (Some(certificate_bytes), Some(private_key_bytes)) => {
                    let certs = build_certs(certificate_bytes)?;
                    let private_key = build_private_key(private_key_bytes)?;
                    builder.with_client_auth_cert(certs, private_key)?
                }
                _ => {
                    builder.with_no_client_auth()
                }
            };

        if let Some(alpn) = &self.alpn {
            config.alpn_protocols.push(alpn.as_bytes().to_vec());
        }

        Ok(TlsOptions {
            config: Arc::new(config)
        })
    }
}

#[cfg(feature = "tokio-rustls")]
fn build_root_ca_store(root_ca_bytes: Option<&[u8]>) -> MqttResult<rustls::RootCertStore> {
    let mut root_cert_store = rustls::RootCertStore::empty();
    if let Some(root_ca_bytes) = root_ca_bytes {
        let mut pem = std::io::BufReader::new(root_ca_bytes);
        for cert in rustls_pemfile::certs(&mut pem) {
            root_cert_store.add(cert?)?;
        }
    } else {
        let system_certs = rustls_native_certs::load_native_certs()?;
        let (added, ignored) = root_cert_store.add_parsable_certificates(system_certs);
        debug!("build_root_ca_store - loaded {} system certificates, ignored {}", added, ignored);
    }

    Ok(root_cert_store)
}

#[cfg(feature = "tokio-rustls")]
fn build_private_key(key_bytes: &[u8]) -> MqttResult<rustls_pki_types::PrivateKeyDer<'static>> {
    let mut reader = std::io::BufReader::new(key_bytes);

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => { return Ok(key.into()); }
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => { return Ok(key.into()); }
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => { return Ok(key.into()); }
            Ok(None) => { return Err(MqttError::new_tls_error("no valid private keys found")); }
            Ok(_) => {}
            Err(_) => { return Err(MqttError::new_tls_error("failed to parse private key pem file")); }
        }
    }
}

#[cfg(feature = "tokio-rustls")]
fn build_certs(certificate_bytes: &[u8]) -> MqttResult<Vec<rustls_pki_types::CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(certificate_bytes);

    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(MqttError::new_tls_error("no valid certificates found"));
    }

    Ok(certs)
}

/// Performs a TLS handshake over a stream once the stream's future resolves
#[cfg(feature = "tokio-rustls")]
pub async fn wrap_stream_with_tls_rustls<S>(stream : Pin<Box<impl Future<Output=MqttResult<S>>+Sized>>, host: String, tls_options: TlsOptions) -> MqttResult<tokio_rustls::client::TlsStream<S>> where S : AsyncRead + AsyncWrite + Unpin {
    let domain = rustls_pki_types::ServerName::try_from(host)?
        .to_owned();

    let connector = tokio_rustls::TlsConnector::from(tls_options.config.clone());

    debug!("wrap_stream_with_tls_rustls - performing tls handshake");
    let inner_stream = stream.await?;
    let tls_stream = connector.connect(domain, inner_stream).await?;
    debug!("wrap_stream_with_tls_rustls - tls handshake successfully completed");

    Ok(tls_stream)
}

#[cfg(feature = "tokio-rustls")]
fn make_boxed_tls_factory(endpoint: &BrokerEndpoint, tls_options: TlsOptions) -> BoxedConnectionFactory {
    let stream_endpoint = endpoint.clone();

    Box::new(move || {
        let tcp_stream = Box::pin(make_leaf_stream(stream_endpoint.clone()));
        let tls_stream = Box::pin(wrap_stream_with_tls_rustls(tcp_stream, stream_endpoint.host.clone(), tls_options.clone()));
        Box::pin(box_stream(tls_stream))
    })
}

/*****************************************************************************************/
/* Websockets */

#[cfg(feature = "tokio-websockets")]
pub(crate) struct HandshakeRequest {
    pub(crate) handshake_builder: http::request::Builder,
}

#[cfg(feature = "tokio-websockets")]
impl IntoClientRequest for HandshakeRequest {
    fn into_client_request(self) -> tungstenite::Result<tungstenite::handshake::client::Request> {
        let final_request = self.handshake_builder.body(()).map_err(tungstenite::Error::HttpFormat)?;
        Ok(tungstenite::handshake::client::Request::from(final_request))
    }
}

#[cfg(feature = "tokio-websockets")]
pub(crate) fn create_default_websocket_handshake_request(uri: &str) -> MqttResult<http::request::Builder> {
    let uri = uri.parse::<Uri>()?;
    let host = uri.host()
        .ok_or_else(|| MqttError::new_invalid_configuration("websocket uri has no host"))?
        .to_string();

    Ok(http::Request::builder()
        .uri(uri.to_string())
        .version(Version::HTTP_11)
        .header("Sec-WebSocket-Protocol", "mqtt")
        .header("Sec-WebSocket-Key", generate_key())
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", 13)
        .header("Host", host))
}

/// Performs a websocket upgrade over a stream once the stream's future resolves, yielding a
/// byte stream that carries MQTT data in binary websocket frames
#[cfg(feature = "tokio-websockets")]
pub async fn wrap_stream_with_websockets<S>(stream : Pin<Box<impl Future<Output=MqttResult<S>>+Sized>>, uri: String) -> MqttResult<WsByteStream<WebSocketStream<S>, Message, tungstenite::Error, WsMessageHandler>> where S : AsyncRead + AsyncWrite + Unpin {
    let handshake_builder = create_default_websocket_handshake_request(uri.as_str())?;

    debug!("wrap_stream_with_websockets - upgrading stream to websockets");
    let inner_stream = stream.await?;
    let (message_stream, _) = client_async(HandshakeRequest { handshake_builder }, inner_stream).await?;
    let byte_stream = WsMessageHandler::wrap_stream(message_stream);
    debug!("wrap_stream_with_websockets - successfully upgraded stream to websockets");

    Ok(byte_stream)
}

#[cfg(feature = "tokio-websockets")]
fn make_boxed_websocket_factory(endpoint: &BrokerEndpoint) -> MqttResult<BoxedConnectionFactory> {
    let stream_endpoint = endpoint.clone();
    let uri = endpoint.websocket_uri();

    let connection_factory : BoxedConnectionFactory = Box::new(move || {
        let tcp_stream = Box::pin(make_leaf_stream(stream_endpoint.clone()));
        let ws_stream = Box::pin(wrap_stream_with_websockets(tcp_stream, uri.clone()));
        Box::pin(box_stream(ws_stream))
    });

    Ok(connection_factory)
}

#[cfg(not(feature = "tokio-websockets"))]
fn make_boxed_websocket_factory(_endpoint: &BrokerEndpoint) -> MqttResult<BoxedConnectionFactory> {
    Err(MqttError::new_invalid_configuration("websocket transport requires the tokio-websockets feature"))
}

#[cfg(all(feature = "tokio-rustls", feature = "tokio-websockets"))]
fn make_boxed_secure_websocket_factory(endpoint: &BrokerEndpoint, tls_options: TlsOptions) -> MqttResult<BoxedConnectionFactory> {
    let stream_endpoint = endpoint.clone();
    let uri = endpoint.websocket_uri();

    let connection_factory : BoxedConnectionFactory = Box::new(move || {
        let tcp_stream = Box::pin(make_leaf_stream(stream_endpoint.clone()));
        let tls_stream = Box::pin(wrap_stream_with_tls_rustls(tcp_stream, stream_endpoint.host.clone(), tls_options.clone()));
        let ws_stream = Box::pin(wrap_stream_with_websockets(tls_stream, uri.clone()));
        Box::pin(box_stream(ws_stream))
    });

    Ok(connection_factory)
}

#[cfg(all(feature = "tokio-rustls", not(feature = "tokio-websockets")))]
fn make_boxed_secure_websocket_factory(_endpoint: &BrokerEndpoint, _tls_options: TlsOptions) -> MqttResult<BoxedConnectionFactory> {
    Err(MqttError::new_invalid_configuration("secure websocket transport requires the tokio-websockets feature"))
}
