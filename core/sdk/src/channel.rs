/* Licensed to the Apache Software Foundation (ASF) under one
 * or more contributor license agreements.  See the NOTICE file
 * distributed with this work for additional information
 * regarding copyright ownership.  The ASF licenses this file
 * to you under the Apache License, Version 2.0 (the
 * "License"); you may not use this file except in compliance
 * with the License.  You may obtain a copy of the License at
 *
 *   http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing,
 * software distributed under the License is distributed on an
 * "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
 * KIND, either express or implied.  See the License for the
 * specific language governing permissions and limitations
 * under the License.
 */

//! One physical connection to a broker: a writer task draining the request
//! queue, a reader task demultiplexing acks to pending requests and pushed
//! messages to the subscription's delivery queue.

use crate::config::ClientConfig;
use bytes::{BufMut, BytesMut};
use dashmap::DashMap;
use prost::Message as _;
use rustls::pki_types::ServerName;
use std::io::BufReader;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strix_common::{
    BrokerAddress, Message, PubSubRequest, PubSubResponse, ResponsePayload, StrixError,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{trace, warn};

const REQUEST_QUEUE_CAPACITY: usize = 256;
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

static CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Invoked with the channel id when the connection drops without an
/// explicit close.
pub(crate) type DisconnectHook = Box<dyn Fn(u64) + Send + Sync>;

pub(crate) struct NetChannel {
    pub id: u64,
    pub address: BrokerAddress,
    out: mpsc::Sender<PubSubRequest>,
    pending: DashMap<u64, oneshot::Sender<Result<PubSubResponse, StrixError>>>,
    delivery_tx: mpsc::Sender<Message>,
    delivery_rx: std::sync::Mutex<Option<mpsc::Receiver<Message>>>,
    alive: AtomicBool,
    closed_explicitly: AtomicBool,
    on_disconnect: DisconnectHook,
    io_tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl NetChannel {
    /// Connects a channel. `read_timeout` is set on subscribe channels:
    /// going that long without any inbound frame closes the channel, which
    /// triggers the subscription's reconnect recovery.
    pub async fn connect(
        address: BrokerAddress,
        config: &ClientConfig,
        read_timeout: Option<Duration>,
        on_disconnect: DisconnectHook,
    ) -> Result<Arc<Self>, StrixError> {
        let socket_addr = if config.tls.enabled {
            address.ssl_addr()
        } else {
            address.plain_addr()
        };
        let stream = TcpStream::connect(&socket_addr)
            .await
            .map_err(|error| StrixError::CouldNotConnect(format!("{socket_addr}: {error}")))?;
        let _ = stream.set_nodelay(true);

        let (out_tx, out_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let (delivery_tx, delivery_rx) = mpsc::channel(config.delivery_buffer);
        let channel = Arc::new(Self {
            id: CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            address,
            out: out_tx,
            pending: DashMap::new(),
            delivery_tx,
            delivery_rx: std::sync::Mutex::new(Some(delivery_rx)),
            alive: AtomicBool::new(true),
            closed_explicitly: AtomicBool::new(false),
            on_disconnect,
            io_tasks: std::sync::Mutex::new(Vec::new()),
        });

        if config.tls.enabled {
            let connector = tls_connector(config)?;
            let domain = if config.tls.domain.is_empty() {
                channel.address.hostname.clone()
            } else {
                config.tls.domain.clone()
            };
            let server_name = ServerName::try_from(domain)
                .map_err(|error| StrixError::CouldNotConnect(error.to_string()))?;
            let tls_stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|error| StrixError::CouldNotConnect(format!("{socket_addr}: {error}")))?;
            channel.spawn_io(tls_stream, out_rx, read_timeout);
        } else {
            channel.spawn_io(stream, out_rx, read_timeout);
        }
        trace!(
            "Connected channel: {} to: {}",
            channel.id,
            channel.address
        );
        Ok(channel)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Sends a request and awaits the matching ack. A dropped channel or an
    /// expired timeout surfaces as `UncertainState`: the server may or may
    /// not have observed the request.
    pub async fn request(
        &self,
        request: PubSubRequest,
        timeout: Duration,
    ) -> Result<PubSubResponse, StrixError> {
        let txn_id = request.txn_id;
        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending.insert(txn_id, ack_tx);
        if self.out.send(request).await.is_err() {
            self.pending.remove(&txn_id);
            return Err(StrixError::CouldNotConnect(self.address.to_string()));
        }
        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StrixError::UncertainState(
                "server connection was lost before the ack".to_owned(),
            )),
            Err(_) => {
                self.pending.remove(&txn_id);
                Err(StrixError::UncertainState(
                    "server ack was not received within the request timeout".to_owned(),
                ))
            }
        }
    }

    /// Fire-and-forget send, used for consume frames.
    pub async fn send_only(&self, request: PubSubRequest) -> Result<(), StrixError> {
        self.out
            .send(request)
            .await
            .map_err(|_| StrixError::CouldNotConnect(self.address.to_string()))
    }

    /// The pushed-message stream; taken once by the subscription driver.
    pub fn take_delivery_rx(&self) -> Option<mpsc::Receiver<Message>> {
        self.delivery_rx.lock().unwrap().take()
    }

    /// Explicit close: no disconnect recovery fires, pending requests are
    /// failed with `UncertainState`.
    pub fn close(&self) {
        self.closed_explicitly.store(true, Ordering::Release);
        self.alive.store(false, Ordering::Release);
        for task in self.io_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.fail_pending();
    }

    fn spawn_io<S>(
        self: &Arc<Self>,
        stream: S,
        mut out_rx: mpsc::Receiver<PubSubRequest>,
        read_timeout: Option<Duration>,
    ) where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);

        let writer = tokio::spawn(async move {
            while let Some(request) = out_rx.recv().await {
                let body_len = request.encoded_len();
                let mut frame = BytesMut::with_capacity(4 + body_len);
                frame.put_u32_le(body_len as u32);
                request
                    .encode(&mut frame)
                    .expect("frame buffer sized from encoded_len");
                if write_half.write_all(&frame).await.is_err() {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let channel = self.clone();
        let reader = tokio::spawn(async move {
            loop {
                let mut length_bytes = [0u8; 4];
                let header = match read_timeout {
                    Some(window) => {
                        match tokio::time::timeout(window, read_half.read_exact(&mut length_bytes))
                            .await
                        {
                            Ok(result) => result.map(|_| ()),
                            Err(_) => {
                                warn!(
                                    "No frames from {} within {window:?}, closing the channel",
                                    channel.address
                                );
                                break;
                            }
                        }
                    }
                    None => read_half.read_exact(&mut length_bytes).await.map(|_| ()),
                };
                if header.is_err() {
                    break;
                }
                let length = u32::from_le_bytes(length_bytes) as usize;
                if length > MAX_FRAME_BYTES {
                    warn!(
                        "Dropping connection to {}: frame of {length} bytes exceeds the limit",
                        channel.address
                    );
                    break;
                }
                let mut body = vec![0u8; length];
                if read_half.read_exact(&mut body).await.is_err() {
                    break;
                }
                let response = match PubSubResponse::decode(body.as_slice()) {
                    Ok(response) => response,
                    Err(error) => {
                        warn!(
                            "Dropping connection to {}: undecodable response: {error}",
                            channel.address
                        );
                        break;
                    }
                };
                channel.dispatch(response).await;
            }
            channel.handle_disconnect();
        });

        let mut tasks = self.io_tasks.lock().unwrap();
        tasks.push(writer);
        tasks.push(reader);
    }

    async fn dispatch(&self, response: PubSubResponse) {
        match response.payload {
            Some(ResponsePayload::Message(message)) => {
                // Blocking here when the delivery buffer is full is the
                // client half of flow control: the socket stops draining
                // and the server's write timeout takes over.
                if self.delivery_tx.send(message).await.is_err() {
                    trace!("Delivery stopped, dropping a pushed message");
                }
            }
            _ => match self.pending.remove(&response.txn_id) {
                Some((_, ack_tx)) => {
                    let _ = ack_tx.send(Ok(response));
                }
                None => warn!(
                    "No pending request for response txn: {} from: {}",
                    response.txn_id, self.address
                ),
            },
        }
    }

    fn handle_disconnect(&self) {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        self.fail_pending();
        if !self.closed_explicitly.load(Ordering::Acquire) {
            warn!("Channel: {} to: {} was disconnected", self.id, self.address);
            (self.on_disconnect)(self.id);
        }
    }

    fn fail_pending(&self) {
        let txn_ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for txn_id in txn_ids {
            if let Some((_, ack_tx)) = self.pending.remove(&txn_id) {
                let _ = ack_tx.send(Err(StrixError::UncertainState(
                    "server ack response never received before the connection dropped".to_owned(),
                )));
            }
        }
    }
}

fn tls_connector(config: &ClientConfig) -> Result<TlsConnector, StrixError> {
    let builder = rustls::ClientConfig::builder();
    let tls_config = if config.tls.accept_invalid_certificates {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoServerVerification))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        let Some(ca_file) = config.tls.ca_file.as_deref() else {
            return Err(StrixError::CouldNotConnect(
                "TLS enabled but no CA file configured".to_owned(),
            ));
        };
        let file = std::fs::File::open(ca_file)
            .map_err(|error| StrixError::CouldNotConnect(format!("{ca_file}: {error}")))?;
        for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
            let cert =
                cert.map_err(|error| StrixError::CouldNotConnect(format!("{ca_file}: {error}")))?;
            roots
                .add(cert)
                .map_err(|error| StrixError::CouldNotConnect(error.to_string()))?;
        }
        builder
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(tls_config)))
}

/// Certificate verifier for development setups that accepts any server
/// certificate.
#[derive(Debug)]
struct NoServerVerification;

impl rustls::client::danger::ServerCertVerifier for NoServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
