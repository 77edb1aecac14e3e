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

use super::connection::handle_connection;
use super::listener::ListenerHandle;
use super::session::Transport;
use crate::broker::SharedBroker;
use crate::configs::TcpTlsConfig;
use crate::server_error::ServerError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

/// Second acceptor sharing the plaintext handler stack; sessions carry the
/// TLS transport tag so redirects advertise the right port of the triplet.
pub async fn start_tls_listener(
    config: &TcpTlsConfig,
    broker: SharedBroker,
) -> Result<ListenerHandle, ServerError> {
    let certs = load_certs(&config.cert_file)?;
    let key = load_key(&config.key_file)?;
    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|error| ServerError::TlsConfig(error.to_string()))?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let listener = TcpListener::bind(&config.address)
        .await
        .map_err(|source| ServerError::Bind {
            address: config.address.clone(),
            source,
        })?;
    let address = listener.local_addr().map_err(|source| ServerError::Bind {
        address: config.address.clone(),
        source,
    })?;
    info!("Broker has started on TCP TLS address: {address}");
    let task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    let _ = stream.set_nodelay(true);
                    let acceptor = acceptor.clone();
                    let broker = broker.clone();
                    tokio::spawn(async move {
                        match acceptor.accept(stream).await {
                            Ok(tls_stream) => {
                                handle_connection(tls_stream, broker, Transport::Tls, remote).await;
                            }
                            Err(handshake_error) => {
                                error!("TLS handshake with {remote} failed: {handshake_error}");
                            }
                        }
                    });
                }
                Err(accept_error) => {
                    error!("Failed to accept a TLS connection: {accept_error}");
                }
            }
        }
    });
    Ok(ListenerHandle { address, task })
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let file = File::open(path).map_err(|source| ServerError::Tls {
        path: path.to_owned(),
        source,
    })?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| ServerError::Tls {
            path: path.to_owned(),
            source,
        })
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, ServerError> {
    let file = File::open(path).map_err(|source| ServerError::Tls {
        path: path.to_owned(),
        source,
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|source| ServerError::Tls {
            path: path.to_owned(),
            source,
        })?
        .ok_or_else(|| ServerError::TlsConfig(format!("no private key found in: {path}")))
}
