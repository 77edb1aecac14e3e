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
use super::session::Transport;
use crate::broker::SharedBroker;
use crate::server_error::ServerError;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// A running acceptor; dropping it does not stop the accept loop, call
/// [`ListenerHandle::stop`].
pub struct ListenerHandle {
    pub address: SocketAddr,
    pub(crate) task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn stop(&self) {
        self.task.abort();
    }
}

pub async fn start_tcp_listener(
    bind_address: &str,
    broker: SharedBroker,
) -> Result<ListenerHandle, ServerError> {
    let listener = TcpListener::bind(bind_address)
        .await
        .map_err(|source| ServerError::Bind {
            address: bind_address.to_owned(),
            source,
        })?;
    let address = listener.local_addr().map_err(|source| ServerError::Bind {
        address: bind_address.to_owned(),
        source,
    })?;
    info!("Broker has started on TCP address: {address}");
    let task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    let _ = stream.set_nodelay(true);
                    let broker = broker.clone();
                    tokio::spawn(handle_connection(stream, broker, Transport::Plain, remote));
                }
                Err(accept_error) => {
                    error!("Failed to accept a TCP connection: {accept_error}");
                }
            }
        }
    });
    Ok(ListenerHandle { address, task })
}
