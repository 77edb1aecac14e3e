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

use super::session::{ConnSession, Outbound, Transport};
use crate::binary::{codec, router};
use crate::broker::SharedBroker;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strix_common::{PubSubRequest, PubSubResponse, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

static CONNECTION_ID: AtomicU64 = AtomicU64::new(1);
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs one accepted connection to completion: a writer task drains the
/// outbound frame queue while this task decodes requests and routes them.
/// Requests on a connection are handled one at a time, in arrival order.
pub async fn handle_connection<S>(
    stream: S,
    broker: SharedBroker,
    transport: Transport,
    remote: SocketAddr,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let id = CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let (mut read_half, write_half) = tokio::io::split(stream);
    let (out_tx, out_rx) = mpsc::channel(broker.config.delivery.outbound_queue);
    let session = Arc::new(ConnSession::new(id, remote, transport, out_tx));
    debug!("Accepted {transport:?} connection: {id} from: {remote}");

    let mut writer_task = tokio::spawn(write_loop(write_half, out_rx));
    let mut shutdown_rx = broker.shutdown_watch();
    loop {
        tokio::select! {
            _ = session.wait_closed() => break,
            _ = async { let _ = shutdown_rx.wait_for(|shutting_down| *shutting_down).await; } => break,
            frame = codec::read_frame::<PubSubRequest, _>(&mut read_half) => match frame {
                Ok(Some(request)) => router::route(&broker, &session, request).await,
                Ok(None) => break,
                Err(error) => {
                    warn!("Failed to read a request on connection: {id} from: {remote}: {error}");
                    session
                        .send_and_close(PubSubResponse::error(
                            0,
                            StatusCode::MalformedRequest,
                            error.to_string(),
                        ))
                        .await;
                    break;
                }
            }
        }
    }

    session.shutdown();
    for topic_subscriber in broker.subscriber_channels.on_channel_disconnected(id) {
        info!("Channel for subscription {topic_subscriber} was disconnected from: {remote}");
        broker.delivery.stop_serving(&topic_subscriber);
    }
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task)
        .await
        .is_err()
    {
        writer_task.abort();
    }
    debug!("Connection: {id} from: {remote} closed");
}

async fn write_loop<W>(mut writer: tokio::io::WriteHalf<W>, mut out_rx: mpsc::Receiver<Outbound>)
where
    W: AsyncWrite + Send + 'static,
{
    while let Some(outbound) = out_rx.recv().await {
        match outbound {
            Outbound::Frame(response) => {
                if codec::write_frame(&mut writer, &response).await.is_err() {
                    break;
                }
            }
            Outbound::Shutdown => break,
        }
    }
    let _ = writer.shutdown().await;
}
