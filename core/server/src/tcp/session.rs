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

use crate::delivery::{DeliveryEndpoint, EndpointClosed};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use strix_common::PubSubResponse;
use tokio::sync::{mpsc, Notify};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    Plain,
    Tls,
}

pub(crate) enum Outbound {
    Frame(PubSubResponse),
    /// Flush what was queued before this marker, then shut the socket down.
    Shutdown,
}

/// One accepted connection as the handlers and the delivery engine see it:
/// an id, a transport tag for redirect triplets, and the outbound frame
/// queue feeding the connection's writer task.
pub struct ConnSession {
    pub id: u64,
    pub remote: SocketAddr,
    pub transport: Transport,
    out: mpsc::Sender<Outbound>,
    close_notify: Notify,
    closed: AtomicBool,
}

impl ConnSession {
    pub(crate) fn new(
        id: u64,
        remote: SocketAddr,
        transport: Transport,
        out: mpsc::Sender<Outbound>,
    ) -> Self {
        Self {
            id,
            remote,
            transport,
            out,
            close_notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Queues a frame behind everything already queued. Fails only when the
    /// connection is gone.
    pub async fn send_frame(&self, response: PubSubResponse) -> Result<(), EndpointClosed> {
        self.out
            .send(Outbound::Frame(response))
            .await
            .map_err(|_| EndpointClosed)
    }

    /// Writes the response and closes the connection after it was flushed.
    pub async fn send_and_close(&self, response: PubSubResponse) {
        let _ = self.out.send(Outbound::Frame(response)).await;
        let _ = self.out.send(Outbound::Shutdown).await;
    }

    /// Abrupt close: wakes the reader loop and stops the writer without
    /// draining the outbound queue.
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_notify.notify_one();
            let _ = self.out.try_send(Outbound::Shutdown);
        }
    }

    pub async fn wait_closed(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.close_notify.notified().await;
    }
}

#[async_trait]
impl DeliveryEndpoint for ConnSession {
    async fn send(&self, response: PubSubResponse) -> Result<(), EndpointClosed> {
        self.send_frame(response).await
    }

    fn close(&self) {
        self.shutdown();
    }
}
