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

//! In-process cluster harness: broker nodes sharing one metadata store and
//! one message log, each with its own TCP listener on a random port, driven
//! through the public SDK.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use strix::{ClientConfig, MessageHandler, PubSubClient};
use strix_common::Message;
use strix_server::broker::{Broker, SharedBroker};
use strix_server::configs::ServerConfig;
use strix_server::metadata::MetadataStore;
use strix_server::delivery::FilterRegistry;
use strix_server::metadata::MemoryMetadataStore;
use strix_server::persistence::MemoryLog;
use strix_server::tcp::{start_tcp_listener, ListenerHandle};
use tokio::sync::{Mutex, Notify};

pub struct TestNode {
    pub broker: SharedBroker,
    pub listener: ListenerHandle,
    port: u16,
}

impl TestNode {
    /// The `host:port:sslPort` triplet clients use as a seed.
    pub fn address(&self) -> String {
        format!("127.0.0.1:{}:0", self.port)
    }

    /// Simulates an abrupt node death: the listener and all live
    /// connections drop without any flush, then the node's metadata
    /// session expires and its ownership claims vanish.
    pub async fn kill(&self, metadata: &MemoryMetadataStore) {
        self.listener.stop();
        self.broker.crash();
        let _ = metadata
            .expire_session(self.broker.metadata_session())
            .await;
    }

    pub async fn shutdown(&self) {
        self.listener.stop();
        self.broker.shutdown().await;
    }
}

pub struct TestCluster {
    pub metadata: Arc<MemoryMetadataStore>,
    pub log: Arc<MemoryLog>,
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    pub async fn start(node_count: usize) -> Self {
        let metadata = Arc::new(MemoryMetadataStore::new());
        let log = Arc::new(MemoryLog::new());
        let mut nodes = Vec::with_capacity(node_count);
        for _ in 0..node_count {
            nodes.push(start_node(metadata.clone(), log.clone()).await);
        }
        Self {
            metadata,
            log,
            nodes,
        }
    }

    /// A client seeded at the given node.
    pub fn client(&self, seed_node: usize) -> PubSubClient {
        self.client_with(seed_node, |_| {})
    }

    pub fn client_with(
        &self,
        seed_node: usize,
        customize: impl FnOnce(&mut ClientConfig),
    ) -> PubSubClient {
        let mut config = ClientConfig {
            seed_address: self.nodes[seed_node].address(),
            request_timeout: Duration::from_secs(5),
            max_server_redirects: 4,
            ..Default::default()
        };
        customize(&mut config);
        PubSubClient::new(config).expect("client config")
    }
}

async fn start_node(metadata: Arc<MemoryMetadataStore>, log: Arc<MemoryLog>) -> TestNode {
    let port = free_port();
    let mut config = ServerConfig::default();
    config.node.hostname = "127.0.0.1".to_owned();
    config.tcp.address = format!("127.0.0.1:{port}");
    // Tight intervals keep scenario timing short.
    config.subscriptions.consume_interval = 1;
    config.subscriptions.retention_check_interval = Duration::from_millis(100);
    let broker = Broker::start(config, metadata, log, FilterRegistry::default())
        .await
        .expect("broker start");
    let listener = start_tcp_listener(&format!("127.0.0.1:{port}"), broker.clone())
        .await
        .expect("listener start");
    TestNode {
        broker,
        listener,
        port,
    }
}

/// Grabs a currently free TCP port. The tiny window between probing and
/// binding is tolerable for tests.
pub fn free_port() -> u16 {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("probe bind");
    let port = probe.local_addr().expect("probe addr").port();
    drop(probe);
    port
}

/// Handler collecting every delivered message, with a wait helper.
#[derive(Default)]
pub struct CollectingHandler {
    messages: Mutex<Vec<Message>>,
    arrived: Notify,
}

impl CollectingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.messages.lock().await.clone()
    }

    pub async fn delivered_seqs(&self) -> Vec<u64> {
        self.messages
            .lock()
            .await
            .iter()
            .map(|message| {
                message
                    .msg_id
                    .as_ref()
                    .map(|msg_id| msg_id.local_component)
                    .unwrap_or(0)
            })
            .collect()
    }

    /// Waits until at least `count` messages arrived.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<Message> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            // Register before checking so an arrival in between still wakes.
            notified.as_mut().enable();
            {
                let messages = self.messages.lock().await;
                if messages.len() >= count {
                    return messages.clone();
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let messages = self.messages.lock().await;
                panic!(
                    "timed out waiting for {count} messages, got {}",
                    messages.len()
                );
            }
        }
    }
}

#[async_trait]
impl MessageHandler for CollectingHandler {
    async fn handle(&self, _topic: &Bytes, _subscriber_id: &Bytes, message: Message) {
        self.messages.lock().await.push(message);
        self.arrived.notify_waiters();
    }
}
