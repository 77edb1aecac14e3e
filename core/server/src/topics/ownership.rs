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

use crate::metadata::{self, MetadataError, MetadataStore, WatchEvent};
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strix_common::{BrokerAddress, StrixError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;
use tracing::{error, info, warn};

const COMPONENT: &str = "OWNERSHIP_REGISTRY";
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// This node's identity for ownership claims. The incarnation id is fresh
/// per process start, so claims left behind by a previous incarnation of
/// the same address are recognized as foreign.
#[derive(Clone, Debug)]
pub struct NodeIdentity {
    pub incarnation: String,
    pub address: BrokerAddress,
}

impl NodeIdentity {
    pub fn new(address: BrokerAddress) -> Self {
        Self {
            incarnation: Uuid::new_v4().to_string(),
            address,
        }
    }
}

/// The value stored under an ownership key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OwnerRecord {
    pub incarnation: String,
    pub address: BrokerAddress,
}

#[derive(Clone, Debug)]
pub enum OwnershipEvent {
    Acquired {
        topic: Bytes,
    },
    /// `external` marks claims lost through the metadata store (session
    /// expiry or a deleted key) rather than a voluntary release.
    Released {
        topic: Bytes,
        external: bool,
    },
}

#[derive(Debug)]
pub enum ClaimOutcome {
    Acquired,
    /// Another node owns the topic; `None` when the holder's record could
    /// not be read, telling the client to fall back to its seed host.
    Redirect(Option<BrokerAddress>),
}

#[derive(Clone, Debug)]
pub struct ClaimRetryConfig {
    pub attempts: usize,
    pub backoff: Duration,
}

impl Default for ClaimRetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Maintains the "node N owns topic T" claims through ephemeral metadata
/// keys and synthesizes release events when a held key disappears
/// externally.
pub struct OwnershipRegistry {
    store: Arc<dyn MetadataStore>,
    node: NodeIdentity,
    session: AtomicU64,
    held: DashMap<Bytes, ()>,
    events_tx: mpsc::Sender<OwnershipEvent>,
    retry: ClaimRetryConfig,
    watch_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl OwnershipRegistry {
    /// Registers a metadata session and returns the registry together with
    /// the ownership-event stream the composition root drains.
    pub async fn new(
        store: Arc<dyn MetadataStore>,
        node: NodeIdentity,
        retry: ClaimRetryConfig,
    ) -> Result<(Arc<Self>, mpsc::Receiver<OwnershipEvent>), StrixError> {
        let session = store
            .register_session()
            .await
            .map_err(|error| StrixError::MetadataStore(error.to_string()))?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let registry = Arc::new(Self {
            store,
            node,
            session: AtomicU64::new(session),
            held: DashMap::new(),
            events_tx,
            retry,
            watch_task: std::sync::Mutex::new(None),
        });
        registry.start_watch();
        Ok((registry, events_rx))
    }

    pub fn node(&self) -> &NodeIdentity {
        &self.node
    }

    /// The metadata session the ephemeral claims are bound to.
    pub fn session(&self) -> crate::metadata::SessionId {
        self.session.load(Ordering::Acquire)
    }

    pub fn is_owned(&self, topic: &Bytes) -> bool {
        self.held.contains_key(topic)
    }

    pub fn owned_topics(&self) -> Vec<Bytes> {
        self.held.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Attempts to write the ephemeral ownership key for `topic`.
    ///
    /// A claim held by a different incarnation, including a stale one left
    /// by a previous incarnation of this very address, yields a redirect;
    /// the holder's session expiry will clear it.
    pub async fn claim(&self, topic: &Bytes) -> Result<ClaimOutcome, StrixError> {
        if self.held.contains_key(topic) {
            return Ok(ClaimOutcome::Acquired);
        }
        let key = metadata::owner_key(topic);
        let record = OwnerRecord {
            incarnation: self.node.incarnation.clone(),
            address: self.node.address.clone(),
        };
        let value: Bytes = serde_json::to_vec(&record)
            .map_err(|error| StrixError::MetadataStore(error.to_string()))?
            .into();

        for attempt in 1..=self.retry.attempts {
            let session = self.session.load(Ordering::Acquire);
            match self
                .store
                .create_ephemeral(session, key.clone(), value.clone())
                .await
            {
                Ok(()) => {
                    self.held.insert(topic.clone(), ());
                    info!(
                        "Acquired ownership of topic: {} as {}",
                        String::from_utf8_lossy(topic),
                        self.node.address
                    );
                    let _ = self
                        .events_tx
                        .send(OwnershipEvent::Acquired {
                            topic: topic.clone(),
                        })
                        .await;
                    return Ok(ClaimOutcome::Acquired);
                }
                Err(MetadataError::KeyExists { current }) => {
                    return Ok(match serde_json::from_slice::<OwnerRecord>(&current) {
                        Ok(owner) if owner.incarnation == self.node.incarnation => {
                            self.held.insert(topic.clone(), ());
                            ClaimOutcome::Acquired
                        }
                        Ok(owner) => ClaimOutcome::Redirect(Some(owner.address)),
                        Err(error) => {
                            warn!(
                                "{COMPONENT} (error: {error}) - unreadable owner record for topic: {}",
                                String::from_utf8_lossy(topic)
                            );
                            ClaimOutcome::Redirect(None)
                        }
                    });
                }
                Err(MetadataError::SessionExpired) => {
                    warn!(
                        "Metadata session expired, re-registering before claiming topic: {}",
                        String::from_utf8_lossy(topic)
                    );
                    match self.store.register_session().await {
                        Ok(fresh) => self.session.store(fresh, Ordering::Release),
                        Err(error) => {
                            error!("{COMPONENT} (error: {error}) - failed to re-register metadata session");
                            tokio::time::sleep(self.retry.backoff).await;
                        }
                    }
                }
                Err(error) => {
                    warn!(
                        "{COMPONENT} (error: {error}) - claim attempt {attempt}/{} failed for topic: {}",
                        self.retry.attempts,
                        String::from_utf8_lossy(topic)
                    );
                    tokio::time::sleep(self.retry.backoff).await;
                }
            }
        }
        Err(StrixError::ServerNotReady(
            String::from_utf8_lossy(topic).into_owned(),
        ))
    }

    /// Voluntarily gives the topic up and fires a release event.
    pub async fn release(&self, topic: &Bytes) {
        if self.held.remove(topic).is_none() {
            return;
        }
        if let Err(error) = self.store.delete(&metadata::owner_key(topic)).await {
            warn!(
                "{COMPONENT} (error: {error}) - failed to delete ownership key for topic: {}",
                String::from_utf8_lossy(topic)
            );
        }
        info!(
            "Released ownership of topic: {}",
            String::from_utf8_lossy(topic)
        );
        let _ = self
            .events_tx
            .send(OwnershipEvent::Released {
                topic: topic.clone(),
                external: false,
            })
            .await;
    }

    pub async fn release_all(&self) {
        for topic in self.owned_topics() {
            self.release(&topic).await;
        }
    }

    pub fn stop(&self) {
        if let Some(handle) = self.watch_task.lock().unwrap().take() {
            handle.abort();
        }
    }

    fn start_watch(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut watch = this.store.watch();
            loop {
                match watch.recv().await {
                    Ok(WatchEvent::Deleted { key }) => {
                        let Some(topic) = metadata::topic_of_owner_key(&key) else {
                            continue;
                        };
                        if this.held.remove(&topic).is_some() {
                            warn!(
                                "Ownership of topic: {} was lost externally",
                                String::from_utf8_lossy(&topic)
                            );
                            let _ = this
                                .events_tx
                                .send(OwnershipEvent::Released {
                                    topic,
                                    external: true,
                                })
                                .await;
                        }
                    }
                    Ok(WatchEvent::SessionExpired { session })
                        if session == this.session.load(Ordering::Acquire) =>
                    {
                        warn!("Metadata session expired, treating all ownership claims as lost");
                        this.drop_all_held().await;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Ownership watch lagged by {missed} events, resyncing held claims");
                        this.resync().await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.watch_task.lock().unwrap() = Some(handle);
    }

    async fn drop_all_held(&self) {
        for topic in self.owned_topics() {
            if self.held.remove(&topic).is_some() {
                let _ = self
                    .events_tx
                    .send(OwnershipEvent::Released {
                        topic,
                        external: true,
                    })
                    .await;
            }
        }
    }

    /// Re-reads every held key after missed watch events and synthesizes
    /// releases for claims that no longer name this incarnation.
    async fn resync(&self) {
        for topic in self.owned_topics() {
            let key = metadata::owner_key(&topic);
            let still_ours = match self.store.get(&key).await {
                Ok(Some(value)) => serde_json::from_slice::<OwnerRecord>(&value)
                    .map(|owner| owner.incarnation == self.node.incarnation)
                    .unwrap_or(false),
                Ok(None) => false,
                Err(error) => {
                    warn!(
                        "{COMPONENT} (error: {error}) - failed to re-read ownership key for topic: {}",
                        String::from_utf8_lossy(&topic)
                    );
                    continue;
                }
            };
            if !still_ours && self.held.remove(&topic).is_some() {
                let _ = self
                    .events_tx
                    .send(OwnershipEvent::Released {
                        topic,
                        external: true,
                    })
                    .await;
            }
        }
    }
}
