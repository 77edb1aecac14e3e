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

use crate::binary::SubscriberChannels;
use crate::configs::ServerConfig;
use crate::delivery::{AllToAllTopologyFilter, DeliveryConfig, DeliveryManager, FilterRegistry, PipelineFilter};
use crate::metadata::MetadataStore;
use crate::persistence::MessageLog;
use crate::server_error::ServerError;
use crate::subscriptions::SubscriptionManager;
use crate::topics::{
    ClaimOutcome, ClaimRetryConfig, NodeIdentity, OwnershipEvent, OwnershipRegistry,
};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use strix_common::{StrixError, SubscriptionPreferences, TopicSubscriber};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const COMPONENT: &str = "BROKER";

pub type SharedBroker = Arc<Broker>;

#[derive(Clone)]
enum TopicState {
    /// The acquire pipeline is running; the watch flips when it finished.
    Acquiring(watch::Receiver<bool>),
    Ready,
}

/// Composition root tying the ownership registry, subscription manager,
/// delivery manager and connection registries together. Components do not
/// hold back-pointers to each other; all cross-component flow runs through
/// this type or the ownership-event stream.
pub struct Broker {
    pub config: ServerConfig,
    pub subscriptions: Arc<SubscriptionManager>,
    pub delivery: Arc<DeliveryManager>,
    pub subscriber_channels: SubscriberChannels,
    pub log: Arc<dyn MessageLog>,
    ownership: Arc<OwnershipRegistry>,
    filters: FilterRegistry,
    region: Bytes,
    topics: DashMap<Bytes, TopicState>,
    events_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Broker {
    pub async fn start(
        config: ServerConfig,
        metadata: Arc<dyn MetadataStore>,
        log: Arc<dyn MessageLog>,
        filters: FilterRegistry,
    ) -> Result<SharedBroker, ServerError> {
        let address = config.advertised_address()?;
        let node = NodeIdentity::new(address);
        let (ownership, events_rx) = OwnershipRegistry::new(
            metadata.clone(),
            node,
            ClaimRetryConfig {
                attempts: config.topic.acquire_attempts,
                backoff: config.topic.acquire_backoff,
            },
        )
        .await
        .map_err(|error| ServerError::Metadata(error.to_string()))?;

        let subscriptions = Arc::new(SubscriptionManager::new(
            metadata,
            log.clone(),
            config.subscriptions.consume_interval,
        ));
        subscriptions.start(config.subscriptions.retention_check_interval);

        let flush_subscriptions = subscriptions.clone();
        let delivery = Arc::new(DeliveryManager::new(
            log.clone(),
            DeliveryConfig {
                batch_count: config.delivery.batch_count,
                batch_bytes: config.delivery.batch_bytes,
                write_timeout: config.delivery.write_timeout,
            },
            Arc::new(move |topic_subscriber: &TopicSubscriber| {
                let subscriptions = flush_subscriptions.clone();
                let topic = topic_subscriber.topic.clone();
                let subscriber_id = topic_subscriber.subscriber_id.clone();
                tokio::spawn(async move {
                    subscriptions.flush_subscription(&topic, &subscriber_id).await;
                });
            }),
        ));

        let region = Bytes::copy_from_slice(config.node.region.as_bytes());
        let broker = Arc::new(Self {
            config,
            subscriptions,
            delivery,
            subscriber_channels: SubscriberChannels::default(),
            log,
            ownership,
            filters,
            region,
            topics: DashMap::new(),
            events_task: std::sync::Mutex::new(None),
            shutdown_tx: watch::channel(false).0,
        });
        broker.spawn_ownership_event_loop(events_rx);
        Ok(broker)
    }

    pub fn advertised_address(&self) -> String {
        self.ownership.node().address.to_string()
    }

    pub fn region(&self) -> &Bytes {
        &self.region
    }

    /// Flips to true once the broker is going away; connection loops watch
    /// it so live channels are severed on shutdown.
    pub fn shutdown_watch(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Confirms this node owns `topic`, claiming it when nobody does. The
    /// acquire pipeline (subscription load included) completes before the
    /// topic is reported ready; concurrent requests wait on it rather than
    /// racing their own claims.
    pub async fn ensure_owned(self: &Arc<Self>, topic: &Bytes) -> Result<(), StrixError> {
        loop {
            let waiter = match self.topics.get(topic).map(|entry| entry.value().clone()) {
                Some(TopicState::Ready) => return Ok(()),
                Some(TopicState::Acquiring(rx)) => Some(rx),
                None => None,
            };
            if let Some(mut rx) = waiter {
                // Wake on completion (or on the acquirer giving up) and
                // re-evaluate from scratch.
                let _ = rx.changed().await;
                continue;
            }

            let (done_tx, done_rx) = watch::channel(false);
            match self.topics.entry(topic.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(entry) => {
                    entry.insert(TopicState::Acquiring(done_rx));
                }
            }
            let result = self.acquire_pipeline(topic).await;
            match &result {
                Ok(()) => {
                    self.topics.insert(topic.clone(), TopicState::Ready);
                }
                Err(_) => {
                    self.topics.remove(topic);
                }
            }
            let _ = done_tx.send(true);
            return result;
        }
    }

    async fn acquire_pipeline(&self, topic: &Bytes) -> Result<(), StrixError> {
        match self.ownership.claim(topic).await? {
            ClaimOutcome::Acquired => {}
            ClaimOutcome::Redirect(owner) => {
                return Err(StrixError::NotResponsibleForTopic(
                    owner.map(|address| address.to_string()),
                ));
            }
        }
        if let Err(error) = self.subscriptions.acquire_topic(topic).await {
            error!(
                "{COMPONENT} (error: {error}) - failed to load subscriptions for claimed topic: {}, giving the claim back",
                String::from_utf8_lossy(topic)
            );
            self.ownership.release(topic).await;
            return Err(StrixError::ServerNotReady(
                String::from_utf8_lossy(topic).into_owned(),
            ));
        }
        Ok(())
    }

    /// The filter pipeline for one freshly acked subscription: the topology
    /// filter first, then the user filter the preferences name, if any.
    pub fn build_filter_pipeline(
        &self,
        topic: &Bytes,
        subscriber_id: &Bytes,
        preferences: &SubscriptionPreferences,
    ) -> Result<PipelineFilter, StrixError> {
        let mut pipeline = PipelineFilter::default();
        pipeline.add_last(Box::new(AllToAllTopologyFilter::new(self.region.clone())));
        if let Some(name) = preferences.message_filter.as_deref() {
            pipeline.add_last(self.filters.build(name)?);
        }
        pipeline.set_subscription_preferences(topic, subscriber_id, preferences);
        Ok(pipeline)
    }

    fn spawn_ownership_event_loop(self: &Arc<Self>, mut events_rx: mpsc::Receiver<OwnershipEvent>) {
        let broker = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    OwnershipEvent::Acquired { .. } => {}
                    OwnershipEvent::Released { topic, external } => {
                        if external {
                            warn!(
                                "Purging state for externally lost topic: {}",
                                String::from_utf8_lossy(&topic)
                            );
                        }
                        broker.purge_topic(&topic).await;
                    }
                }
            }
        });
        *self.events_task.lock().unwrap() = Some(handle);
    }

    async fn purge_topic(&self, topic: &Bytes) {
        self.topics.remove(topic);
        self.delivery.stop_topic(topic);
        self.subscriptions.release_topic(topic).await;
    }

    /// Ordered shutdown: flush consume pointers and give every claim back.
    pub async fn shutdown(self: &Arc<Self>) {
        info!("Shutting down broker: {}", self.advertised_address());
        let _ = self.shutdown_tx.send(true);
        self.subscriptions.stop();
        for topic in self.ownership.owned_topics() {
            self.ownership.release(&topic).await;
            self.purge_topic(&topic).await;
        }
        self.ownership.stop();
        if let Some(handle) = self.events_task.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Metadata session backing this node's ownership claims. Expiring it
    /// through the store simulates an abrupt node death.
    pub fn metadata_session(&self) -> crate::metadata::SessionId {
        self.ownership.session()
    }

    /// Stops background tasks without flushing or releasing anything, for
    /// failover tests that expire the metadata session out from under the
    /// node.
    pub fn crash(&self) {
        let _ = self.shutdown_tx.send(true);
        self.subscriptions.stop();
        self.ownership.stop();
        if let Some(handle) = self.events_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}
