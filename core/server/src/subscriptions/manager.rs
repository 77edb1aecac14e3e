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

use super::op_queue::TopicOpQueue;
use super::state::InMemorySubscriptionState;
use super::SubscriptionEventListener;
use crate::metadata::{self, MetadataError, MetadataStore};
use crate::persistence::MessageLog;
use bytes::Bytes;
use dashmap::DashMap;
use error_set::ErrContext;
use futures::future::join_all;
use prost::Message as _;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use strix_common::{
    is_hub_subscriber, CreateOrAttach, MessageSeqId, StrixError, SubscribeRequest,
    SubscriptionData,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const COMPONENT: &str = "SUBSCRIPTION_MANAGER";
const OP_QUEUE_CAPACITY: usize = 1024;

type TopicSubscriptions = Arc<Mutex<HashMap<Bytes, InMemorySubscriptionState>>>;

/// Per-topic subscription bookkeeping: attach/create semantics, lazy
/// consume-pointer persistence and the derived garbage-collection hints.
///
/// Every mutation runs under a per-topic operation queue; local and hub
/// subscribers use distinct queues so slow cross-region work cannot starve
/// local subscribes.
pub struct SubscriptionManager {
    store: Arc<dyn MetadataStore>,
    log: Arc<dyn MessageLog>,
    local_queue: TopicOpQueue,
    hub_queue: TopicOpQueue,
    topics: DashMap<Bytes, TopicSubscriptions>,
    listeners: RwLock<Vec<Arc<dyn SubscriptionEventListener>>>,
    /// Last minimum consume pointer reported to the persistence layer.
    min_consumed: DashMap<Bytes, u64>,
    consume_interval: u64,
    gc_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

fn topic_str(topic: &Bytes) -> String {
    String::from_utf8_lossy(topic).into_owned()
}

fn has_local_subscriptions(map: &HashMap<Bytes, InMemorySubscriptionState>) -> bool {
    map.keys().any(|subscriber| !is_hub_subscriber(subscriber))
}

fn metadata_error(error: MetadataError) -> StrixError {
    StrixError::MetadataStore(error.to_string())
}

impl SubscriptionManager {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        log: Arc<dyn MessageLog>,
        consume_interval: u64,
    ) -> Self {
        Self {
            store,
            log,
            local_queue: TopicOpQueue::new("local", OP_QUEUE_CAPACITY),
            hub_queue: TopicOpQueue::new("hub", OP_QUEUE_CAPACITY),
            topics: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            min_consumed: DashMap::new(),
            consume_interval,
            gc_task: std::sync::Mutex::new(None),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn SubscriptionEventListener>) {
        self.listeners.write().unwrap().push(listener);
    }

    /// Starts the recurring task deriving the minimum consume pointer and
    /// the message bound for every held topic.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                this.run_consumed_pass().await;
            }
        });
        *self.gc_task.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.gc_task.lock().unwrap().take() {
            handle.abort();
        }
    }

    fn queue_for(&self, subscriber_id: &Bytes) -> &TopicOpQueue {
        if is_hub_subscriber(subscriber_id) {
            &self.hub_queue
        } else {
            &self.local_queue
        }
    }

    /// Loads all persisted subscription records for a freshly claimed topic.
    /// Completes before the topic is marked ready to serve; a read failure
    /// leaves the topic unacquired.
    pub async fn acquire_topic(self: &Arc<Self>, topic: &Bytes) -> Result<(), StrixError> {
        let this = self.clone();
        let owned_topic = topic.clone();
        self.local_queue
            .run(topic, async move { this.acquire_topic_op(owned_topic).await })
            .await
            .map_err(|_| StrixError::NotResponsibleForTopic(None))?
    }

    async fn acquire_topic_op(self: Arc<Self>, topic: Bytes) -> Result<(), StrixError> {
        if self.topics.contains_key(&topic) {
            return Ok(());
        }
        let prefix = metadata::subscriptions_prefix(&topic);
        let records = self
            .store
            .list_prefix(&prefix)
            .await
            .map_err(metadata_error)?;
        let mut map = HashMap::with_capacity(records.len());
        for (key, value) in records {
            let subscriber_id = key.slice(prefix.len()..);
            let data = SubscriptionData::decode(value.as_ref()).map_err(|error| {
                error!(
                    "{COMPONENT} (error: {error}) - failed to decode subscription record for topic: {}, subscriber: {}",
                    topic_str(&topic),
                    String::from_utf8_lossy(&subscriber_id)
                );
                StrixError::MetadataStore(format!("corrupt subscription record: {error}"))
            })?;
            map.insert(subscriber_id, InMemorySubscriptionState::new(data));
        }
        // The node just inherited these subscribers; if any of them are
        // local the federation listeners have to know before we serve.
        if has_local_subscriptions(&map) {
            self.notify_first_local_subscribe(&topic, false).await?;
        }
        info!(
            "Subscription manager acquired topic: {} with {} subscription(s)",
            topic_str(&topic),
            map.len()
        );
        self.topics.insert(topic.clone(), Arc::new(Mutex::new(map)));
        self.update_message_bound(&topic).await;
        Ok(())
    }

    /// Flushes dirty consume pointers and drops the in-memory state for a
    /// topic this node no longer owns.
    pub async fn release_topic(self: &Arc<Self>, topic: &Bytes) {
        let this = self.clone();
        let owned_topic = topic.clone();
        let _ = self
            .local_queue
            .run(topic, async move { this.release_topic_op(owned_topic).await })
            .await;
        self.local_queue.retire(topic);
        self.hub_queue.retire(topic);
    }

    async fn release_topic_op(self: Arc<Self>, topic: Bytes) {
        let Some((_, subscriptions)) = self.topics.remove(&topic) else {
            return;
        };
        let mut map = subscriptions.lock().await;
        let has_local = has_local_subscriptions(&map);
        for (subscriber_id, state) in map.iter_mut() {
            let Some(record) = state.pending_flush() else {
                continue;
            };
            let key = metadata::subscription_key(&topic, subscriber_id);
            match self.store.put(key, record.encode_to_vec().into()).await {
                Ok(()) => state.mark_flushed(),
                Err(error) => warn!(
                    "{COMPONENT} (error: {error}) - failed to flush consume pointer when releasing topic: {}, subscriber: {}",
                    topic_str(&topic),
                    String::from_utf8_lossy(subscriber_id)
                ),
            }
        }
        drop(map);
        self.min_consumed.remove(&topic);
        self.notify_last_local_unsubscribe(&topic, !has_local);
        info!("Subscription manager released topic: {}", topic_str(&topic));
    }

    pub async fn subscribe(
        self: &Arc<Self>,
        topic: &Bytes,
        request: SubscribeRequest,
        current_seq: MessageSeqId,
    ) -> Result<SubscriptionData, StrixError> {
        let this = self.clone();
        let owned_topic = topic.clone();
        self.queue_for(&request.subscriber_id)
            .run(topic, async move {
                this.subscribe_op(owned_topic, request, current_seq).await
            })
            .await
            .map_err(|_| StrixError::NotResponsibleForTopic(None))?
    }

    async fn subscribe_op(
        self: Arc<Self>,
        topic: Bytes,
        request: SubscribeRequest,
        current_seq: MessageSeqId,
    ) -> Result<SubscriptionData, StrixError> {
        let subscriber_id = request.subscriber_id.clone();
        info!(
            "Executing a subscription request for topic: {} from subscriber: {}",
            topic_str(&topic),
            String::from_utf8_lossy(&subscriber_id)
        );
        let Some(subscriptions) = self.topics.get(&topic).map(|entry| entry.value().clone()) else {
            return Err(StrixError::NotResponsibleForTopic(None));
        };
        let mut map = subscriptions.lock().await;
        let mode = CreateOrAttach::try_from(request.create_or_attach)
            .unwrap_or(CreateOrAttach::CreateOrAttach);

        if let Some(state) = map.get_mut(&subscriber_id) {
            if mode == CreateOrAttach::Create {
                error!(
                    "Topic: {} subscriber: {} requested creating a subscription but is already subscribed",
                    topic_str(&topic),
                    String::from_utf8_lossy(&subscriber_id)
                );
                return Err(StrixError::AlreadySubscribed {
                    topic: topic_str(&topic),
                    subscriber: String::from_utf8_lossy(&subscriber_id).into_owned(),
                });
            }
            // Attach. New preferences are merged and persisted before the
            // state is handed back; the in-memory state is only replaced
            // once the metadata write succeeded.
            if let Some(preferences) = &request.preferences {
                let mut merged = state.clone();
                if merged.merge_preferences(preferences) {
                    let record = merged.to_subscription_data();
                    let key = metadata::subscription_key(&topic, &subscriber_id);
                    self.store
                        .put(key, record.encode_to_vec().into())
                        .await
                        .map_err(metadata_error)?;
                    *state = merged;
                    let data = state.to_subscription_data();
                    drop(map);
                    self.update_message_bound(&topic).await;
                    return Ok(data);
                }
            }
            info!(
                "Topic: {} subscriber: {} attaching to existing subscription",
                topic_str(&topic),
                String::from_utf8_lossy(&subscriber_id)
            );
            return Ok(state.to_subscription_data());
        }

        if mode == CreateOrAttach::Attach {
            info!(
                "Topic: {} subscriber: {} requested attaching but is not subscribed",
                topic_str(&topic),
                String::from_utf8_lossy(&subscriber_id)
            );
            return Err(StrixError::NotSubscribed {
                topic: topic_str(&topic),
                subscriber: String::from_utf8_lossy(&subscriber_id).into_owned(),
            });
        }

        // Brand new subscription: the subscriber starts receiving messages
        // published after this point.
        let preferences = request.preferences.clone().unwrap_or_default();
        let data = SubscriptionData::initial(current_seq, preferences);
        let key = metadata::subscription_key(&topic, &subscriber_id);
        self.store
            .put(key.clone(), data.encode_to_vec().into())
            .await
            .with_error_context(|error| {
                format!(
                    "{COMPONENT} (error: {error}) - failed to persist subscription record for topic: {}, subscriber: {}",
                    topic_str(&topic),
                    String::from_utf8_lossy(&subscriber_id)
                )
            })
            .map_err(metadata_error)?;

        if !is_hub_subscriber(&subscriber_id) && !has_local_subscriptions(&map) {
            info!(
                "First local subscriber for topic: {}, notifying listeners",
                topic_str(&topic)
            );
            if let Err(error) = self
                .notify_first_local_subscribe(&topic, request.synchronous)
                .await
            {
                error!(
                    "{COMPONENT} (error: {error}) - listener failed, rolling back subscription for topic: {}, subscriber: {}",
                    topic_str(&topic),
                    String::from_utf8_lossy(&subscriber_id)
                );
                if let Err(delete_error) = self.store.delete(&key).await {
                    error!(
                        "{COMPONENT} (error: {delete_error}) - failed to roll back subscription record for topic: {}",
                        topic_str(&topic)
                    );
                }
                return Err(error);
            }
        }
        map.insert(
            subscriber_id,
            InMemorySubscriptionState::new(data.clone()),
        );
        drop(map);
        self.update_message_bound(&topic).await;
        Ok(data)
    }

    /// Advances a subscriber's consume pointer. The pointer is persisted
    /// only when it ran `consume_interval` messages ahead of the stored
    /// record; otherwise the advance stays in memory.
    pub async fn consume(
        self: &Arc<Self>,
        topic: &Bytes,
        subscriber_id: &Bytes,
        seq_id: MessageSeqId,
    ) -> Result<(), StrixError> {
        let this = self.clone();
        let owned_topic = topic.clone();
        let owned_subscriber = subscriber_id.clone();
        self.queue_for(subscriber_id)
            .run(topic, async move {
                this.consume_op(owned_topic, owned_subscriber, seq_id).await
            })
            .await
            .unwrap_or(Ok(()))
    }

    async fn consume_op(
        self: Arc<Self>,
        topic: Bytes,
        subscriber_id: Bytes,
        seq_id: MessageSeqId,
    ) -> Result<(), StrixError> {
        let Some(subscriptions) = self.topics.get(&topic).map(|entry| entry.value().clone()) else {
            return Ok(());
        };
        let mut map = subscriptions.lock().await;
        let Some(state) = map.get_mut(&subscriber_id) else {
            return Ok(());
        };
        if state.advance_consume_pointer(&seq_id, self.consume_interval) {
            if let Some(record) = state.pending_flush() {
                let key = metadata::subscription_key(&topic, &subscriber_id);
                self.store
                    .put(key, record.encode_to_vec().into())
                    .await
                    .map_err(metadata_error)?;
                state.mark_flushed();
            }
        } else {
            debug!(
                "Only advanced consume pointer in memory, will persist later, topic: {}, subscriber: {}, seq: {}",
                topic_str(&topic),
                String::from_utf8_lossy(&subscriber_id),
                seq_id.local_component
            );
        }
        Ok(())
    }

    pub async fn unsubscribe(
        self: &Arc<Self>,
        topic: &Bytes,
        subscriber_id: &Bytes,
    ) -> Result<(), StrixError> {
        let this = self.clone();
        let owned_topic = topic.clone();
        let owned_subscriber = subscriber_id.clone();
        self.queue_for(subscriber_id)
            .run(topic, async move {
                this.unsubscribe_op(owned_topic, owned_subscriber).await
            })
            .await
            .map_err(|_| StrixError::NotResponsibleForTopic(None))?
    }

    async fn unsubscribe_op(
        self: Arc<Self>,
        topic: Bytes,
        subscriber_id: Bytes,
    ) -> Result<(), StrixError> {
        let Some(subscriptions) = self.topics.get(&topic).map(|entry| entry.value().clone()) else {
            return Err(StrixError::NotResponsibleForTopic(None));
        };
        let mut map = subscriptions.lock().await;
        if !map.contains_key(&subscriber_id) {
            return Err(StrixError::NotSubscribed {
                topic: topic_str(&topic),
                subscriber: String::from_utf8_lossy(&subscriber_id).into_owned(),
            });
        }
        self.store
            .delete(&metadata::subscription_key(&topic, &subscriber_id))
            .await
            .with_error_context(|error| {
                format!(
                    "{COMPONENT} (error: {error}) - failed to delete subscription record for topic: {}, subscriber: {}",
                    topic_str(&topic),
                    String::from_utf8_lossy(&subscriber_id)
                )
            })
            .map_err(metadata_error)?;
        map.remove(&subscriber_id);
        if !is_hub_subscriber(&subscriber_id) && !has_local_subscriptions(&map) {
            self.notify_last_local_unsubscribe(&topic, true);
        }
        drop(map);
        self.update_message_bound(&topic).await;
        Ok(())
    }

    /// Best-effort consume-pointer flush, used when a delivery session ends.
    pub async fn flush_subscription(self: &Arc<Self>, topic: &Bytes, subscriber_id: &Bytes) {
        let this = self.clone();
        let owned_topic = topic.clone();
        let owned_subscriber = subscriber_id.clone();
        let _ = self
            .queue_for(subscriber_id)
            .run(topic, async move {
                this.flush_subscription_op(owned_topic, owned_subscriber)
                    .await
            })
            .await;
    }

    async fn flush_subscription_op(self: Arc<Self>, topic: Bytes, subscriber_id: Bytes) {
        let Some(subscriptions) = self.topics.get(&topic).map(|entry| entry.value().clone()) else {
            return;
        };
        let mut map = subscriptions.lock().await;
        let Some(state) = map.get_mut(&subscriber_id) else {
            return;
        };
        let Some(record) = state.pending_flush() else {
            return;
        };
        let key = metadata::subscription_key(&topic, &subscriber_id);
        match self.store.put(key, record.encode_to_vec().into()).await {
            Ok(()) => state.mark_flushed(),
            Err(error) => warn!(
                "{COMPONENT} (error: {error}) - failed to flush consume pointer for topic: {}, subscriber: {}",
                topic_str(&topic),
                String::from_utf8_lossy(&subscriber_id)
            ),
        }
    }

    /// One pass of the recurring derived-state task: report the minimum
    /// consume pointer per topic and refresh the message bound.
    pub async fn run_consumed_pass(&self) {
        let topics: Vec<(Bytes, TopicSubscriptions)> = self
            .topics
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (topic, subscriptions) in topics {
            let map = subscriptions.lock().await;
            if map.is_empty() {
                continue;
            }
            // The consume pointers are persisted lazily, so the stale
            // in-memory value is the safe one to report.
            let min = map
                .values()
                .map(InMemorySubscriptionState::consumed_seq)
                .min()
                .unwrap_or(0);
            drop(map);
            if min == 0 {
                continue;
            }
            let unchanged = self
                .min_consumed
                .insert(topic.clone(), min)
                .is_some_and(|previous| previous == min);
            if !unchanged {
                self.log.consumed_until(&topic, min).await;
            }
            self.update_message_bound(&topic).await;
        }
    }

    /// Pushes `max(bounds)` to the persistence layer when every subscriber
    /// carries a message bound, clears it otherwise.
    async fn update_message_bound(&self, topic: &Bytes) {
        let Some(subscriptions) = self.topics.get(topic).map(|entry| entry.value().clone()) else {
            return;
        };
        let map = subscriptions.lock().await;
        let mut max_bound: Option<u32> = None;
        for state in map.values() {
            match state.preferences().message_bound {
                Some(bound) => max_bound = Some(max_bound.unwrap_or(0).max(bound)),
                None => {
                    max_bound = None;
                    break;
                }
            }
        }
        drop(map);
        match max_bound {
            Some(bound) => self.log.set_message_bound(topic, bound).await,
            None => self.log.clear_message_bound(topic).await,
        }
    }

    async fn notify_first_local_subscribe(
        &self,
        topic: &Bytes,
        synchronous: bool,
    ) -> Result<(), StrixError> {
        let listeners = { self.listeners.read().unwrap().clone() };
        let results = join_all(
            listeners
                .iter()
                .map(|listener| listener.on_first_local_subscribe(topic, synchronous)),
        )
        .await;
        results.into_iter().collect()
    }

    fn notify_last_local_unsubscribe(&self, topic: &Bytes, last_subscriber: bool) {
        let listeners = { self.listeners.read().unwrap().clone() };
        for listener in listeners {
            listener.on_last_local_unsubscribe(topic, last_subscriber);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MemoryMetadataStore;
    use crate::persistence::MemoryLog;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use strix_common::SubscriptionPreferences;

    const CONSUME_INTERVAL: u64 = 5;

    struct Fixture {
        store: Arc<MemoryMetadataStore>,
        log: Arc<MemoryLog>,
        manager: Arc<SubscriptionManager>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryMetadataStore::new());
        let log = Arc::new(MemoryLog::new());
        let manager = Arc::new(SubscriptionManager::new(
            store.clone(),
            log.clone(),
            CONSUME_INTERVAL,
        ));
        manager
            .acquire_topic(&Bytes::from_static(b"orders"))
            .await
            .unwrap();
        Fixture {
            store,
            log,
            manager,
        }
    }

    fn subscribe_request(subscriber: &'static [u8], mode: CreateOrAttach) -> SubscribeRequest {
        SubscribeRequest {
            subscriber_id: Bytes::from_static(subscriber),
            create_or_attach: mode as i32,
            ..Default::default()
        }
    }

    fn bounded_request(
        subscriber: &'static [u8],
        mode: CreateOrAttach,
        bound: u32,
    ) -> SubscribeRequest {
        let mut request = subscribe_request(subscriber, mode);
        request.preferences = Some(SubscriptionPreferences {
            message_bound: Some(bound),
            ..Default::default()
        });
        request
    }

    #[tokio::test]
    async fn create_on_existing_subscription_fails() {
        let f = fixture().await;
        let topic = Bytes::from_static(b"orders");
        f.manager
            .subscribe(
                &topic,
                subscribe_request(b"s1", CreateOrAttach::Create),
                MessageSeqId::local(0),
            )
            .await
            .unwrap();
        let error = f
            .manager
            .subscribe(
                &topic,
                subscribe_request(b"s1", CreateOrAttach::Create),
                MessageSeqId::local(0),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, StrixError::AlreadySubscribed { .. }));
    }

    #[tokio::test]
    async fn attach_without_subscription_fails_and_create_or_attach_is_idempotent() {
        let f = fixture().await;
        let topic = Bytes::from_static(b"orders");
        let error = f
            .manager
            .subscribe(
                &topic,
                subscribe_request(b"s1", CreateOrAttach::Attach),
                MessageSeqId::local(0),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, StrixError::NotSubscribed { .. }));

        let first = f
            .manager
            .subscribe(
                &topic,
                subscribe_request(b"s1", CreateOrAttach::CreateOrAttach),
                MessageSeqId::local(7),
            )
            .await
            .unwrap();
        let second = f
            .manager
            .subscribe(
                &topic,
                subscribe_request(b"s1", CreateOrAttach::CreateOrAttach),
                MessageSeqId::local(99),
            )
            .await
            .unwrap();
        // The second call attached; the consume pointer did not move.
        assert_eq!(first.consume_pointer(), 7);
        assert_eq!(second.consume_pointer(), 7);
    }

    #[tokio::test]
    async fn attach_with_new_preferences_merges_and_persists() {
        let f = fixture().await;
        let topic = Bytes::from_static(b"orders");
        f.manager
            .subscribe(
                &topic,
                bounded_request(b"s1", CreateOrAttach::Create, 100),
                MessageSeqId::local(0),
            )
            .await
            .unwrap();
        let attached = f
            .manager
            .subscribe(
                &topic,
                bounded_request(b"s1", CreateOrAttach::Attach, 250),
                MessageSeqId::local(0),
            )
            .await
            .unwrap();
        assert_eq!(
            attached.preferences.as_ref().unwrap().message_bound,
            Some(250)
        );

        let key = metadata::subscription_key(&topic, &Bytes::from_static(b"s1"));
        let raw = f.store.get(&key).await.unwrap().expect("record persisted");
        let record = SubscriptionData::decode(raw.as_ref()).unwrap();
        assert_eq!(record.preferences.unwrap().message_bound, Some(250));
    }

    #[tokio::test]
    async fn consume_pointer_persists_lazily() {
        let f = fixture().await;
        let topic = Bytes::from_static(b"orders");
        let subscriber = Bytes::from_static(b"s1");
        f.manager
            .subscribe(
                &topic,
                subscribe_request(b"s1", CreateOrAttach::Create),
                MessageSeqId::local(0),
            )
            .await
            .unwrap();
        let key = metadata::subscription_key(&topic, &subscriber);

        // Below the interval: only the in-memory pointer moves.
        f.manager
            .consume(&topic, &subscriber, MessageSeqId::local(3))
            .await
            .unwrap();
        let raw = f.store.get(&key).await.unwrap().unwrap();
        assert_eq!(
            SubscriptionData::decode(raw.as_ref()).unwrap().consume_pointer(),
            0
        );

        // Crossing the interval persists the advanced pointer.
        f.manager
            .consume(&topic, &subscriber, MessageSeqId::local(6))
            .await
            .unwrap();
        let raw = f.store.get(&key).await.unwrap().unwrap();
        assert_eq!(
            SubscriptionData::decode(raw.as_ref()).unwrap().consume_pointer(),
            6
        );
    }

    #[tokio::test]
    async fn release_flushes_dirty_pointers() {
        let f = fixture().await;
        let topic = Bytes::from_static(b"orders");
        let subscriber = Bytes::from_static(b"s1");
        f.manager
            .subscribe(
                &topic,
                subscribe_request(b"s1", CreateOrAttach::Create),
                MessageSeqId::local(0),
            )
            .await
            .unwrap();
        f.manager
            .consume(&topic, &subscriber, MessageSeqId::local(2))
            .await
            .unwrap();
        f.manager.release_topic(&topic).await;

        let key = metadata::subscription_key(&topic, &subscriber);
        let raw = f.store.get(&key).await.unwrap().unwrap();
        assert_eq!(
            SubscriptionData::decode(raw.as_ref()).unwrap().consume_pointer(),
            2
        );
    }

    #[tokio::test]
    async fn message_bound_follows_the_subscriber_population() {
        let f = fixture().await;
        let topic = Bytes::from_static(b"orders");
        f.manager
            .subscribe(
                &topic,
                bounded_request(b"s1", CreateOrAttach::Create, 100),
                MessageSeqId::local(0),
            )
            .await
            .unwrap();
        f.manager
            .subscribe(
                &topic,
                bounded_request(b"s2", CreateOrAttach::Create, 200),
                MessageSeqId::local(0),
            )
            .await
            .unwrap();
        for _ in 0..500 {
            f.log
                .append(
                    &topic,
                    strix_common::Message {
                        payload: Bytes::from_static(b"m"),
                        msg_id: None,
                        src_region: None,
                    },
                )
                .await
                .unwrap();
        }
        assert_eq!(f.log.retained_unconsumed(&topic).await, 200);

        // Removing the higher-bound subscriber lowers the cap.
        f.manager
            .unsubscribe(&topic, &Bytes::from_static(b"s2"))
            .await
            .unwrap();
        assert_eq!(f.log.retained_unconsumed(&topic).await, 100);

        // An unbounded subscriber clears the cap.
        f.manager
            .subscribe(
                &topic,
                subscribe_request(b"s3", CreateOrAttach::Create),
                MessageSeqId::local(500),
            )
            .await
            .unwrap();
        for _ in 0..150 {
            f.log
                .append(
                    &topic,
                    strix_common::Message {
                        payload: Bytes::from_static(b"m"),
                        msg_id: None,
                        src_region: None,
                    },
                )
                .await
                .unwrap();
        }
        assert_eq!(f.log.retained_unconsumed(&topic).await, 250);
    }

    #[tokio::test]
    async fn consumed_pass_reports_the_minimum_pointer() {
        let f = fixture().await;
        let topic = Bytes::from_static(b"orders");
        f.manager
            .subscribe(
                &topic,
                subscribe_request(b"s1", CreateOrAttach::Create),
                MessageSeqId::local(0),
            )
            .await
            .unwrap();
        f.manager
            .subscribe(
                &topic,
                subscribe_request(b"s2", CreateOrAttach::Create),
                MessageSeqId::local(0),
            )
            .await
            .unwrap();
        for _ in 0..10 {
            f.log
                .append(
                    &topic,
                    strix_common::Message {
                        payload: Bytes::from_static(b"m"),
                        msg_id: None,
                        src_region: None,
                    },
                )
                .await
                .unwrap();
        }
        f.manager
            .consume(&topic, &Bytes::from_static(b"s1"), MessageSeqId::local(8))
            .await
            .unwrap();
        f.manager
            .consume(&topic, &Bytes::from_static(b"s2"), MessageSeqId::local(4))
            .await
            .unwrap();

        f.manager.run_consumed_pass().await;
        assert_eq!(f.log.retained_unconsumed(&topic).await, 6);
    }

    struct FailingListener {
        fired: AtomicUsize,
    }

    #[async_trait]
    impl SubscriptionEventListener for FailingListener {
        async fn on_first_local_subscribe(
            &self,
            _topic: &Bytes,
            _synchronous: bool,
        ) -> Result<(), StrixError> {
            self.fired.fetch_add(1, Ordering::Relaxed);
            Err(StrixError::ServiceUnavailable("remote region down".into()))
        }

        fn on_last_local_unsubscribe(&self, _topic: &Bytes, _last_subscriber: bool) {}
    }

    #[tokio::test]
    async fn listener_failure_rolls_back_the_pending_subscribe() {
        let f = fixture().await;
        let topic = Bytes::from_static(b"orders");
        let listener = Arc::new(FailingListener {
            fired: AtomicUsize::new(0),
        });
        f.manager.add_listener(listener.clone());

        let error = f
            .manager
            .subscribe(
                &topic,
                subscribe_request(b"s1", CreateOrAttach::Create),
                MessageSeqId::local(0),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, StrixError::ServiceUnavailable(_)));
        assert_eq!(listener.fired.load(Ordering::Relaxed), 1);

        // The persisted record was rolled back and the subscriber is free
        // to retry with a clean view.
        let key = metadata::subscription_key(&topic, &Bytes::from_static(b"s1"));
        assert!(f.store.get(&key).await.unwrap().is_none());
        let error = f
            .manager
            .subscribe(
                &topic,
                subscribe_request(b"s1", CreateOrAttach::Attach),
                MessageSeqId::local(0),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, StrixError::NotSubscribed { .. }));
    }

    struct HubBlindListener {
        fired_for_hub: AtomicBool,
    }

    #[async_trait]
    impl SubscriptionEventListener for HubBlindListener {
        async fn on_first_local_subscribe(
            &self,
            _topic: &Bytes,
            _synchronous: bool,
        ) -> Result<(), StrixError> {
            self.fired_for_hub.store(true, Ordering::Relaxed);
            Ok(())
        }

        fn on_last_local_unsubscribe(&self, _topic: &Bytes, _last_subscriber: bool) {}
    }

    #[tokio::test]
    async fn hub_subscribers_do_not_fire_first_local_listeners() {
        let f = fixture().await;
        let topic = Bytes::from_static(b"orders");
        let listener = Arc::new(HubBlindListener {
            fired_for_hub: AtomicBool::new(false),
        });
        f.manager.add_listener(listener.clone());

        f.manager
            .subscribe(
                &topic,
                subscribe_request(b"__hub:region-b", CreateOrAttach::Create),
                MessageSeqId::local(0),
            )
            .await
            .unwrap();
        assert!(!listener.fired_for_hub.load(Ordering::Relaxed));

        f.manager
            .subscribe(
                &topic,
                subscribe_request(b"s1", CreateOrAttach::Create),
                MessageSeqId::local(0),
            )
            .await
            .unwrap();
        assert!(listener.fired_for_hub.load(Ordering::Relaxed));
    }
}
