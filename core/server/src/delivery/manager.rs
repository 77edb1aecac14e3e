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

use super::{DeliveryEndpoint, PipelineFilter};
use crate::persistence::MessageLog;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strix_common::{PubSubResponse, TopicSubscriber};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, warn};

const COMPONENT: &str = "DELIVERY_MANAGER";

#[derive(Clone, Debug)]
pub struct DeliveryConfig {
    /// Maximum messages fetched per log scan.
    pub batch_count: usize,
    /// Maximum payload bytes fetched per log scan.
    pub batch_bytes: usize,
    /// How long one endpoint write may stall before the session is torn
    /// down. Prevents unbounded in-flight batches on a stuck subscriber.
    pub write_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            batch_count: 64,
            batch_bytes: 1024 * 1024,
            write_timeout: Duration::from_secs(30),
        }
    }
}

/// Invoked when a delivery session ends, with the subscription it served.
/// The composition root wires this to a best-effort consume-pointer flush.
pub type SessionEndHook = Arc<dyn Fn(&TopicSubscriber) + Send + Sync>;

struct SessionHandle {
    id: u64,
    stop: watch::Sender<bool>,
}

/// FIFO delivery engine: one cooperative task per active (topic,
/// subscriber) session, scanning the log, applying the filter chain and
/// writing frames to the subscriber endpoint.
pub struct DeliveryManager {
    log: Arc<dyn MessageLog>,
    config: DeliveryConfig,
    sessions: DashMap<TopicSubscriber, SessionHandle>,
    session_counter: AtomicU64,
    on_session_end: SessionEndHook,
}

impl DeliveryManager {
    pub fn new(
        log: Arc<dyn MessageLog>,
        config: DeliveryConfig,
        on_session_end: SessionEndHook,
    ) -> Self {
        Self {
            log,
            config,
            sessions: DashMap::new(),
            session_counter: AtomicU64::new(0),
            on_session_end,
        }
    }

    /// Starts serving a subscription from `start_seq`. An existing session
    /// for the same subscription is stopped and replaced.
    pub fn start_serving(
        self: &Arc<Self>,
        topic_subscriber: TopicSubscriber,
        start_seq: u64,
        endpoint: Arc<dyn DeliveryEndpoint>,
        filter: PipelineFilter,
    ) {
        let id = self.session_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let (stop_tx, stop_rx) = watch::channel(false);
        if let Some(old) = self.sessions.insert(
            topic_subscriber.clone(),
            SessionHandle { id, stop: stop_tx },
        ) {
            let _ = old.stop.send(true);
        }
        debug!("Starting delivery session: {id} for {topic_subscriber} at seq: {start_seq}");
        let this = self.clone();
        tokio::spawn(async move {
            this.run_session(id, topic_subscriber, start_seq, endpoint, filter, stop_rx)
                .await;
        });
    }

    /// Ends the session for one subscription, if any.
    pub fn stop_serving(&self, topic_subscriber: &TopicSubscriber) {
        if let Some((_, handle)) = self.sessions.remove(topic_subscriber) {
            let _ = handle.stop.send(true);
        }
    }

    /// Ends every session on a topic; used when the topic is released.
    pub fn stop_topic(&self, topic: &Bytes) {
        let keys: Vec<TopicSubscriber> = self
            .sessions
            .iter()
            .filter(|entry| entry.key().topic == *topic)
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            self.stop_serving(&key);
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    async fn run_session(
        self: Arc<Self>,
        id: u64,
        topic_subscriber: TopicSubscriber,
        start_seq: u64,
        endpoint: Arc<dyn DeliveryEndpoint>,
        filter: PipelineFilter,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let topic = topic_subscriber.topic.clone();
        let mut tail = self.log.tail(&topic);
        let mut next = start_seq;
        'session: while !*stop_rx.borrow() {
            let batch = match self
                .log
                .scan(&topic, next, self.config.batch_count, self.config.batch_bytes)
                .await
            {
                Ok(batch) => batch,
                Err(error) => {
                    warn!("{COMPONENT} (error: {error}) - scan failed for {topic_subscriber}, ending session: {id}");
                    break 'session;
                }
            };
            if batch.is_empty() {
                // Caught up; park until a publish moves the tail.
                tokio::select! {
                    changed = tail.changed() => {
                        if changed.is_err() {
                            break 'session;
                        }
                    }
                    stopped = stop_rx.changed() => {
                        if stopped.is_err() {
                            break 'session;
                        }
                    }
                }
                continue;
            }
            for message in batch {
                let seq = message
                    .msg_id
                    .as_ref()
                    .map(|msg_id| msg_id.local_component)
                    .unwrap_or(next);
                if filter.accepts(&message) {
                    match timeout(
                        self.config.write_timeout,
                        endpoint.send(PubSubResponse::message(message)),
                    )
                    .await
                    {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => break 'session,
                        Err(_) => {
                            warn!(
                                "Endpoint for {topic_subscriber} not writable for {:?}, closing session: {id}",
                                self.config.write_timeout
                            );
                            endpoint.close();
                            break 'session;
                        }
                    }
                }
                next = seq + 1;
            }
        }
        self.sessions
            .remove_if(&topic_subscriber, |_, handle| handle.id == id);
        (self.on_session_end)(&topic_subscriber);
        debug!("Delivery session: {id} for {topic_subscriber} ended at seq: {next}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::EndpointClosed;
    use crate::persistence::MemoryLog;
    use async_trait::async_trait;
    use strix_common::{Message, ResponsePayload};
    use tokio::sync::mpsc;

    struct ChannelEndpoint {
        tx: mpsc::Sender<PubSubResponse>,
    }

    #[async_trait]
    impl DeliveryEndpoint for ChannelEndpoint {
        async fn send(&self, response: PubSubResponse) -> Result<(), EndpointClosed> {
            self.tx.send(response).await.map_err(|_| EndpointClosed)
        }

        fn close(&self) {}
    }

    fn manager(log: Arc<MemoryLog>, write_timeout: Duration) -> Arc<DeliveryManager> {
        Arc::new(DeliveryManager::new(
            log,
            DeliveryConfig {
                batch_count: 2,
                batch_bytes: 1024 * 1024,
                write_timeout,
            },
            Arc::new(|_| {}),
        ))
    }

    async fn publish(log: &MemoryLog, topic: &Bytes, n: usize) {
        for _ in 0..n {
            log.append(
                topic,
                Message {
                    payload: Bytes::from_static(b"m"),
                    msg_id: None,
                    src_region: None,
                },
            )
            .await
            .unwrap();
        }
    }

    fn delivered_seq(response: &PubSubResponse) -> u64 {
        match &response.payload {
            Some(ResponsePayload::Message(message)) => {
                message.msg_id.as_ref().unwrap().local_component
            }
            other => panic!("expected a message frame, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn delivers_in_order_from_start_seq_and_follows_the_tail() {
        let log = Arc::new(MemoryLog::new());
        let topic = Bytes::from_static(b"orders");
        publish(&log, &topic, 5).await;

        let manager = manager(log.clone(), Duration::from_secs(5));
        let (tx, mut rx) = mpsc::channel(16);
        manager.start_serving(
            TopicSubscriber::new(topic.clone(), Bytes::from_static(b"s1")),
            3,
            Arc::new(ChannelEndpoint { tx }),
            PipelineFilter::default(),
        );

        for expected in 3..=5u64 {
            let response = rx.recv().await.unwrap();
            assert_eq!(delivered_seq(&response), expected);
        }

        // A publish after catch-up wakes the parked session.
        publish(&log, &topic, 1).await;
        let response = rx.recv().await.unwrap();
        assert_eq!(delivered_seq(&response), 6);
    }

    struct DropEverything;

    impl crate::delivery::ServerMessageFilter for DropEverything {
        fn set_subscription_preferences(
            &mut self,
            _topic: &Bytes,
            _subscriber_id: &Bytes,
            _preferences: &strix_common::SubscriptionPreferences,
        ) {
        }

        fn accepts(&self, _message: &Message) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn filtered_messages_advance_without_being_sent() {
        let log = Arc::new(MemoryLog::new());
        let topic = Bytes::from_static(b"orders");
        publish(&log, &topic, 3).await;

        let manager = manager(log.clone(), Duration::from_secs(5));
        let (tx, mut rx) = mpsc::channel(16);
        let mut filter = PipelineFilter::default();
        filter.add_last(Box::new(DropEverything));
        manager.start_serving(
            TopicSubscriber::new(topic.clone(), Bytes::from_static(b"s1")),
            1,
            Arc::new(ChannelEndpoint { tx }),
            filter,
        );

        // Nothing may arrive; the session must stay alive and caught up.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(manager.active_sessions(), 1);
    }

    #[tokio::test]
    async fn stalled_endpoint_ends_the_session_after_the_write_timeout() {
        let log = Arc::new(MemoryLog::new());
        let topic = Bytes::from_static(b"orders");
        publish(&log, &topic, 4).await;

        let manager = manager(log.clone(), Duration::from_millis(50));
        // Capacity one and nobody draining: the second send stalls.
        let (tx, _rx) = mpsc::channel(1);
        manager.start_serving(
            TopicSubscriber::new(topic.clone(), Bytes::from_static(b"s1")),
            1,
            Arc::new(ChannelEndpoint { tx }),
            PipelineFilter::default(),
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(manager.active_sessions(), 0);
    }

    #[tokio::test]
    async fn stop_serving_ends_the_session() {
        let log = Arc::new(MemoryLog::new());
        let topic = Bytes::from_static(b"orders");
        let manager = manager(log.clone(), Duration::from_secs(5));
        let (tx, _rx) = mpsc::channel(16);
        let key = TopicSubscriber::new(topic.clone(), Bytes::from_static(b"s1"));
        manager.start_serving(
            key.clone(),
            1,
            Arc::new(ChannelEndpoint { tx }),
            PipelineFilter::default(),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.stop_serving(&key);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.active_sessions(), 0);
    }
}
