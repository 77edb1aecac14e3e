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

use crate::channel::NetChannel;
use crate::config::ClientConfig;
use crate::message_handler::MessageHandler;
use bytes::Bytes;
use dashmap::DashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use strix_common::{
    is_valid_subscriber_id, BrokerAddress, ConsumeRequest, CreateOrAttach, Message, MessageSeqId,
    OperationType, PublishRequest, PubSubRequest, PubSubResponse, RequestBody, ResponseBodyKind,
    ResponsePayload, StatusCode, StrixError, SubscribeRequest, SubscriptionPreferences,
    TopicSubscriber, UnsubscribeRequest, PROTOCOL_VERSION,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Client for the strix broker cluster.
///
/// Publishes and unsubscribes share one channel per broker host; every
/// subscription gets a dedicated channel so flow control on one does not
/// couple to the others. A process-wide topic-to-owner cache avoids
/// rediscovery round trips; entries are purged on disconnects and corrected
/// by redirects.
#[derive(Clone)]
pub struct PubSubClient {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    config: ClientConfig,
    seed: BrokerAddress,
    host_channels: DashMap<BrokerAddress, Arc<NetChannel>>,
    topic_owners: DashMap<Bytes, BrokerAddress>,
    subscriptions: DashMap<TopicSubscriber, Arc<SubscriptionHandle>>,
    txn_counter: AtomicU64,
    stopped: AtomicBool,
}

/// The logical subscription: it owns the dedicated channel currently
/// serving it and the message handler, which outlives channel churn.
pub(crate) struct SubscriptionHandle {
    topic: Bytes,
    subscriber_id: Bytes,
    original_request: SubscribeRequest,
    channel: Arc<NetChannel>,
    handler: Arc<tokio::sync::Mutex<Option<Arc<dyn MessageHandler>>>>,
    armed: Arc<Notify>,
    driver_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PubSubClient {
    pub fn new(config: ClientConfig) -> Result<Self, StrixError> {
        let seed = BrokerAddress::from_str(&config.seed_address)?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                seed,
                host_channels: DashMap::new(),
                topic_owners: DashMap::new(),
                subscriptions: DashMap::new(),
                txn_counter: AtomicU64::new(1),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    /// Publishes one message and returns its assigned sequence id.
    pub async fn publish(&self, topic: &Bytes, payload: Bytes) -> Result<MessageSeqId, StrixError> {
        self.inner.ensure_running()?;
        let body = RequestBody::Publish(PublishRequest {
            msg: Some(Message {
                payload,
                msg_id: None,
                src_region: None,
            }),
        });
        let response = self
            .inner
            .execute_shared(OperationType::Publish, topic, body)
            .await?;
        match response_body(&response) {
            Some(ResponseBodyKind::Publish(publish)) => publish
                .published_msg_id
                .clone()
                .ok_or_else(|| StrixError::MalformedRequest("publish ack without a seq id".into())),
            _ => Err(StrixError::MalformedRequest(
                "publish ack without a response body".into(),
            )),
        }
    }

    /// Creates or attaches the subscription. Messages buffer server-side
    /// until [`PubSubClient::start_delivery`] arms a handler.
    pub async fn subscribe(
        &self,
        topic: &Bytes,
        subscriber_id: &Bytes,
        mode: CreateOrAttach,
        preferences: Option<SubscriptionPreferences>,
    ) -> Result<(), StrixError> {
        self.inner.ensure_running()?;
        if !is_valid_subscriber_id(subscriber_id, false) {
            return Err(StrixError::InvalidSubscriberId(
                String::from_utf8_lossy(subscriber_id).into_owned(),
            ));
        }
        let request = SubscribeRequest {
            subscriber_id: subscriber_id.clone(),
            create_or_attach: mode as i32,
            synchronous: false,
            force_attach: false,
            preferences,
        };
        self.inner.do_subscribe(topic.clone(), request).await
    }

    /// Subscribe variant carrying the force-attach flag: any session
    /// serving the same subscription elsewhere is evicted.
    pub async fn subscribe_force_attach(
        &self,
        topic: &Bytes,
        subscriber_id: &Bytes,
        mode: CreateOrAttach,
    ) -> Result<(), StrixError> {
        self.inner.ensure_running()?;
        if !is_valid_subscriber_id(subscriber_id, false) {
            return Err(StrixError::InvalidSubscriberId(
                String::from_utf8_lossy(subscriber_id).into_owned(),
            ));
        }
        let request = SubscribeRequest {
            subscriber_id: subscriber_id.clone(),
            create_or_attach: mode as i32,
            synchronous: false,
            force_attach: true,
            preferences: None,
        };
        self.inner.do_subscribe(topic.clone(), request).await
    }

    /// Arms the message handler for an established subscription.
    pub async fn start_delivery(
        &self,
        topic: &Bytes,
        subscriber_id: &Bytes,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), StrixError> {
        let key = TopicSubscriber::new(topic.clone(), subscriber_id.clone());
        let Some(handle) = self.inner.subscriptions.get(&key).map(|entry| entry.value().clone()) else {
            return Err(StrixError::NotSubscribed {
                topic: String::from_utf8_lossy(topic).into_owned(),
                subscriber: String::from_utf8_lossy(subscriber_id).into_owned(),
            });
        };
        *handle.handler.lock().await = Some(handler);
        handle.armed.notify_one();
        Ok(())
    }

    /// Stops invoking the handler; messages buffer under flow control until
    /// delivery is started again.
    pub async fn stop_delivery(
        &self,
        topic: &Bytes,
        subscriber_id: &Bytes,
    ) -> Result<(), StrixError> {
        let key = TopicSubscriber::new(topic.clone(), subscriber_id.clone());
        let Some(handle) = self.inner.subscriptions.get(&key).map(|entry| entry.value().clone()) else {
            return Err(StrixError::NotSubscribed {
                topic: String::from_utf8_lossy(topic).into_owned(),
                subscriber: String::from_utf8_lossy(subscriber_id).into_owned(),
            });
        };
        *handle.handler.lock().await = None;
        Ok(())
    }

    /// Advances the subscription's consume pointer on the broker. Fire and
    /// forget: no ack is produced and a dropped frame only means bounded
    /// redelivery after recovery.
    pub async fn consume(
        &self,
        topic: &Bytes,
        subscriber_id: &Bytes,
        seq_id: MessageSeqId,
    ) -> Result<(), StrixError> {
        let key = TopicSubscriber::new(topic.clone(), subscriber_id.clone());
        let Some(handle) = self.inner.subscriptions.get(&key).map(|entry| entry.value().clone()) else {
            return Err(StrixError::NotSubscribed {
                topic: String::from_utf8_lossy(topic).into_owned(),
                subscriber: String::from_utf8_lossy(subscriber_id).into_owned(),
            });
        };
        let request = PubSubRequest {
            protocol_version: PROTOCOL_VERSION,
            operation_type: OperationType::Consume as i32,
            topic: topic.clone(),
            txn_id: self.inner.next_txn_id(),
            should_claim: false,
            tried_servers: Vec::new(),
            body: Some(RequestBody::Consume(ConsumeRequest {
                subscriber_id: subscriber_id.clone(),
                msg_id: Some(seq_id),
            })),
        };
        handle.channel.send_only(request).await
    }

    /// Tears the local subscription down, then removes it on the broker.
    pub async fn unsubscribe(
        &self,
        topic: &Bytes,
        subscriber_id: &Bytes,
    ) -> Result<(), StrixError> {
        self.inner.ensure_running()?;
        if !is_valid_subscriber_id(subscriber_id, false) {
            return Err(StrixError::InvalidSubscriberId(
                String::from_utf8_lossy(subscriber_id).into_owned(),
            ));
        }
        // Local teardown happens first: even if the request fails, no more
        // messages are delivered and the caller can retry the unsubscribe.
        let key = TopicSubscriber::new(topic.clone(), subscriber_id.clone());
        self.inner.close_subscription(&key);
        let body = RequestBody::Unsubscribe(UnsubscribeRequest {
            subscriber_id: subscriber_id.clone(),
        });
        self.inner
            .execute_shared(OperationType::Unsubscribe, topic, body)
            .await?;
        Ok(())
    }

    /// Closes every channel and stops all delivery. Pending requests fail
    /// with `UncertainState`.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Stopping pub/sub client");
        let keys: Vec<TopicSubscriber> = self
            .inner
            .subscriptions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            self.inner.close_subscription(&key);
        }
        let addresses: Vec<BrokerAddress> = self
            .inner
            .host_channels
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for address in addresses {
            if let Some((_, channel)) = self.inner.host_channels.remove(&address) {
                channel.close();
            }
        }
    }

    /// The cached owner for a topic, if any. Exposed for tests.
    pub fn cached_owner(&self, topic: &Bytes) -> Option<String> {
        self.inner
            .topic_owners
            .get(topic)
            .map(|entry| entry.to_string())
    }
}

impl ClientInner {
    fn ensure_running(&self) -> Result<(), StrixError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(StrixError::ClientStopped);
        }
        Ok(())
    }

    fn next_txn_id(&self) -> u64 {
        self.txn_counter.fetch_add(1, Ordering::Relaxed)
    }

    fn build_request(
        &self,
        operation: OperationType,
        topic: &Bytes,
        body: RequestBody,
        should_claim: bool,
        tried_servers: &[String],
    ) -> PubSubRequest {
        PubSubRequest {
            protocol_version: PROTOCOL_VERSION,
            operation_type: operation as i32,
            topic: topic.clone(),
            txn_id: self.next_txn_id(),
            should_claim,
            tried_servers: tried_servers
                .iter()
                .map(|server| Bytes::copy_from_slice(server.as_bytes()))
                .collect(),
            body: Some(body),
        }
    }

    /// The redirect-chasing request loop for operations that ride the
    /// shared per-host channels (publish, unsubscribe).
    async fn execute_shared(
        self: &Arc<Self>,
        operation: OperationType,
        topic: &Bytes,
        body: RequestBody,
    ) -> Result<PubSubResponse, StrixError> {
        let mut tried: Vec<String> = Vec::new();
        let mut should_claim = false;
        let mut target = self
            .topic_owners
            .get(topic)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| self.seed.clone());
        loop {
            let channel = self.shared_channel(&target).await?;
            let request = self.build_request(operation, topic, body.clone(), should_claim, &tried);
            let response = channel.request(request, self.config.request_timeout).await?;
            if response.status() != StatusCode::NotResponsibleForTopic {
                self.topic_owners.insert(topic.clone(), target.clone());
            }
            match response.status() {
                StatusCode::Success => return Ok(response),
                StatusCode::NotResponsibleForTopic => {
                    target = self.next_redirect_target(
                        topic,
                        &target,
                        &response.status_msg,
                        &mut tried,
                    )?;
                    should_claim = true;
                }
                status => return Err(StrixError::from_status(status, &response.status_msg)),
            }
        }
    }

    /// One redirect step: budget check, next-host extraction with seed
    /// fallback, loop detection. Routing failures surface as `ServiceDown`
    /// with the precise cause inside.
    fn next_redirect_target(
        &self,
        topic: &Bytes,
        current: &BrokerAddress,
        status_msg: &str,
        tried: &mut Vec<String>,
    ) -> Result<BrokerAddress, StrixError> {
        if tried.len() >= self.config.max_server_redirects {
            return Err(StrixError::service_down(StrixError::TooManyRedirects(
                tried.len(),
            )));
        }
        tried.push(current.to_string());
        let next = if status_msg.is_empty() {
            self.seed.clone()
        } else {
            BrokerAddress::from_str(status_msg)
                .map_err(StrixError::service_down)?
        };
        if tried.contains(&next.to_string()) {
            return Err(StrixError::service_down(StrixError::RedirectLoop(
                next.to_string(),
            )));
        }
        info!(
            "Redirected for topic: {} from: {current} to: {next}",
            String::from_utf8_lossy(topic)
        );
        Ok(next)
    }

    /// Returns the cached channel to `address`, connecting one when needed.
    async fn shared_channel(
        self: &Arc<Self>,
        address: &BrokerAddress,
    ) -> Result<Arc<NetChannel>, StrixError> {
        if let Some(channel) = self.host_channels.get(address).map(|entry| entry.value().clone()) {
            if channel.is_alive() {
                return Ok(channel);
            }
            self.host_channels
                .remove_if(address, |_, current| current.id == channel.id);
        }
        let weak: Weak<ClientInner> = Arc::downgrade(self);
        let hook_address = address.clone();
        let channel = NetChannel::connect(
            address.clone(),
            &self.config,
            None,
            Box::new(move |channel_id| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_shared_channel_disconnected(&hook_address, channel_id);
                }
            }),
        )
        .await?;
        // Insert-if-absent: a racing connect keeps the first live channel.
        match self.host_channels.entry(address.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) if existing.get().is_alive() => {
                let winner = existing.get().clone();
                drop(existing);
                channel.close();
                Ok(winner)
            }
            dashmap::mapref::entry::Entry::Occupied(mut stale) => {
                stale.insert(channel.clone());
                Ok(channel)
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(channel.clone());
                Ok(channel)
            }
        }
    }

    /// Disconnect of a shared publish/unsubscribe channel: drop it from the
    /// channel map and forget every owner cached for that host.
    fn on_shared_channel_disconnected(&self, address: &BrokerAddress, channel_id: u64) {
        if self
            .host_channels
            .remove_if(address, |_, channel| channel.id == channel_id)
            .is_some()
        {
            self.topic_owners.retain(|_, owner| owner != address);
        }
    }

    /// The subscribe flow: a dedicated channel per attempt, redirect chase,
    /// and on success the installed subscription handle with its delivery
    /// driver.
    pub(crate) async fn do_subscribe(
        self: &Arc<Self>,
        topic: Bytes,
        request: SubscribeRequest,
    ) -> Result<(), StrixError> {
        let key = TopicSubscriber::new(topic.clone(), request.subscriber_id.clone());
        let mut tried: Vec<String> = Vec::new();
        let mut should_claim = false;
        let mut target = self
            .topic_owners
            .get(&topic)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| self.seed.clone());
        loop {
            let weak: Weak<ClientInner> = Arc::downgrade(self);
            let hook_key = key.clone();
            let channel = NetChannel::connect(
                target.clone(),
                &self.config,
                Some(self.config.subscribe_read_timeout),
                Box::new(move |channel_id| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_subscribe_channel_disconnected(hook_key.clone(), channel_id);
                    }
                }),
            )
            .await?;

            let wire_request = self.build_request(
                OperationType::Subscribe,
                &topic,
                RequestBody::Subscribe(request.clone()),
                should_claim,
                &tried,
            );
            let response = match channel
                .request(wire_request, self.config.request_timeout)
                .await
            {
                Ok(response) => response,
                Err(request_error) => {
                    channel.close();
                    return Err(request_error);
                }
            };
            if response.status() != StatusCode::NotResponsibleForTopic {
                self.topic_owners.insert(topic.clone(), target.clone());
            }
            match response.status() {
                StatusCode::Success => {
                    self.install_subscription(key, topic, request, channel);
                    return Ok(());
                }
                StatusCode::NotResponsibleForTopic => {
                    channel.close();
                    target = self.next_redirect_target(
                        &topic,
                        &target,
                        &response.status_msg,
                        &mut tried,
                    )?;
                    should_claim = true;
                }
                status => {
                    channel.close();
                    return Err(StrixError::from_status(status, &response.status_msg));
                }
            }
        }
    }

    /// Installs (or replaces) the subscription handle. A replaced handle
    /// keeps its handler slot so delivery resumes where the caller left it.
    fn install_subscription(
        self: &Arc<Self>,
        key: TopicSubscriber,
        topic: Bytes,
        request: SubscribeRequest,
        channel: Arc<NetChannel>,
    ) {
        let (handler, armed) = match self.subscriptions.get(&key) {
            Some(existing) => (existing.handler.clone(), existing.armed.clone()),
            None => (
                Arc::new(tokio::sync::Mutex::new(None)),
                Arc::new(Notify::new()),
            ),
        };
        let handle = Arc::new(SubscriptionHandle {
            topic,
            subscriber_id: key.subscriber_id.clone(),
            original_request: request,
            channel,
            handler,
            armed,
            driver_task: std::sync::Mutex::new(None),
        });
        self.spawn_delivery_driver(&handle);
        if let Some(previous) = self.subscriptions.insert(key, handle) {
            if let Some(task) = previous.driver_task.lock().unwrap().take() {
                task.abort();
            }
            previous.channel.close();
        }
    }

    /// Per-subscription driver: pulls pushed messages off the channel,
    /// parks while no handler is armed, and sends automatic consume frames
    /// every `auto_send_consume_window` handled messages.
    fn spawn_delivery_driver(self: &Arc<Self>, handle: &Arc<SubscriptionHandle>) {
        let Some(mut delivery_rx) = handle.channel.take_delivery_rx() else {
            return;
        };
        let topic = handle.topic.clone();
        let subscriber_id = handle.subscriber_id.clone();
        let handler_slot = handle.handler.clone();
        let armed = handle.armed.clone();
        let channel = handle.channel.clone();
        let window = self.config.auto_send_consume_window;
        let weak: Weak<ClientInner> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut handled_since_consume = 0usize;
            while let Some(message) = delivery_rx.recv().await {
                let seq_id = message.msg_id.clone();
                loop {
                    let maybe_handler = handler_slot.lock().await.clone();
                    match maybe_handler {
                        Some(handler) => {
                            handler.handle(&topic, &subscriber_id, message.clone()).await;
                            break;
                        }
                        None => armed.notified().await,
                    }
                }
                if window == 0 {
                    continue;
                }
                handled_since_consume += 1;
                if handled_since_consume < window {
                    continue;
                }
                handled_since_consume = 0;
                let (Some(seq_id), Some(inner)) = (seq_id.clone(), weak.upgrade()) else {
                    continue;
                };
                let request = PubSubRequest {
                    protocol_version: PROTOCOL_VERSION,
                    operation_type: OperationType::Consume as i32,
                    topic: topic.clone(),
                    txn_id: inner.next_txn_id(),
                    should_claim: false,
                    tried_servers: Vec::new(),
                    body: Some(RequestBody::Consume(ConsumeRequest {
                        subscriber_id: subscriber_id.clone(),
                        msg_id: Some(seq_id),
                    })),
                };
                let _ = channel.send_only(request).await;
            }
        });
        *handle.driver_task.lock().unwrap() = Some(task);
    }

    /// Recovery for a dropped subscribe channel: purge the topic's cached
    /// owner for that host, clear the redirect state and re-submit the
    /// original request to the seed host. On success delivery restarts with
    /// whatever handler was armed at disconnect time.
    fn on_subscribe_channel_disconnected(
        self: &Arc<Self>,
        key: TopicSubscriber,
        channel_id: u64,
    ) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let Some(handle) = self.subscriptions.get(&key).map(|entry| entry.value().clone()) else {
            info!("Channel for an unknown subscription was disconnected");
            return;
        };
        if handle.channel.id != channel_id {
            // The subscription already moved to a newer channel.
            return;
        }
        self.topic_owners
            .remove_if(&key.topic, |_, owner| *owner == handle.channel.address);
        let inner = self.clone();
        tokio::spawn(async move {
            warn!("Subscribe channel for {key} was disconnected, resubscribing via the seed host");
            // Failover is not instant: the new owner may still be claiming
            // the topic, so transient failures are retried with backoff.
            const RECONNECT_ATTEMPTS: usize = 10;
            const RECONNECT_BACKOFF: Duration = Duration::from_millis(200);
            for attempt in 1..=RECONNECT_ATTEMPTS {
                match inner
                    .do_subscribe(key.topic.clone(), handle.original_request.clone())
                    .await
                {
                    Ok(()) => {
                        info!("Resubscribed {key} after a disconnect");
                        return;
                    }
                    Err(
                        resubscribe_error @ (StrixError::AlreadySubscribed { .. }
                        | StrixError::NotSubscribed { .. }
                        | StrixError::TopicBusy { .. }
                        | StrixError::InvalidSubscriberId(_)
                        | StrixError::InvalidMessageFilter(_)),
                    ) => {
                        error!("Cannot resubscribe {key}: {resubscribe_error}");
                        break;
                    }
                    Err(resubscribe_error) => {
                        warn!(
                            "Resubscribe attempt {attempt}/{RECONNECT_ATTEMPTS} for {key} failed: {resubscribe_error}"
                        );
                        tokio::time::sleep(RECONNECT_BACKOFF).await;
                    }
                }
            }
            error!("Giving up on resubscribing {key}");
            inner.close_subscription(&key);
        });
    }

    pub(crate) fn close_subscription(&self, key: &TopicSubscriber) {
        if let Some((_, handle)) = self.subscriptions.remove(key) {
            if let Some(task) = handle.driver_task.lock().unwrap().take() {
                task.abort();
            }
            handle.channel.close();
        }
    }
}

fn response_body(response: &PubSubResponse) -> Option<&ResponseBodyKind> {
    match &response.payload {
        Some(ResponsePayload::Body(body)) => body.kind.as_ref(),
        _ => None,
    }
}
