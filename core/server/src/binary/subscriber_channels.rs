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

use crate::delivery::DeliveryEndpoint;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use strix_common::TopicSubscriber;
use tracing::info;

/// One subscriber channel as seen by the registry. Identity is the
/// connection id; the endpoint handle is what force-attach closes.
#[derive(Clone)]
pub struct ChannelHandle {
    pub conn_id: u64,
    pub endpoint: Arc<dyn DeliveryEndpoint>,
}

/// A different live channel already serves the subscription.
#[derive(Debug)]
pub struct ChannelBusy;

/// The `subscription -> channel` and `channel -> subscriptions` registries
/// the subscribe path maintains. At most one channel serves a subscription
/// per node; a new subscribe either loses with `ChannelBusy` or, with
/// force-attach, evicts the old channel.
#[derive(Default)]
pub struct SubscriberChannels {
    sub_to_channel: DashMap<TopicSubscriber, ChannelHandle>,
    channel_to_subs: DashMap<u64, Vec<TopicSubscriber>>,
}

impl SubscriberChannels {
    /// Installs `handle` as the serving channel. With `force_attach` the
    /// current holder is closed (best effort) and replaced.
    pub fn register(
        &self,
        topic_subscriber: TopicSubscriber,
        handle: ChannelHandle,
        force_attach: bool,
    ) -> Result<(), ChannelBusy> {
        match self.sub_to_channel.entry(topic_subscriber.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(handle.clone());
            }
            Entry::Occupied(mut entry) => {
                let old = entry.get().clone();
                if old.conn_id == handle.conn_id {
                    entry.insert(handle.clone());
                } else if force_attach {
                    info!(
                        "New subscribe request for {topic_subscriber} kills old channel: {}",
                        old.conn_id
                    );
                    old.endpoint.close();
                    entry.insert(handle.clone());
                } else {
                    return Err(ChannelBusy);
                }
            }
        }
        self.channel_to_subs
            .entry(handle.conn_id)
            .or_default()
            .push(topic_subscriber);
        Ok(())
    }

    /// Removes the subscription mapping regardless of the serving channel;
    /// used by the unsubscribe path. Returns the evicted handle.
    pub fn remove(&self, topic_subscriber: &TopicSubscriber) -> Option<ChannelHandle> {
        self.sub_to_channel
            .remove(topic_subscriber)
            .map(|(_, handle)| handle)
    }

    /// Disconnect cleanup for one channel. The `sub -> channel` side is
    /// removed only while it still maps to this channel, so a newer session
    /// installed by force-attach is never evicted.
    pub fn on_channel_disconnected(&self, conn_id: u64) -> Vec<TopicSubscriber> {
        let Some((_, subscriptions)) = self.channel_to_subs.remove(&conn_id) else {
            return Vec::new();
        };
        subscriptions
            .into_iter()
            .filter(|topic_subscriber| {
                self.sub_to_channel
                    .remove_if(topic_subscriber, |_, handle| handle.conn_id == conn_id)
                    .is_some()
            })
            .collect()
    }

    pub fn serving_channel(&self, topic_subscriber: &TopicSubscriber) -> Option<u64> {
        self.sub_to_channel
            .get(topic_subscriber)
            .map(|entry| entry.conn_id)
    }
}
