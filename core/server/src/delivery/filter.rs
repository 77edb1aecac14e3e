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

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use strix_common::{is_hub_subscriber, Message, StrixError, SubscriptionPreferences};

/// Server-side message filter applied between the log scan and the wire.
/// Filtered-out messages still advance the delivery pointer.
pub trait ServerMessageFilter: Send + Sync {
    fn set_subscription_preferences(
        &mut self,
        topic: &Bytes,
        subscriber_id: &Bytes,
        preferences: &SubscriptionPreferences,
    );

    fn accepts(&self, message: &Message) -> bool;
}

/// Keeps hub subscribers from re-importing messages that already crossed a
/// region boundary: in an all-to-all topology every region subscribes to
/// every other, so only locally originated messages may leave the region.
pub struct AllToAllTopologyFilter {
    local_region: Bytes,
    subscriber_is_hub: bool,
}

impl AllToAllTopologyFilter {
    pub fn new(local_region: Bytes) -> Self {
        Self {
            local_region,
            subscriber_is_hub: false,
        }
    }
}

impl ServerMessageFilter for AllToAllTopologyFilter {
    fn set_subscription_preferences(
        &mut self,
        _topic: &Bytes,
        subscriber_id: &Bytes,
        _preferences: &SubscriptionPreferences,
    ) {
        self.subscriber_is_hub = is_hub_subscriber(subscriber_id);
    }

    fn accepts(&self, message: &Message) -> bool {
        if !self.subscriber_is_hub {
            return true;
        }
        match &message.src_region {
            None => true,
            Some(region) => *region == self.local_region,
        }
    }
}

/// An ordered chain of filters; a message is delivered only when every
/// filter accepts it.
#[derive(Default)]
pub struct PipelineFilter {
    filters: Vec<Box<dyn ServerMessageFilter>>,
}

impl PipelineFilter {
    pub fn add_last(&mut self, filter: Box<dyn ServerMessageFilter>) {
        self.filters.push(filter);
    }

    pub fn set_subscription_preferences(
        &mut self,
        topic: &Bytes,
        subscriber_id: &Bytes,
        preferences: &SubscriptionPreferences,
    ) {
        for filter in &mut self.filters {
            filter.set_subscription_preferences(topic, subscriber_id, preferences);
        }
    }

    pub fn accepts(&self, message: &Message) -> bool {
        self.filters.iter().all(|filter| filter.accepts(message))
    }
}

type FilterFactory = Arc<dyn Fn() -> Box<dyn ServerMessageFilter> + Send + Sync>;

/// Named user filters registered at bootstrap. Subscription preferences
/// select a filter by its registered name; unknown names fail the subscribe
/// with `InvalidMessageFilter`.
#[derive(Default)]
pub struct FilterRegistry {
    factories: HashMap<String, FilterFactory>,
}

impl FilterRegistry {
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn ServerMessageFilter> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn build(&self, name: &str) -> Result<Box<dyn ServerMessageFilter>, StrixError> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| StrixError::InvalidMessageFilter(name.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(src_region: Option<&'static [u8]>) -> Message {
        Message {
            payload: Bytes::from_static(b"m"),
            msg_id: None,
            src_region: src_region.map(Bytes::from_static),
        }
    }

    #[test]
    fn local_subscribers_receive_everything() {
        let mut filter = AllToAllTopologyFilter::new(Bytes::from_static(b"region-a"));
        filter.set_subscription_preferences(
            &Bytes::from_static(b"orders"),
            &Bytes::from_static(b"s1"),
            &SubscriptionPreferences::default(),
        );
        assert!(filter.accepts(&message(None)));
        assert!(filter.accepts(&message(Some(b"region-b"))));
    }

    #[test]
    fn hub_subscribers_only_receive_locally_originated_messages() {
        let mut filter = AllToAllTopologyFilter::new(Bytes::from_static(b"region-a"));
        filter.set_subscription_preferences(
            &Bytes::from_static(b"orders"),
            &Bytes::from_static(b"__hub:region-b"),
            &SubscriptionPreferences::default(),
        );
        assert!(filter.accepts(&message(None)));
        assert!(filter.accepts(&message(Some(b"region-a"))));
        assert!(!filter.accepts(&message(Some(b"region-b"))));
    }

    #[test]
    fn registry_rejects_unknown_filter_names() {
        let mut registry = FilterRegistry::default();
        registry.register("topology", || {
            Box::new(AllToAllTopologyFilter::new(Bytes::from_static(b"region-a")))
        });
        assert!(registry.build("topology").is_ok());
        assert!(matches!(
            registry.build("no-such-filter"),
            Err(StrixError::InvalidMessageFilter(_))
        ));
    }
}
