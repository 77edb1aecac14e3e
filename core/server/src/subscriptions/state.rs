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

use strix_common::{
    MessageSeqId, SubscriptionData, SubscriptionPreferences, SubscriptionState,
};

/// The in-memory view of one subscription.
///
/// `persisted` mirrors the record in the metadata store; `last_consumed` runs
/// ahead of it and is folded in lazily (every `consume_interval` messages, on
/// topic release and on shutdown). Crash recovery therefore re-delivers a
/// bounded window of duplicates, preserving at-least-once.
#[derive(Clone, Debug)]
pub struct InMemorySubscriptionState {
    persisted: SubscriptionState,
    preferences: SubscriptionPreferences,
    last_consumed: MessageSeqId,
}

impl InMemorySubscriptionState {
    pub fn new(data: SubscriptionData) -> Self {
        let persisted = data.state.unwrap_or_default();
        let last_consumed = persisted.msg_id.clone().unwrap_or_default();
        Self {
            persisted,
            preferences: data.preferences.unwrap_or_default(),
            last_consumed,
        }
    }

    pub fn preferences(&self) -> &SubscriptionPreferences {
        &self.preferences
    }

    /// Local component of the in-memory consume pointer.
    pub fn consumed_seq(&self) -> u64 {
        self.last_consumed.local_component
    }

    fn persisted_seq(&self) -> u64 {
        self.persisted
            .msg_id
            .as_ref()
            .map(|id| id.local_component)
            .unwrap_or(0)
    }

    /// Advances the in-memory consume pointer. Returns whether the pointer
    /// has run far enough ahead of the persisted record that it should be
    /// persisted now. A pointer at or below the current one is a no-op.
    pub fn advance_consume_pointer(&mut self, seq_id: &MessageSeqId, consume_interval: u64) -> bool {
        if seq_id.local_component <= self.last_consumed.local_component {
            return false;
        }
        self.last_consumed = seq_id.clone();
        self.last_consumed.local_component - self.persisted_seq() >= consume_interval
    }

    /// Record to persist if the in-memory pointer ran ahead, `None` if clean.
    /// Callers persist it and then commit with [`Self::mark_flushed`], so a
    /// failed metadata write leaves the persisted view untouched.
    pub fn pending_flush(&self) -> Option<SubscriptionData> {
        (self.last_consumed.local_component > self.persisted_seq())
            .then(|| self.to_subscription_data_at(self.last_consumed.clone()))
    }

    pub fn mark_flushed(&mut self) {
        self.persisted.msg_id = Some(self.last_consumed.clone());
    }

    /// Field-wise merge of newly supplied preferences. Returns whether
    /// anything changed and the merged record needs to be persisted.
    pub fn merge_preferences(&mut self, new: &SubscriptionPreferences) -> bool {
        let mut changed = false;
        if new.message_bound.is_some() && new.message_bound != self.preferences.message_bound {
            self.preferences.message_bound = new.message_bound;
            changed = true;
        }
        if new.message_filter.is_some() && new.message_filter != self.preferences.message_filter {
            self.preferences.message_filter = new.message_filter.clone();
            changed = true;
        }
        for (key, value) in &new.options {
            if self.preferences.options.get(key) != Some(value) {
                self.preferences
                    .options
                    .insert(key.clone(), value.clone());
                changed = true;
            }
        }
        changed
    }

    pub fn to_subscription_data(&self) -> SubscriptionData {
        self.to_subscription_data_at(self.persisted.msg_id.clone().unwrap_or_default())
    }

    fn to_subscription_data_at(&self, msg_id: MessageSeqId) -> SubscriptionData {
        SubscriptionData {
            state: Some(SubscriptionState {
                msg_id: Some(msg_id),
            }),
            preferences: Some(self.preferences.clone()),
        }
    }
}
