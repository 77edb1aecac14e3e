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

mod memory;
mod store;

pub use memory::MemoryMetadataStore;
pub use store::{MetadataError, MetadataStore, SessionId, WatchEvent};

use bytes::{BufMut, Bytes, BytesMut};

pub const OWNERS_PREFIX: &[u8] = b"owners/";
pub const SUBSCRIPTIONS_PREFIX: &[u8] = b"subscriptions/";

/// Key holding the ephemeral ownership claim for a topic.
pub fn owner_key(topic: &Bytes) -> Bytes {
    let mut key = BytesMut::with_capacity(OWNERS_PREFIX.len() + topic.len());
    key.put_slice(OWNERS_PREFIX);
    key.put_slice(topic);
    key.freeze()
}

pub fn topic_of_owner_key(key: &Bytes) -> Option<Bytes> {
    key.starts_with(OWNERS_PREFIX)
        .then(|| key.slice(OWNERS_PREFIX.len()..))
}

/// Prefix under which a topic's subscription records live.
pub fn subscriptions_prefix(topic: &Bytes) -> Bytes {
    let mut key = BytesMut::with_capacity(SUBSCRIPTIONS_PREFIX.len() + topic.len() + 1);
    key.put_slice(SUBSCRIPTIONS_PREFIX);
    key.put_slice(topic);
    key.put_u8(b'/');
    key.freeze()
}

/// Key of one persisted subscription record.
pub fn subscription_key(topic: &Bytes, subscriber_id: &Bytes) -> Bytes {
    let prefix = subscriptions_prefix(topic);
    let mut key = BytesMut::with_capacity(prefix.len() + subscriber_id.len());
    key.put_slice(&prefix);
    key.put_slice(subscriber_id);
    key.freeze()
}
