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
use std::fmt;

/// Reserved prefix marking hub subscribers, the cross-region consumers that
/// import a topic into another region. Local subscriber ids must not start
/// with it.
pub const HUB_SUBSCRIBER_PREFIX: &[u8] = b"__hub:";

pub fn is_hub_subscriber(subscriber_id: &[u8]) -> bool {
    subscriber_id.starts_with(HUB_SUBSCRIBER_PREFIX)
}

/// Checks the subscriber id against the namespace it claims to be in.
pub fn is_valid_subscriber_id(subscriber_id: &[u8], is_hub: bool) -> bool {
    !subscriber_id.is_empty() && is_hub_subscriber(subscriber_id) == is_hub
}

/// The unique key of a subscription: one topic, one subscriber id.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TopicSubscriber {
    pub topic: Bytes,
    pub subscriber_id: Bytes,
}

impl TopicSubscriber {
    pub fn new(topic: Bytes, subscriber_id: Bytes) -> Self {
        Self {
            topic,
            subscriber_id,
        }
    }
}

impl fmt::Display for TopicSubscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(topic: {}, subscriber: {})",
            String::from_utf8_lossy(&self.topic),
            String::from_utf8_lossy(&self.subscriber_id)
        )
    }
}

impl fmt::Debug for TopicSubscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
