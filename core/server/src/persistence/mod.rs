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

pub use memory::MemoryLog;

use async_trait::async_trait;
use bytes::Bytes;
use strix_common::{Message, MessageSeqId, StrixError};
use tokio::sync::watch;

/// Gateway to the durable, append-only, range-scannable message log.
///
/// The broker is the only writer for topics it owns; sequence ids are minted
/// here at append time and are strictly increasing without gaps per topic.
/// `consumed_until` and the message bound are advisory garbage-collection
/// hints; the underlying log may retain longer.
#[async_trait]
pub trait MessageLog: Send + Sync {
    /// Appends a message and returns the assigned sequence id.
    async fn append(&self, topic: &Bytes, message: Message) -> Result<MessageSeqId, StrixError>;

    /// Scans up to `max_count` messages (or `max_bytes` of payload) starting
    /// at `from`. An empty result means the scan is caught up with the tail.
    async fn scan(
        &self,
        topic: &Bytes,
        from: u64,
        max_count: usize,
        max_bytes: usize,
    ) -> Result<Vec<Message>, StrixError>;

    /// Sequence id of the last published message; zero for a fresh topic.
    async fn current_seq_id(&self, topic: &Bytes) -> MessageSeqId;

    /// Hints that messages with local component <= `seq` are no longer
    /// needed by any subscriber on this node.
    async fn consumed_until(&self, topic: &Bytes, seq: u64);

    /// Caps the number of retained-but-unconsumed messages.
    async fn set_message_bound(&self, topic: &Bytes, bound: u32);

    async fn clear_message_bound(&self, topic: &Bytes);

    /// Watch on the topic tail; the value is the last appended sequence id.
    fn tail(&self, topic: &Bytes) -> watch::Receiver<u64>;
}
