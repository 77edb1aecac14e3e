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

use super::MessageLog;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use strix_common::{Message, MessageSeqId, StrixError};
use tokio::sync::{watch, Mutex};
use tracing::trace;

struct TopicLog {
    inner: Mutex<TopicLogInner>,
    tail_tx: watch::Sender<u64>,
    tail_rx: watch::Receiver<u64>,
}

#[derive(Default)]
struct TopicLogInner {
    /// Retained messages, oldest first. Front seq is `last_seq - len + 1`.
    messages: VecDeque<Message>,
    last_seq: u64,
    consumed_until: u64,
    message_bound: Option<u32>,
}

impl TopicLogInner {
    fn trim(&mut self) {
        while let Some(front) = self.messages.front() {
            let seq = front
                .msg_id
                .as_ref()
                .map(|id| id.local_component)
                .unwrap_or(0);
            if seq <= self.consumed_until {
                self.messages.pop_front();
                continue;
            }
            break;
        }
        if let Some(bound) = self.message_bound {
            while self.messages.len() > bound as usize {
                self.messages.pop_front();
            }
        }
    }
}

impl TopicLog {
    fn new() -> Self {
        let (tail_tx, tail_rx) = watch::channel(0);
        Self {
            inner: Mutex::new(TopicLogInner::default()),
            tail_tx,
            tail_rx,
        }
    }
}

/// In-memory implementation of the durable log. A single instance may be
/// shared by several in-process nodes so that a failed-over topic keeps its
/// history, the way an external replicated log would.
pub struct MemoryLog {
    topics: DashMap<Bytes, Arc<TopicLog>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
        }
    }

    fn topic(&self, topic: &Bytes) -> Arc<TopicLog> {
        self.topics
            .entry(topic.clone())
            .or_insert_with(|| Arc::new(TopicLog::new()))
            .clone()
    }

    /// Number of retained-but-unconsumed messages, for tests and stats.
    pub async fn retained_unconsumed(&self, topic: &Bytes) -> usize {
        match self.topics.get(topic) {
            Some(entry) => entry.inner.lock().await.messages.len(),
            None => 0,
        }
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageLog for MemoryLog {
    async fn append(&self, topic: &Bytes, mut message: Message) -> Result<MessageSeqId, StrixError> {
        let log = self.topic(topic);
        let mut inner = log.inner.lock().await;
        inner.last_seq += 1;
        let seq = inner.last_seq;
        let mut msg_id = message
            .msg_id
            .take()
            .unwrap_or_else(|| MessageSeqId::local(0));
        msg_id.local_component = seq;
        message.msg_id = Some(msg_id.clone());
        inner.messages.push_back(message);
        inner.trim();
        drop(inner);
        let _ = log.tail_tx.send(seq);
        trace!(
            "Appended message with seq: {seq} to topic: {}",
            String::from_utf8_lossy(topic)
        );
        Ok(msg_id)
    }

    async fn scan(
        &self,
        topic: &Bytes,
        from: u64,
        max_count: usize,
        max_bytes: usize,
    ) -> Result<Vec<Message>, StrixError> {
        let Some(log) = self.topics.get(topic).map(|entry| entry.value().clone()) else {
            return Ok(Vec::new());
        };
        let inner = log.inner.lock().await;
        let mut batch = Vec::new();
        let mut bytes = 0usize;
        for message in inner.messages.iter() {
            let seq = message
                .msg_id
                .as_ref()
                .map(|id| id.local_component)
                .unwrap_or(0);
            if seq < from {
                continue;
            }
            if batch.len() >= max_count || (bytes > 0 && bytes + message.payload.len() > max_bytes)
            {
                break;
            }
            bytes += message.payload.len();
            batch.push(message.clone());
        }
        Ok(batch)
    }

    async fn current_seq_id(&self, topic: &Bytes) -> MessageSeqId {
        match self.topics.get(topic) {
            Some(entry) => MessageSeqId::local(entry.inner.lock().await.last_seq),
            None => MessageSeqId::local(0),
        }
    }

    async fn consumed_until(&self, topic: &Bytes, seq: u64) {
        let log = self.topic(topic);
        let mut inner = log.inner.lock().await;
        if seq > inner.consumed_until {
            inner.consumed_until = seq;
            inner.trim();
        }
    }

    async fn set_message_bound(&self, topic: &Bytes, bound: u32) {
        let log = self.topic(topic);
        let mut inner = log.inner.lock().await;
        inner.message_bound = Some(bound);
        inner.trim();
    }

    async fn clear_message_bound(&self, topic: &Bytes) {
        let log = self.topic(topic);
        log.inner.lock().await.message_bound = None;
    }

    fn tail(&self, topic: &Bytes) -> watch::Receiver<u64> {
        self.topic(topic).tail_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(text: &str) -> Message {
        Message {
            payload: Bytes::copy_from_slice(text.as_bytes()),
            msg_id: None,
            src_region: None,
        }
    }

    #[tokio::test]
    async fn append_assigns_gapless_monotone_seq_ids() {
        let log = MemoryLog::new();
        let topic = Bytes::from_static(b"orders");
        for expected in 1..=5u64 {
            let assigned = log.append(&topic, payload("m")).await.unwrap();
            assert_eq!(assigned.local_component, expected);
        }
        assert_eq!(log.current_seq_id(&topic).await.local_component, 5);
    }

    #[tokio::test]
    async fn scan_restarts_from_any_seq_and_respects_count() {
        let log = MemoryLog::new();
        let topic = Bytes::from_static(b"orders");
        for i in 0..10 {
            log.append(&topic, payload(&format!("m{i}"))).await.unwrap();
        }

        let batch = log.scan(&topic, 4, 3, usize::MAX).await.unwrap();
        let seqs: Vec<u64> = batch
            .iter()
            .map(|m| m.msg_id.as_ref().unwrap().local_component)
            .collect();
        assert_eq!(seqs, vec![4, 5, 6]);

        let rest = log.scan(&topic, 7, 100, usize::MAX).await.unwrap();
        assert_eq!(rest.len(), 4);
        let tail = log.scan(&topic, 11, 100, usize::MAX).await.unwrap();
        assert!(tail.is_empty());
    }

    #[tokio::test]
    async fn consumed_until_and_bound_trim_retained_messages() {
        let log = MemoryLog::new();
        let topic = Bytes::from_static(b"orders");
        for _ in 0..500 {
            log.append(&topic, payload("m")).await.unwrap();
        }

        log.consumed_until(&topic, 100).await;
        assert_eq!(log.retained_unconsumed(&topic).await, 400);

        log.set_message_bound(&topic, 200).await;
        assert_eq!(log.retained_unconsumed(&topic).await, 200);

        // Trimmed messages are gone; scans start at the first retained seq.
        let batch = log.scan(&topic, 1, 1, usize::MAX).await.unwrap();
        assert_eq!(batch[0].msg_id.as_ref().unwrap().local_component, 301);
    }

    #[tokio::test]
    async fn tail_watch_observes_appends() {
        let log = MemoryLog::new();
        let topic = Bytes::from_static(b"orders");
        let mut tail = log.tail(&topic);
        assert_eq!(*tail.borrow(), 0);
        log.append(&topic, payload("m")).await.unwrap();
        tail.changed().await.unwrap();
        assert_eq!(*tail.borrow_and_update(), 1);
    }
}
