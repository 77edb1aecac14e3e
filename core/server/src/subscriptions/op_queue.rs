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
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

type QueuedOp = Pin<Box<dyn Future<Output = ()> + Send>>;

/// The queue closed underneath a submitted operation, which happens when the
/// topic was retired while the op was in flight.
#[derive(Debug)]
pub struct OpQueueClosed;

/// Per-topic serializer: one bounded FIFO per topic, drained by a task that
/// runs at most one operation at a time. Operations across topics run in
/// parallel. Queues are created lazily and retired on topic release.
pub struct TopicOpQueue {
    label: &'static str,
    capacity: usize,
    queues: DashMap<Bytes, mpsc::Sender<QueuedOp>>,
}

impl TopicOpQueue {
    pub fn new(label: &'static str, capacity: usize) -> Self {
        Self {
            label,
            capacity,
            queues: DashMap::new(),
        }
    }

    /// Runs `op` serialized with all other operations on `topic` and returns
    /// its output. Awaits queue capacity when the topic's queue is full.
    pub async fn run<R, F>(&self, topic: &Bytes, op: F) -> Result<R, OpQueueClosed>
    where
        F: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let mut queued: QueuedOp = Box::pin(async move {
            let _ = done_tx.send(op.await);
        });
        loop {
            let sender = self
                .queues
                .entry(topic.clone())
                .or_insert_with(|| self.spawn_drain_task(topic))
                .clone();
            match sender.send(queued).await {
                Ok(()) => break,
                Err(mpsc::error::SendError(returned)) => {
                    // Raced with a retire; re-create the queue and retry.
                    self.queues
                        .remove_if(topic, |_, current| current.same_channel(&sender));
                    queued = returned;
                }
            }
        }
        done_rx.await.map_err(|_| OpQueueClosed)
    }

    /// Drops the topic's queue sender. Already queued operations still run;
    /// the drain task exits once the queue empties.
    pub fn retire(&self, topic: &Bytes) {
        if self.queues.remove(topic).is_some() {
            trace!("Retired {} op queue for topic: {}", self.label, String::from_utf8_lossy(topic));
        }
    }

    fn spawn_drain_task(&self, topic: &Bytes) -> mpsc::Sender<QueuedOp> {
        let (tx, mut rx) = mpsc::channel::<QueuedOp>(self.capacity);
        let label = self.label;
        let topic = topic.clone();
        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                op.await;
            }
            trace!(
                "Drained {label} op queue for topic: {}",
                String::from_utf8_lossy(&topic)
            );
        });
        tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[tokio::test]
    async fn ops_on_one_topic_run_one_at_a_time_in_fifo_order() {
        let queue = Arc::new(TopicOpQueue::new("local", 64));
        let topic = Bytes::from_static(b"orders");
        let observed = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for i in 0..16u32 {
            let queue = queue.clone();
            let topic = topic.clone();
            let observed = observed.clone();
            tasks.push(tokio::spawn(async move {
                queue
                    .run(&topic, async move {
                        let mut guard = observed.lock().await;
                        guard.push(i);
                        // An interleaving op would be visible as a reorder.
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    })
                    .await
                    .unwrap();
            }));
            // Give each submission time to enqueue so FIFO order is defined.
            tokio::task::yield_now().await;
        }
        for task in tasks {
            task.await.unwrap();
        }
        let observed = observed.lock().await;
        let expected: Vec<u32> = (0..16).collect();
        assert_eq!(*observed, expected);
    }

    #[tokio::test]
    async fn topics_do_not_serialize_against_each_other() {
        let queue = Arc::new(TopicOpQueue::new("local", 64));
        let (gate_tx, gate_rx) = oneshot::channel::<()>();

        let slow_queue = queue.clone();
        let slow = tokio::spawn(async move {
            slow_queue
                .run(&Bytes::from_static(b"slow"), async move {
                    let _ = gate_rx.await;
                })
                .await
                .unwrap();
        });

        // Completes while the slow topic's op is still parked.
        queue
            .run(&Bytes::from_static(b"fast"), async { 42 })
            .await
            .unwrap();

        gate_tx.send(()).unwrap();
        slow.await.unwrap();
    }

    #[tokio::test]
    async fn run_after_retire_recreates_the_queue() {
        let queue = TopicOpQueue::new("local", 64);
        let topic = Bytes::from_static(b"orders");
        assert_eq!(queue.run(&topic, async { 1 }).await.unwrap(), 1);
        queue.retire(&topic);
        assert_eq!(queue.run(&topic, async { 2 }).await.unwrap(), 2);
    }
}
