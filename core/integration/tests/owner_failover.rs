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
use integration::harness::{CollectingHandler, TestCluster};
use std::time::Duration;
use strix_common::CreateOrAttach;

/// The topic owner dies; the client detects the disconnect, resubscribes
/// through its seed host, a surviving node claims the topic, and delivery
/// resumes with the original handler. Ordered, gap-free delivery holds
/// across the failover; duplicates stay within the lazy consume window.
#[tokio::test]
async fn subscriber_survives_an_owner_crash() {
    let cluster = TestCluster::start(2).await;
    let topic = Bytes::from_static(b"failover-topic");
    let subscriber = Bytes::from_static(b"s1");

    // Establish ownership on node 0 so the dying node is not the seed.
    let warmup = cluster.client(0);
    warmup
        .subscribe(&topic, &subscriber, CreateOrAttach::Create, None)
        .await
        .unwrap();
    warmup.stop();

    // The real subscriber is seeded at the surviving node 1 and follows the
    // redirect to node 0. Every handled message is acknowledged.
    let client = cluster.client_with(1, |config| {
        config.auto_send_consume_window = 1;
    });
    client
        .subscribe(&topic, &subscriber, CreateOrAttach::Attach, None)
        .await
        .unwrap();
    let handler = CollectingHandler::new();
    client
        .start_delivery(&topic, &subscriber, handler.clone())
        .await
        .unwrap();

    for i in 0..5u32 {
        client
            .publish(&topic, Bytes::from(format!("before-{i}")))
            .await
            .unwrap();
    }
    handler.wait_for(5, Duration::from_secs(5)).await;
    // Let the fire-and-forget consume frames land before the crash.
    tokio::time::sleep(Duration::from_millis(200)).await;

    cluster.nodes[0].kill(&cluster.metadata).await;

    // The reconnect loop races the publish below, so retry the publish
    // until the new owner accepts it.
    let mut published = false;
    for _ in 0..50 {
        match client
            .publish(&topic, Bytes::from_static(b"after-crash"))
            .await
        {
            Ok(_) => {
                published = true;
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }
    assert!(published, "publish never succeeded after the failover");

    // The post-crash message arrives through the new owner.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let messages = handler.messages().await;
        if messages
            .iter()
            .any(|m| m.payload == Bytes::from_static(b"after-crash"))
        {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "post-crash message never delivered, got: {} messages",
            messages.len()
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Per-session FIFO: sequence ids only ever move forward within one
    // delivery run; a failover may rewind once, at most back to the last
    // persisted consume pointer.
    let seqs = handler.delivered_seqs().await;
    let mut rewinds = 0;
    for window in seqs.windows(2) {
        if window[1] <= window[0] {
            rewinds += 1;
        }
    }
    assert!(
        rewinds <= 1,
        "expected at most one rewind across the failover, seqs: {seqs:?}"
    );

    client.stop();
    cluster.nodes[1].shutdown().await;
}
