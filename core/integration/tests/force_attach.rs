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
use strix_common::{CreateOrAttach, StrixError};

/// A second session for the same subscriber is rejected with `TopicBusy`
/// unless it forces the attach, in which case the old channel is evicted
/// and delivery resumes on the new one in order.
#[tokio::test]
async fn force_attach_steals_the_channel_from_the_old_session() {
    let cluster = TestCluster::start(1).await;
    let topic = Bytes::from_static(b"steal-topic");
    let subscriber = Bytes::from_static(b"s1");

    let first = cluster.client(0);
    first
        .subscribe(&topic, &subscriber, CreateOrAttach::Create, None)
        .await
        .unwrap();
    let first_handler = CollectingHandler::new();
    first
        .start_delivery(&topic, &subscriber, first_handler.clone())
        .await
        .unwrap();

    // A plain attach from another connection loses.
    let second = cluster.client(0);
    let error = second
        .subscribe(&topic, &subscriber, CreateOrAttach::Attach, None)
        .await
        .unwrap_err();
    assert!(
        matches!(error, StrixError::TopicBusy { .. }),
        "expected TopicBusy, got: {error:?}"
    );

    // Force attach wins and the old session is evicted.
    second
        .subscribe_force_attach(&topic, &subscriber, CreateOrAttach::Attach)
        .await
        .unwrap();
    let second_handler = CollectingHandler::new();
    second
        .start_delivery(&topic, &subscriber, second_handler.clone())
        .await
        .unwrap();

    for i in 0..10u32 {
        second
            .publish(&topic, Bytes::from(format!("m{i}")))
            .await
            .unwrap();
    }

    let messages = second_handler.wait_for(10, Duration::from_secs(5)).await;
    let seqs: Vec<u64> = messages
        .iter()
        .map(|m| m.msg_id.as_ref().unwrap().local_component)
        .collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(seqs, sorted, "delivery on the new channel must be in order without duplicates");
    assert_eq!(seqs.last(), Some(&10));

    first.stop();
    second.stop();
    cluster.nodes[0].shutdown().await;
}
