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
use strix_common::{CreateOrAttach, MessageSeqId, StrixError};

const SUBSCRIBER: &[u8] = b"s1";

/// A reconnecting subscriber attaches to its existing subscription and
/// delivery resumes one past the persisted consume pointer; a CREATE against
/// the same subscriber id is rejected.
#[tokio::test]
async fn attach_resumes_after_the_consume_pointer_and_create_is_rejected() {
    let cluster = TestCluster::start(1).await;
    let topic = Bytes::from_static(b"attach-topic");
    let subscriber = Bytes::from_static(SUBSCRIBER);

    // First incarnation: subscribe, receive 50 messages, acknowledge 42.
    let first = cluster.client(0);
    first
        .subscribe(&topic, &subscriber, CreateOrAttach::Create, None)
        .await
        .unwrap();
    let handler = CollectingHandler::new();
    first
        .start_delivery(&topic, &subscriber, handler.clone())
        .await
        .unwrap();
    for i in 0..50u32 {
        first
            .publish(&topic, Bytes::from(format!("m{i}")))
            .await
            .unwrap();
    }
    handler.wait_for(50, Duration::from_secs(5)).await;
    first
        .consume(&topic, &subscriber, MessageSeqId::local(42))
        .await
        .unwrap();
    // Consume frames are fire-and-forget; give the broker a beat to apply
    // and persist before the channel goes away.
    tokio::time::sleep(Duration::from_millis(200)).await;
    first.stop();

    // Second incarnation attaches and resumes at 43.
    let second = cluster.client(0);
    second
        .subscribe(&topic, &subscriber, CreateOrAttach::Attach, None)
        .await
        .unwrap();
    let resumed = CollectingHandler::new();
    second
        .start_delivery(&topic, &subscriber, resumed.clone())
        .await
        .unwrap();
    let messages = resumed.wait_for(8, Duration::from_secs(5)).await;
    let seqs: Vec<u64> = messages
        .iter()
        .map(|m| m.msg_id.as_ref().unwrap().local_component)
        .collect();
    assert_eq!(seqs, (43..=50).collect::<Vec<u64>>());

    // CREATE on the existing subscription is refused.
    let error = second
        .subscribe(&topic, &subscriber, CreateOrAttach::Create, None)
        .await
        .unwrap_err();
    assert!(
        matches!(error, StrixError::AlreadySubscribed { .. }),
        "expected AlreadySubscribed, got: {error:?}"
    );

    second.stop();
    cluster.nodes[0].shutdown().await;
}

/// Attaching without an existing subscription fails with `NotSubscribed`.
#[tokio::test]
async fn attach_without_a_subscription_is_rejected() {
    let cluster = TestCluster::start(1).await;
    let client = cluster.client(0);
    let error = client
        .subscribe(
            &Bytes::from_static(b"empty-topic"),
            &Bytes::from_static(b"nobody"),
            CreateOrAttach::Attach,
            None,
        )
        .await
        .unwrap_err();
    assert!(
        matches!(error, StrixError::NotSubscribed { .. }),
        "expected NotSubscribed, got: {error:?}"
    );
    client.stop();
    cluster.nodes[0].shutdown().await;
}

/// Hub-prefixed subscriber ids are rejected for local subscribers before
/// any request leaves the client.
#[tokio::test]
async fn hub_prefixed_ids_are_invalid_for_local_subscribers() {
    let cluster = TestCluster::start(1).await;
    let client = cluster.client(0);
    let error = client
        .subscribe(
            &Bytes::from_static(b"any-topic"),
            &Bytes::from_static(b"__hub:region-b"),
            CreateOrAttach::Create,
            None,
        )
        .await
        .unwrap_err();
    assert!(
        matches!(error, StrixError::InvalidSubscriberId(_)),
        "expected InvalidSubscriberId, got: {error:?}"
    );
    client.stop();
    cluster.nodes[0].shutdown().await;
}
