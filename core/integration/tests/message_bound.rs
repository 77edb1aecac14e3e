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
use integration::harness::TestCluster;
use std::time::Duration;
use strix_common::{CreateOrAttach, SubscriptionPreferences};

fn bounded(bound: u32) -> Option<SubscriptionPreferences> {
    Some(SubscriptionPreferences {
        message_bound: Some(bound),
        ..Default::default()
    })
}

/// With every subscriber bounded, retained-but-unconsumed messages converge
/// to the largest bound; dropping the larger subscriber tightens the cap.
#[tokio::test]
async fn message_bounds_cap_retained_messages() {
    let cluster = TestCluster::start(1).await;
    let topic = Bytes::from_static(b"bounded-topic");

    let client = cluster.client_with(0, |config| {
        // Swallow the pushed backlog without exerting backpressure.
        config.delivery_buffer = 1024;
    });
    client
        .subscribe(
            &topic,
            &Bytes::from_static(b"small"),
            CreateOrAttach::Create,
            bounded(100),
        )
        .await
        .unwrap();
    client
        .subscribe(
            &topic,
            &Bytes::from_static(b"large"),
            CreateOrAttach::Create,
            bounded(200),
        )
        .await
        .unwrap();

    for i in 0..500u32 {
        client
            .publish(&topic, Bytes::from(format!("m{i}")))
            .await
            .unwrap();
    }
    assert_eq!(
        cluster.log.retained_unconsumed(&topic).await,
        200,
        "retention must follow max(bounds)"
    );

    // Removing the higher-bound subscriber lowers the cap to 100.
    client
        .unsubscribe(&topic, &Bytes::from_static(b"large"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(cluster.log.retained_unconsumed(&topic).await, 100);

    client.stop();
    cluster.nodes[0].shutdown().await;
}
