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
use integration::harness::{free_port, CollectingHandler, TestCluster};
use std::time::Duration;
use strix::{ClientConfig, PubSubClient};
use strix_common::{
    CreateOrAttach, PubSubRequest, PubSubResponse, StatusCode, StrixError,
};
use strix_server::binary::codec;
use tokio::net::TcpListener;

/// A node that owns nothing redirects to the topic master, and the client
/// completes the request against the master.
#[tokio::test]
async fn client_chases_a_redirect_to_the_topic_owner() {
    let cluster = TestCluster::start(2).await;
    let topic = Bytes::from_static(b"redirect-topic");

    // Make node 1 the owner by subscribing through it first.
    let owner_client = cluster.client(1);
    owner_client
        .subscribe(
            &topic,
            &Bytes::from_static(b"warmup"),
            CreateOrAttach::CreateOrAttach,
            None,
        )
        .await
        .unwrap();

    // A client seeded at node 0 is redirected to node 1 and succeeds.
    let client = cluster.client(0);
    client
        .subscribe(
            &topic,
            &Bytes::from_static(b"s1"),
            CreateOrAttach::Create,
            None,
        )
        .await
        .unwrap();
    assert_eq!(
        client.cached_owner(&topic),
        Some(cluster.nodes[1].address())
    );

    let handler = CollectingHandler::new();
    client
        .start_delivery(
            &topic,
            &Bytes::from_static(b"s1"),
            handler.clone(),
        )
        .await
        .unwrap();
    client
        .publish(&topic, Bytes::from_static(b"hello"))
        .await
        .unwrap();
    let messages = handler.wait_for(1, Duration::from_secs(5)).await;
    assert_eq!(messages[0].payload, Bytes::from_static(b"hello"));

    client.stop();
    owner_client.stop();
    for node in &cluster.nodes {
        node.shutdown().await;
    }
}

/// A stub broker that answers every request with a redirect to a fixed
/// target triplet.
async fn spawn_redirecting_stub(port: u16, redirect_to: String) {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.expect("stub bind");
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let redirect_to = redirect_to.clone();
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                while let Ok(Some(request)) =
                    codec::read_frame::<PubSubRequest, _>(&mut reader).await
                {
                    let response = PubSubResponse::error(
                        request.txn_id,
                        StatusCode::NotResponsibleForTopic,
                        redirect_to.clone(),
                    );
                    if codec::write_frame(&mut writer, &response).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
}

/// An A -> B -> A redirect chain terminates with `ServiceDown` caused by a
/// redirect loop, after both servers were tried.
#[tokio::test]
async fn redirect_loop_aborts_with_service_down() {
    let port_a = free_port();
    let port_b = free_port();
    let triplet_a = format!("127.0.0.1:{port_a}:0");
    let triplet_b = format!("127.0.0.1:{port_b}:0");
    spawn_redirecting_stub(port_a, triplet_b.clone()).await;
    spawn_redirecting_stub(port_b, triplet_a.clone()).await;

    let client = PubSubClient::new(ClientConfig {
        seed_address: triplet_a,
        request_timeout: Duration::from_secs(5),
        max_server_redirects: 4,
        ..Default::default()
    })
    .unwrap();

    let error = client
        .publish(&Bytes::from_static(b"looped"), Bytes::from_static(b"m"))
        .await
        .unwrap_err();
    let StrixError::ServiceDown(cause) = error else {
        panic!("expected ServiceDown, got: {error:?}");
    };
    assert!(
        matches!(*cause, StrixError::RedirectLoop(_)),
        "expected a redirect loop cause, got: {cause:?}"
    );
    client.stop();
}

/// With the redirect budget exhausted before a loop is even detected, the
/// failure cause is `TooManyRedirects`.
#[tokio::test]
async fn redirect_budget_exhaustion_aborts_with_service_down() {
    let port_a = free_port();
    let port_b = free_port();
    let triplet_a = format!("127.0.0.1:{port_a}:0");
    let triplet_b = format!("127.0.0.1:{port_b}:0");
    spawn_redirecting_stub(port_a, triplet_b.clone()).await;
    spawn_redirecting_stub(port_b, triplet_a.clone()).await;

    let client = PubSubClient::new(ClientConfig {
        seed_address: triplet_a,
        request_timeout: Duration::from_secs(5),
        max_server_redirects: 1,
        ..Default::default()
    })
    .unwrap();

    let error = client
        .publish(&Bytes::from_static(b"looped"), Bytes::from_static(b"m"))
        .await
        .unwrap_err();
    let StrixError::ServiceDown(cause) = error else {
        panic!("expected ServiceDown, got: {error:?}");
    };
    assert!(
        matches!(*cause, StrixError::TooManyRedirects(1)),
        "expected a redirect budget cause, got: {cause:?}"
    );
    client.stop();
}
