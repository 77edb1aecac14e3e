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

use crate::binary::{error_response, router, ChannelHandle};
use crate::broker::SharedBroker;
use crate::delivery::DeliveryEndpoint;
use crate::tcp::ConnSession;
use std::sync::Arc;
use strix_common::{
    PubSubRequest, PubSubResponse, ResponseBody, ResponseBodyKind, StatusCode, StrixError,
    SubscribeRequest, SubscribeResponse, TopicSubscriber,
};
use tracing::{error, info};

const COMPONENT: &str = "SUBSCRIBE_HANDLER";

pub async fn handle(
    broker: &SharedBroker,
    session: &Arc<ConnSession>,
    request: &PubSubRequest,
    body: SubscribeRequest,
) {
    if body.subscriber_id.is_empty() {
        session
            .send_and_close(PubSubResponse::error(
                request.txn_id,
                StatusCode::InvalidSubscriberId,
                "empty subscriber id",
            ))
            .await;
        return;
    }
    info!(
        "Received a subscription request for topic: {} and subscriber: {} from: {}",
        String::from_utf8_lossy(&request.topic),
        String::from_utf8_lossy(&body.subscriber_id),
        session.remote
    );
    if !router::ensure_owner_or_redirect(broker, session, request, true).await {
        return;
    }

    let current_seq = broker.log.current_seq_id(&request.topic).await;
    let data = match broker
        .subscriptions
        .subscribe(&request.topic, body.clone(), current_seq)
        .await
    {
        Ok(data) => data,
        Err(error) => {
            error!(
                "{COMPONENT} (error: {error}) - error serving subscribe request (txn: {}) for topic: {}, subscriber: {}",
                request.txn_id,
                String::from_utf8_lossy(&request.topic),
                String::from_utf8_lossy(&body.subscriber_id)
            );
            session
                .send_and_close(error_response(request.txn_id, &error))
                .await;
            return;
        }
    };

    let preferences = data.preferences.clone().unwrap_or_default();
    let filter = match broker.build_filter_pipeline(
        &request.topic,
        &body.subscriber_id,
        &preferences,
    ) {
        Ok(filter) => filter,
        Err(error) => {
            error!(
                "{COMPONENT} (error: {error}) - failed to instantiate message filter for topic: {}, subscriber: {}",
                String::from_utf8_lossy(&request.topic),
                String::from_utf8_lossy(&body.subscriber_id)
            );
            session
                .send_and_close(error_response(request.txn_id, &error))
                .await;
            return;
        }
    };

    let topic_subscriber =
        TopicSubscriber::new(request.topic.clone(), body.subscriber_id.clone());
    let endpoint: Arc<dyn DeliveryEndpoint> = session.clone();
    let handle = ChannelHandle {
        conn_id: session.id,
        endpoint,
    };
    if broker
        .subscriber_channels
        .register(topic_subscriber.clone(), handle, body.force_attach)
        .is_err()
    {
        let error = StrixError::TopicBusy {
            topic: String::from_utf8_lossy(&request.topic).into_owned(),
            subscriber: String::from_utf8_lossy(&body.subscriber_id).into_owned(),
        };
        error!(
            "{COMPONENT} - subscribe request (txn: {}) rejected, {error}",
            request.txn_id
        );
        session
            .send_and_close(error_response(request.txn_id, &error))
            .await;
        return;
    }

    // The ack goes out first so the first delivered message never precedes
    // it; both travel the connection's outbound queue in FIFO order.
    let response = PubSubResponse::success(
        request.txn_id,
        ResponseBody {
            kind: Some(ResponseBodyKind::Subscribe(SubscribeResponse {
                preferences: Some(preferences),
            })),
        },
    );
    if session.send_frame(response).await.is_err() {
        // Channel died while we were processing; disconnect cleanup will
        // unwind the registration.
        return;
    }
    info!(
        "Subscribe request (txn: {}) for topic: {}, subscriber: {} from: {} succeeded",
        request.txn_id,
        String::from_utf8_lossy(&request.topic),
        String::from_utf8_lossy(&body.subscriber_id),
        session.remote
    );

    // Delivery starts one past the persisted consume pointer.
    let start_seq = data.consume_pointer() + 1;
    broker
        .delivery
        .start_serving(topic_subscriber, start_seq, session.clone(), filter);
}
