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

use crate::binary::{error_response, router};
use crate::broker::SharedBroker;
use crate::tcp::ConnSession;
use std::sync::Arc;
use strix_common::{PubSubRequest, PubSubResponse, StatusCode, TopicSubscriber, UnsubscribeRequest};
use tracing::info;

pub async fn handle(
    broker: &SharedBroker,
    session: &Arc<ConnSession>,
    request: &PubSubRequest,
    body: UnsubscribeRequest,
) {
    if body.subscriber_id.is_empty() {
        let _ = session
            .send_frame(PubSubResponse::error(
                request.txn_id,
                StatusCode::InvalidSubscriberId,
                "empty subscriber id",
            ))
            .await;
        return;
    }
    if !router::ensure_owner_or_redirect(broker, session, request, false).await {
        return;
    }
    let topic_subscriber =
        TopicSubscriber::new(request.topic.clone(), body.subscriber_id.clone());

    // Any active delivery session ends before the subscription state goes.
    broker.delivery.stop_serving(&topic_subscriber);
    broker.subscriber_channels.remove(&topic_subscriber);

    match broker
        .subscriptions
        .unsubscribe(&request.topic, &body.subscriber_id)
        .await
    {
        Ok(()) => {
            info!("Unsubscribed {topic_subscriber}");
            let _ = session.send_frame(PubSubResponse::ok(request.txn_id)).await;
        }
        Err(error) => {
            let _ = session
                .send_frame(error_response(request.txn_id, &error))
                .await;
        }
    }
}
