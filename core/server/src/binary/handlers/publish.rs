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

use crate::binary::router;
use crate::broker::SharedBroker;
use crate::tcp::ConnSession;
use std::sync::Arc;
use strix_common::{
    PubSubRequest, PubSubResponse, PublishRequest, PublishResponse, ResponseBody,
    ResponseBodyKind, StatusCode,
};
use tracing::{debug, error};

const COMPONENT: &str = "PUBLISH_HANDLER";

pub async fn handle(
    broker: &SharedBroker,
    session: &Arc<ConnSession>,
    request: &PubSubRequest,
    body: PublishRequest,
) {
    if !router::ensure_owner_or_redirect(broker, session, request, false).await {
        return;
    }
    let Some(message) = body.msg else {
        session
            .send_and_close(PubSubResponse::error(
                request.txn_id,
                StatusCode::MalformedRequest,
                "missing publish request data",
            ))
            .await;
        return;
    };
    match broker.log.append(&request.topic, message).await {
        Ok(msg_id) => {
            debug!(
                "Published message with seq: {} to topic: {}",
                msg_id.local_component,
                String::from_utf8_lossy(&request.topic)
            );
            let response = PubSubResponse::success(
                request.txn_id,
                ResponseBody {
                    kind: Some(ResponseBodyKind::Publish(PublishResponse {
                        published_msg_id: Some(msg_id),
                    })),
                },
            );
            let _ = session.send_frame(response).await;
        }
        Err(error) => {
            error!(
                "{COMPONENT} (error: {error}) - failed to persist message for topic: {}",
                String::from_utf8_lossy(&request.topic)
            );
            let response =
                PubSubResponse::error(request.txn_id, StatusCode::ServiceDown, error.to_string());
            let _ = session.send_frame(response).await;
        }
    }
}
