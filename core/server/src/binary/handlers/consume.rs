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
use strix_common::{ConsumeRequest, PubSubRequest, PubSubResponse, StatusCode};
use tracing::warn;

const COMPONENT: &str = "CONSUME_HANDLER";

/// Consume frames are fire-and-forget: no ack is produced, and failures
/// surface only as redelivery after recovery.
pub async fn handle(
    broker: &SharedBroker,
    session: &Arc<ConnSession>,
    request: &PubSubRequest,
    body: ConsumeRequest,
) {
    let Some(msg_id) = body.msg_id else {
        session
            .send_and_close(PubSubResponse::error(
                request.txn_id,
                StatusCode::MalformedRequest,
                "missing consume sequence id",
            ))
            .await;
        return;
    };
    if !router::ensure_owner_or_redirect(broker, session, request, false).await {
        return;
    }
    if let Err(error) = broker
        .subscriptions
        .consume(&request.topic, &body.subscriber_id, msg_id)
        .await
    {
        warn!(
            "{COMPONENT} (error: {error}) - failed to advance consume pointer for topic: {}, subscriber: {}",
            String::from_utf8_lossy(&request.topic),
            String::from_utf8_lossy(&body.subscriber_id)
        );
    }
}
