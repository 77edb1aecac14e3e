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

use crate::binary::handlers;
use crate::broker::SharedBroker;
use crate::tcp::ConnSession;
use std::sync::Arc;
use strix_common::{OperationType, PubSubRequest, PubSubResponse, RequestBody, StatusCode, StrixError};
use tracing::{info, warn};

const COMPONENT: &str = "REQUEST_ROUTER";

/// Dispatches one decoded request to its typed handler. A request whose
/// body does not match its operation type is malformed and closes the
/// channel after the error response.
pub async fn route(broker: &SharedBroker, session: &Arc<ConnSession>, request: PubSubRequest) {
    match (
        OperationType::try_from(request.operation_type),
        request.body.clone(),
    ) {
        (Ok(OperationType::Publish), Some(RequestBody::Publish(body))) => {
            handlers::publish::handle(broker, session, &request, body).await;
        }
        (Ok(OperationType::Subscribe), Some(RequestBody::Subscribe(body))) => {
            handlers::subscribe::handle(broker, session, &request, body).await;
        }
        (Ok(OperationType::Unsubscribe), Some(RequestBody::Unsubscribe(body))) => {
            handlers::unsubscribe::handle(broker, session, &request, body).await;
        }
        (Ok(OperationType::Consume), Some(RequestBody::Consume(body))) => {
            handlers::consume::handle(broker, session, &request, body).await;
        }
        (operation, _) => {
            warn!(
                "{COMPONENT} - malformed request from {}: operation {:?} does not match the request body",
                session.remote, operation
            );
            session
                .send_and_close(PubSubResponse::error(
                    request.txn_id,
                    StatusCode::MalformedRequest,
                    "operation type does not match the request body",
                ))
                .await;
        }
    }
}

/// Confirms this node owns the request's topic, answering a redirect
/// otherwise. Subscribe requests close the channel after the redirect so
/// the client re-routes on a fresh connection; publish and unsubscribe
/// channels stay open.
pub(crate) async fn ensure_owner_or_redirect(
    broker: &SharedBroker,
    session: &Arc<ConnSession>,
    request: &PubSubRequest,
    close_on_redirect: bool,
) -> bool {
    let owner_hint = match broker.ensure_owned(&request.topic).await {
        Ok(()) => return true,
        Err(StrixError::NotResponsibleForTopic(owner)) => owner.unwrap_or_default(),
        Err(error) => {
            // Claim retries exhausted; answer redirects with no owner hint
            // until the metadata store comes back.
            warn!(
                "{COMPONENT} (error: {error}) - cannot acquire topic: {}, redirecting without an owner hint",
                String::from_utf8_lossy(&request.topic)
            );
            String::new()
        }
    };
    info!(
        "Redirecting request (txn: {}) for topic: {} from client: {} to: {}",
        request.txn_id,
        String::from_utf8_lossy(&request.topic),
        session.remote,
        if owner_hint.is_empty() { "<seed>" } else { &owner_hint }
    );
    let response = PubSubResponse::error(
        request.txn_id,
        StatusCode::NotResponsibleForTopic,
        owner_hint,
    );
    if close_on_redirect {
        session.send_and_close(response).await;
    } else {
        let _ = session.send_frame(response).await;
    }
    false
}
