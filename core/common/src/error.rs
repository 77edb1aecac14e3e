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

use crate::protocol::StatusCode;
use thiserror::Error;

/// The error type shared by the broker and the client library.
///
/// Routing failures (`TooManyRedirects`, `RedirectLoop`) are surfaced to API
/// callers wrapped in [`StrixError::ServiceDown`] so that callers match on a
/// single terminal kind while the cause stays inspectable.
#[derive(Debug, Error)]
pub enum StrixError {
    #[error("Not responsible for topic, intended owner: {0:?}")]
    NotResponsibleForTopic(Option<String>),
    #[error("Exceeded the maximum of {0} server redirects")]
    TooManyRedirects(usize),
    #[error("Redirected to an already tried server: {0}")]
    RedirectLoop(String),
    #[error("Service down")]
    ServiceDown(#[source] Box<StrixError>),
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("Client is already subscribed, topic: {topic}, subscriber: {subscriber}")]
    AlreadySubscribed { topic: String, subscriber: String },
    #[error("Client is not subscribed, topic: {topic}, subscriber: {subscriber}")]
    NotSubscribed { topic: String, subscriber: String },
    #[error("Subscriber is already being served on another channel, topic: {topic}, subscriber: {subscriber}")]
    TopicBusy { topic: String, subscriber: String },
    #[error("Invalid subscriber id: {0}")]
    InvalidSubscriberId(String),
    #[error("Invalid message filter: {0}")]
    InvalidMessageFilter(String),
    #[error("Malformed request: {0}")]
    MalformedRequest(String),
    #[error("Could not connect to {0}")]
    CouldNotConnect(String),
    #[error("Request outcome unknown: {0}")]
    UncertainState(String),
    #[error("Server not ready for topic: {0}")]
    ServerNotReady(String),
    #[error("Metadata store error: {0}")]
    MetadataStore(String),
    #[error("Invalid broker address: {0}")]
    InvalidAddress(String),
    #[error("Client already stopped")]
    ClientStopped,
    #[error("IO error")]
    Io(#[from] std::io::Error),
    #[error("Failed to decode protocol frame")]
    Decode(#[from] prost::DecodeError),
}

impl StrixError {
    /// Wrap a routing failure the way callers observe it.
    pub fn service_down(cause: StrixError) -> Self {
        StrixError::ServiceDown(Box::new(cause))
    }

    /// Status code this error is encoded as on the wire.
    pub fn as_status(&self) -> StatusCode {
        match self {
            StrixError::NotResponsibleForTopic(_) => StatusCode::NotResponsibleForTopic,
            StrixError::AlreadySubscribed { .. } => StatusCode::ClientAlreadySubscribed,
            StrixError::NotSubscribed { .. } => StatusCode::ClientNotSubscribed,
            StrixError::TopicBusy { .. } => StatusCode::TopicBusy,
            StrixError::InvalidSubscriberId(_) => StatusCode::InvalidSubscriberId,
            StrixError::InvalidMessageFilter(_) => StatusCode::InvalidMessageFilter,
            StrixError::MalformedRequest(_) | StrixError::Decode(_) => StatusCode::MalformedRequest,
            StrixError::UncertainState(_) => StatusCode::UncertainState,
            _ => StatusCode::ServiceDown,
        }
    }

    /// Rebuild the error a server response encodes. The redirect owner hint
    /// travels in `status_msg` and an empty hint stays `None`.
    pub fn from_status(status: StatusCode, status_msg: &str) -> Self {
        match status {
            StatusCode::Success => {
                StrixError::MalformedRequest("success is not an error status".to_owned())
            }
            StatusCode::NotResponsibleForTopic => StrixError::NotResponsibleForTopic(
                (!status_msg.is_empty()).then(|| status_msg.to_owned()),
            ),
            StatusCode::ClientAlreadySubscribed => StrixError::AlreadySubscribed {
                topic: String::new(),
                subscriber: status_msg.to_owned(),
            },
            StatusCode::ClientNotSubscribed => StrixError::NotSubscribed {
                topic: String::new(),
                subscriber: status_msg.to_owned(),
            },
            StatusCode::TopicBusy => StrixError::TopicBusy {
                topic: String::new(),
                subscriber: status_msg.to_owned(),
            },
            StatusCode::InvalidSubscriberId => {
                StrixError::InvalidSubscriberId(status_msg.to_owned())
            }
            StatusCode::InvalidMessageFilter => {
                StrixError::InvalidMessageFilter(status_msg.to_owned())
            }
            StatusCode::MalformedRequest => StrixError::MalformedRequest(status_msg.to_owned()),
            StatusCode::UncertainState => StrixError::UncertainState(status_msg.to_owned()),
            StatusCode::ServiceDown => StrixError::ServiceUnavailable(status_msg.to_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_errors_map_to_service_down_status() {
        let error = StrixError::service_down(StrixError::RedirectLoop("host:4080:4081".into()));
        assert_eq!(error.as_status(), StatusCode::ServiceDown);
        let StrixError::ServiceDown(cause) = error else {
            panic!("expected ServiceDown");
        };
        assert!(matches!(*cause, StrixError::RedirectLoop(_)));
    }

    #[test]
    fn redirect_hint_survives_the_status_roundtrip() {
        let status_msg = "owner-host:4080:4081";
        let rebuilt = StrixError::from_status(StatusCode::NotResponsibleForTopic, status_msg);
        assert!(
            matches!(rebuilt, StrixError::NotResponsibleForTopic(Some(hint)) if hint == status_msg)
        );
        let rebuilt = StrixError::from_status(StatusCode::NotResponsibleForTopic, "");
        assert!(matches!(rebuilt, StrixError::NotResponsibleForTopic(None)));
    }
}
