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

//! On-wire protocol: a single request/response union exchanged as
//! length-prefixed protobuf frames. The structs below are hand-written
//! `prost` messages so the crate carries no build-time codegen step.

use bytes::Bytes;
use std::collections::HashMap;

/// Current protocol version. Bumped on incompatible frame changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Frames are a little-endian u32 byte length followed by the encoded body.
pub const FRAME_LENGTH_BYTES: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum OperationType {
    Publish = 0,
    Subscribe = 1,
    Unsubscribe = 2,
    Consume = 3,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration, strum::Display,
)]
#[repr(i32)]
pub enum StatusCode {
    Success = 0,
    NotResponsibleForTopic = 1,
    ClientAlreadySubscribed = 2,
    ClientNotSubscribed = 3,
    TopicBusy = 4,
    InvalidSubscriberId = 5,
    InvalidMessageFilter = 6,
    MalformedRequest = 7,
    ServiceDown = 8,
    UncertainState = 9,
}

/// Create-or-attach mode of a subscribe request. The zero value is the
/// protobuf default, so an absent field means `CreateOrAttach`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum CreateOrAttach {
    CreateOrAttach = 0,
    Create = 1,
    Attach = 2,
}

/// Sequence id of a message within one region, paired with the seen
/// remote-region components for cross-region federation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageSeqId {
    /// Strictly increasing per topic on the owning node; never reused.
    #[prost(uint64, tag = "1")]
    pub local_component: u64,
    #[prost(message, repeated, tag = "2")]
    pub region_components: Vec<RegionSeqId>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegionSeqId {
    #[prost(bytes = "bytes", tag = "1")]
    pub region: Bytes,
    #[prost(uint64, tag = "2")]
    pub seq_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    #[prost(bytes = "bytes", tag = "1")]
    pub payload: Bytes,
    #[prost(message, optional, tag = "2")]
    pub msg_id: Option<MessageSeqId>,
    /// Region the message was first published in. Empty means local.
    #[prost(bytes = "bytes", optional, tag = "3")]
    pub src_region: Option<Bytes>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubscriptionPreferences {
    /// Cap on retained-but-unconsumed messages this subscriber needs.
    #[prost(uint32, optional, tag = "1")]
    pub message_bound: Option<u32>,
    /// Name of a server-side message filter registered at the broker.
    #[prost(string, optional, tag = "2")]
    pub message_filter: Option<String>,
    /// Opaque user options carried with the subscription.
    #[prost(map = "string, bytes", tag = "3")]
    pub options: HashMap<String, Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubscriptionState {
    /// Last consume pointer persisted for the subscriber.
    #[prost(message, optional, tag = "1")]
    pub msg_id: Option<MessageSeqId>,
}

/// The record persisted in the metadata store per (topic, subscriber).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubscriptionData {
    #[prost(message, optional, tag = "1")]
    pub state: Option<SubscriptionState>,
    #[prost(message, optional, tag = "2")]
    pub preferences: Option<SubscriptionPreferences>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PublishRequest {
    #[prost(message, optional, tag = "1")]
    pub msg: Option<Message>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubscribeRequest {
    #[prost(bytes = "bytes", tag = "1")]
    pub subscriber_id: Bytes,
    #[prost(enumeration = "CreateOrAttach", tag = "2")]
    pub create_or_attach: i32,
    /// When set, first-local-subscribe listeners must complete before the ack.
    #[prost(bool, tag = "3")]
    pub synchronous: bool,
    /// Evict an existing delivery session for the same subscriber.
    #[prost(bool, tag = "4")]
    pub force_attach: bool,
    #[prost(message, optional, tag = "5")]
    pub preferences: Option<SubscriptionPreferences>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UnsubscribeRequest {
    #[prost(bytes = "bytes", tag = "1")]
    pub subscriber_id: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConsumeRequest {
    #[prost(bytes = "bytes", tag = "1")]
    pub subscriber_id: Bytes,
    #[prost(message, optional, tag = "2")]
    pub msg_id: Option<MessageSeqId>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PubSubRequest {
    #[prost(uint32, tag = "1")]
    pub protocol_version: u32,
    #[prost(enumeration = "OperationType", tag = "2")]
    pub operation_type: i32,
    #[prost(bytes = "bytes", tag = "3")]
    pub topic: Bytes,
    /// Client-chosen id used to match the response on the same channel.
    #[prost(uint64, tag = "4")]
    pub txn_id: u64,
    #[prost(bool, tag = "5")]
    pub should_claim: bool,
    /// Owner-address triplets already tried while chasing redirects.
    #[prost(bytes = "bytes", repeated, tag = "6")]
    pub tried_servers: Vec<Bytes>,
    #[prost(oneof = "RequestBody", tags = "52, 53, 54, 55")]
    pub body: Option<RequestBody>,
}

#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum RequestBody {
    #[prost(message, tag = "52")]
    Publish(PublishRequest),
    #[prost(message, tag = "53")]
    Subscribe(SubscribeRequest),
    #[prost(message, tag = "54")]
    Unsubscribe(UnsubscribeRequest),
    #[prost(message, tag = "55")]
    Consume(ConsumeRequest),
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PublishResponse {
    #[prost(message, optional, tag = "1")]
    pub published_msg_id: Option<MessageSeqId>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubscribeResponse {
    #[prost(message, optional, tag = "1")]
    pub preferences: Option<SubscriptionPreferences>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResponseBody {
    #[prost(oneof = "ResponseBodyKind", tags = "1, 2")]
    pub kind: Option<ResponseBodyKind>,
}

#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum ResponseBodyKind {
    #[prost(message, tag = "1")]
    Publish(PublishResponse),
    #[prost(message, tag = "2")]
    Subscribe(SubscribeResponse),
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PubSubResponse {
    #[prost(uint32, tag = "1")]
    pub protocol_version: u32,
    #[prost(enumeration = "StatusCode", tag = "2")]
    pub status_code: i32,
    /// On `NotResponsibleForTopic` this carries the owner triplet
    /// `hostname:port:sslPort`; empty means "fall back to the seed host".
    #[prost(string, tag = "3")]
    pub status_msg: String,
    #[prost(uint64, tag = "4")]
    pub txn_id: u64,
    #[prost(oneof = "ResponsePayload", tags = "5, 6")]
    pub payload: Option<ResponsePayload>,
}

#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum ResponsePayload {
    /// A message pushed to a subscriber; not tied to any pending txn.
    #[prost(message, tag = "5")]
    Message(Message),
    #[prost(message, tag = "6")]
    Body(ResponseBody),
}

impl MessageSeqId {
    pub fn local(local_component: u64) -> Self {
        Self {
            local_component,
            region_components: Vec::new(),
        }
    }
}

impl PubSubResponse {
    pub fn status(&self) -> StatusCode {
        StatusCode::try_from(self.status_code).unwrap_or(StatusCode::ServiceDown)
    }

    /// A bare success ack without a response body.
    pub fn ok(txn_id: u64) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            status_code: StatusCode::Success as i32,
            status_msg: String::new(),
            txn_id,
            payload: None,
        }
    }

    pub fn success(txn_id: u64, body: ResponseBody) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            status_code: StatusCode::Success as i32,
            status_msg: String::new(),
            txn_id,
            payload: Some(ResponsePayload::Body(body)),
        }
    }

    pub fn error(txn_id: u64, status: StatusCode, status_msg: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            status_code: status as i32,
            status_msg: status_msg.into(),
            txn_id,
            payload: None,
        }
    }

    pub fn message(message: Message) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            status_code: StatusCode::Success as i32,
            status_msg: String::new(),
            txn_id: 0,
            payload: Some(ResponsePayload::Message(message)),
        }
    }
}

impl SubscriptionData {
    /// Initial record for a brand new subscription starting at `seq_id`.
    pub fn initial(seq_id: MessageSeqId, preferences: SubscriptionPreferences) -> Self {
        Self {
            state: Some(SubscriptionState {
                msg_id: Some(seq_id),
            }),
            preferences: Some(preferences),
        }
    }

    pub fn consume_pointer(&self) -> u64 {
        self.state
            .as_ref()
            .and_then(|s| s.msg_id.as_ref())
            .map(|id| id.local_component)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message as _;

    #[test]
    fn subscription_data_roundtrips_bit_identically() {
        let mut preferences = SubscriptionPreferences {
            message_bound: Some(200),
            message_filter: Some("all-to-all".to_owned()),
            options: HashMap::new(),
        };
        preferences
            .options
            .insert("color".to_owned(), b"blue".to_vec());
        let data = SubscriptionData::initial(MessageSeqId::local(42), preferences);

        let encoded = data.encode_to_vec();
        let decoded = SubscriptionData::decode(encoded.as_slice()).expect("decode");
        assert_eq!(data, decoded);
        assert_eq!(encoded, decoded.encode_to_vec());
        assert_eq!(decoded.consume_pointer(), 42);
    }

    #[test]
    fn absent_create_or_attach_defaults_to_create_or_attach() {
        let request = SubscribeRequest {
            subscriber_id: Bytes::from_static(b"sub-1"),
            ..Default::default()
        };
        let decoded = SubscribeRequest::decode(request.encode_to_vec().as_slice()).expect("decode");
        assert_eq!(
            CreateOrAttach::try_from(decoded.create_or_attach),
            Ok(CreateOrAttach::CreateOrAttach)
        );
    }
}
