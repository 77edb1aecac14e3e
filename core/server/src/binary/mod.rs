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

pub mod codec;
pub mod handlers;
pub mod router;
mod subscriber_channels;

pub use subscriber_channels::{ChannelBusy, ChannelHandle, SubscriberChannels};

use strix_common::{PubSubResponse, StrixError};

/// Encodes an error the way clients decode it: the status code carries the
/// kind, and for redirects the status message carries the owner triplet
/// (empty when unknown, telling the client to fall back to its seed).
pub fn error_response(txn_id: u64, error: &StrixError) -> PubSubResponse {
    let status_msg = match error {
        StrixError::NotResponsibleForTopic(hint) => hint.clone().unwrap_or_default(),
        other => other.to_string(),
    };
    PubSubResponse::error(txn_id, error.as_status(), status_msg)
}
