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

use async_trait::async_trait;
use bytes::Bytes;
use strix_common::Message;

/// Callback receiving delivered messages for one subscription.
///
/// Messages for a subscription are handled one at a time, in sequence-id
/// order. The handler survives reconnects: after the client recovers a
/// dropped subscribe channel, delivery resumes with the same handler.
/// Returning from `handle` marks the message processed for the optional
/// automatic consume window; acknowledging to the broker beyond that stays
/// an explicit [`crate::PubSubClient::consume`] call.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, topic: &Bytes, subscriber_id: &Bytes, message: Message);
}
