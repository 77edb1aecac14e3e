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

mod filter;
mod manager;

pub use filter::{AllToAllTopologyFilter, FilterRegistry, PipelineFilter, ServerMessageFilter};
pub use manager::{DeliveryConfig, DeliveryManager, SessionEndHook};

use async_trait::async_trait;
use strix_common::PubSubResponse;

/// The subscriber's end of a delivery session, backed by the connection's
/// outbound queue. `send` awaits queue capacity; the delivery loop bounds
/// that wait and closes the endpoint when the subscriber stops draining.
#[async_trait]
pub trait DeliveryEndpoint: Send + Sync {
    async fn send(&self, response: PubSubResponse) -> Result<(), EndpointClosed>;

    /// Asks the transport to tear the connection down, best effort.
    fn close(&self);
}

#[derive(Debug)]
pub struct EndpointClosed;
