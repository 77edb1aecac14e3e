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

mod manager;
mod op_queue;
mod state;

pub use manager::SubscriptionManager;
pub use op_queue::{OpQueueClosed, TopicOpQueue};
pub use state::InMemorySubscriptionState;

use async_trait::async_trait;
use bytes::Bytes;
use strix_common::StrixError;

/// Hook for components interested in the local subscriber population of a
/// topic, primarily the cross-region federator which starts an upstream
/// subscription when the first local subscriber appears and stops it when
/// the last one leaves.
#[async_trait]
pub trait SubscriptionEventListener: Send + Sync {
    /// Fired when a topic gains its first local subscriber. All registered
    /// listeners are invoked; any failure rolls back the pending subscribe.
    /// `synchronous` asks the listener to finish its upstream work before
    /// returning rather than kicking it off in the background.
    async fn on_first_local_subscribe(
        &self,
        topic: &Bytes,
        synchronous: bool,
    ) -> Result<(), StrixError>;

    /// Fired when a topic loses its local subscribers. `last_subscriber`
    /// distinguishes a real last unsubscribe from the node merely losing
    /// the topic while local subscribers still exist elsewhere.
    fn on_last_local_unsubscribe(&self, topic: &Bytes, last_subscriber: bool);
}
