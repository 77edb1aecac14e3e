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

//! Client library for the strix pub/sub broker.
//!
//! A [`PubSubClient`] keeps one logical subscription alive per
//! (topic, subscriber id) across redirects, reconnects and topic failover,
//! delivering messages in order to a [`MessageHandler`].

mod channel;
mod client;
mod config;
mod message_handler;

pub use client::PubSubClient;
pub use config::{ClientConfig, ClientTlsConfig};
pub use message_handler::MessageHandler;

pub mod prelude {
    pub use crate::client::PubSubClient;
    pub use crate::config::{ClientConfig, ClientTlsConfig};
    pub use crate::message_handler::MessageHandler;
    pub use bytes::Bytes;
    pub use strix_common::{
        BrokerAddress, CreateOrAttach, Message, MessageSeqId, StatusCode, StrixError,
        SubscriptionPreferences, TopicSubscriber,
    };
}
