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

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Client configuration.
///
/// The seed address is a `hostname:port:sslPort` triplet, typically a VIP in
/// front of the cluster; requests for topics with no cached owner go there
/// and follow redirects to the actual topic master.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub seed_address: String,
    pub tls: ClientTlsConfig,
    /// Server-ack timeout; expiry fails the request with `UncertainState`.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Idle window on a subscribe channel before it is considered dead and
    /// closed, which triggers reconnect recovery.
    #[serde(with = "humantime_serde")]
    pub subscribe_read_timeout: Duration,
    /// Redirects tolerated per request before it fails with `ServiceDown`.
    pub max_server_redirects: usize,
    /// Messages handled between automatic consume frames; zero leaves
    /// consume-pointer advancement entirely to explicit `consume` calls.
    pub auto_send_consume_window: usize,
    /// Messages buffered per subscription before the client stops reading
    /// from the socket and the server's flow control kicks in.
    pub delivery_buffer: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientTlsConfig {
    pub enabled: bool,
    /// Server name presented for SNI; the seed hostname when empty.
    pub domain: String,
    /// PEM file with the roots to trust; system trust is not consulted.
    pub ca_file: Option<String>,
    /// Disables certificate validation for development setups.
    pub accept_invalid_certificates: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            seed_address: "localhost:4080:4081".to_owned(),
            tls: ClientTlsConfig::default(),
            request_timeout: Duration::from_secs(10),
            subscribe_read_timeout: Duration::from_secs(600),
            max_server_redirects: 2,
            auto_send_consume_window: 0,
            delivery_buffer: 256,
        }
    }
}
