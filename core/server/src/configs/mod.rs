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

use crate::server_error::ServerError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use strix_common::BrokerAddress;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub node: NodeConfig,
    pub tcp: TcpConfig,
    pub topic: TopicConfig,
    pub subscriptions: SubscriptionsConfig,
    pub delivery: DeliverySettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Hostname advertised to clients in redirect triplets.
    pub hostname: String,
    pub region: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TcpConfig {
    pub address: String,
    pub tls: Option<TcpTlsConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TcpTlsConfig {
    pub address: String,
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TopicConfig {
    /// Claim attempts against the metadata store before the node answers
    /// redirects instead.
    pub acquire_attempts: usize,
    #[serde(with = "humantime_serde")]
    pub acquire_backoff: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SubscriptionsConfig {
    /// Messages a consume pointer may run ahead of its persisted record.
    pub consume_interval: u64,
    #[serde(with = "humantime_serde")]
    pub retention_check_interval: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeliverySettings {
    pub batch_count: usize,
    pub batch_bytes: usize,
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    /// Outbound frames buffered per connection before delivery back-pressures.
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            tcp: TcpConfig::default(),
            topic: TopicConfig::default(),
            subscriptions: SubscriptionsConfig::default(),
            delivery: DeliverySettings::default(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_owned(),
            region: "standalone".to_owned(),
        }
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:4080".to_owned(),
            tls: None,
        }
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            acquire_attempts: 3,
            acquire_backoff: Duration::from_millis(200),
        }
    }
}

impl Default for SubscriptionsConfig {
    fn default() -> Self {
        Self {
            consume_interval: 50,
            retention_check_interval: Duration::from_secs(60),
        }
    }
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            batch_count: 64,
            batch_bytes: 1024 * 1024,
            write_timeout: Duration::from_secs(30),
            outbound_queue: 256,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let raw = std::fs::read_to_string(path).map_err(|error| ServerError::ConfigLoad {
            path: path.display().to_string(),
            source: error,
        })?;
        toml::from_str(&raw).map_err(|error| ServerError::ConfigParse {
            path: path.display().to_string(),
            source: error,
        })
    }

    /// The `host:port:sslPort` triplet advertised in redirects. The ports
    /// are taken from the bind addresses; a node without TLS advertises
    /// ssl port zero.
    pub fn advertised_address(&self) -> Result<BrokerAddress, ServerError> {
        let port = parse_port(&self.tcp.address)?;
        let ssl_port = match &self.tcp.tls {
            Some(tls) => parse_port(&tls.address)?,
            None => 0,
        };
        Ok(BrokerAddress::new(
            self.node.hostname.clone(),
            port,
            ssl_port,
        ))
    }
}

fn parse_port(address: &str) -> Result<u16, ServerError> {
    address
        .rsplit(':')
        .next()
        .and_then(|port| port.parse().ok())
        .ok_or_else(|| ServerError::InvalidAddress(address.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertised_address_uses_bind_ports() {
        let mut config = ServerConfig::default();
        config.node.hostname = "broker-1".to_owned();
        config.tcp.address = "0.0.0.0:4080".to_owned();
        config.tcp.tls = Some(TcpTlsConfig {
            address: "0.0.0.0:4081".to_owned(),
            cert_file: "cert.pem".to_owned(),
            key_file: "key.pem".to_owned(),
        });
        assert_eq!(
            config.advertised_address().unwrap().to_string(),
            "broker-1:4080:4081"
        );
    }

    #[test]
    fn config_parses_from_toml_with_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            [node]
            hostname = "broker-2"
            region = "eu-west"

            [subscriptions]
            consume_interval = 10
            retention_check_interval = "5s"
            "#,
        )
        .unwrap();
        assert_eq!(config.node.hostname, "broker-2");
        assert_eq!(config.subscriptions.consume_interval, 10);
        assert_eq!(
            config.subscriptions.retention_check_interval,
            Duration::from_secs(5)
        );
        assert_eq!(config.tcp.address, "0.0.0.0:4080");
    }
}
