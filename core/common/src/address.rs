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

use crate::error::StrixError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A broker address triplet `hostname:port:sslPort`.
///
/// The triplet is kept as a single opaque string on the wire and in the
/// client's tried-server sets, so that plaintext and TLS clients talking to
/// the same owner agree on equality. It is parsed only at the client
/// boundary to pick the port matching the client's transport.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrokerAddress {
    pub hostname: String,
    pub port: u16,
    pub ssl_port: u16,
}

impl BrokerAddress {
    pub fn new(hostname: impl Into<String>, port: u16, ssl_port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            ssl_port,
        }
    }

    /// Socket address string for the plaintext port.
    pub fn plain_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// Socket address string for the TLS port.
    pub fn ssl_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.ssl_port)
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.hostname, self.port, self.ssl_port)
    }
}

impl FromStr for BrokerAddress {
    type Err = StrixError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.rsplitn(3, ':');
        let ssl_port = parts.next();
        let port = parts.next();
        let hostname = parts.next();
        match (hostname, port, ssl_port) {
            (Some(hostname), Some(port), Some(ssl_port)) if !hostname.is_empty() => {
                let port = port
                    .parse()
                    .map_err(|_| StrixError::InvalidAddress(s.to_owned()))?;
                let ssl_port = ssl_port
                    .parse()
                    .map_err(|_| StrixError::InvalidAddress(s.to_owned()))?;
                Ok(Self::new(hostname, port, ssl_port))
            }
            _ => Err(StrixError::InvalidAddress(s.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_formats_the_triplet() {
        let address: BrokerAddress = "broker-1.example.com:4080:4081".parse().expect("parse");
        assert_eq!(address.hostname, "broker-1.example.com");
        assert_eq!(address.port, 4080);
        assert_eq!(address.ssl_port, 4081);
        assert_eq!(address.to_string(), "broker-1.example.com:4080:4081");
        assert_eq!(address.plain_addr(), "broker-1.example.com:4080");
        assert_eq!(address.ssl_addr(), "broker-1.example.com:4081");
    }

    #[test]
    fn rejects_malformed_triplets() {
        for raw in ["", "host", "host:4080", "host:notaport:4081", ":4080:4081"] {
            assert!(
                raw.parse::<BrokerAddress>().is_err(),
                "expected parse failure for: {raw}"
            );
        }
    }
}
