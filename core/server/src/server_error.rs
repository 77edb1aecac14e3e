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

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Cannot read config file: {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Cannot parse config file: {path}")]
    ConfigParse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid bind address: {0}")]
    InvalidAddress(String),
    #[error("Cannot bind listener on: {address}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Cannot load TLS certificate material from: {path}")]
    Tls {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid TLS configuration: {0}")]
    TlsConfig(String),
    #[error("Metadata store error: {0}")]
    Metadata(String),
}
