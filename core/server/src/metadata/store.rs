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
use thiserror::Error;
use tokio::sync::broadcast;

pub type SessionId = u64;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Key already exists")]
    KeyExists { current: Bytes },
    #[error("Key not found")]
    NotFound,
    #[error("Session expired")]
    SessionExpired,
    #[error("Metadata store unavailable: {0}")]
    Unavailable(String),
}

/// Change notifications emitted by the store. Values are not carried;
/// watchers re-read the keys they care about.
#[derive(Clone, Debug)]
pub enum WatchEvent {
    Created { key: Bytes },
    Deleted { key: Bytes },
    SessionExpired { session: SessionId },
}

/// The strongly consistent KV store the broker keeps its ownership claims
/// and subscription records in. Ephemeral keys are bound to a registered
/// session and disappear when that session expires.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn register_session(&self) -> Result<SessionId, MetadataError>;

    /// Compare-and-set creation of an ephemeral key. Fails with
    /// [`MetadataError::KeyExists`] carrying the current holder's value.
    async fn create_ephemeral(
        &self,
        session: SessionId,
        key: Bytes,
        value: Bytes,
    ) -> Result<(), MetadataError>;

    /// Unconditional write of a persistent key.
    async fn put(&self, key: Bytes, value: Bytes) -> Result<(), MetadataError>;

    async fn get(&self, key: &Bytes) -> Result<Option<Bytes>, MetadataError>;

    /// Deletes a key. Returns whether the key existed.
    async fn delete(&self, key: &Bytes) -> Result<bool, MetadataError>;

    async fn list_prefix(&self, prefix: &Bytes) -> Result<Vec<(Bytes, Bytes)>, MetadataError>;

    /// Subscribe to change events for all keys.
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;

    /// Expire a session, deleting its ephemeral keys and notifying watchers.
    async fn expire_session(&self, session: SessionId) -> Result<(), MetadataError>;
}
