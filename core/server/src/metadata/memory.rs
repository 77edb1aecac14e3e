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

use super::store::{MetadataError, MetadataStore, SessionId, WatchEvent};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, Mutex};

const WATCH_CHANNEL_CAPACITY: usize = 1024;

struct Entry {
    value: Bytes,
    /// Session the key is bound to; `None` for persistent keys.
    session: Option<SessionId>,
}

/// In-memory metadata store. A single instance can be shared by several
/// in-process broker nodes, which makes ownership contention observable in
/// tests without an external coordination service.
pub struct MemoryMetadataStore {
    entries: Mutex<BTreeMap<Bytes, Entry>>,
    sessions: Mutex<HashSet<SessionId>>,
    next_session: AtomicU64,
    events: broadcast::Sender<WatchEvent>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            entries: Mutex::new(BTreeMap::new()),
            sessions: Mutex::new(HashSet::new()),
            next_session: AtomicU64::new(1),
            events,
        }
    }

    fn notify(&self, event: WatchEvent) {
        // Nobody watching is fine.
        let _ = self.events.send(event);
    }
}

impl Default for MemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn register_session(&self) -> Result<SessionId, MetadataError> {
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        self.sessions.lock().await.insert(session);
        Ok(session)
    }

    async fn create_ephemeral(
        &self,
        session: SessionId,
        key: Bytes,
        value: Bytes,
    ) -> Result<(), MetadataError> {
        if !self.sessions.lock().await.contains(&session) {
            return Err(MetadataError::SessionExpired);
        }
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(&key) {
            return Err(MetadataError::KeyExists {
                current: existing.value.clone(),
            });
        }
        entries.insert(
            key.clone(),
            Entry {
                value,
                session: Some(session),
            },
        );
        drop(entries);
        self.notify(WatchEvent::Created { key });
        Ok(())
    }

    async fn put(&self, key: Bytes, value: Bytes) -> Result<(), MetadataError> {
        let created = self
            .entries
            .lock()
            .await
            .insert(
                key.clone(),
                Entry {
                    value,
                    session: None,
                },
            )
            .is_none();
        if created {
            self.notify(WatchEvent::Created { key });
        }
        Ok(())
    }

    async fn get(&self, key: &Bytes) -> Result<Option<Bytes>, MetadataError> {
        Ok(self
            .entries
            .lock()
            .await
            .get(key)
            .map(|entry| entry.value.clone()))
    }

    async fn delete(&self, key: &Bytes) -> Result<bool, MetadataError> {
        let existed = self.entries.lock().await.remove(key).is_some();
        if existed {
            self.notify(WatchEvent::Deleted { key: key.clone() });
        }
        Ok(existed)
    }

    async fn list_prefix(&self, prefix: &Bytes) -> Result<Vec<(Bytes, Bytes)>, MetadataError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    async fn expire_session(&self, session: SessionId) -> Result<(), MetadataError> {
        if !self.sessions.lock().await.remove(&session) {
            return Err(MetadataError::SessionExpired);
        }
        let mut expired_keys = Vec::new();
        {
            let mut entries = self.entries.lock().await;
            entries.retain(|key, entry| {
                if entry.session == Some(session) {
                    expired_keys.push(key.clone());
                    false
                } else {
                    true
                }
            });
        }
        for key in expired_keys {
            self.notify(WatchEvent::Deleted { key });
        }
        self.notify(WatchEvent::SessionExpired { session });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ephemeral_create_is_compare_and_set() {
        let store = MemoryMetadataStore::new();
        let s1 = store.register_session().await.unwrap();
        let s2 = store.register_session().await.unwrap();
        let key = Bytes::from_static(b"owners/orders");

        store
            .create_ephemeral(s1, key.clone(), Bytes::from_static(b"node-a"))
            .await
            .unwrap();
        let err = store
            .create_ephemeral(s2, key.clone(), Bytes::from_static(b"node-b"))
            .await
            .unwrap_err();
        let MetadataError::KeyExists { current } = err else {
            panic!("expected KeyExists");
        };
        assert_eq!(current, Bytes::from_static(b"node-a"));
    }

    #[tokio::test]
    async fn session_expiry_drops_ephemeral_keys_and_notifies_watchers() {
        let store = MemoryMetadataStore::new();
        let session = store.register_session().await.unwrap();
        let key = Bytes::from_static(b"owners/orders");
        store
            .create_ephemeral(session, key.clone(), Bytes::from_static(b"node-a"))
            .await
            .unwrap();
        store
            .put(Bytes::from_static(b"subscriptions/orders/s1"), Bytes::new())
            .await
            .unwrap();

        let mut watcher = store.watch();
        store.expire_session(session).await.unwrap();

        assert_eq!(store.get(&key).await.unwrap(), None);
        assert!(store
            .get(&Bytes::from_static(b"subscriptions/orders/s1"))
            .await
            .unwrap()
            .is_some());

        let event = watcher.recv().await.unwrap();
        assert!(matches!(event, WatchEvent::Deleted { key: deleted } if deleted == key));
        let event = watcher.recv().await.unwrap();
        assert!(matches!(event, WatchEvent::SessionExpired { session: s } if s == session));
    }

    #[tokio::test]
    async fn list_prefix_returns_only_matching_keys() {
        let store = MemoryMetadataStore::new();
        store
            .put(
                Bytes::from_static(b"subscriptions/orders/s1"),
                Bytes::from_static(b"1"),
            )
            .await
            .unwrap();
        store
            .put(
                Bytes::from_static(b"subscriptions/orders/s2"),
                Bytes::from_static(b"2"),
            )
            .await
            .unwrap();
        store
            .put(
                Bytes::from_static(b"subscriptions/other/s3"),
                Bytes::from_static(b"3"),
            )
            .await
            .unwrap();

        let listed = store
            .list_prefix(&Bytes::from_static(b"subscriptions/orders/"))
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed
            .iter()
            .all(|(key, _)| key.starts_with(b"subscriptions/orders/")));
    }
}
