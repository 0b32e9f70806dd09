//! TTL-bounded session scopes.
//!
//! A session is a named bag of JSON values with a sliding expiry: every
//! read or write of a live session pushes its deadline out by the full
//! TTL. Expiry is lazy: an expired session is simply invisible. Its entry
//! is retained so restarting the id brings stored data back; `session_end`
//! discards one scope and `session_prune` sweeps out every expired one.
//!
//! With a connected cluster the whole scope replicates through the
//! backend's kv store after each mutation, so a session started on one
//! node is readable on another.

use crate::context;
use crate::error::ProcessError;
use crate::system::ProcessSystem;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn kv_key(id: &str) -> String {
    format!("session/{id}")
}

#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct SessionScope {
    ttl_ms: u64,
    expires_at_ms: u64,
    data: HashMap<String, serde_json::Value>,
}

impl SessionScope {
    fn new(ttl: Duration) -> Self {
        let ttl_ms = ttl.as_millis() as u64;
        Self {
            ttl_ms,
            expires_at_ms: now_ms() + ttl_ms,
            data: HashMap::new(),
        }
    }

    fn live(&self, now: u64) -> bool {
        now < self.expires_at_ms
    }

    fn touch(&mut self, now: u64) {
        self.expires_at_ms = now + self.ttl_ms;
    }
}

pub(crate) struct SessionStore {
    entries: DashMap<String, SessionScope>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl ProcessSystem {
    /// Creates a session, or refreshes the TTL of an existing one. The
    /// data of a refreshed session is preserved, including data written
    /// while it was expired.
    pub async fn session_start(&self, id: &str, ttl: Duration) {
        {
            let mut entry = self
                .sessions()
                .entries
                .entry(id.to_string())
                .or_insert_with(|| SessionScope::new(ttl));
            entry.ttl_ms = ttl.as_millis() as u64;
            entry.touch(now_ms());
        }
        debug!(session = id, ?ttl, "session started");
        self.replicate_session(id).await;
    }

    /// Drops every expired scope from the local store, returning how many
    /// were removed. A pruned id restarts from an empty scope, unless a
    /// replicated copy still exists in the cluster kv store and hydrates
    /// back on the next read.
    pub fn session_prune(&self) -> usize {
        let now = now_ms();
        let before = self.sessions().entries.len();
        self.sessions().entries.retain(|_, scope| scope.live(now));
        before - self.sessions().entries.len()
    }

    /// Ends a session immediately, discarding its data.
    pub async fn session_end(&self, id: &str) {
        self.sessions().entries.remove(id);
        debug!(session = id, "session ended");
        if let Some(cluster) = self.cluster() {
            if let Err(err) = cluster.kv_delete(&kv_key(id)).await {
                warn!(session = id, %err, "session delete did not replicate");
            }
        }
    }

    /// Writes one value into a session scope.
    ///
    /// Writing to an expired or unknown id stores the value but does not
    /// revive the session; the data becomes visible if the id is started
    /// again. Writing to a live session extends its TTL.
    pub async fn session_set<V: Serialize>(
        &self,
        id: &str,
        key: &str,
        value: &V,
    ) -> Result<(), ProcessError> {
        let json = serde_json::to_value(value)?;
        let now = now_ms();
        {
            let mut entry = self
                .sessions()
                .entries
                .entry(id.to_string())
                .or_insert_with(|| SessionScope {
                    ttl_ms: 0,
                    expires_at_ms: 0,
                    data: HashMap::new(),
                });
            if entry.live(now) {
                entry.touch(now);
            }
            entry.data.insert(key.to_string(), json);
        }
        self.replicate_session(id).await;
        Ok(())
    }

    /// Reads one value from a live session scope, extending its TTL.
    /// Returns `Ok(None)` when the session is expired or unknown, or holds
    /// no such key.
    pub async fn session_get<T: DeserializeOwned>(
        &self,
        id: &str,
        key: &str,
    ) -> Result<Option<T>, ProcessError> {
        self.hydrate_session(id).await;

        let now = now_ms();
        let value = {
            let Some(mut entry) = self.sessions().entries.get_mut(id) else {
                return Ok(None);
            };
            if !entry.live(now) {
                return Ok(None);
            }
            entry.touch(now);
            entry.data.get(key).cloned()
        };

        // The read extended the TTL; keep the replica in step.
        self.replicate_session(id).await;
        match value {
            Some(json) => Ok(Some(serde_json::from_value(json)?)),
            None => Ok(None),
        }
    }

    /// Returns `true` if `id` names a live session. Does not extend the
    /// TTL.
    pub fn session_is_live(&self, id: &str) -> bool {
        let now = now_ms();
        self.sessions()
            .entries
            .get(id)
            .map(|entry| entry.live(now))
            .unwrap_or(false)
    }

    // ---------------------------------------------------------------------
    // Ambient variants, resolving the id from the enclosing
    // `colony::session_scope`.

    /// The ambient session id, when inside a [`crate::session_scope`] and
    /// the session is live.
    pub fn session_id(&self) -> Option<String> {
        let id = context::current_session()?;
        self.session_is_live(&id).then_some(id)
    }

    /// Returns `true` when the ambient session exists and is live.
    pub fn has_session(&self) -> bool {
        self.session_id().is_some()
    }

    /// [`session_start`](Self::session_start) against the ambient session
    /// id. No-op outside a session scope.
    pub async fn session_start_ambient(&self, ttl: Duration) {
        if let Some(id) = context::current_session() {
            self.session_start(&id, ttl).await;
        }
    }

    /// [`session_set`](Self::session_set) against the ambient session id.
    /// Outside a session scope the write is dropped with a warning.
    pub async fn session_set_data<V: Serialize>(
        &self,
        key: &str,
        value: &V,
    ) -> Result<(), ProcessError> {
        match context::current_session() {
            Some(id) => self.session_set(&id, key, value).await,
            None => {
                warn!(key, "session write outside a session scope dropped");
                Ok(())
            }
        }
    }

    /// [`session_get`](Self::session_get) against the ambient session id.
    /// Returns `Ok(None)` outside a session scope.
    pub async fn session_get_data<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, ProcessError> {
        match context::current_session() {
            Some(id) => self.session_get(&id, key).await,
            None => Ok(None),
        }
    }

    // ---------------------------------------------------------------------
    // Replication

    /// Pulls a session scope from the cluster when this node has never
    /// seen the id.
    async fn hydrate_session(&self, id: &str) {
        if self.sessions().entries.contains_key(id) {
            return;
        }
        let Some(cluster) = self.cluster() else { return };
        match cluster.kv_get(&kv_key(id)).await {
            Ok(Some(blob)) => match serde_json::from_slice::<SessionScope>(&blob) {
                Ok(scope) => {
                    debug!(session = id, "session hydrated from cluster");
                    self.sessions().entries.insert(id.to_string(), scope);
                }
                Err(err) => warn!(session = id, %err, "replicated session did not decode"),
            },
            Ok(None) => {}
            Err(err) => warn!(session = id, %err, "session hydration failed"),
        }
    }

    async fn replicate_session(&self, id: &str) {
        let Some(cluster) = self.cluster() else { return };
        let Some(scope) = self
            .sessions()
            .entries
            .get(id)
            .map(|entry| entry.value().clone())
        else {
            return;
        };
        match serde_json::to_vec(&scope) {
            Ok(blob) => {
                if let Err(err) = cluster.kv_put(&kv_key(id), blob).await {
                    warn!(session = id, %err, "session write did not replicate");
                }
            }
            Err(err) => warn!(session = id, %err, "session scope did not serialize"),
        }
    }
}
