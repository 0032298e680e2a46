use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::db::VoteBackend;
use crate::error::StorageError;
use crate::identity::VoterIdentity;
use crate::models::LocalVoteEntry;

/// Session-local record of "my current vote" per poll, persisted as JSON.
///
/// All writes go through one async mutex, so two vote actions racing in the
/// same session cannot interleave a half-written entry. If the file cannot be
/// read or written the store keeps working from memory for the rest of the session.
pub struct VoteStateStore {
    inner: Mutex<LocalVoteCache>,
}

struct LocalVoteCache {
    path: Option<PathBuf>,
    entries: HashMap<String, LocalVoteEntry>,
}

impl VoteStateStore {
    /// In-memory only.
    pub fn ephemeral() -> Self {
        Self {
            inner: Mutex::new(LocalVoteCache { path: None, entries: HashMap::new() }),
        }
    }

    /// Load the cache file at `path`. A missing file starts an empty cache.
    pub async fn open(path: Option<PathBuf>) -> Self {
        let Some(path) = path else {
            return Self::ephemeral();
        };

        let cache = match load_entries(&path).await {
            Ok(entries) => LocalVoteCache { path: Some(path), entries },
            Err(e) => {
                warn!("{}; keeping votes in memory for this session", e);
                LocalVoteCache { path: None, entries: HashMap::new() }
            }
        };
        Self { inner: Mutex::new(cache) }
    }

    pub async fn local_entry(&self, poll_id: &str) -> Option<LocalVoteEntry> {
        self.inner.lock().await.entries.get(poll_id).cloned()
    }

    /// The voter's current vote on `poll_id`.
    ///
    /// Authenticated voters are looked up in the authoritative store, and the
    /// answer is mirrored into the local cache. Anonymous voters, or a failed
    /// lookup, fall back to the local cache.
    pub async fn current_vote(
        &self,
        poll_id: &str,
        identity: &VoterIdentity,
        backend: &dyn VoteBackend,
    ) -> Option<LocalVoteEntry> {
        if let VoterIdentity::Anonymous = identity {
            return self.local_entry(poll_id).await;
        }

        match backend.find_vote(poll_id, identity).await {
            Ok(Some(record)) => {
                let entry = LocalVoteEntry { option_id: record.option_id, timestamp: record.voted_at };
                let mut cache = self.inner.lock().await;
                if cache.entries.get(poll_id) != Some(&entry) {
                    cache.entries.insert(poll_id.to_string(), entry.clone());
                    cache.persist().await;
                }
                Some(entry)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Vote lookup for poll {} failed, using local cache: {}", poll_id, e);
                self.local_entry(poll_id).await
            }
        }
    }

    /// Replace the entry for `poll_id`. An older `timestamp` than the stored one is ignored.
    pub async fn record_local(&self, poll_id: &str, option_id: &str, timestamp: DateTime<Utc>) {
        let mut cache = self.inner.lock().await;
        if let Some(existing) = cache.entries.get(poll_id) {
            if existing.timestamp > timestamp {
                debug!("Ignoring older local vote for poll {}", poll_id);
                return;
            }
        }
        cache.entries.insert(
            poll_id.to_string(),
            LocalVoteEntry { option_id: option_id.to_string(), timestamp },
        );
        cache.persist().await;
    }

    /// Put back exactly `previous`, removing the entry when it is `None`.
    pub async fn restore_local(&self, poll_id: &str, previous: Option<LocalVoteEntry>) {
        let mut cache = self.inner.lock().await;
        match previous {
            Some(entry) => cache.entries.insert(poll_id.to_string(), entry),
            None => cache.entries.remove(poll_id),
        };
        cache.persist().await;
    }

    pub async fn is_persistent(&self) -> bool {
        self.inner.lock().await.path.is_some()
    }
}

impl LocalVoteCache {
    async fn persist(&mut self) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = write_entries(path, &self.entries).await {
            warn!("{}; keeping votes in memory for this session", e);
            self.path = None;
        }
    }
}

async fn load_entries(path: &Path) -> Result<HashMap<String, LocalVoteEntry>, StorageError> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(e.into()),
    }
}

// Write to a sibling file then rename, so a crash never leaves a torn cache.
async fn write_entries(path: &Path, entries: &HashMap<String, LocalVoteEntry>) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec_pretty(entries)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
