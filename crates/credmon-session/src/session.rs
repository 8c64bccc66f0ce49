//! Per-key session state
//!
//! A session is created when the user opens a key's entry page and lives in
//! memory until it expires. It tracks, for every provider named in the key
//! file, whether a token has been issued, the outstanding CSRF state, and
//! the resolved provider-side username.
//!
//! Each session sits behind its own async mutex. All changes are
//! read-modify-write under that lock, so two browser tabs racing the flow
//! for the same key cannot clobber each other's provider entries. The outer
//! map lock is only held long enough to look a session up.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use credmon_auth::{KeyFile, UNKNOWN_USERNAME};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::tracker;

/// Authorization status of one provider within a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderSession {
    pub logged_in: bool,
    /// Set when authorization begins, consumed when the callback matches.
    #[serde(skip)]
    pub csrf_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_scopes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_audience: Option<String>,
    pub username: String,
}

impl Default for ProviderSession {
    fn default() -> Self {
        Self {
            logged_in: false,
            csrf_state: None,
            requested_scopes: None,
            requested_audience: None,
            username: UNKNOWN_USERNAME.to_string(),
        }
    }
}

/// State for one key's credential request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRecord {
    pub key_path: PathBuf,
    pub local_username: String,
    /// True iff every provider is logged in. Kept in step by
    /// [`SessionRecord::recompute_logged_in`].
    pub logged_in: bool,
    /// Provider whose authorization is in progress. Callbacks for several
    /// handles can arrive on one shared return path, so this, not the path,
    /// identifies the provider being completed.
    #[serde(skip)]
    pub in_flight: Option<String>,
    pub providers: BTreeMap<String, ProviderSession>,
}

impl SessionRecord {
    /// Seed a session from a key file: one logged-out entry per distinct
    /// provider display name.
    pub fn from_key_file(key: &KeyFile) -> Self {
        let providers = key
            .entries
            .iter()
            .map(|entry| {
                (
                    entry.name.clone(),
                    ProviderSession {
                        requested_scopes: entry.scopes.clone(),
                        requested_audience: entry.audience.clone(),
                        ..ProviderSession::default()
                    },
                )
            })
            .collect();

        Self {
            key_path: key.path.clone(),
            local_username: key.local_username.clone(),
            logged_in: false,
            in_flight: None,
            providers,
        }
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderSession> {
        self.providers.get(name)
    }

    pub fn recompute_logged_in(&mut self) -> bool {
        self.logged_in = tracker::all_logged_in(&self.providers);
        self.logged_in
    }
}

fn provider_mut<'a>(
    record: &'a mut SessionRecord,
    provider: &str,
) -> Result<&'a mut ProviderSession> {
    record
        .providers
        .get_mut(provider)
        .ok_or_else(|| Error::UnknownProvider(provider.to_string()))
}

struct Entry {
    record: Mutex<SessionRecord>,
    created_at: Instant,
}

/// In-memory session store keyed by opaque session id.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Entry>>>,
    ttl: Duration,
}

impl SessionStore {
    /// Sessions older than `ttl` are dropped lazily on the next creation.
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Parse the key file at `key_path` and start a new session for it.
    pub async fn create_session(&self, key_path: &Path) -> Result<(String, SessionRecord)> {
        let key = KeyFile::load(key_path).await?;
        let record = SessionRecord::from_key_file(&key);
        let id = self.insert(record.clone()).await;
        info!(
            session = %id,
            user = %record.local_username,
            providers = record.providers.len(),
            "session created"
        );
        metrics::counter!("credmon_sessions_created_total").increment(1);
        Ok((id, record))
    }

    /// Store `record` under a fresh id.
    pub async fn insert(&self, record: SessionRecord) -> String {
        let id = uuid::Uuid::new_v4().as_simple().to_string();
        let entry = Arc::new(Entry {
            record: Mutex::new(record),
            created_at: Instant::now(),
        });

        let mut sessions = self.sessions.write().await;
        let ttl = self.ttl;
        let before = sessions.len();
        sessions.retain(|_, e| e.created_at.elapsed() < ttl);
        if sessions.len() < before {
            debug!(expired = before - sessions.len(), "swept expired sessions");
        }
        sessions.insert(id.clone(), entry);
        id
    }

    /// Snapshot of a session.
    pub async fn get_session(&self, id: &str) -> Result<SessionRecord> {
        let entry = self.entry(id).await?;
        let record = entry.record.lock().await;
        Ok(record.clone())
    }

    /// Run `f` against the session under its lock.
    pub async fn with_session<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut SessionRecord) -> Result<R>,
    ) -> Result<R> {
        let entry = self.entry(id).await?;
        let mut record = entry.record.lock().await;
        f(&mut record)
    }

    /// Apply `f` to a single provider's state, then refresh the aggregate
    /// login flag. Sibling providers are never rewritten.
    ///
    /// Returns `f`'s result together with the session's recomputed
    /// `logged_in`.
    pub async fn mutate_provider<R>(
        &self,
        id: &str,
        provider: &str,
        f: impl FnOnce(&mut ProviderSession) -> R,
    ) -> Result<(R, bool)> {
        self.with_session(id, |record| {
            let out = f(provider_mut(record, provider)?);
            Ok((out, record.recompute_logged_in()))
        })
        .await
    }

    /// Record that authorization for `provider` has begun: store its CSRF
    /// state (replacing any earlier one) and mark it in flight.
    pub async fn start_authorization(&self, id: &str, provider: &str, state: String) -> Result<()> {
        self.with_session(id, |record| {
            provider_mut(record, provider)?.csrf_state = Some(state);
            record.in_flight = Some(provider.to_string());
            Ok(())
        })
        .await
    }

    /// Resolve the provider a callback belongs to and run `f` against it.
    ///
    /// The in-flight provider wins over `fallback` (the provider named by
    /// the return path) and is consumed whether or not `f` succeeds.
    /// Returns the resolved provider name with `f`'s result.
    pub async fn claim_callback<R>(
        &self,
        id: &str,
        fallback: &str,
        f: impl FnOnce(&str, &mut ProviderSession) -> Result<R>,
    ) -> Result<(String, R)> {
        self.with_session(id, |record| {
            let provider = record
                .in_flight
                .take()
                .unwrap_or_else(|| fallback.to_string());
            let out = f(&provider, provider_mut(record, &provider)?)?;
            record.recompute_logged_in();
            Ok((provider, out))
        })
        .await
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn entry(&self, id: &str) -> Result<Arc<Entry>> {
        let sessions = self.sessions.read().await;
        match sessions.get(id) {
            Some(entry) if entry.created_at.elapsed() < self.ttl => Ok(entry.clone()),
            _ => Err(Error::SessionNotFound(id.to_string())),
        }
    }
}
