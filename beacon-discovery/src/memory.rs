//! In-memory coordination namespace (for testing and development)
//!
//! Many sessions can be opened against one [`InMemoryNamespace`]; each gets
//! its own ephemeral-record lifetime and watches, like independent clients
//! of a real ensemble. Test controls simulate outages and session expiry.

use crate::session::{
    is_direct_child, ChildEvent, ChildRecord, ChildWatch, Connector, CoordinationSession,
    DiscoveryError,
};
use crate::settings::{ConnectionSettings, Credential};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug)]
struct Record {
    data: Vec<u8>,
    // None for persistent records seeded by tests
    owner: Option<u64>,
}

struct Watch {
    session: u64,
    root: String,
    tx: mpsc::UnboundedSender<ChildEvent>,
}

struct NamespaceState {
    records: BTreeMap<String, Record>,
    live_sessions: HashSet<u64>,
    watches: Vec<Watch>,
    next_session: u64,
    available: bool,
    required_credential: Option<Credential>,
}

impl NamespaceState {
    fn notify(&mut self, event: ChildEvent) {
        // Receivers dropped by their owner are pruned here
        self.watches.retain(|watch| {
            if !is_direct_child(&watch.root, &event.record.path) {
                return true;
            }
            watch.tx.send(event.clone()).is_ok()
        });
    }

    fn end_session(&mut self, session: u64) -> bool {
        if !self.live_sessions.remove(&session) {
            return false;
        }

        self.watches.retain(|watch| watch.session != session);

        let owned: Vec<String> = self
            .records
            .iter()
            .filter(|(_, record)| record.owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();

        for path in owned {
            if let Some(record) = self.records.remove(&path) {
                self.notify(ChildEvent::removed(path, Some(record.data)));
            }
        }

        true
    }

    fn check(&self, session: u64) -> Result<(), DiscoveryError> {
        if !self.available {
            return Err(DiscoveryError::ConnectionLoss(
                "coordination service unavailable".to_string(),
            ));
        }
        if !self.live_sessions.contains(&session) {
            return Err(DiscoveryError::SessionClosed);
        }
        Ok(())
    }
}

/// Process-local coordination namespace
#[derive(Clone)]
pub struct InMemoryNamespace {
    state: Arc<Mutex<NamespaceState>>,
    connect_attempts: Arc<AtomicUsize>,
}

impl InMemoryNamespace {
    /// Create an empty, available namespace
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NamespaceState {
                records: BTreeMap::new(),
                live_sessions: HashSet::new(),
                watches: Vec::new(),
                next_session: 1,
                available: true,
                required_credential: None,
            })),
            connect_attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Reject sessions that do not present this credential
    pub fn require_credential(&self, credential: Credential) {
        self.state.lock().required_credential = Some(credential);
    }

    /// Simulate an outage (`false`) or recovery (`true`)
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Number of connection attempts made so far
    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.state.lock().live_sessions.len()
    }

    /// Direct children of `root`
    pub fn records(&self, root: &str) -> Vec<ChildRecord> {
        self.state
            .lock()
            .records
            .iter()
            .filter(|(path, _)| is_direct_child(root, path))
            .map(|(path, record)| ChildRecord::new(path.clone(), Some(record.data.clone())))
            .collect()
    }

    /// Session owning the ephemeral record at `path`
    pub fn owner_of(&self, path: &str) -> Option<u64> {
        self.state.lock().records.get(path).and_then(|r| r.owner)
    }

    /// Insert or replace a record not bound to any session
    pub fn put_persistent(&self, path: &str, data: &[u8]) {
        let mut state = self.state.lock();
        let existed = state
            .records
            .insert(
                path.to_string(),
                Record {
                    data: data.to_vec(),
                    owner: None,
                },
            )
            .is_some();

        let event = if existed {
            ChildEvent::updated(path, Some(data.to_vec()))
        } else {
            ChildEvent::added(path, Some(data.to_vec()))
        };
        state.notify(event);
    }

    /// Remove a record regardless of owner
    pub fn remove(&self, path: &str) -> bool {
        let mut state = self.state.lock();
        match state.records.remove(path) {
            Some(record) => {
                state.notify(ChildEvent::removed(path, Some(record.data)));
                true
            }
            None => false,
        }
    }

    /// Expire a session as the service would after its owner went silent:
    /// its ephemeral records vanish and its watches end.
    pub fn expire_session(&self, session: u64) -> bool {
        let expired = self.state.lock().end_session(session);
        if expired {
            debug!(session, "session expired");
        }
        expired
    }
}

impl Default for InMemoryNamespace {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for InMemoryNamespace {
    async fn connect(
        &self,
        settings: &ConnectionSettings,
    ) -> Result<Arc<dyn CoordinationSession>, DiscoveryError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        if !state.available {
            return Err(DiscoveryError::ConnectionLoss(format!(
                "cannot reach {}",
                settings.ensemble_string()
            )));
        }

        if let Some(required) = &state.required_credential {
            if settings.credential.as_ref() != Some(required) {
                return Err(DiscoveryError::Backend("authentication failed".to_string()));
            }
        }

        let id = state.next_session;
        state.next_session += 1;
        state.live_sessions.insert(id);
        debug!(session = id, "session opened");

        Ok(Arc::new(InMemorySession {
            id,
            state: Arc::clone(&self.state),
        }))
    }
}

/// Session against an [`InMemoryNamespace`]
pub struct InMemorySession {
    id: u64,
    state: Arc<Mutex<NamespaceState>>,
}

impl InMemorySession {
    pub fn session_id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
impl CoordinationSession for InMemorySession {
    fn id(&self) -> String {
        self.id.to_string()
    }

    async fn exists(&self, path: &str) -> Result<bool, DiscoveryError> {
        let state = self.state.lock();
        state.check(self.id)?;
        Ok(state.records.contains_key(path))
    }

    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<(), DiscoveryError> {
        let mut state = self.state.lock();
        state.check(self.id)?;

        if state.records.contains_key(path) {
            return Err(DiscoveryError::NodeExists(path.to_string()));
        }

        state.records.insert(
            path.to_string(),
            Record {
                data: data.to_vec(),
                owner: Some(self.id),
            },
        );
        state.notify(ChildEvent::added(path, Some(data.to_vec())));
        Ok(())
    }

    async fn create_persistent(&self, path: &str, data: &[u8]) -> Result<(), DiscoveryError> {
        let mut state = self.state.lock();
        state.check(self.id)?;

        if state.records.contains_key(path) {
            return Err(DiscoveryError::NodeExists(path.to_string()));
        }

        state.records.insert(
            path.to_string(),
            Record {
                data: data.to_vec(),
                owner: None,
            },
        );
        state.notify(ChildEvent::added(path, Some(data.to_vec())));
        Ok(())
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> Result<(), DiscoveryError> {
        let mut state = self.state.lock();
        state.check(self.id)?;

        let record = state
            .records
            .get_mut(path)
            .ok_or_else(|| DiscoveryError::NoNode(path.to_string()))?;
        record.data = data.to_vec();

        state.notify(ChildEvent::updated(path, Some(data.to_vec())));
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), DiscoveryError> {
        let mut state = self.state.lock();
        state.check(self.id)?;

        let record = state
            .records
            .remove(path)
            .ok_or_else(|| DiscoveryError::NoNode(path.to_string()))?;

        state.notify(ChildEvent::removed(path, Some(record.data)));
        Ok(())
    }

    async fn list_children(&self, root: &str) -> Result<Vec<ChildRecord>, DiscoveryError> {
        let state = self.state.lock();
        state.check(self.id)?;

        Ok(state
            .records
            .iter()
            .filter(|(path, _)| is_direct_child(root, path))
            .map(|(path, record)| ChildRecord::new(path.clone(), Some(record.data.clone())))
            .collect())
    }

    async fn watch_children(&self, root: &str) -> Result<ChildWatch, DiscoveryError> {
        let mut state = self.state.lock();
        state.check(self.id)?;

        let (tx, rx) = mpsc::unbounded_channel();
        for (path, record) in state.records.iter() {
            if is_direct_child(root, path) {
                let _ = tx.send(ChildEvent::added(path.clone(), Some(record.data.clone())));
            }
        }

        state.watches.push(Watch {
            session: self.id,
            root: root.to_string(),
            tx,
        });

        Ok(rx)
    }

    async fn close(&self) {
        if self.state.lock().end_session(self.id) {
            debug!(session = self.id, "session closed");
        }
    }
}
