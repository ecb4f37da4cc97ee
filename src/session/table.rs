//! Session table: the live sessions of one channel, keyed by id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::time::Instant;

use super::session::Session;
use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};
use crate::protocol::Destination;
use crate::stats::SessionSnapshot;
use crate::writer::WriterHandle;

/// Which end of the channel this table belongs to.
///
/// The enclave allocates odd session ids and the host even ones, so both
/// ends can open sessions without colliding. Id 0 is never a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Enclave,
    Host,
}

impl Role {
    fn first_id(self) -> u32 {
        match self {
            Role::Enclave => 1,
            Role::Host => 2,
        }
    }

    /// Whether `id` belongs to the id space this role allocates from.
    pub fn owns(self, id: u32) -> bool {
        id != 0 && id % 2 == self.first_id() % 2
    }

    pub fn peer(self) -> Role {
        match self {
            Role::Enclave => Role::Host,
            Role::Host => Role::Enclave,
        }
    }
}

#[derive(Default)]
struct TableInner {
    sessions: HashMap<u32, Arc<Session>>,
    closed: bool,
}

/// Concurrent map of live sessions plus the channel's id allocator.
pub struct SessionTable {
    role: Role,
    config: TunnelConfig,
    writer: WriterHandle,
    next_id: AtomicU64,
    inner: Mutex<TableInner>,
}

impl SessionTable {
    pub(crate) fn new(role: Role, config: TunnelConfig, writer: WriterHandle) -> Arc<Self> {
        Arc::new(Self {
            role,
            config,
            writer,
            next_id: AtomicU64::new(role.first_id() as u64),
            inner: Mutex::new(TableInner::default()),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Allocate a fresh id for a locally opened session. Ids are never reused.
    pub fn next_id(&self) -> Result<u32> {
        // The 64-bit counter cannot wrap in practice, so exhaustion is sticky.
        let id = self.next_id.fetch_add(2, Ordering::Relaxed);
        u32::try_from(id)
            .map_err(|_| TunnelError::ChannelFailure("session id space exhausted".to_string()))
    }

    /// Register a new session.
    ///
    /// `locally_initiated` sessions get an id from [`SessionTable::next_id`];
    /// remote ids must come from the peer's id space. A duplicate id is a
    /// protocol violation.
    pub fn create(
        self: &Arc<Self>,
        id: u32,
        destination: Option<Destination>,
        locally_initiated: bool,
    ) -> Result<Arc<Session>> {
        let owner = if locally_initiated { self.role } else { self.role.peer() };
        if !owner.owns(id) {
            return Err(TunnelError::ProtocolViolation(format!(
                "session id {} is outside the {:?} id space",
                id, owner
            )));
        }

        let mut inner = self.lock();
        if inner.closed {
            return Err(TunnelError::ChannelFailure("channel is closed".to_string()));
        }
        if inner.sessions.contains_key(&id) {
            return Err(TunnelError::ProtocolViolation(format!(
                "OPEN for existing session {}",
                id
            )));
        }
        let session = Arc::new(Session::new(
            id,
            destination,
            locally_initiated,
            &self.config,
            self.writer.clone(),
            Arc::downgrade(self),
        ));
        inner.sessions.insert(id, session.clone());
        Ok(session)
    }

    pub fn lookup(&self, id: u32) -> Option<Arc<Session>> {
        self.lock().sessions.get(&id).cloned()
    }

    pub fn remove(&self, id: u32) -> Option<Arc<Session>> {
        self.lock().sessions.remove(&id)
    }

    /// Close the table and hand back every session still in it.
    ///
    /// Later calls to [`SessionTable::create`] fail.
    pub fn drain(&self) -> Vec<Arc<Session>> {
        let mut inner = self.lock();
        inner.closed = true;
        inner.sessions.drain().map(|(_, s)| s).collect()
    }

    /// All live sessions, in no particular order.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.lock().sessions.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-session snapshots, ordered by id.
    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let now = Instant::now();
        // Session locks are taken after the table lock is released.
        let mut snapshots: Vec<_> = self.sessions().iter().map(|s| s.snapshot(now)).collect();
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
