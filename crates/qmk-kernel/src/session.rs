//! Session registry
//!
//! A session is a tenant-bound authorization container: the negotiated
//! rights, the capability tokens backing them, and the live handles its jobs
//! have produced. Closing a session cancels its jobs and releases its
//! handles; a suspended tenant invalidates its sessions at the next lookup.

use parking_lot::{Mutex, RwLock};
use qmk_core::{CapId, HandleId, JobId, KernelError, Result, RightSet, SessionId, TenantId};
use qmk_device::{LinkId, PhysQubit};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A live virtual-qubit handle held at session scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VqHandle {
    pub handle: HandleId,
    pub phys: PhysQubit,
    pub owner: TenantId,
}

/// A live channel endpoint held at session scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChHandle {
    pub handle: HandleId,
    pub link: LinkId,
}

/// One session row.
pub struct Session {
    pub id: SessionId,
    pub tenant: TenantId,
    pub granted: RightSet,
    tokens: Mutex<Vec<CapId>>,
    live_vqs: Mutex<HashMap<String, VqHandle>>,
    live_chs: Mutex<HashMap<String, ChHandle>>,
    jobs: Mutex<Vec<JobId>>,
    closed: AtomicBool,
}

impl Session {
    fn new(tenant: TenantId, granted: RightSet, tokens: Vec<CapId>) -> Self {
        Self {
            id: SessionId::generate(),
            tenant,
            granted,
            tokens: Mutex::new(tokens),
            live_vqs: Mutex::new(HashMap::new()),
            live_chs: Mutex::new(HashMap::new()),
            jobs: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn tokens(&self) -> Vec<CapId> {
        self.tokens.lock().clone()
    }

    /// Replace the backing tokens (delegation hand-off, tests).
    pub fn set_tokens(&self, tokens: Vec<CapId>) {
        *self.tokens.lock() = tokens;
    }

    pub fn add_token(&self, token: CapId) {
        self.tokens.lock().push(token);
    }

    /// Deposit a live VQ; returns the handle this name displaced, if any,
    /// so the caller can release it on the backend.
    pub fn insert_vq(&self, name: String, handle: VqHandle) -> Option<VqHandle> {
        self.live_vqs.lock().insert(name, handle)
    }

    pub fn vq(&self, name: &str) -> Option<VqHandle> {
        self.live_vqs.lock().get(name).cloned()
    }

    pub fn take_vq(&self, name: &str) -> Option<VqHandle> {
        self.live_vqs.lock().remove(name)
    }

    /// Drain every live VQ, for session teardown.
    pub fn drain_vqs(&self) -> Vec<VqHandle> {
        self.live_vqs.lock().drain().map(|(_, h)| h).collect()
    }

    pub fn live_vq_count(&self) -> usize {
        self.live_vqs.lock().len()
    }

    pub fn insert_ch(&self, name: String, handle: ChHandle) -> Option<ChHandle> {
        self.live_chs.lock().insert(name, handle)
    }

    pub fn drain_chs(&self) -> Vec<ChHandle> {
        self.live_chs.lock().drain().map(|(_, h)| h).collect()
    }

    pub fn add_job(&self, job: JobId) {
        self.jobs.lock().push(job);
    }

    pub fn jobs(&self) -> Vec<JobId> {
        self.jobs.lock().clone()
    }
}

/// The session table.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, tenant: TenantId, granted: RightSet, tokens: Vec<CapId>) -> Arc<Session> {
        let session = Arc::new(Session::new(tenant, granted, tokens));
        self.sessions.write().insert(session.id, session.clone());
        session
    }

    /// Lookup rejecting closed sessions.
    pub fn get(&self, id: SessionId) -> Result<Arc<Session>> {
        let session = self
            .sessions
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| KernelError::SessionInvalid(format!("unknown session {id}")))?;
        if session.is_closed() {
            return Err(KernelError::SessionInvalid(format!("session {id} is closed")));
        }
        Ok(session)
    }

    /// Mark closed and hand the row back for teardown. Idempotent.
    pub fn close(&self, id: SessionId) -> Result<Arc<Session>> {
        let session = self
            .sessions
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| KernelError::SessionInvalid(format!("unknown session {id}")))?;
        session.close();
        Ok(session)
    }

    pub fn of_tenant(&self, tenant: &TenantId) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .filter(|s| &s.tenant == tenant)
            .cloned()
            .collect()
    }
}
