//! Checkpoint & migration manager
//!
//! Snapshots pair the backend's opaque device state with the executor's
//! handle tables at a program point. Retention is LRU-bounded, but a running
//! job's checkpoints are pinned and never evicted out from under it.
//! Migration points are checkpoints whose destination quote covers the job's
//! qubit count and capability set.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use qmk_core::{CheckpointId, JobId, KernelError, Result, RightSet};
use qmk_device::DeviceSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Executor handle tables frozen at a checkpoint. Handle ids are not
/// captured: a restore is a fresh production and mints fresh ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandleTableSnapshot {
    /// Index of the node the checkpoint was taken before.
    pub node_index: usize,
    /// Live VQs: (name, physical slot).
    pub vqs: Vec<(String, u32)>,
    /// Live in-graph channels: (name, link id, remaining entanglements).
    pub chs: Vec<(String, u64, u32)>,
    /// Events recorded so far.
    pub events: BTreeMap<String, u8>,
    /// Indices of nodes executed (not skipped) before the checkpoint.
    pub executed: Vec<usize>,
}

/// One captured checkpoint.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub job: JobId,
    pub created_at: DateTime<Utc>,
    pub device: DeviceSnapshot,
    pub handles: HandleTableSnapshot,
}

/// Quote an externally supplied migration destination must present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationDestination {
    pub logical_qubits: u32,
    pub rights: RightSet,
}

struct Inner {
    map: HashMap<CheckpointId, Arc<Checkpoint>>,
    lru: VecDeque<CheckpointId>,
    pinned_jobs: HashSet<JobId>,
}

/// LRU-bounded checkpoint store.
pub struct CheckpointManager {
    bound: usize,
    inner: Mutex<Inner>,
}

impl CheckpointManager {
    pub fn new(bound: usize) -> Self {
        Self {
            bound: bound.max(1),
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                lru: VecDeque::new(),
                pinned_jobs: HashSet::new(),
            }),
        }
    }

    /// Capture a checkpoint for `job`, evicting the oldest unpinned entries
    /// above the bound.
    pub fn capture(
        &self,
        job: JobId,
        device: DeviceSnapshot,
        handles: HandleTableSnapshot,
    ) -> CheckpointId {
        let checkpoint = Arc::new(Checkpoint {
            id: CheckpointId::generate(),
            job,
            created_at: Utc::now(),
            device,
            handles,
        });
        let id = checkpoint.id;
        let mut inner = self.inner.lock();
        inner.map.insert(id, checkpoint);
        inner.lru.push_back(id);
        self.evict_excess(&mut inner);
        id
    }

    fn evict_excess(&self, inner: &mut Inner) {
        while inner.map.len() > self.bound {
            // Oldest unpinned entry goes first; if everything is pinned, the
            // bound stretches rather than dropping an active checkpoint.
            let victim = inner
                .lru
                .iter()
                .position(|id| {
                    inner
                        .map
                        .get(id)
                        .map(|c| !inner.pinned_jobs.contains(&c.job))
                        .unwrap_or(true)
                })
                .and_then(|pos| inner.lru.remove(pos));
            match victim {
                Some(id) => {
                    inner.map.remove(&id);
                    debug!(checkpoint = %id, "evicted checkpoint");
                }
                None => break,
            }
        }
    }

    /// Keep `job`'s checkpoints out of eviction while it runs.
    pub fn pin_job(&self, job: JobId) {
        self.inner.lock().pinned_jobs.insert(job);
    }

    /// Release the pin; entries become ordinary LRU citizens.
    pub fn unpin_job(&self, job: JobId) {
        self.inner.lock().pinned_jobs.remove(&job);
    }

    pub fn get(&self, id: CheckpointId) -> Option<Arc<Checkpoint>> {
        let mut inner = self.inner.lock();
        let found = inner.map.get(&id).cloned();
        if found.is_some() {
            // Touch for recency.
            if let Some(pos) = inner.lru.iter().position(|x| *x == id) {
                inner.lru.remove(pos);
                inner.lru.push_back(id);
            }
        }
        found
    }

    /// Most recent retained checkpoint of a job.
    pub fn latest_for(&self, job: JobId) -> Option<Arc<Checkpoint>> {
        let inner = self.inner.lock();
        inner
            .lru
            .iter()
            .rev()
            .filter_map(|id| inner.map.get(id))
            .find(|c| c.job == job)
            .cloned()
    }

    /// Drop every checkpoint of a finished job.
    pub fn forget_job(&self, job: JobId) {
        let mut inner = self.inner.lock();
        inner.pinned_jobs.remove(&job);
        let stale: Vec<CheckpointId> = inner
            .map
            .values()
            .filter(|c| c.job == job)
            .map(|c| c.id)
            .collect();
        for id in stale {
            inner.map.remove(&id);
            if let Some(pos) = inner.lru.iter().position(|x| *x == id) {
                inner.lru.remove(pos);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validate a migration destination against a checkpoint: it must quote
    /// room for every live logical qubit and cover the job's rights.
    pub fn validate_migration(
        &self,
        checkpoint: &Checkpoint,
        destination: &MigrationDestination,
        required_rights: &RightSet,
    ) -> Result<()> {
        let live = checkpoint.handles.vqs.len() as u32;
        if destination.logical_qubits < live {
            return Err(KernelError::BadRequest(format!(
                "destination quotes {} logical qubits, checkpoint holds {live}",
                destination.logical_qubits
            )));
        }
        if !required_rights.is_subset(&destination.rights) {
            return Err(KernelError::BadRequest(format!(
                "destination rights {} do not cover required {}",
                destination.rights, required_rights
            )));
        }
        Ok(())
    }
}
