//! Job manager
//!
//! Jobs carry a certified graph through `QUEUED → VALIDATING → RUNNING` into
//! exactly one terminal state. Transitions are monotone and terminal states
//! absorbing; `CANCELLED` is reachable from any non-terminal state. The run
//! queue orders by integer priority (higher first), FIFO within a priority.

use parking_lot::{Mutex, RwLock};
use qmk_core::{CertifiedGraph, JobId, KernelError, Result, SessionId, TenantId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::debug;

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Validating,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }

    /// Wire form.
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::Validating => "VALIDATING",
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
        }
    }

    fn rank(self) -> u8 {
        match self {
            JobState::Queued => 0,
            JobState::Validating => 1,
            JobState::Running => 2,
            JobState::Completed | JobState::Failed | JobState::Cancelled => 3,
        }
    }
}

/// Why a job reached `FAILED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub code: String,
    pub node: Option<String>,
    pub message: String,
}

/// One job row.
pub struct JobRecord {
    pub id: JobId,
    pub session: SessionId,
    pub tenant: TenantId,
    pub priority: i32,
    pub seed: u64,
    pub debug: bool,
    pub graph: CertifiedGraph,
    state: Mutex<JobState>,
    state_tx: watch::Sender<JobState>,
    cancel: AtomicBool,
    events: Mutex<BTreeMap<String, u8>>,
    failure: Mutex<Option<JobFailure>>,
    progress: Mutex<(usize, usize)>,
}

impl JobRecord {
    pub fn new(
        session: SessionId,
        tenant: TenantId,
        graph: CertifiedGraph,
        priority: i32,
        seed: u64,
        debug: bool,
    ) -> Arc<Self> {
        let total = graph.graph().nodes.len();
        let (state_tx, _) = watch::channel(JobState::Queued);
        Arc::new(Self {
            id: JobId::generate(),
            session,
            tenant,
            priority,
            seed,
            debug,
            graph,
            state: Mutex::new(JobState::Queued),
            state_tx,
            cancel: AtomicBool::new(false),
            events: Mutex::new(BTreeMap::new()),
            failure: Mutex::new(None),
            progress: Mutex::new((0, total)),
        })
    }

    pub fn state(&self) -> JobState {
        *self.state.lock()
    }

    /// Monotone transition. Terminal states absorb everything; any other
    /// regression is refused. Returns whether the state changed.
    pub fn transition(&self, to: JobState) -> bool {
        let mut state = self.state.lock();
        let allowed = !state.is_terminal() && to.rank() > state.rank();
        if !allowed {
            return false;
        }
        *state = to;
        // send_replace updates the value even with no live receivers.
        self.state_tx.send_replace(to);
        debug!(job = %self.id, state = to.as_str(), "job transition");
        true
    }

    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state_tx.subscribe()
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, AtomicOrdering::SeqCst);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(AtomicOrdering::SeqCst)
    }

    pub fn record_events(&self, events: BTreeMap<String, u8>) {
        *self.events.lock() = events;
    }

    pub fn events(&self) -> BTreeMap<String, u8> {
        self.events.lock().clone()
    }

    pub fn set_failure(&self, failure: JobFailure) {
        *self.failure.lock() = Some(failure);
    }

    pub fn failure(&self) -> Option<JobFailure> {
        self.failure.lock().clone()
    }

    pub fn set_progress(&self, done: usize) {
        self.progress.lock().0 = done;
    }

    /// (nodes done, nodes total).
    pub fn progress(&self) -> (usize, usize) {
        *self.progress.lock()
    }
}

/// Queue entry ordering: priority descending, then submission order.
struct QueuedJob {
    priority: i32,
    seq: u64,
    id: JobId,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

/// The job table plus run queue.
pub struct JobManager {
    jobs: RwLock<HashMap<JobId, Arc<JobRecord>>>,
    queue: Mutex<BinaryHeap<QueuedJob>>,
    queue_ready: Notify,
    dedup: Mutex<HashMap<(SessionId, String), JobId>>,
    seq: AtomicU64,
}

impl JobManager {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            queue: Mutex::new(BinaryHeap::new()),
            queue_ready: Notify::new(),
            dedup: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Enqueue a job. A repeated client request id returns the prior job
    /// instead of a new one.
    pub fn submit(&self, record: Arc<JobRecord>, request_id: Option<String>) -> JobId {
        if let Some(request_id) = request_id {
            let mut dedup = self.dedup.lock();
            if let Some(prior) = dedup.get(&(record.session, request_id.clone())) {
                return *prior;
            }
            dedup.insert((record.session, request_id), record.id);
        }
        let id = record.id;
        let seq = self.seq.fetch_add(1, AtomicOrdering::SeqCst);
        self.jobs.write().insert(id, record.clone());
        self.queue.lock().push(QueuedJob {
            priority: record.priority,
            seq,
            id,
        });
        self.queue_ready.notify_one();
        id
    }

    /// Worker side: next job to run, waiting for the queue to fill.
    pub async fn next(&self) -> Arc<JobRecord> {
        loop {
            let popped = self.queue.lock().pop();
            if let Some(entry) = popped {
                if let Some(record) = self.jobs.read().get(&entry.id).cloned() {
                    return record;
                }
                continue;
            }
            self.queue_ready.notified().await;
        }
    }

    pub fn get(&self, id: JobId) -> Result<Arc<JobRecord>> {
        self.jobs
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| KernelError::JobNotFound(id.to_string()))
    }

    /// Prior job for a client request id, if the session already sent it.
    pub fn lookup_request(&self, session: SessionId, request_id: &str) -> Option<JobId> {
        self.dedup
            .lock()
            .get(&(session, request_id.to_string()))
            .copied()
    }

    /// Request cancellation. Queued jobs terminate immediately; running jobs
    /// stop at the next node boundary. Idempotent on terminal jobs. The
    /// boolean reports whether this call performed the terminal transition.
    pub fn cancel(&self, id: JobId) -> Result<(JobState, bool)> {
        let record = self.get(id)?;
        record.request_cancel();
        let transitioned =
            record.state() == JobState::Queued && record.transition(JobState::Cancelled);
        Ok((record.state(), transitioned))
    }

    /// Block until the job is terminal or the timeout lapses.
    pub async fn wait(&self, id: JobId, timeout: Duration) -> Result<JobState> {
        let record = self.get(id)?;
        let mut rx = record.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let state = *rx.borrow();
            if state.is_terminal() {
                return Ok(state);
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                // Sender dropped: report the last observed state.
                Ok(Err(_)) => return Ok(*rx.borrow()),
                Err(_) => return Err(KernelError::Timeout),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qmk_core::{QvmGraph, SigningKey, Verifier};
    use serde_json::json;

    fn certified() -> CertifiedGraph {
        let graph = QvmGraph::from_value(&json!({
            "version": "0.1",
            "program": {"nodes": [
                {"id": "a", "op": "ALLOC_LQ", "vqs": ["q0"]},
                {"id": "f", "op": "FREE_LQ", "vqs": ["q0"]}
            ]},
            "resources": {"vqs": ["q0"]},
            "caps": ["CAP_ALLOC"]
        }))
        .unwrap();
        let key = SigningKey::from_seed(42);
        Verifier::new(&key).certify(graph).unwrap()
    }

    fn record(session: SessionId, priority: i32) -> Arc<JobRecord> {
        JobRecord::new(
            session,
            TenantId::new("acme"),
            certified(),
            priority,
            42,
            false,
        )
    }

    #[test]
    fn states_are_monotone_and_terminal_states_absorb() {
        let job = record(SessionId::generate(), 0);
        assert!(job.transition(JobState::Validating));
        assert!(job.transition(JobState::Running));
        assert!(!job.transition(JobState::Queued));
        assert!(job.transition(JobState::Completed));
        assert!(!job.transition(JobState::Failed));
        assert!(!job.transition(JobState::Cancelled));
        assert_eq!(job.state(), JobState::Completed);
    }

    #[test]
    fn cancelled_is_reachable_from_any_non_terminal_state() {
        let queued = record(SessionId::generate(), 0);
        assert!(queued.transition(JobState::Cancelled));

        let running = record(SessionId::generate(), 0);
        running.transition(JobState::Validating);
        running.transition(JobState::Running);
        assert!(running.transition(JobState::Cancelled));
    }

    #[tokio::test]
    async fn queue_orders_by_priority_then_fifo() {
        let mgr = JobManager::new();
        let session = SessionId::generate();
        let low = record(session, 1);
        let high = record(session, 5);
        let high_later = record(session, 5);
        mgr.submit(low.clone(), None);
        mgr.submit(high.clone(), None);
        mgr.submit(high_later.clone(), None);

        assert_eq!(mgr.next().await.id, high.id);
        assert_eq!(mgr.next().await.id, high_later.id);
        assert_eq!(mgr.next().await.id, low.id);
    }

    #[tokio::test]
    async fn duplicate_request_id_returns_prior_job() {
        let mgr = JobManager::new();
        let session = SessionId::generate();
        let first = record(session, 0);
        let id = mgr.submit(first, Some("req-1".into()));
        let second = record(session, 0);
        let dup = mgr.submit(second, Some("req-1".into()));
        assert_eq!(dup, id);
        // Only the first landed in the queue.
        assert_eq!(mgr.next().await.id, id);
    }

    #[tokio::test]
    async fn wait_times_out_and_then_observes_terminal() {
        let mgr = JobManager::new();
        let job = record(SessionId::generate(), 0);
        let id = mgr.submit(job.clone(), None);

        let res = mgr.wait(id, Duration::from_millis(20)).await;
        assert_eq!(res, Err(KernelError::Timeout));

        job.transition(JobState::Validating);
        job.transition(JobState::Running);
        job.transition(JobState::Completed);
        let state = mgr.wait(id, Duration::from_millis(100)).await.unwrap();
        assert_eq!(state, JobState::Completed);
    }

    #[test]
    fn cancel_is_idempotent_on_terminal_jobs() {
        let mgr = JobManager::new();
        let job = record(SessionId::generate(), 0);
        let id = mgr.submit(job.clone(), None);
        assert_eq!(mgr.cancel(id).unwrap(), (JobState::Cancelled, true));
        // Again: still acknowledged, no second transition.
        assert_eq!(mgr.cancel(id).unwrap(), (JobState::Cancelled, false));
    }

    #[test]
    fn unknown_job_is_job_not_found() {
        let mgr = JobManager::new();
        assert!(matches!(
            mgr.cancel(JobId::generate()),
            Err(KernelError::JobNotFound(_))
        ));
    }
}
