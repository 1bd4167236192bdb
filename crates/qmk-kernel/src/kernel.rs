//! Kernel facade
//!
//! Wires the registries, capability store, device, audit log, and job
//! machinery into the seven-method surface the RPC layer exposes, plus the
//! admin operations (tenants, tokens, channels, session close) that live
//! behind it. All checks happen here or deeper; the RPC layer is framing.

use crate::audit::{AuditKind, AuditLog, Severity};
use crate::channel::{ChannelRegistry, ChannelToken};
use crate::checkpoint::CheckpointManager;
use crate::config::KernelConfig;
use crate::executor::{ExecEnv, ExecOutcome, Executor};
use crate::job::{JobFailure, JobManager, JobRecord, JobState};
use crate::session::{Session, SessionRegistry};
use crate::telemetry::{Counters, TelemetryHub};
use crate::tenant::{OpClass, Quota, Tenant, TenantRegistry};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use qmk_core::{
    CapId, CapabilityStore, CapabilityToken, ChannelId, HandleIdGen, JobId, KernelError,
    MonotonicClock, QvmGraph, Result, Right, RightSet, SessionId, SigningKey, SystemClock,
    TenantId, Verifier,
};
use qmk_device::{DeviceBackend, DeviceTelemetry};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Result of `negotiate_capabilities`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Negotiation {
    pub session_id: SessionId,
    pub granted: RightSet,
    pub denied: RightSet,
}

/// Options accepted by `submit_job`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SubmitOpts {
    pub priority: i32,
    pub seed: u64,
    pub debug: bool,
    pub request_id: Option<String>,
}

/// Options accepted by `open_channel`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelOpts {
    pub fidelity: f64,
    pub max_entanglements: u32,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Default for ChannelOpts {
    fn default() -> Self {
        Self {
            fidelity: 0.99,
            max_entanglements: 1,
            expires_at: None,
        }
    }
}

/// `get_job_status` response.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub state: &'static str,
    pub nodes_done: usize,
    pub nodes_total: usize,
    pub terminal_reason: Option<JobFailure>,
}

/// `wait_for_job` response.
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub state: &'static str,
    pub events: BTreeMap<String, u8>,
    pub terminal_reason: Option<JobFailure>,
}

/// `get_telemetry` response.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryReport {
    pub session: Counters,
    pub global: Counters,
    pub device: DeviceTelemetry,
}

/// The kernel instance.
pub struct Kernel {
    config: KernelConfig,
    tenants: TenantRegistry,
    sessions: SessionRegistry,
    caps: Arc<CapabilityStore>,
    channels: Arc<ChannelRegistry>,
    audit: Arc<AuditLog>,
    jobs: Arc<JobManager>,
    telemetry: Arc<TelemetryHub>,
    checkpoints: Arc<CheckpointManager>,
    device: Arc<dyn DeviceBackend>,
    env: Arc<ExecEnv>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Kernel {
    /// Build a kernel over `device` with the real system clock.
    pub fn new(config: KernelConfig, device: Arc<dyn DeviceBackend>) -> Arc<Self> {
        Self::with_clock(config, device, Arc::new(SystemClock::new()))
    }

    /// Build with an injected clock (tests drive rate limits by hand).
    pub fn with_clock(
        config: KernelConfig,
        device: Arc<dyn DeviceBackend>,
        clock: Arc<dyn MonotonicClock>,
    ) -> Arc<Self> {
        let key = SigningKey::from_seed(config.signing_seed);
        let caps = Arc::new(CapabilityStore::new(key.clone()));
        let audit = match &config.audit_path {
            Some(path) => match AuditLog::with_sink(key.clone(), path) {
                Ok(log) => Arc::new(log),
                Err(err) => {
                    warn!(%err, "audit sink unavailable, keeping log in memory");
                    Arc::new(AuditLog::new(key.clone()))
                }
            },
            None => Arc::new(AuditLog::new(key.clone())),
        };
        let channels = Arc::new(ChannelRegistry::new());
        let telemetry = Arc::new(TelemetryHub::new());
        let checkpoints = Arc::new(CheckpointManager::new(config.checkpoints.max_checkpoints));
        let env = Arc::new(ExecEnv {
            device: device.clone(),
            caps: caps.clone(),
            channels: channels.clone(),
            checkpoints: checkpoints.clone(),
            audit: audit.clone(),
            telemetry: telemetry.clone(),
            checkpoint_cfg: config.checkpoints.clone(),
            device_profile: config.device_profile.clone(),
            handles: Mutex::new(HandleIdGen::new()),
        });
        let kernel = Arc::new(Self {
            tenants: TenantRegistry::new(clock, config.rate_limit),
            sessions: SessionRegistry::new(),
            caps,
            channels,
            audit,
            jobs: Arc::new(JobManager::new()),
            telemetry,
            checkpoints,
            device,
            env,
            workers: Mutex::new(Vec::new()),
            config,
        });
        for bootstrap in kernel.config.bootstrap_tenants.clone() {
            let quota = bootstrap.quota.unwrap_or(kernel.config.default_quota);
            if let Err(err) = kernel.create_tenant(
                TenantId::new(bootstrap.id.clone()),
                quota,
                bootstrap.rights.clone(),
            ) {
                warn!(tenant = %bootstrap.id, %err, "bootstrap tenant skipped");
            }
        }
        kernel
    }

    /// Spawn the worker pool.
    pub fn start_workers(self: &Arc<Self>) {
        let mut workers = self.workers.lock();
        for worker in 0..self.config.workers.max(1) {
            let kernel = self.clone();
            workers.push(tokio::spawn(async move {
                info!(worker, "job worker started");
                loop {
                    let job = kernel.jobs.next().await;
                    kernel.run_job(job).await;
                }
            }));
        }
    }

    pub fn shutdown(&self) {
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn capability_store(&self) -> &CapabilityStore {
        &self.caps
    }

    pub fn channel_registry(&self) -> &ChannelRegistry {
        &self.channels
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn session(&self, id: SessionId) -> Result<Arc<Session>> {
        self.sessions.get(id)
    }

    // ───────── admin surface ─────────

    pub fn create_tenant(&self, id: TenantId, quota: Quota, rights: RightSet) -> Result<()> {
        self.tenants.create(id.clone(), quota, rights)?;
        info!(tenant = %id, "tenant created");
        Ok(())
    }

    pub fn suspend_tenant(&self, id: &TenantId) -> Result<()> {
        self.tenants.suspend(id)
    }

    pub fn resume_tenant(&self, id: &TenantId) -> Result<()> {
        self.tenants.resume(id)
    }

    /// Issue a root token for a tenant. Admin path and test harness.
    pub fn issue_token(
        &self,
        tenant: &TenantId,
        rights: RightSet,
        expires_at: Option<DateTime<Utc>>,
        max_uses: Option<u32>,
    ) -> Result<CapabilityToken> {
        self.tenants.get(tenant)?;
        let token = self
            .caps
            .issue(tenant.clone(), "kernel", rights, expires_at, max_uses, 3, Utc::now());
        self.audit.append(
            Some(tenant.clone()),
            None,
            AuditKind::CapabilityGranted,
            Severity::Info,
            json!({"cap": token.cap_id.to_string(), "rights": token.rights.names()}),
        );
        Ok(token)
    }

    pub fn delegate_token(
        &self,
        parent: CapId,
        rights: RightSet,
        expires_at: Option<DateTime<Utc>>,
        max_uses: Option<u32>,
    ) -> Result<CapabilityToken> {
        let token = self.caps.delegate(parent, rights, expires_at, max_uses, Utc::now())?;
        self.audit.append(
            Some(token.tenant.clone()),
            None,
            AuditKind::CapabilityDelegated,
            Severity::Info,
            json!({
                "parent": parent.to_string(),
                "child": token.cap_id.to_string(),
                "rights": token.rights.names(),
            }),
        );
        Ok(token)
    }

    pub fn revoke_token(&self, id: CapId) -> usize {
        let covered = self.caps.revoke(id);
        self.audit.append(
            None,
            None,
            AuditKind::CapabilityRevoked,
            Severity::Warning,
            json!({"cap": id.to_string(), "covered": covered}),
        );
        covered
    }

    pub fn revoke_channel(&self, id: ChannelId) -> bool {
        let revoked = self.channels.revoke(id);
        if revoked {
            self.audit.append(
                None,
                None,
                AuditKind::ChannelRevoked,
                Severity::Warning,
                json!({"channel": id.to_string()}),
            );
        }
        revoked
    }

    /// Close a session: cancel its jobs, release its handles, return its
    /// quota. Idempotent.
    pub async fn close_session(&self, id: SessionId) -> Result<()> {
        let session = self.sessions.close(id)?;
        for job in session.jobs() {
            let _ = self.jobs.cancel(job);
        }
        let tenant = self.tenants.get(&session.tenant).ok();
        for vq in session.drain_vqs() {
            if let Err(err) = self.device.release(vq.phys).await {
                warn!(%err, "release failed during session close");
            }
            if let Some(tenant) = &tenant {
                tenant.release_vqs(1);
            }
        }
        for ch in session.drain_chs() {
            if let Err(err) = self.device.close_link(ch.link).await {
                warn!(%err, "link close failed during session close");
            }
            if let Some(tenant) = &tenant {
                tenant.release_chs(1);
            }
        }
        if let Some(tenant) = &tenant {
            tenant.release_session();
        }
        self.telemetry.forget(id);
        Ok(())
    }

    // ───────── RPC surface ─────────

    /// `negotiate_capabilities`: open a session whose rights are the
    /// intersection of request, tenant grant, and kernel policy.
    pub fn negotiate_capabilities(
        &self,
        tenant_id: &TenantId,
        requested: RightSet,
    ) -> Result<Negotiation> {
        let tenant = self.tenants.get_active(tenant_id)?;
        self.check_rate(&tenant, OpClass::Session, None)?;
        if let Err(err) = tenant.admit_session() {
            self.note_quota(tenant_id, None, &err);
            return Err(err);
        }

        let granted = requested
            .intersection(&tenant.rights)
            .intersection(&self.config.policy_rights);
        let denied = requested.difference(&granted);
        let now = Utc::now();
        let expires_at = self
            .config
            .session_ttl_ms
            .map(|ms| now + ChronoDuration::milliseconds(ms as i64));
        let token = self
            .caps
            .issue(tenant_id.clone(), "kernel", granted.clone(), expires_at, None, 3, now);
        let session = self
            .sessions
            .open(tenant_id.clone(), granted.clone(), vec![token.cap_id]);
        self.audit.append(
            Some(tenant_id.clone()),
            Some(session.id),
            AuditKind::CapabilityGranted,
            Severity::Info,
            json!({"granted": granted.names(), "denied": denied.names()}),
        );
        info!(session = %session.id, tenant = %tenant_id, granted = %granted, "session opened");
        Ok(Negotiation {
            session_id: session.id,
            granted,
            denied,
        })
    }

    /// `submit_job`: certify and enqueue a graph.
    pub fn submit_job(&self, session_id: SessionId, graph: &Value, opts: SubmitOpts) -> Result<JobId> {
        let session = self.sessions.get(session_id)?;
        let tenant = self.tenants.get_active(&session.tenant)?;
        self.check_rate(&tenant, OpClass::Submit, Some(session_id))?;
        self.require_fresh_tokens(&session)?;
        if opts.debug && !session.granted.contains(Right::Debug) {
            return Err(KernelError::CapDenied(
                "debug submissions require CAP_DEBUG".into(),
            ));
        }

        if let Some(request_id) = &opts.request_id {
            if let Some(prior) = self.jobs.lookup_request(session_id, request_id) {
                return Ok(prior);
            }
        }

        let parsed = QvmGraph::from_value(graph)?;
        let verifier = Verifier::new(self.caps.signing_key());
        let certified = verifier
            .certify(parsed)
            .map_err(|mut errors| KernelError::Graph(errors.remove(0)))?;
        info!(
            session = %session_id,
            content = %qmk_core::ContentHash::hex(&certified.graph().content_hash()),
            "graph certified"
        );

        if let Err(err) = tenant.admit_job() {
            self.note_quota(&tenant.id, Some(session_id), &err);
            return Err(err);
        }

        let record = JobRecord::new(
            session_id,
            tenant.id.clone(),
            certified,
            opts.priority,
            opts.seed,
            opts.debug,
        );
        let id = self.jobs.submit(record, opts.request_id);
        session.add_job(id);
        self.telemetry.record(session_id, |c| c.jobs_submitted += 1);
        self.audit.append(
            Some(tenant.id.clone()),
            Some(session_id),
            AuditKind::JobStateChanged,
            Severity::Info,
            json!({"job": id.to_string(), "state": JobState::Queued.as_str()}),
        );
        Ok(id)
    }

    /// `get_job_status`.
    pub fn get_job_status(&self, session_id: SessionId, job_id: JobId) -> Result<JobStatus> {
        let job = self.owned_job(session_id, job_id)?;
        let (done, total) = job.progress();
        Ok(JobStatus {
            state: job.state().as_str(),
            nodes_done: done,
            nodes_total: total,
            terminal_reason: job.failure(),
        })
    }

    /// `wait_for_job`: park until terminal or `TIMEOUT`.
    pub async fn wait_for_job(
        &self,
        session_id: SessionId,
        job_id: JobId,
        timeout_ms: u64,
    ) -> Result<JobResult> {
        let job = self.owned_job(session_id, job_id)?;
        let state = self
            .jobs
            .wait(job_id, Duration::from_millis(timeout_ms))
            .await?;
        Ok(JobResult {
            state: state.as_str(),
            events: job.events(),
            terminal_reason: job.failure(),
        })
    }

    /// `cancel_job`: idempotent acknowledgement.
    pub fn cancel_job(&self, session_id: SessionId, job_id: JobId) -> Result<JobState> {
        self.owned_job(session_id, job_id)?;
        let (state, transitioned) = self.jobs.cancel(job_id)?;
        if transitioned {
            self.telemetry.record(session_id, |c| c.jobs_cancelled += 1);
            self.audit_job_state(&*self.jobs.get(job_id)?);
        }
        Ok(state)
    }

    /// `open_channel`: bind two live session VQs into a channel token. The
    /// peer endpoint is addressed as `<session-id>:<vq-name>`; a bare name
    /// is resolved in the caller's session.
    pub async fn open_channel(
        &self,
        session_id: SessionId,
        vq_a: &str,
        vq_b: &str,
        opts: ChannelOpts,
    ) -> Result<ChannelToken> {
        let session = self.sessions.get(session_id)?;
        let tenant = self.tenants.get_active(&session.tenant)?;
        self.check_rate(&tenant, OpClass::Channel, Some(session_id))?;
        if !session.granted.contains(Right::Link) {
            return Err(KernelError::CapDenied("session was not granted CAP_LINK".into()));
        }

        let a = session
            .vq(vq_a)
            .ok_or_else(|| KernelError::BadRequest(format!("no live VQ named {vq_a}")))?;
        let (peer_session, peer_name) = match vq_b.split_once(':') {
            Some((sid, name)) => {
                let sid = SessionId::parse(sid)
                    .ok_or_else(|| KernelError::BadRequest(format!("malformed session id {sid}")))?;
                (self.sessions.get(sid)?, name)
            }
            None => (session.clone(), vq_b),
        };
        // Mutual authorization: the peer must itself hold CAP_LINK.
        if !peer_session.granted.contains(Right::Link) {
            return Err(KernelError::CapDenied(
                "peer session was not granted CAP_LINK".into(),
            ));
        }
        let b = peer_session
            .vq(peer_name)
            .ok_or_else(|| KernelError::BadRequest(format!("no live VQ named {peer_name}")))?;

        self.audit.append(
            Some(tenant.id.clone()),
            Some(session_id),
            AuditKind::ChannelRequested,
            Severity::Info,
            json!({"vq_a": vq_a, "vq_b": vq_b}),
        );

        if let Err(err) = tenant.reserve_chs(1) {
            self.note_quota(&tenant.id, Some(session_id), &err);
            return Err(err);
        }
        let link = match self.device.open_link(a.phys, b.phys).await {
            Ok(link) => link,
            Err(err) => {
                tenant.release_chs(1);
                return Err(err.into());
            }
        };

        let token = ChannelToken {
            chan_id: ChannelId::generate(),
            tenants: (a.owner.clone(), b.owner.clone()),
            sessions: (session_id, peer_session.id),
            link,
            fidelity: opts.fidelity,
            max_entanglements: opts.max_entanglements,
            expires_at: opts.expires_at,
        };
        self.channels.register(token.clone());
        self.telemetry.record(session_id, |c| c.channels_opened += 1);
        self.audit.append(
            Some(tenant.id.clone()),
            Some(session_id),
            AuditKind::ChannelApproved,
            Severity::Info,
            json!({
                "channel": token.chan_id.to_string(),
                "tenants": [token.tenants.0.to_string(), token.tenants.1.to_string()],
                "max_entanglements": token.max_entanglements,
            }),
        );
        Ok(token)
    }

    /// `get_telemetry`.
    pub fn get_telemetry(&self, session_id: SessionId) -> Result<TelemetryReport> {
        let session = self.sessions.get(session_id)?;
        if let Ok(tenant) = self.tenants.get(&session.tenant) {
            self.check_rate(&tenant, OpClass::Query, Some(session_id))?;
        }
        Ok(TelemetryReport {
            session: self.telemetry.session(session_id),
            global: self.telemetry.global(),
            device: self.device.telemetry(),
        })
    }

    /// Read-only audit query, gated on CAP_AUDIT.
    pub fn query_audit(
        &self,
        session_id: SessionId,
        filter: &crate::audit::AuditFilter,
    ) -> Result<Vec<crate::audit::AuditRecord>> {
        let session = self.sessions.get(session_id)?;
        if !session.granted.contains(Right::Audit) {
            return Err(KernelError::CapDenied(
                "audit queries require CAP_AUDIT".into(),
            ));
        }
        Ok(self.audit.query(filter))
    }

    // ───────── internals ─────────

    fn owned_job(&self, session_id: SessionId, job_id: JobId) -> Result<Arc<JobRecord>> {
        self.sessions.get(session_id)?;
        let job = self.jobs.get(job_id)?;
        if job.session != session_id {
            // Do not leak other sessions' jobs.
            return Err(KernelError::JobNotFound(job_id.to_string()));
        }
        Ok(job)
    }

    fn check_rate(&self, tenant: &Tenant, class: OpClass, session: Option<SessionId>) -> Result<()> {
        match self.tenants.check_rate(tenant, class) {
            Ok(()) => Ok(()),
            Err(err) => {
                match session {
                    Some(id) => self.telemetry.record(id, |c| c.rate_limit_rejections += 1),
                    None => self
                        .telemetry
                        .record_global(|c| c.rate_limit_rejections += 1),
                }
                self.audit.append(
                    Some(tenant.id.clone()),
                    session,
                    AuditKind::RateLimited,
                    Severity::Warning,
                    json!({"class": format!("{class:?}")}),
                );
                Err(err)
            }
        }
    }

    fn note_quota(&self, tenant: &TenantId, session: Option<SessionId>, err: &KernelError) {
        match session {
            Some(id) => self.telemetry.record(id, |c| c.quota_rejections += 1),
            None => self.telemetry.record_global(|c| c.quota_rejections += 1),
        }
        self.audit.append(
            Some(tenant.clone()),
            session,
            AuditKind::QuotaExceeded,
            Severity::Warning,
            json!({"error": err.to_string()}),
        );
    }

    /// Submission-time token freshness: every session must hold at least one
    /// verifiable token; the specific token error (EXPIRED, REVOKED, ...)
    /// surfaces to the caller and the audit trail.
    fn require_fresh_tokens(&self, session: &Session) -> Result<()> {
        let now = Utc::now();
        let tokens = session.tokens();
        if tokens.is_empty() {
            return Err(KernelError::CapDenied("session holds no tokens".into()));
        }
        let mut first_err = None;
        for cap in tokens {
            match self.caps.verify(cap, now) {
                Ok(_) => return Ok(()),
                Err(err) => first_err = first_err.or(Some(err)),
            }
        }
        let err = first_err.unwrap_or_else(|| KernelError::CapDenied("no valid token".into()));
        self.telemetry.record(session.id, |c| c.cap_denials += 1);
        self.audit.append(
            Some(session.tenant.clone()),
            Some(session.id),
            AuditKind::CapabilityDenied,
            Severity::Warning,
            json!({"error": err.to_string()}),
        );
        Err(err)
    }

    fn audit_job_state(&self, job: &JobRecord) {
        self.audit.append(
            Some(job.tenant.clone()),
            Some(job.session),
            AuditKind::JobStateChanged,
            Severity::Info,
            json!({"job": job.id.to_string(), "state": job.state().as_str()}),
        );
    }

    /// Run one job to a terminal state. Called from worker tasks.
    pub(crate) async fn run_job(&self, job: Arc<JobRecord>) {
        if job.state().is_terminal() {
            // Cancelled while queued; return the admission slot.
            if let Ok(tenant) = self.tenants.get(&job.tenant) {
                tenant.release_job();
            }
            self.checkpoints.forget_job(job.id);
            return;
        }

        job.transition(JobState::Validating);
        self.audit_job_state(&job);

        let session = self.sessions.get(job.session);
        let tenant = self.tenants.get_active(&job.tenant);
        let (session, tenant) = match (session, tenant) {
            (Ok(session), Ok(tenant)) => (session, tenant),
            (session, tenant) => {
                let err = session
                    .err()
                    .or(tenant.err())
                    .unwrap_or_else(|| KernelError::Internal("session lookup".into()));
                job.set_failure(JobFailure {
                    code: err.code().as_str().to_string(),
                    node: None,
                    message: err.to_string(),
                });
                job.transition(JobState::Failed);
                self.telemetry.record_global(|c| c.jobs_failed += 1);
                self.audit_job_state(&job);
                if let Ok(tenant) = self.tenants.get(&job.tenant) {
                    tenant.release_job();
                }
                self.checkpoints.forget_job(job.id);
                return;
            }
        };

        job.transition(JobState::Running);
        self.audit_job_state(&job);
        self.checkpoints.pin_job(job.id);

        let executor = Executor::new(self.env.clone());
        match executor.run(&job, &session, &tenant).await {
            Ok(ExecOutcome::Completed(summary)) => {
                job.record_events(summary.events);
                job.transition(JobState::Completed);
                self.telemetry.record(job.session, |c| c.jobs_completed += 1);
            }
            Ok(ExecOutcome::Cancelled(summary)) => {
                job.record_events(summary.events);
                job.transition(JobState::Cancelled);
                self.telemetry.record(job.session, |c| c.jobs_cancelled += 1);
            }
            Err(exec_err) => {
                let code = match exec_err.error.graph_sub_code() {
                    Some(sub) => format!("GRAPH_INVALID/{sub}"),
                    None => exec_err.error.code().as_str().to_string(),
                };
                job.set_failure(JobFailure {
                    code,
                    node: exec_err.node,
                    message: exec_err.error.to_string(),
                });
                job.transition(JobState::Failed);
                self.telemetry.record(job.session, |c| c.jobs_failed += 1);
            }
        }
        self.audit_job_state(&job);
        tenant.release_job();
        self.checkpoints.unpin_job(job.id);
        self.checkpoints.forget_job(job.id);
    }
}
