//! End-to-end scenarios over the full kernel: certified graphs, sessions,
//! jobs, channels, and the RPC boundary, all against the deterministic
//! simulator with seed 42.

use async_trait::async_trait;
use qmk_core::{
    DeterministicRng, ErrorCode, KernelError, Right, RightSet, SessionId, TenantId,
};
use qmk_device::{
    Basis, DeviceBackend, DeviceError, DeviceResult, DeviceSnapshot, DeviceTelemetry, Gate,
    LinkId, PhysQubit, StateVectorBackend,
};
use qmk_kernel::{
    rpc, AuditFilter, AuditKind, CheckpointConfig, Kernel, KernelConfig, Quota, SubmitOpts,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const SEED: u64 = 42;

fn rights_all() -> RightSet {
    RightSet::all()
}

fn started_kernel() -> Arc<Kernel> {
    let kernel = Kernel::new(KernelConfig::default(), Arc::new(StateVectorBackend::new()));
    kernel.start_workers();
    kernel
}

fn open_session(kernel: &Kernel, tenant: &str, rights: RightSet) -> SessionId {
    let id = TenantId::new(tenant);
    kernel
        .create_tenant(id.clone(), Quota::default(), rights.clone())
        .unwrap();
    kernel
        .negotiate_capabilities(&id, rights)
        .unwrap()
        .session_id
}

async fn run_to_end(kernel: &Kernel, session: SessionId, graph: &Value) -> qmk_kernel::JobResult {
    let job = kernel
        .submit_job(
            session,
            graph,
            SubmitOpts {
                seed: SEED,
                ..Default::default()
            },
        )
        .unwrap();
    kernel.wait_for_job(session, job, 10_000).await.unwrap()
}

fn bell_graph() -> Value {
    json!({
        "version": "0.1",
        "program": {"nodes": [
            {"id": "alloc", "op": "ALLOC_LQ", "vqs": ["q0", "q1"]},
            {"id": "h0", "op": "APPLY_H", "vqs": ["q0"]},
            {"id": "cx", "op": "APPLY_CNOT", "vqs": ["q0", "q1"]},
            {"id": "m0", "op": "MEASURE_Z", "vqs": ["q0"], "produces": ["m0"]},
            {"id": "m1", "op": "MEASURE_Z", "vqs": ["q1"], "produces": ["m1"]},
            {"id": "free", "op": "FREE_LQ", "vqs": ["q0", "q1"]}
        ]},
        "resources": {"vqs": ["q0", "q1"], "events": ["m0", "m1"]},
        "caps": ["CAP_ALLOC", "CAP_MEASURE"]
    })
}

/// A graph that intentionally leaves `q0` live: the terminator is guarded on
/// an event that a fresh qubit's Z-measurement can never produce.
fn leftover_graph() -> Value {
    json!({
        "version": "0.1",
        "program": {"nodes": [
            {"id": "alloc", "op": "ALLOC_LQ", "vqs": ["q0"]},
            {"id": "m", "op": "MEASURE_Z", "vqs": ["q0"], "produces": ["m"]},
            {"id": "free", "op": "FREE_LQ", "vqs": ["q0"],
             "guard": {"event": "m", "equals": 1}}
        ]},
        "resources": {"vqs": ["q0"], "events": ["m"]},
        "caps": ["CAP_ALLOC", "CAP_MEASURE"]
    })
}

#[tokio::test]
async fn bell_pair_measurements_agree() {
    let kernel = started_kernel();
    let session = open_session(&kernel, "acme", rights_all());
    let result = run_to_end(&kernel, session, &bell_graph()).await;

    assert_eq!(result.state, "COMPLETED");
    assert_eq!(result.events["m0"], result.events["m1"]);

    let report = kernel.get_telemetry(session).unwrap();
    assert_eq!(report.session.jobs_completed, 1);
    assert_eq!(report.session.measurements, 2);
    assert_eq!(report.session.vqs_allocated, 2);
    assert_eq!(report.session.vqs_released, 2);
}

#[tokio::test]
async fn teleported_plus_state_measures_zero() {
    let kernel = started_kernel();
    let session = open_session(&kernel, "acme", rights_all());
    let graph = json!({
        "version": "0.1",
        "program": {"nodes": [
            {"id": "alloc", "op": "ALLOC_LQ", "vqs": ["q0", "q1", "q2"]},
            {"id": "plus", "op": "APPLY_H", "vqs": ["q0"]},
            {"id": "bell_h", "op": "APPLY_H", "vqs": ["q1"]},
            {"id": "bell_cx", "op": "APPLY_CNOT", "vqs": ["q1", "q2"]},
            {"id": "cx01", "op": "APPLY_CNOT", "vqs": ["q0", "q1"]},
            {"id": "h0", "op": "APPLY_H", "vqs": ["q0"]},
            {"id": "m0", "op": "MEASURE_Z", "vqs": ["q0"], "produces": ["m0"]},
            {"id": "m1", "op": "MEASURE_Z", "vqs": ["q1"], "produces": ["m1"]},
            {"id": "fence", "op": "FENCE_EPOCH"},
            {"id": "corr_x", "op": "APPLY_X", "vqs": ["q2"],
             "guard": {"event": "m1", "equals": 1}},
            {"id": "corr_z", "op": "APPLY_Z", "vqs": ["q2"],
             "guard": {"event": "m0", "equals": 1}},
            {"id": "m2", "op": "MEASURE_X", "vqs": ["q2"], "produces": ["m2"]},
            {"id": "free", "op": "FREE_LQ", "vqs": ["q0", "q1", "q2"]}
        ]},
        "resources": {"vqs": ["q0", "q1", "q2"], "events": ["m0", "m1", "m2"]},
        "caps": ["CAP_ALLOC", "CAP_MEASURE"]
    });

    let result = run_to_end(&kernel, session, &graph).await;
    assert_eq!(result.state, "COMPLETED", "reason: {:?}", result.terminal_reason);
    // The teleported |+⟩ is an X eigenstate; its X measurement is forced.
    assert_eq!(result.events["m2"], 0);
}

#[tokio::test]
async fn skipped_producer_skips_its_consumers_transitively() {
    let kernel = started_kernel();
    let session = open_session(&kernel, "acme", rights_all());
    // m0 of a fresh qubit is deterministically 0, so node A (guarded on 1)
    // skips, its event never exists, and B skips in turn.
    let graph = json!({
        "version": "0.1",
        "program": {"nodes": [
            {"id": "alloc", "op": "ALLOC_LQ", "vqs": ["q0", "q1"]},
            {"id": "m0", "op": "MEASURE_Z", "vqs": ["q0"], "produces": ["m0"]},
            {"id": "a", "op": "MEASURE_X", "vqs": ["q1"], "produces": ["a_out"],
             "guard": {"event": "m0", "equals": 1}},
            {"id": "b", "op": "COND_PAULI", "vqs": ["q1"], "inputs": ["a_out"],
             "args": {"mask": "X"}},
            {"id": "free", "op": "FREE_LQ", "vqs": ["q0", "q1"]}
        ]},
        "resources": {"vqs": ["q0", "q1"], "events": ["m0", "a_out"]},
        "caps": ["CAP_ALLOC", "CAP_MEASURE"]
    });

    let result = run_to_end(&kernel, session, &graph).await;
    assert_eq!(result.state, "COMPLETED");
    assert_eq!(result.events.len(), 1);
    assert_eq!(result.events["m0"], 0);

    let report = kernel.get_telemetry(session).unwrap();
    assert_eq!(report.session.nodes_skipped, 2);
}

#[tokio::test]
async fn linearity_violation_rejected_before_any_state_moves() {
    let kernel = started_kernel();
    let session = open_session(&kernel, "acme", rights_all());
    // Two APPLY_H nodes both consuming q0; the second consumes a dead VQ.
    let graph = json!({
        "version": "0.1",
        "program": {"nodes": [
            {"id": "alloc", "op": "ALLOC_LQ", "vqs": ["q0"]},
            {"id": "h1", "op": "APPLY_H", "vqs": ["q0"]},
            {"id": "free", "op": "FREE_LQ", "vqs": ["q0"]},
            {"id": "h2", "op": "APPLY_H", "vqs": ["q0"]}
        ]},
        "resources": {"vqs": ["q0"]},
        "caps": ["CAP_ALLOC"]
    });

    let err = kernel
        .submit_job(session, &graph, SubmitOpts { seed: SEED, ..Default::default() })
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::GraphInvalid);
    assert_eq!(err.graph_sub_code(), Some("LINEARITY_VIOLATION"));

    // No job was created and nothing was allocated.
    assert_eq!(kernel.get_telemetry(session).unwrap().session.jobs_submitted, 0);
    let allocations = kernel.audit().query(&AuditFilter {
        kind: Some(AuditKind::ResourceAllocated),
        ..Default::default()
    });
    assert!(allocations.is_empty());
}

#[tokio::test]
async fn undeclared_capability_requirement_is_cap_missing() {
    let kernel = started_kernel();
    let session = open_session(&kernel, "acme", rights_all());
    let graph = json!({
        "version": "0.1",
        "program": {"nodes": [
            {"id": "alloc", "op": "ALLOC_LQ", "vqs": ["q0", "q1"]},
            {"id": "tp", "op": "TELEPORT_CNOT", "vqs": ["q0", "q1"],
             "args": {"channel": "00000000-0000-4000-8000-000000000000"}},
            {"id": "free", "op": "FREE_LQ", "vqs": ["q0", "q1"]}
        ]},
        "resources": {"vqs": ["q0", "q1"]},
        "caps": ["CAP_ALLOC"]
    });
    let err = kernel
        .submit_job(session, &graph, SubmitOpts::default())
        .unwrap_err();
    assert_eq!(err.graph_sub_code(), Some("CAP_MISSING"));
}

#[tokio::test]
async fn graph_referencing_foreign_vq_is_rejected_at_verification() {
    let kernel = started_kernel();
    let session = open_session(&kernel, "acme", rights_all());
    // A CNOT pairing a local qubit with a name never allocated in-graph:
    // cross-tenant pre-binding is inexpressible and dies in verification.
    let graph = json!({
        "version": "0.1",
        "program": {"nodes": [
            {"id": "alloc", "op": "ALLOC_LQ", "vqs": ["mine"]},
            {"id": "cx", "op": "APPLY_CNOT", "vqs": ["mine", "theirs"]},
            {"id": "free", "op": "FREE_LQ", "vqs": ["mine"]}
        ]},
        "resources": {"vqs": ["mine", "theirs"]},
        "caps": ["CAP_ALLOC"]
    });
    let err = kernel
        .submit_job(session, &graph, SubmitOpts::default())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::GraphInvalid);
}

#[tokio::test]
async fn revoked_channel_trips_the_firewall_at_runtime() {
    let kernel = started_kernel();
    let session_a = open_session(&kernel, "acme", rights_all());
    let tenant_b = TenantId::new("umbra");
    kernel
        .create_tenant(tenant_b.clone(), Quota::default(), rights_all())
        .unwrap();
    let session_b = kernel
        .negotiate_capabilities(&tenant_b, rights_all())
        .unwrap()
        .session_id;

    // Each side leaves one live qubit in its session.
    assert_eq!(run_to_end(&kernel, session_a, &leftover_graph()).await.state, "COMPLETED");
    assert_eq!(run_to_end(&kernel, session_b, &leftover_graph()).await.state, "COMPLETED");

    let token = kernel
        .open_channel(
            session_a,
            "q0",
            &format!("{session_b}:q0"),
            Default::default(),
        )
        .await
        .unwrap();
    assert_eq!(token.tenants.0, TenantId::new("acme"));
    assert_eq!(token.tenants.1, tenant_b);

    kernel.revoke_channel(token.chan_id);

    let graph = json!({
        "version": "0.1",
        "program": {"nodes": [
            {"id": "alloc", "op": "ALLOC_LQ", "vqs": ["a", "b"]},
            {"id": "tp", "op": "TELEPORT_CNOT", "vqs": ["a", "b"],
             "args": {"channel": token.chan_id.to_string()}},
            {"id": "free", "op": "FREE_LQ", "vqs": ["a", "b"]}
        ]},
        "resources": {"vqs": ["a", "b"]},
        "caps": ["CAP_ALLOC", "CAP_TELEPORT"]
    });
    let result = run_to_end(&kernel, session_a, &graph).await;
    assert_eq!(result.state, "FAILED");
    let failure = result.terminal_reason.unwrap();
    assert_eq!(failure.code, "FIREWALL_VIOLATION");
    assert_eq!(failure.node.as_deref(), Some("tp"));

    let violations = kernel.audit().query(&AuditFilter {
        kind: Some(AuditKind::FirewallViolation),
        ..Default::default()
    });
    assert_eq!(violations.len(), 1);
}

#[tokio::test]
async fn live_channel_admits_teleport_and_burns_budget() {
    let kernel = started_kernel();
    let session_a = open_session(&kernel, "acme", rights_all());
    let tenant_b = TenantId::new("umbra");
    kernel
        .create_tenant(tenant_b.clone(), Quota::default(), rights_all())
        .unwrap();
    let session_b = kernel
        .negotiate_capabilities(&tenant_b, rights_all())
        .unwrap()
        .session_id;
    run_to_end(&kernel, session_a, &leftover_graph()).await;
    run_to_end(&kernel, session_b, &leftover_graph()).await;

    let token = kernel
        .open_channel(
            session_a,
            "q0",
            &format!("{session_b}:q0"),
            Default::default(),
        )
        .await
        .unwrap();

    let graph = json!({
        "version": "0.1",
        "program": {"nodes": [
            {"id": "alloc", "op": "ALLOC_LQ", "vqs": ["a", "b"]},
            {"id": "tp", "op": "TELEPORT_CNOT", "vqs": ["a", "b"],
             "args": {"channel": token.chan_id.to_string()}},
            {"id": "free", "op": "FREE_LQ", "vqs": ["a", "b"]}
        ]},
        "resources": {"vqs": ["a", "b"]},
        "caps": ["CAP_ALLOC", "CAP_TELEPORT"]
    });
    let result = run_to_end(&kernel, session_a, &graph).await;
    assert_eq!(result.state, "COMPLETED", "reason: {:?}", result.terminal_reason);
    assert_eq!(kernel.channel_registry().remaining(token.chan_id), Some(0));
}

#[tokio::test]
async fn expired_token_fails_submission_without_side_effects() {
    let kernel = started_kernel();
    let session = open_session(&kernel, "acme", rights_all());
    let expired = kernel
        .issue_token(
            &TenantId::new("acme"),
            rights_all(),
            Some(chrono::Utc::now() - chrono::Duration::seconds(1)),
            Some(5),
        )
        .unwrap();
    kernel
        .session(session)
        .unwrap()
        .set_tokens(vec![expired.cap_id]);

    let err = kernel
        .submit_job(session, &bell_graph(), SubmitOpts::default())
        .unwrap_err();
    assert_eq!(err, KernelError::Expired);

    // The failure never consumed a use and left no job behind.
    assert_eq!(kernel.capability_store().uses_remaining(expired.cap_id), Some(5));
    assert_eq!(kernel.get_telemetry(session).unwrap().session.jobs_submitted, 0);
    let denials = kernel.audit().query(&AuditFilter {
        kind: Some(AuditKind::CapabilityDenied),
        ..Default::default()
    });
    assert_eq!(denials.len(), 1);
}

#[tokio::test]
async fn cancellation_is_immediate_when_queued_and_idempotent_when_terminal() {
    // No workers: submissions stay queued.
    let kernel = Kernel::new(KernelConfig::default(), Arc::new(StateVectorBackend::new()));
    let session = open_session(&kernel, "acme", rights_all());
    let job = kernel
        .submit_job(session, &bell_graph(), SubmitOpts::default())
        .unwrap();

    let state = kernel.cancel_job(session, job).unwrap();
    assert_eq!(state.as_str(), "CANCELLED");
    let result = kernel.wait_for_job(session, job, 1_000).await.unwrap();
    assert_eq!(result.state, "CANCELLED");

    // Cancel of a terminal job is an acknowledged no-op.
    let again = kernel.cancel_job(session, job).unwrap();
    assert_eq!(again.as_str(), "CANCELLED");
    assert_eq!(kernel.get_telemetry(session).unwrap().session.jobs_cancelled, 1);
}

#[tokio::test]
async fn wait_surfaces_timeout_without_cancelling() {
    let kernel = Kernel::new(KernelConfig::default(), Arc::new(StateVectorBackend::new()));
    let session = open_session(&kernel, "acme", rights_all());
    let job = kernel
        .submit_job(session, &bell_graph(), SubmitOpts::default())
        .unwrap();
    let err = kernel.wait_for_job(session, job, 20).await.unwrap_err();
    assert_eq!(err, KernelError::Timeout);
    assert_eq!(kernel.get_job_status(session, job).unwrap().state, "QUEUED");
}

#[tokio::test]
async fn duplicate_request_id_returns_the_same_job() {
    let kernel = started_kernel();
    let session = open_session(&kernel, "acme", rights_all());
    let opts = || SubmitOpts {
        seed: SEED,
        request_id: Some("req-7".into()),
        ..Default::default()
    };
    let first = kernel.submit_job(session, &bell_graph(), opts()).unwrap();
    let second = kernel.submit_job(session, &bell_graph(), opts()).unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn identical_runs_are_byte_identical() {
    let mut observations = Vec::new();
    for _ in 0..2 {
        let kernel = started_kernel();
        let session = open_session(&kernel, "acme", rights_all());
        let result = run_to_end(&kernel, session, &bell_graph()).await;
        let counters = kernel.get_telemetry(session).unwrap().session;
        observations.push((result.state.to_string(), result.events, counters));
    }
    assert_eq!(observations[0], observations[1]);
}

#[tokio::test]
async fn vq_quota_fails_the_job_synchronously() {
    let kernel = started_kernel();
    let tenant = TenantId::new("tiny");
    kernel
        .create_tenant(tenant.clone(), Quota { max_vqs: 1, ..Quota::default() }, rights_all())
        .unwrap();
    let session = kernel
        .negotiate_capabilities(&tenant, rights_all())
        .unwrap()
        .session_id;

    let result = run_to_end(&kernel, session, &bell_graph()).await;
    assert_eq!(result.state, "FAILED");
    assert_eq!(result.terminal_reason.unwrap().code, "QUOTA_EXCEEDED");

    let audit = kernel.audit().query(&AuditFilter {
        kind: Some(AuditKind::QuotaExceeded),
        ..Default::default()
    });
    assert_eq!(audit.len(), 1);
    // The partial allocation was rolled back.
    assert_eq!(kernel.get_telemetry(session).unwrap().session.vqs_allocated, 1);
}

#[tokio::test]
async fn session_quota_bounds_negotiation() {
    let kernel = started_kernel();
    let tenant = TenantId::new("acme");
    kernel
        .create_tenant(tenant.clone(), Quota { max_sessions: 1, ..Quota::default() }, rights_all())
        .unwrap();
    kernel.negotiate_capabilities(&tenant, rights_all()).unwrap();
    let err = kernel.negotiate_capabilities(&tenant, rights_all()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::QuotaExceeded);
}

#[tokio::test]
async fn granted_rights_are_an_intersection() {
    let kernel = started_kernel();
    let tenant = TenantId::new("acme");
    let tenant_rights: RightSet = [Right::Alloc, Right::Measure].into_iter().collect();
    kernel
        .create_tenant(tenant.clone(), Quota::default(), tenant_rights)
        .unwrap();
    let requested: RightSet = [Right::Alloc, Right::Teleport].into_iter().collect();
    let negotiation = kernel.negotiate_capabilities(&tenant, requested).unwrap();
    assert!(negotiation.granted.contains(Right::Alloc));
    assert!(!negotiation.granted.contains(Right::Teleport));
    assert!(negotiation.denied.contains(Right::Teleport));
}

#[tokio::test]
async fn audit_queries_require_the_audit_right() {
    let kernel = started_kernel();
    let tenant = TenantId::new("acme");
    kernel
        .create_tenant(tenant.clone(), Quota::default(), rights_all())
        .unwrap();
    let limited: RightSet = [Right::Alloc, Right::Measure].into_iter().collect();
    let plain = kernel
        .negotiate_capabilities(&tenant, limited)
        .unwrap()
        .session_id;
    let auditor_rights: RightSet = [Right::Audit].into_iter().collect();
    let auditor = kernel
        .negotiate_capabilities(&tenant, auditor_rights)
        .unwrap()
        .session_id;

    let err = kernel.query_audit(plain, &AuditFilter::default()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::CapDenied);
    let records = kernel.query_audit(auditor, &AuditFilter::default()).unwrap();
    assert!(!records.is_empty());
}

#[tokio::test]
async fn debug_submissions_require_the_debug_right() {
    let kernel = started_kernel();
    let tenant = TenantId::new("acme");
    kernel
        .create_tenant(tenant.clone(), Quota::default(), rights_all())
        .unwrap();
    let limited: RightSet = [Right::Alloc, Right::Measure].into_iter().collect();
    let session = kernel
        .negotiate_capabilities(&tenant, limited)
        .unwrap()
        .session_id;
    let err = kernel
        .submit_job(
            session,
            &bell_graph(),
            SubmitOpts { debug: true, ..Default::default() },
        )
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::CapDenied);
}

#[tokio::test]
async fn audit_chain_attests_all_activity() {
    let kernel = started_kernel();
    let session = open_session(&kernel, "acme", rights_all());
    run_to_end(&kernel, session, &bell_graph()).await;
    assert!(kernel.audit().verify_chain());
    let summary = kernel.audit().summary();
    assert!(summary.total > 0);
    assert_eq!(summary.attestation_root.len(), 64);
}

#[tokio::test]
async fn execution_checks_rights_at_time_of_dispatch() {
    let kernel = started_kernel();
    let tenant = TenantId::new("acme");
    kernel
        .create_tenant(tenant.clone(), Quota::default(), rights_all())
        .unwrap();
    // Negotiate allocation only: the measurement right is never granted.
    let requested: RightSet = [Right::Alloc].into_iter().collect();
    let session = kernel
        .negotiate_capabilities(&tenant, requested)
        .unwrap()
        .session_id;

    let result = run_to_end(&kernel, session, &bell_graph()).await;
    assert_eq!(result.state, "FAILED");
    let failure = result.terminal_reason.unwrap();
    assert_eq!(failure.code, "CAP_DENIED");
    assert_eq!(failure.node.as_deref(), Some("m0"));
    assert_eq!(kernel.get_telemetry(session).unwrap().session.cap_denials, 1);
}

#[tokio::test]
async fn closing_a_session_frees_leftovers_and_returns_quota() {
    let kernel = started_kernel();
    let tenant = TenantId::new("acme");
    kernel
        .create_tenant(tenant.clone(), Quota { max_sessions: 1, ..Quota::default() }, rights_all())
        .unwrap();
    let session = kernel
        .negotiate_capabilities(&tenant, rights_all())
        .unwrap()
        .session_id;
    run_to_end(&kernel, session, &leftover_graph()).await;
    assert_eq!(kernel.session(session).unwrap().live_vq_count(), 1);

    kernel.close_session(session).await.unwrap();
    assert!(kernel.get_telemetry(session).is_err());
    // The session slot and the leftover qubit's quota both came back.
    kernel.negotiate_capabilities(&tenant, rights_all()).unwrap();
}

#[tokio::test]
async fn destructive_measurement_is_a_terminator() {
    let kernel = started_kernel();
    let session = open_session(&kernel, "acme", rights_all());
    // No FREE_LQ: the destructive measurement closes the lifetime.
    let graph = json!({
        "version": "0.1",
        "program": {"nodes": [
            {"id": "alloc", "op": "ALLOC_LQ", "vqs": ["q0"]},
            {"id": "m", "op": "MEASURE_Z", "vqs": ["q0"], "produces": ["m"],
             "args": {"destructive": true}}
        ]},
        "resources": {"vqs": ["q0"], "events": ["m"]},
        "caps": ["CAP_ALLOC", "CAP_MEASURE"]
    });
    let result = run_to_end(&kernel, session, &graph).await;
    assert_eq!(result.state, "COMPLETED");
    assert_eq!(result.events["m"], 0);
    let counters = kernel.get_telemetry(session).unwrap().session;
    assert_eq!(counters.vqs_released, 1);
    assert_eq!(kernel.session(session).unwrap().live_vq_count(), 0);
}

#[tokio::test]
async fn suspended_tenant_invalidates_its_sessions() {
    let kernel = started_kernel();
    let session = open_session(&kernel, "acme", rights_all());
    kernel.suspend_tenant(&TenantId::new("acme")).unwrap();
    let err = kernel
        .submit_job(session, &bell_graph(), SubmitOpts::default())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::SessionInvalid);
    kernel.resume_tenant(&TenantId::new("acme")).unwrap();
    kernel
        .submit_job(session, &bell_graph(), SubmitOpts::default())
        .unwrap();
}

// ───────── device-failure recovery ─────────

/// Simulator wrapper that fails the first CNOT once, then behaves.
struct FlakyBackend {
    inner: StateVectorBackend,
    tripped: AtomicBool,
}

impl FlakyBackend {
    fn new() -> Self {
        Self {
            inner: StateVectorBackend::new(),
            tripped: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl DeviceBackend for FlakyBackend {
    async fn allocate(&self, owner: &TenantId, profile: &str) -> DeviceResult<PhysQubit> {
        self.inner.allocate(owner, profile).await
    }
    async fn release(&self, qubit: PhysQubit) -> DeviceResult<()> {
        self.inner.release(qubit).await
    }
    async fn apply(&self, gate: Gate, qubit: PhysQubit) -> DeviceResult<()> {
        self.inner.apply(gate, qubit).await
    }
    async fn apply_cnot(&self, control: PhysQubit, target: PhysQubit) -> DeviceResult<()> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(DeviceError::Fault("transient two-qubit fault".into()));
        }
        self.inner.apply_cnot(control, target).await
    }
    async fn measure(
        &self,
        qubit: PhysQubit,
        basis: Basis,
        rng: &mut DeterministicRng,
    ) -> DeviceResult<u8> {
        self.inner.measure(qubit, basis, rng).await
    }
    async fn measure_bell(
        &self,
        a: PhysQubit,
        b: PhysQubit,
        rng: &mut DeterministicRng,
    ) -> DeviceResult<(u8, u8)> {
        self.inner.measure_bell(a, b, rng).await
    }
    async fn inject_magic(&self, qubit: PhysQubit) -> DeviceResult<()> {
        self.inner.inject_magic(qubit).await
    }
    async fn open_link(&self, a: PhysQubit, b: PhysQubit) -> DeviceResult<LinkId> {
        self.inner.open_link(a, b).await
    }
    async fn use_link(&self, link: LinkId) -> DeviceResult<()> {
        self.inner.use_link(link).await
    }
    async fn close_link(&self, link: LinkId) -> DeviceResult<()> {
        self.inner.close_link(link).await
    }
    async fn owner_of(&self, qubit: PhysQubit) -> DeviceResult<TenantId> {
        self.inner.owner_of(qubit).await
    }
    async fn indicator(&self, qubits: &[PhysQubit]) -> DeviceResult<u64> {
        self.inner.indicator(qubits).await
    }
    async fn snapshot(&self) -> DeviceResult<DeviceSnapshot> {
        self.inner.snapshot().await
    }
    async fn restore(&self, snapshot: &DeviceSnapshot) -> DeviceResult<()> {
        self.inner.restore(snapshot).await
    }
    fn telemetry(&self) -> DeviceTelemetry {
        self.inner.telemetry()
    }
}

#[tokio::test]
async fn transient_device_fault_recovers_through_uncompute() {
    let config = KernelConfig {
        checkpoints: CheckpointConfig {
            retry_limit: 1,
            ..CheckpointConfig::default()
        },
        ..KernelConfig::default()
    };
    let kernel = Kernel::new(config, Arc::new(FlakyBackend::new()));
    kernel.start_workers();
    let session = open_session(&kernel, "acme", rights_all());

    let result = run_to_end(&kernel, session, &bell_graph()).await;
    assert_eq!(result.state, "COMPLETED", "reason: {:?}", result.terminal_reason);
    assert_eq!(result.events["m0"], result.events["m1"]);

    let counters = kernel.get_telemetry(session).unwrap().session;
    assert_eq!(counters.uncompute_runs, 1);
}

// ───────── RPC boundary ─────────

struct RpcClient {
    reader: tokio::io::BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
    next_id: u64,
}

impl RpcClient {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            reader: tokio::io::BufReader::new(reader),
            writer,
            next_id: 1,
        }
    }

    async fn call(&mut self, method: &str, params: Value) -> Value {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
        let id = self.next_id;
        self.next_id += 1;
        let line = serde_json::to_string(&json!({"id": id, "method": method, "params": params}))
            .unwrap();
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        let mut response = String::new();
        self.reader.read_line(&mut response).await.unwrap();
        let value: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(value["id"], id);
        value
    }
}

#[tokio::test]
async fn rpc_round_trip_runs_a_job() {
    let kernel = started_kernel();
    kernel
        .create_tenant(TenantId::new("acme"), Quota::default(), rights_all())
        .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = kernel.clone();
    tokio::spawn(async move {
        let _ = rpc::serve_on(server, listener).await;
    });

    let mut client = RpcClient::connect(addr).await;

    let nego = client
        .call(
            "negotiate_capabilities",
            json!({"tenant": "acme", "requested": ["CAP_ALLOC", "CAP_MEASURE"]}),
        )
        .await;
    let session = nego["result"]["session_id"].as_str().unwrap().to_string();
    assert!(nego["result"]["granted"]
        .as_array()
        .unwrap()
        .contains(&json!("CAP_MEASURE")));

    let submit = client
        .call(
            "submit_job",
            json!({"session": session, "graph": bell_graph(), "seed": SEED}),
        )
        .await;
    let job = submit["result"]["job_id"].as_str().unwrap().to_string();

    let waited = client
        .call(
            "wait_for_job",
            json!({"session": session, "job_id": job, "timeout_ms": 10_000}),
        )
        .await;
    assert_eq!(waited["result"]["state"], "COMPLETED");
    assert_eq!(
        waited["result"]["events"]["m0"],
        waited["result"]["events"]["m1"]
    );

    let telemetry = client
        .call("get_telemetry", json!({"session": session}))
        .await;
    assert_eq!(telemetry["result"]["session"]["jobs_completed"], 1);

    let bogus = client.call("open_portal", json!({})).await;
    assert_eq!(bogus["error"]["code"], "METHOD_NOT_FOUND");

    let cancelled = client
        .call("cancel_job", json!({"session": session, "job_id": job}))
        .await;
    assert_eq!(cancelled["result"]["ack"], true);
    assert_eq!(cancelled["result"]["state"], "COMPLETED");
}
