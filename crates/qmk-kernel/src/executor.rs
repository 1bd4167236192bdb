//! Graph executor
//!
//! Dispatches a certified graph node by node in schedule order: guard
//! evaluation, runtime linearity, capability checks, the entanglement
//! firewall, then the backend call. Runtime state is the canonical source of
//! truth — a handle that is not live in these tables cannot be consumed no
//! matter what the verifier admitted.
//!
//! Skips propagate: a skipped producer's outputs never exist, so every
//! transitive consumer skips too. On completion, residual live handles are
//! written back to the session; on failure or cancellation they are released
//! through the backend.

use crate::audit::{AuditKind, AuditLog, Severity};
use crate::channel::ChannelRegistry;
use crate::checkpoint::{CheckpointManager, HandleTableSnapshot};
use crate::config::CheckpointConfig;
use crate::job::JobRecord;
use crate::rev::{self, Uncomputer};
use crate::session::{ChHandle, Session, VqHandle};
use crate::telemetry::TelemetryHub;
use crate::tenant::Tenant;
use chrono::Utc;
use parking_lot::Mutex;
use qmk_core::{
    CapabilityStore, ChRole, ChannelId, DeterministicRng, GraphError, GraphErrorKind, HandleId,
    HandleIdGen, KernelError, Node, Opcode, QvmGraph, Right, VqRole,
};
use qmk_device::{Basis, DeviceBackend, Gate, LinkId, PhysQubit};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared services the executor needs; one per kernel instance.
pub struct ExecEnv {
    pub device: Arc<dyn DeviceBackend>,
    pub caps: Arc<CapabilityStore>,
    pub channels: Arc<ChannelRegistry>,
    pub checkpoints: Arc<CheckpointManager>,
    pub audit: Arc<AuditLog>,
    pub telemetry: Arc<TelemetryHub>,
    pub checkpoint_cfg: CheckpointConfig,
    pub device_profile: String,
    pub handles: Mutex<HandleIdGen>,
}

/// How a run ended, short of a fatal error.
#[derive(Debug)]
pub enum ExecOutcome {
    Completed(ExecSummary),
    Cancelled(ExecSummary),
}

/// What a run produced.
#[derive(Debug, Default)]
pub struct ExecSummary {
    pub events: BTreeMap<String, u8>,
    pub nodes_executed: u64,
    pub nodes_skipped: u64,
    /// Handles written back to the session at completion.
    pub leftover_vqs: usize,
}

/// A fatal execution error, attributed to the offending node.
#[derive(Debug)]
pub struct ExecError {
    pub node: Option<String>,
    pub error: KernelError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Life {
    NotProduced,
    Live,
    /// The chain was cut by a skipped node; the backing resource (if any)
    /// survives for cleanup but no further operation may touch it.
    Suppressed,
    Dead,
}

#[derive(Debug)]
struct VqRt {
    life: Life,
    phys: Option<PhysQubit>,
    handle: Option<HandleId>,
}

#[derive(Debug)]
struct ChRt {
    life: Life,
    link: Option<LinkId>,
    remaining: u32,
    handle: Option<HandleId>,
}

struct RunCtx<'a> {
    job: &'a JobRecord,
    session: &'a Session,
    tenant: &'a Tenant,
    graph: &'a QvmGraph,
    rng: DeterministicRng,
    vqs: HashMap<String, VqRt>,
    chs: HashMap<String, ChRt>,
    events: BTreeMap<String, u8>,
    executed: Vec<usize>,
    nodes_skipped: u64,
    /// Indicator and live set recorded at the last irreversible boundary.
    boundary: (u64, Vec<PhysQubit>),
    reserved_vqs: u32,
    reserved_chs: u32,
    retries_used: u32,
    rights_logged: HashSet<Right>,
}

impl RunCtx<'_> {
    fn vq(&self, name: &str) -> &VqRt {
        &self.vqs[name]
    }

    fn vq_mut(&mut self, name: &str) -> &mut VqRt {
        self.vqs.get_mut(name).expect("verified vq name")
    }

    fn phys_of(&self, name: &str) -> Result<PhysQubit, KernelError> {
        self.vq(name)
            .phys
            .ok_or_else(|| KernelError::Internal(format!("VQ {name} has no backing qubit")))
    }

    fn live_phys(&self) -> Vec<PhysQubit> {
        let mut out: Vec<(&String, PhysQubit)> = self
            .vqs
            .iter()
            .filter(|(_, rt)| rt.life == Life::Live)
            .filter_map(|(name, rt)| rt.phys.map(|p| (name, p)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(b.0));
        out.into_iter().map(|(_, p)| p).collect()
    }

    fn phys_map(&self) -> HashMap<String, PhysQubit> {
        self.vqs
            .iter()
            .filter_map(|(name, rt)| rt.phys.map(|p| (name.clone(), p)))
            .collect()
    }

    fn freeze(&self, node_index: usize) -> HandleTableSnapshot {
        let mut vqs: Vec<(String, u32)> = self
            .vqs
            .iter()
            .filter(|(_, rt)| rt.life == Life::Live)
            .filter_map(|(name, rt)| rt.phys.map(|p| (name.clone(), p.0)))
            .collect();
        vqs.sort();
        let mut chs: Vec<(String, u64, u32)> = self
            .chs
            .iter()
            .filter(|(_, rt)| rt.life == Life::Live)
            .filter_map(|(name, rt)| rt.link.map(|l| (name.clone(), l.0, rt.remaining)))
            .collect();
        chs.sort();
        HandleTableSnapshot {
            node_index,
            vqs,
            chs,
            events: self.events.clone(),
            executed: self.executed.clone(),
        }
    }
}

/// The executor proper. Stateless between runs; every job gets fresh tables.
pub struct Executor {
    env: Arc<ExecEnv>,
}

enum NodeStep {
    Executed,
    Skipped,
}

impl Executor {
    pub fn new(env: Arc<ExecEnv>) -> Self {
        Self { env }
    }

    /// Run one job to an outcome. The caller owns job-state transitions.
    pub async fn run(
        &self,
        job: &JobRecord,
        session: &Session,
        tenant: &Tenant,
    ) -> Result<ExecOutcome, ExecError> {
        if !job.graph.is_certified_by(self.env.caps.signing_key()) {
            return Err(ExecError {
                node: None,
                error: KernelError::Internal("graph certification does not verify".into()),
            });
        }
        let graph = job.graph.graph();
        let mut ctx = RunCtx {
            job,
            session,
            tenant,
            graph,
            rng: DeterministicRng::new(job.seed),
            vqs: graph
                .vqs
                .iter()
                .map(|name| {
                    (
                        name.clone(),
                        VqRt { life: Life::NotProduced, phys: None, handle: None },
                    )
                })
                .collect(),
            chs: graph
                .chs
                .iter()
                .map(|name| {
                    (
                        name.clone(),
                        ChRt { life: Life::NotProduced, link: None, remaining: 0, handle: None },
                    )
                })
                .collect(),
            events: BTreeMap::new(),
            executed: Vec::new(),
            nodes_skipped: 0,
            boundary: (0, Vec::new()),
            reserved_vqs: 0,
            reserved_chs: 0,
            retries_used: 0,
            rights_logged: HashSet::new(),
        };
        if let Ok(base) = self.env.device.indicator(&[]).await {
            ctx.boundary = (base, Vec::new());
        }

        let mut idx = 0;
        while idx < graph.nodes.len() {
            if job.cancel_requested() {
                self.release_everything(&mut ctx).await;
                return Ok(ExecOutcome::Cancelled(self.summary(&ctx)));
            }

            match self.exec_node(&mut ctx, idx).await {
                Ok(NodeStep::Executed) | Ok(NodeStep::Skipped) => {
                    job.set_progress(idx + 1);
                    idx += 1;
                }
                Err(error @ KernelError::Device(_))
                    if ctx.retries_used < self.env.checkpoint_cfg.retry_limit =>
                {
                    warn!(job = %job.id, node = %graph.nodes[idx].id, %error, "device failure, attempting recovery");
                    match self.recover(&mut ctx).await {
                        Ok(resume) => {
                            ctx.retries_used += 1;
                            idx = resume;
                        }
                        Err(recovery_error) => {
                            debug!(job = %job.id, %recovery_error, "recovery failed");
                            self.note_failure(&ctx, &graph.nodes[idx], &error);
                            self.release_everything(&mut ctx).await;
                            return Err(ExecError {
                                node: Some(graph.nodes[idx].id.clone()),
                                error,
                            });
                        }
                    }
                }
                Err(error) => {
                    self.note_failure(&ctx, &graph.nodes[idx], &error);
                    self.release_everything(&mut ctx).await;
                    return Err(ExecError {
                        node: Some(graph.nodes[idx].id.clone()),
                        error,
                    });
                }
            }
        }

        let summary = self.finish(&mut ctx).await;
        Ok(ExecOutcome::Completed(summary))
    }

    fn summary(&self, ctx: &RunCtx<'_>) -> ExecSummary {
        ExecSummary {
            events: ctx.events.clone(),
            nodes_executed: ctx.executed.len() as u64,
            nodes_skipped: ctx.nodes_skipped,
            leftover_vqs: 0,
        }
    }

    /// Per-node procedure: guard, linearity, capabilities, firewall,
    /// checkpoint policy, dispatch, handle transitions, telemetry.
    async fn exec_node(&self, ctx: &mut RunCtx<'_>, idx: usize) -> Result<NodeStep, KernelError> {
        let graph = ctx.graph;
        let node = &graph.nodes[idx];

        if self.should_skip(ctx, node) {
            self.mark_skipped(ctx, node);
            ctx.nodes_skipped += 1;
            self.env
                .telemetry
                .record(ctx.session.id, |c| c.nodes_skipped += 1);
            debug!(job = %ctx.job.id, node = %node.id, "node skipped");
            return Ok(NodeStep::Skipped);
        }

        self.check_runtime_linearity(ctx, node)?;
        self.authorize(ctx, node)?;
        self.firewall(ctx, node).await?;
        self.maybe_checkpoint(ctx, node, idx).await?;
        self.dispatch(ctx, node).await?;

        ctx.executed.push(idx);
        self.env
            .telemetry
            .record(ctx.session.id, |c| c.nodes_executed += 1);

        if !node.op.is_reversible() {
            let live = ctx.live_phys();
            let indicator = self.env.device.indicator(&live).await?;
            ctx.boundary = (indicator, live);
        }
        Ok(NodeStep::Executed)
    }

    fn should_skip(&self, ctx: &RunCtx<'_>, node: &Node) -> bool {
        if let Some(guard) = &node.guard {
            match ctx.events.get(&guard.event) {
                None => return true,
                Some(value) if *value != guard.equals => return true,
                Some(_) => {}
            }
        }
        if node.inputs.iter().any(|ev| !ctx.events.contains_key(ev)) {
            return true;
        }
        if node.vqs.iter().any(|vq| ctx.vq(vq).life == Life::Suppressed) {
            return true;
        }
        node.chs.iter().any(|ch| ctx.chs[ch].life == Life::Suppressed)
    }

    /// A skipped node's productions never come into existence, so their
    /// consumers skip transitively. Pass-through uses and consumptions of a
    /// skipped node leave the handle untouched: a skipped correction gate
    /// does not cut its qubit's chain, and a skipped terminator leaves the
    /// handle live (it surfaces as a session leftover at completion).
    fn mark_skipped(&self, ctx: &mut RunCtx<'_>, node: &Node) {
        if node.vq_role() == VqRole::Produce {
            for name in node.vqs.clone() {
                let rt = ctx.vq_mut(&name);
                if rt.life == Life::NotProduced {
                    rt.life = Life::Suppressed;
                }
            }
        }
        if node.op.signature().ch_role == ChRole::Produce {
            for name in node.chs.clone() {
                if let Some(rt) = ctx.chs.get_mut(&name) {
                    if rt.life == Life::NotProduced {
                        rt.life = Life::Suppressed;
                    }
                }
            }
        }
    }

    /// Runtime linearity is canonical: refuse anything the tables disagree
    /// with, even for a certified graph.
    fn check_runtime_linearity(&self, ctx: &RunCtx<'_>, node: &Node) -> Result<(), KernelError> {
        match node.vq_role() {
            VqRole::Produce => {
                for vq in &node.vqs {
                    if ctx.vq(vq).life != Life::NotProduced {
                        return Err(linearity_violation(node, format!("{vq} already produced")));
                    }
                }
            }
            VqRole::Use | VqRole::Consume => {
                for vq in &node.vqs {
                    if ctx.vq(vq).life != Life::Live {
                        return Err(linearity_violation(node, format!("{vq} is not live")));
                    }
                }
            }
            VqRole::None | VqRole::Measure => {}
        }
        match node.op.signature().ch_role {
            ChRole::Produce => {
                for ch in &node.chs {
                    if ctx.chs[ch].life != Life::NotProduced {
                        return Err(linearity_violation(node, format!("{ch} already produced")));
                    }
                }
            }
            ChRole::Use | ChRole::Consume => {
                for ch in &node.chs {
                    if ctx.chs[ch].life != Life::Live {
                        return Err(linearity_violation(node, format!("{ch} is not live")));
                    }
                }
            }
            ChRole::None => {}
        }
        Ok(())
    }

    /// Every required right needs the session grant plus a valid token.
    fn authorize(&self, ctx: &mut RunCtx<'_>, node: &Node) -> Result<(), KernelError> {
        let now = Utc::now();
        for right in node.required_rights().iter() {
            if !ctx.session.granted.contains(right) {
                return Err(KernelError::CapDenied(format!(
                    "session was not granted {right}"
                )));
            }
            let mut authorized = false;
            for cap in ctx.session.tokens() {
                if let Ok(token) = self.env.caps.verify(cap, now) {
                    if token.rights.contains(right) {
                        let _ = self.env.caps.consume_use(cap, now);
                        authorized = true;
                        break;
                    }
                }
            }
            if !authorized {
                return Err(KernelError::CapDenied(format!(
                    "no valid token carries {right}"
                )));
            }
            if ctx.rights_logged.insert(right) {
                self.env.audit.append(
                    Some(ctx.tenant.id.clone()),
                    Some(ctx.session.id),
                    AuditKind::CapabilityUsed,
                    Severity::Info,
                    json!({"right": right.name(), "job": ctx.job.id.to_string()}),
                );
            }
        }
        Ok(())
    }

    /// Entanglement firewall: a cross-tenant pair is admitted only through a
    /// valid channel token presented by the node.
    async fn firewall(&self, ctx: &mut RunCtx<'_>, node: &Node) -> Result<(), KernelError> {
        if !node.op.is_two_qubit() {
            return Ok(());
        }
        let a = ctx.phys_of(&node.vqs[0])?;
        let b = ctx.phys_of(&node.vqs[1])?;
        let owner_a = self.env.device.owner_of(a).await?;
        let owner_b = self.env.device.owner_of(b).await?;

        let presented = node
            .args
            .channel
            .as_deref()
            .map(|raw| {
                ChannelId::parse(raw).ok_or_else(|| {
                    KernelError::Firewall(format!("malformed channel token {raw}"))
                })
            })
            .transpose()?;

        if owner_a != owner_b {
            let chan = presented.ok_or_else(|| {
                KernelError::Firewall(format!(
                    "cross-tenant pair ({owner_a}, {owner_b}) without a channel token"
                ))
            })?;
            let token = self
                .env
                .channels
                .authorize_use(chan, &ctx.tenant.id, Utc::now())?;
            self.env.audit.append(
                Some(ctx.tenant.id.clone()),
                Some(ctx.session.id),
                AuditKind::ChannelUsed,
                Severity::Info,
                json!({
                    "channel": token.chan_id.to_string(),
                    "node": node.id,
                    "tenants": [token.tenants.0.to_string(), token.tenants.1.to_string()],
                }),
            );
        } else if let Some(chan) = presented {
            // Same-tenant use of a registry channel still burns budget.
            self.env
                .channels
                .authorize_use(chan, &ctx.tenant.id, Utc::now())?;
        }
        Ok(())
    }

    /// Checkpoint at fences and (by policy) before measurements, when the
    /// session holds the checkpoint right.
    async fn maybe_checkpoint(
        &self,
        ctx: &mut RunCtx<'_>,
        node: &Node,
        idx: usize,
    ) -> Result<(), KernelError> {
        let wants = node.op == Opcode::FenceEpoch
            || (self.env.checkpoint_cfg.before_measurements && node.op.is_measurement());
        if !wants || !ctx.session.granted.contains(Right::Checkpoint) {
            return Ok(());
        }
        let snapshot = self.env.device.snapshot().await?;
        let handles = ctx.freeze(idx);
        let id = self.env.checkpoints.capture(ctx.job.id, snapshot, handles);
        self.env
            .telemetry
            .record(ctx.session.id, |c| c.checkpoints_taken += 1);
        self.env.audit.append(
            Some(ctx.tenant.id.clone()),
            Some(ctx.session.id),
            AuditKind::CheckpointTaken,
            Severity::Info,
            json!({"checkpoint": id.to_string(), "node": node.id}),
        );
        Ok(())
    }

    async fn dispatch(&self, ctx: &mut RunCtx<'_>, node: &Node) -> Result<(), KernelError> {
        match node.op {
            Opcode::AllocLq | Opcode::InjectTState => {
                let profile = node
                    .args
                    .profile
                    .clone()
                    .unwrap_or_else(|| self.env.device_profile.clone());
                for name in node.vqs.clone() {
                    ctx.tenant.reserve_vqs(1)?;
                    ctx.reserved_vqs += 1;
                    let phys = self.env.device.allocate(&ctx.tenant.id, &profile).await?;
                    if node.op == Opcode::InjectTState {
                        self.env.device.inject_magic(phys).await?;
                    }
                    let handle = self.env.handles.lock().fresh();
                    let rt = ctx.vq_mut(&name);
                    rt.life = Life::Live;
                    rt.phys = Some(phys);
                    rt.handle = Some(handle);
                    self.env
                        .telemetry
                        .record(ctx.session.id, |c| c.vqs_allocated += 1);
                    self.env.audit.append(
                        Some(ctx.tenant.id.clone()),
                        Some(ctx.session.id),
                        AuditKind::ResourceAllocated,
                        Severity::Info,
                        json!({"vq": name, "slot": phys.0, "node": node.id}),
                    );
                }
            }
            Opcode::FreeLq | Opcode::Reset => {
                for name in node.vqs.clone() {
                    self.release_vq(ctx, &name, &node.id).await?;
                }
            }
            Opcode::ApplyH | Opcode::ApplyS | Opcode::ApplyX | Opcode::ApplyY | Opcode::ApplyZ => {
                let gate = match node.op {
                    Opcode::ApplyH => Gate::H,
                    Opcode::ApplyS => Gate::S,
                    Opcode::ApplyX => Gate::X,
                    Opcode::ApplyY => Gate::Y,
                    _ => Gate::Z,
                };
                let q = ctx.phys_of(&node.vqs[0])?;
                self.env.device.apply(gate, q).await?;
            }
            Opcode::ApplyCnot => {
                let c = ctx.phys_of(&node.vqs[0])?;
                let t = ctx.phys_of(&node.vqs[1])?;
                self.env.device.apply_cnot(c, t).await?;
            }
            Opcode::MeasureZ | Opcode::MeasureX | Opcode::MeasureY | Opcode::MeasureAngle => {
                let basis = match node.op {
                    Opcode::MeasureZ => Basis::Z,
                    Opcode::MeasureX => Basis::X,
                    Opcode::MeasureY => Basis::Y,
                    _ => Basis::Angle(node.args.angle.unwrap_or(0.0)),
                };
                let name = node.vqs[0].clone();
                let q = ctx.phys_of(&name)?;
                let bit = self.env.device.measure(q, basis, &mut ctx.rng).await?;
                ctx.events.insert(node.produces[0].clone(), bit);
                self.env
                    .telemetry
                    .record(ctx.session.id, |c| c.measurements += 1);
                if node.destructive() {
                    self.release_vq(ctx, &name, &node.id).await?;
                }
            }
            Opcode::MeasureBell => {
                let (name_a, name_b) = (node.vqs[0].clone(), node.vqs[1].clone());
                let a = ctx.phys_of(&name_a)?;
                let b = ctx.phys_of(&name_b)?;
                let (phase, parity) = self.env.device.measure_bell(a, b, &mut ctx.rng).await?;
                ctx.events.insert(node.produces[0].clone(), phase);
                ctx.events.insert(node.produces[1].clone(), parity);
                self.env
                    .telemetry
                    .record(ctx.session.id, |c| c.measurements += 2);
                if node.destructive() {
                    self.release_vq(ctx, &name_a, &node.id).await?;
                    self.release_vq(ctx, &name_b, &node.id).await?;
                }
            }
            Opcode::TeleportCnot => {
                if let Some(name) = node.chs.first().cloned() {
                    let (link, remaining) = {
                        let rt = &ctx.chs[&name];
                        (rt.link, rt.remaining)
                    };
                    if remaining == 0 {
                        return Err(KernelError::Firewall(format!(
                            "channel {name} entanglement budget exhausted"
                        )));
                    }
                    if let Some(link) = link {
                        self.env.device.use_link(link).await?;
                    }
                    if let Some(rt) = ctx.chs.get_mut(&name) {
                        rt.remaining -= 1;
                    }
                }
                let c = ctx.phys_of(&node.vqs[0])?;
                let t = ctx.phys_of(&node.vqs[1])?;
                self.env.device.apply_cnot(c, t).await?;
            }
            Opcode::OpenChan => {
                let name = node.chs[0].clone();
                ctx.tenant.reserve_chs(1)?;
                ctx.reserved_chs += 1;
                let a = ctx.phys_of(&node.vqs[0])?;
                let b = ctx.phys_of(&node.vqs[1])?;
                let link = self.env.device.open_link(a, b).await?;
                let handle = self.env.handles.lock().fresh();
                if let Some(rt) = ctx.chs.get_mut(&name) {
                    rt.life = Life::Live;
                    rt.link = Some(link);
                    rt.remaining = node.args.max_entanglements.unwrap_or(1);
                    rt.handle = Some(handle);
                }
                self.env
                    .telemetry
                    .record(ctx.session.id, |c| c.channels_opened += 1);
                self.env.audit.append(
                    Some(ctx.tenant.id.clone()),
                    Some(ctx.session.id),
                    AuditKind::ChannelApproved,
                    Severity::Info,
                    json!({"ch": name, "node": node.id}),
                );
            }
            Opcode::UseChan => {
                let name = node.chs[0].clone();
                let (link, remaining) = {
                    let rt = &ctx.chs[&name];
                    (rt.link, rt.remaining)
                };
                if remaining == 0 {
                    return Err(KernelError::Firewall(format!(
                        "channel {name} entanglement budget exhausted"
                    )));
                }
                if let Some(link) = link {
                    self.env.device.use_link(link).await?;
                }
                if let Some(rt) = ctx.chs.get_mut(&name) {
                    rt.remaining -= 1;
                }
                if let Some(vq) = node.vqs.first().cloned() {
                    // The qubit is consumed through the channel.
                    self.release_vq(ctx, &vq, &node.id).await?;
                }
                self.env.audit.append(
                    Some(ctx.tenant.id.clone()),
                    Some(ctx.session.id),
                    AuditKind::ChannelUsed,
                    Severity::Info,
                    json!({"ch": name, "node": node.id}),
                );
            }
            Opcode::CloseChan => {
                let name = node.chs[0].clone();
                let link = ctx.chs[&name].link;
                if let Some(link) = link {
                    self.env.device.close_link(link).await?;
                }
                if let Some(rt) = ctx.chs.get_mut(&name) {
                    rt.life = Life::Dead;
                    rt.link = None;
                }
                ctx.tenant.release_chs(1);
                ctx.reserved_chs = ctx.reserved_chs.saturating_sub(1);
                self.env
                    .telemetry
                    .record(ctx.session.id, |c| c.channels_closed += 1);
            }
            Opcode::CondPauli => {
                let value = ctx.events.get(&node.inputs[0]).copied().unwrap_or(0);
                if value == 1 {
                    let gate = match node.args.mask.as_deref() {
                        Some("Y") => Gate::Y,
                        Some("Z") => Gate::Z,
                        _ => Gate::X,
                    };
                    let q = ctx.phys_of(&node.vqs[0])?;
                    self.env.device.apply(gate, q).await?;
                }
            }
            // Fences and barriers are scheduling marks; SET_POLICY is a
            // non-semantic hint.
            Opcode::FenceEpoch | Opcode::BarRegion | Opcode::SetPolicy => {}
        }
        Ok(())
    }

    async fn release_vq(
        &self,
        ctx: &mut RunCtx<'_>,
        name: &str,
        node_id: &str,
    ) -> Result<(), KernelError> {
        let phys = ctx.phys_of(name)?;
        self.env.device.release(phys).await?;
        let rt = ctx.vq_mut(name);
        rt.life = Life::Dead;
        rt.phys = None;
        ctx.tenant.release_vqs(1);
        ctx.reserved_vqs = ctx.reserved_vqs.saturating_sub(1);
        self.env
            .telemetry
            .record(ctx.session.id, |c| c.vqs_released += 1);
        self.env.audit.append(
            Some(ctx.tenant.id.clone()),
            Some(ctx.session.id),
            AuditKind::ResourceFreed,
            Severity::Info,
            json!({"vq": name, "node": node_id}),
        );
        Ok(())
    }

    /// Device-failure recovery: uncompute the open reversible segment first;
    /// fall back to the latest checkpoint.
    async fn recover(&self, ctx: &mut RunCtx<'_>) -> Result<usize, KernelError> {
        let segment = rev::current_segment(ctx.graph, &ctx.executed);
        if !segment.is_empty() {
            let steps = rev::synthesize_inverse(ctx.graph, &segment);
            let phys = ctx.phys_map();
            self.env
                .telemetry
                .record(ctx.session.id, |c| c.uncompute_runs += 1);
            let rollback = Uncomputer::new(&*self.env.device)
                .rollback(&steps, &phys, &ctx.events, &ctx.boundary.1, ctx.boundary.0)
                .await;
            match rollback {
                Ok(()) => {
                    let resume = segment.nodes[0];
                    ctx.executed.retain(|i| !segment.nodes.contains(i));
                    debug!(job = %ctx.job.id, resume, "uncomputed back to boundary");
                    return Ok(resume);
                }
                Err(err) => {
                    warn!(job = %ctx.job.id, %err, "uncompute rollback failed");
                }
            }
        }

        let checkpoint = self
            .env
            .checkpoints
            .latest_for(ctx.job.id)
            .ok_or_else(|| KernelError::Device("no recovery point available".into()))?;
        self.env.device.restore(&checkpoint.device).await?;
        self.restore_tables(ctx, &checkpoint.handles);
        let live = ctx.live_phys();
        let indicator = self.env.device.indicator(&live).await?;
        ctx.boundary = (indicator, live);
        self.env
            .telemetry
            .record(ctx.session.id, |c| c.checkpoints_restored += 1);
        self.env.audit.append(
            Some(ctx.tenant.id.clone()),
            Some(ctx.session.id),
            AuditKind::CheckpointRestored,
            Severity::Warning,
            json!({"checkpoint": checkpoint.id.to_string(), "job": ctx.job.id.to_string()}),
        );
        Ok(checkpoint.handles.node_index)
    }

    fn restore_tables(&self, ctx: &mut RunCtx<'_>, snapshot: &HandleTableSnapshot) {
        let snapshot_vqs = snapshot.vqs.len() as u32;
        let over = ctx.reserved_vqs.saturating_sub(snapshot_vqs);
        ctx.tenant.release_vqs(over);
        ctx.reserved_vqs = snapshot_vqs;

        let snapshot_chs = snapshot.chs.len() as u32;
        let over = ctx.reserved_chs.saturating_sub(snapshot_chs);
        ctx.tenant.release_chs(over);
        ctx.reserved_chs = snapshot_chs;

        for rt in ctx.vqs.values_mut() {
            *rt = VqRt { life: Life::NotProduced, phys: None, handle: None };
        }
        for (name, slot) in &snapshot.vqs {
            if let Some(rt) = ctx.vqs.get_mut(name) {
                rt.life = Life::Live;
                rt.phys = Some(PhysQubit(*slot));
                // A restore is a fresh production.
                rt.handle = Some(self.env.handles.lock().fresh());
            }
        }
        for rt in ctx.chs.values_mut() {
            *rt = ChRt { life: Life::NotProduced, link: None, remaining: 0, handle: None };
        }
        for (name, link, remaining) in &snapshot.chs {
            if let Some(rt) = ctx.chs.get_mut(name) {
                rt.life = Life::Live;
                rt.link = Some(LinkId(*link));
                rt.remaining = *remaining;
                rt.handle = Some(self.env.handles.lock().fresh());
            }
        }
        ctx.events = snapshot.events.clone();
        ctx.executed = snapshot.executed.clone();
    }

    fn note_failure(&self, ctx: &RunCtx<'_>, node: &Node, error: &KernelError) {
        use qmk_core::ErrorCode;
        let (kind, severity) = match error.code() {
            ErrorCode::CapDenied => (AuditKind::CapabilityDenied, Severity::Warning),
            ErrorCode::FirewallViolation => (AuditKind::FirewallViolation, Severity::Critical),
            ErrorCode::QuotaExceeded => (AuditKind::QuotaExceeded, Severity::Warning),
            _ => return,
        };
        match kind {
            AuditKind::CapabilityDenied => self
                .env
                .telemetry
                .record(ctx.session.id, |c| c.cap_denials += 1),
            AuditKind::FirewallViolation => self
                .env
                .telemetry
                .record(ctx.session.id, |c| c.firewall_violations += 1),
            AuditKind::QuotaExceeded => self
                .env
                .telemetry
                .record(ctx.session.id, |c| c.quota_rejections += 1),
            _ => {}
        }
        self.env.audit.append(
            Some(ctx.tenant.id.clone()),
            Some(ctx.session.id),
            kind,
            severity,
            json!({"node": node.id, "job": ctx.job.id.to_string(), "error": error.to_string()}),
        );
    }

    /// Completion: write residual live handles back to the session.
    async fn finish(&self, ctx: &mut RunCtx<'_>) -> ExecSummary {
        let mut summary = self.summary(ctx);
        let names: Vec<String> = ctx.vqs.keys().cloned().collect();
        for name in names {
            let (life, phys, handle) = {
                let rt = ctx.vq(&name);
                (rt.life, rt.phys, rt.handle)
            };
            if !matches!(life, Life::Live | Life::Suppressed) {
                continue;
            }
            let (Some(phys), Some(handle)) = (phys, handle) else {
                continue;
            };
            let displaced = ctx.session.insert_vq(
                name.clone(),
                VqHandle {
                    handle,
                    phys,
                    owner: ctx.tenant.id.clone(),
                },
            );
            summary.leftover_vqs += 1;
            if let Some(old) = displaced {
                if let Err(err) = self.env.device.release(old.phys).await {
                    warn!(%err, "failed to release displaced session qubit");
                }
                ctx.tenant.release_vqs(1);
            }
        }
        let ch_names: Vec<String> = ctx.chs.keys().cloned().collect();
        for name in ch_names {
            let (life, link, handle) = {
                let rt = &ctx.chs[&name];
                (rt.life, rt.link, rt.handle)
            };
            if !matches!(life, Life::Live | Life::Suppressed) {
                continue;
            }
            let (Some(link), Some(handle)) = (link, handle) else {
                continue;
            };
            ctx.session.insert_ch(name, ChHandle { handle, link });
        }
        summary
    }

    /// Failure / cancellation: every live or suppressed resource goes back
    /// to the backend, and reservations return to the tenant.
    async fn release_everything(&self, ctx: &mut RunCtx<'_>) {
        let names: Vec<String> = ctx.vqs.keys().cloned().collect();
        for name in names {
            let (life, phys) = {
                let rt = ctx.vq(&name);
                (rt.life, rt.phys)
            };
            if matches!(life, Life::Live | Life::Suppressed) {
                if let Some(phys) = phys {
                    if let Err(err) = self.env.device.release(phys).await {
                        warn!(%err, vq = %name, "release failed during teardown");
                    }
                }
            }
            let rt = ctx.vq_mut(&name);
            rt.life = Life::Dead;
            rt.phys = None;
        }
        let ch_names: Vec<String> = ctx.chs.keys().cloned().collect();
        for name in ch_names {
            let link = {
                let rt = &ctx.chs[&name];
                if matches!(rt.life, Life::Live | Life::Suppressed) {
                    rt.link
                } else {
                    None
                }
            };
            if let Some(link) = link {
                if let Err(err) = self.env.device.close_link(link).await {
                    warn!(%err, ch = %name, "link close failed during teardown");
                }
            }
            if let Some(rt) = ctx.chs.get_mut(&name) {
                rt.life = Life::Dead;
                rt.link = None;
            }
        }
        ctx.tenant.release_vqs(ctx.reserved_vqs);
        ctx.tenant.release_chs(ctx.reserved_chs);
        ctx.reserved_vqs = 0;
        ctx.reserved_chs = 0;
    }
}

fn linearity_violation(node: &Node, detail: String) -> KernelError {
    KernelError::Graph(GraphError::at_node(
        GraphErrorKind::LinearityViolation,
        &node.id,
        detail,
    ))
}
