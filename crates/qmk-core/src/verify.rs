//! Static verifier
//!
//! Certifies a parsed graph against the structural, linearity, lifetime,
//! ordering, guard, and capability rules. Certification is a keyed MAC over
//! the graph content hash; the executor recomputes it and refuses to run
//! anything it cannot reproduce.
//!
//! The verifier collects every independent error it can find rather than
//! stopping at the first, so a submitter sees the whole picture in one round.

use crate::capability::SigningKey;
use crate::error::{GraphError, GraphErrorKind};
use crate::graph::{ChRole, Opcode, QvmGraph, VqRole};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

/// Proof that a graph passed verification under a given kernel key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Certification {
    content_hash: [u8; 32],
    mac: [u8; 32],
}

impl Certification {
    pub fn content_hash(&self) -> [u8; 32] {
        self.content_hash
    }

    /// Check the token against a graph and the kernel key.
    pub fn covers(&self, key: &SigningKey, graph: &QvmGraph) -> bool {
        if self.content_hash != graph.content_hash() {
            return false;
        }
        let expected = key.mac(&self.content_hash);
        SigningKey::mac_eq(&self.mac, &expected)
    }
}

/// A graph plus its certification, the only form the executor accepts.
#[derive(Debug, Clone)]
pub struct CertifiedGraph {
    graph: Arc<QvmGraph>,
    cert: Certification,
}

impl CertifiedGraph {
    pub fn graph(&self) -> &QvmGraph {
        &self.graph
    }

    pub fn certification(&self) -> &Certification {
        &self.cert
    }

    pub fn is_certified_by(&self, key: &SigningKey) -> bool {
        self.cert.covers(key, &self.graph)
    }
}

/// The verifier. Stateless apart from the signing key it certifies with.
pub struct Verifier<'k> {
    key: &'k SigningKey,
}

/// Per-handle lifecycle state during the linearity pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinState {
    NotProduced,
    Live,
    Dead,
}

impl<'k> Verifier<'k> {
    pub fn new(key: &'k SigningKey) -> Self {
        Self { key }
    }

    /// Run every check; certify only a clean graph.
    pub fn certify(&self, graph: QvmGraph) -> Result<CertifiedGraph, Vec<GraphError>> {
        let errors = self.check(&graph);
        if !errors.is_empty() {
            tracing::debug!(errors = errors.len(), "graph failed verification");
            return Err(errors);
        }
        let content_hash = graph.content_hash();
        let cert = Certification {
            content_hash,
            mac: self.key.mac(&content_hash),
        };
        Ok(CertifiedGraph {
            graph: Arc::new(graph),
            cert,
        })
    }

    /// All structural checks, collecting independent errors.
    pub fn check(&self, graph: &QvmGraph) -> Vec<GraphError> {
        let mut errors = Vec::new();
        check_unique_ids(graph, &mut errors);
        check_signatures(graph, &mut errors);
        check_declarations(graph, &mut errors);
        check_linearity(graph, &mut errors);
        check_events(graph, &mut errors);
        check_capability_coverage(graph, &mut errors);
        check_firewall_prebinding(graph, &mut errors);
        errors
    }
}

fn check_unique_ids(graph: &QvmGraph, errors: &mut Vec<GraphError>) {
    let mut seen = HashSet::new();
    for node in &graph.nodes {
        if !seen.insert(node.id.as_str()) {
            errors.push(GraphError::at_node(
                GraphErrorKind::TypeMismatch,
                &node.id,
                "duplicate node id",
            ));
        }
    }
}

fn check_signatures(graph: &QvmGraph, errors: &mut Vec<GraphError>) {
    for node in &graph.nodes {
        let sig = node.op.signature();
        let mut arity = |field: &str, want: crate::graph::Arity, got: usize| {
            if !want.admits(got) {
                errors.push(GraphError::at_node(
                    GraphErrorKind::TypeMismatch,
                    &node.id,
                    format!("{} takes {want} {field}, got {got}", node.op),
                ));
            }
        };
        arity("vqs", sig.vqs, node.vqs.len());
        arity("chs", sig.chs, node.chs.len());
        arity("inputs", sig.inputs, node.inputs.len());
        arity("produces", sig.produces, node.produces.len());

        if sig.needs_angle && node.args.angle.is_none() {
            errors.push(GraphError::at_node(
                GraphErrorKind::TypeMismatch,
                &node.id,
                format!("{} requires args.angle", node.op),
            ));
        }
        if sig.needs_mask {
            match node.args.mask.as_deref() {
                Some("X") | Some("Y") | Some("Z") => {}
                _ => errors.push(GraphError::at_node(
                    GraphErrorKind::TypeMismatch,
                    &node.id,
                    "args.mask must be one of X, Y, Z",
                )),
            }
        }
        if node.op == Opcode::TeleportCnot && node.chs.is_empty() && node.args.channel.is_none() {
            errors.push(GraphError::at_node(
                GraphErrorKind::TypeMismatch,
                &node.id,
                "TELEPORT_CNOT requires a channel operand or args.channel",
            ));
        }
    }
}

fn check_declarations(graph: &QvmGraph, errors: &mut Vec<GraphError>) {
    let vqs: HashSet<&str> = graph.vqs.iter().map(String::as_str).collect();
    let chs: HashSet<&str> = graph.chs.iter().map(String::as_str).collect();
    let events: HashSet<&str> = graph.events.iter().map(String::as_str).collect();

    for node in &graph.nodes {
        for vq in &node.vqs {
            if !vqs.contains(vq.as_str()) {
                errors.push(GraphError::at_node(
                    GraphErrorKind::TypeMismatch,
                    &node.id,
                    format!("references undeclared VQ {vq}"),
                ));
            }
        }
        for ch in &node.chs {
            if !chs.contains(ch.as_str()) {
                errors.push(GraphError::at_node(
                    GraphErrorKind::TypeMismatch,
                    &node.id,
                    format!("references undeclared CH {ch}"),
                ));
            }
        }
        for ev in node.inputs.iter().chain(node.produces.iter()) {
            if !events.contains(ev.as_str()) {
                errors.push(GraphError::at_node(
                    GraphErrorKind::TypeMismatch,
                    &node.id,
                    format!("references undeclared event {ev}"),
                ));
            }
        }
        if let Some(guard) = &node.guard {
            if !events.contains(guard.event.as_str()) {
                errors.push(GraphError::at_node(
                    GraphErrorKind::GuardInvalid,
                    &node.id,
                    format!("guard references undeclared event {}", guard.event),
                ));
            }
        }
    }
}

/// Linearity and lifetime closure for VQ and CH handles.
///
/// Node-list order is the schedule: a producer brings a handle to life, each
/// use consumes the current version and produces the next, a terminator kills
/// it. Any reference outside that protocol is a linearity violation; any
/// handle still live (or never produced) at the end of the program leaks.
fn check_linearity(graph: &QvmGraph, errors: &mut Vec<GraphError>) {
    let mut vq_state: HashMap<&str, LinState> = graph
        .vqs
        .iter()
        .map(|v| (v.as_str(), LinState::NotProduced))
        .collect();
    let mut ch_state: HashMap<&str, LinState> = graph
        .chs
        .iter()
        .map(|c| (c.as_str(), LinState::NotProduced))
        .collect();

    for node in &graph.nodes {
        let mut in_node = HashSet::new();
        for vq in &node.vqs {
            if !in_node.insert(vq.as_str()) {
                errors.push(GraphError::at_node(
                    GraphErrorKind::LinearityViolation,
                    &node.id,
                    format!("{vq} listed twice in one operation"),
                ));
            }
        }

        let role = node.vq_role();
        for vq in &node.vqs {
            let Some(state) = vq_state.get_mut(vq.as_str()) else {
                continue; // undeclared, reported elsewhere
            };
            match (role, *state) {
                (VqRole::Produce, LinState::NotProduced) => *state = LinState::Live,
                (VqRole::Produce, _) => errors.push(GraphError::at_node(
                    GraphErrorKind::LinearityViolation,
                    &node.id,
                    format!("{vq} has more than one producing node"),
                )),
                (VqRole::Use, LinState::Live) => {}
                (VqRole::Consume, LinState::Live) => *state = LinState::Dead,
                (VqRole::Use | VqRole::Consume, LinState::NotProduced) => {
                    errors.push(GraphError::at_node(
                        GraphErrorKind::LinearityViolation,
                        &node.id,
                        format!("{vq} used before production"),
                    ));
                }
                (VqRole::Use | VqRole::Consume, LinState::Dead) => {
                    errors.push(GraphError::at_node(
                        GraphErrorKind::LinearityViolation,
                        &node.id,
                        format!("{vq} consumed twice"),
                    ));
                }
                (VqRole::None | VqRole::Measure, _) => {}
            }
        }

        let ch_role = node.op.signature().ch_role;
        for ch in &node.chs {
            let Some(state) = ch_state.get_mut(ch.as_str()) else {
                continue;
            };
            match (ch_role, *state) {
                (ChRole::Produce, LinState::NotProduced) => *state = LinState::Live,
                (ChRole::Produce, _) => errors.push(GraphError::at_node(
                    GraphErrorKind::LinearityViolation,
                    &node.id,
                    format!("{ch} has more than one producing node"),
                )),
                (ChRole::Use, LinState::Live) => {}
                (ChRole::Consume, LinState::Live) => *state = LinState::Dead,
                (ChRole::Use | ChRole::Consume, LinState::NotProduced) => {
                    errors.push(GraphError::at_node(
                        GraphErrorKind::LinearityViolation,
                        &node.id,
                        format!("{ch} used before production"),
                    ));
                }
                (ChRole::Use | ChRole::Consume, LinState::Dead) => {
                    errors.push(GraphError::at_node(
                        GraphErrorKind::LinearityViolation,
                        &node.id,
                        format!("{ch} used after close"),
                    ));
                }
                (ChRole::None, _) => {}
            }
        }
    }

    // Report leaks in declaration order so error output is deterministic.
    for vq in &graph.vqs {
        match vq_state.get(vq.as_str()) {
            Some(LinState::Live) => errors.push(GraphError::new(
                GraphErrorKind::LifetimeLeak,
                format!("VQ {vq} is never terminated"),
            )),
            Some(LinState::NotProduced) => errors.push(GraphError::new(
                GraphErrorKind::LifetimeLeak,
                format!("VQ {vq} is declared but never produced"),
            )),
            _ => {}
        }
    }
    for ch in &graph.chs {
        match ch_state.get(ch.as_str()) {
            Some(LinState::Live) => errors.push(GraphError::new(
                GraphErrorKind::LifetimeLeak,
                format!("CH {ch} is never closed"),
            )),
            Some(LinState::NotProduced) => errors.push(GraphError::new(
                GraphErrorKind::LifetimeLeak,
                format!("CH {ch} is declared but never produced"),
            )),
            _ => {}
        }
    }
}

/// Event production, input ordering (the acyclicity check over derived
/// dependency edges), and guard validity.
fn check_events(graph: &QvmGraph, errors: &mut Vec<GraphError>) {
    let mut produced_at: HashMap<&str, usize> = HashMap::new();
    for (idx, node) in graph.nodes.iter().enumerate() {
        for ev in &node.produces {
            if produced_at.insert(ev.as_str(), idx).is_some() {
                errors.push(GraphError::at_node(
                    GraphErrorKind::TypeMismatch,
                    &node.id,
                    format!("event {ev} produced more than once"),
                ));
            }
        }
    }

    for (idx, node) in graph.nodes.iter().enumerate() {
        for ev in &node.inputs {
            match produced_at.get(ev.as_str()) {
                None => errors.push(GraphError::at_node(
                    GraphErrorKind::GuardInvalid,
                    &node.id,
                    format!("input event {ev} is not produced by any node"),
                )),
                // A dependency on a later node is a back-edge in schedule order.
                Some(&p) if p >= idx => errors.push(GraphError::at_node(
                    GraphErrorKind::DagCyclic,
                    &node.id,
                    format!("input event {ev} depends on a later node"),
                )),
                Some(_) => {}
            }
        }
        if let Some(guard) = &node.guard {
            match produced_at.get(guard.event.as_str()) {
                None => errors.push(GraphError::at_node(
                    GraphErrorKind::GuardInvalid,
                    &node.id,
                    format!("guard event {} is not produced by any node", guard.event),
                )),
                Some(&p) if p >= idx => errors.push(GraphError::at_node(
                    GraphErrorKind::GuardInvalid,
                    &node.id,
                    format!("guard event {} does not precede the guarded node", guard.event),
                )),
                Some(_) => {}
            }
        }
    }
}

fn check_capability_coverage(graph: &QvmGraph, errors: &mut Vec<GraphError>) {
    for node in &graph.nodes {
        let missing = node.required_rights().difference(&graph.caps);
        if !missing.is_empty() {
            errors.push(GraphError::at_node(
                GraphErrorKind::CapMissing,
                &node.id,
                format!("requires {missing} not declared by the graph"),
            ));
        }
    }
}

/// Graph-level entanglement-firewall pre-check. Every VQ a two-qubit
/// operation touches must originate from an allocation chain inside this
/// graph; cross-tenant pre-binding is impossible to express here, so the
/// runtime check only has to police channel-mediated pairs.
fn check_firewall_prebinding(graph: &QvmGraph, errors: &mut Vec<GraphError>) {
    let produced: HashSet<&str> = graph
        .nodes
        .iter()
        .filter(|n| matches!(n.op.signature().vq_role, VqRole::Produce))
        .flat_map(|n| n.vqs.iter().map(String::as_str))
        .collect();
    for node in graph.nodes.iter().filter(|n| n.op.is_two_qubit()) {
        for vq in &node.vqs {
            if !produced.contains(vq.as_str()) {
                errors.push(GraphError::at_node(
                    GraphErrorKind::LinearityViolation,
                    &node.id,
                    format!("two-qubit operand {vq} has no in-graph allocation"),
                ));
            }
        }
    }
}
