//! QVM graph model
//!
//! The in-memory form of a submitted program: sum-typed opcodes, declared
//! resource sets, guards, and per-node operand lists. Graphs are immutable
//! after parsing; the content hash taken here is what certification binds to.
//!
//! Parsing performs the schema-shape half of verification: anything that is
//! not structurally a graph never reaches the verifier.

use crate::determinism::ContentHash;
use crate::error::{GraphError, GraphErrorKind};
use crate::rights::{Right, RightSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Graph format versions this kernel accepts.
pub const ACCEPTED_VERSIONS: &[&str] = &["0.1"];

/// Operation codes, one variant per wire opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    AllocLq,
    FreeLq,
    FenceEpoch,
    BarRegion,
    ApplyH,
    ApplyS,
    ApplyX,
    ApplyY,
    ApplyZ,
    ApplyCnot,
    Reset,
    MeasureZ,
    MeasureX,
    MeasureY,
    MeasureAngle,
    MeasureBell,
    TeleportCnot,
    InjectTState,
    OpenChan,
    UseChan,
    CloseChan,
    CondPauli,
    SetPolicy,
}

impl Opcode {
    pub const ALL: [Opcode; 23] = [
        Opcode::AllocLq,
        Opcode::FreeLq,
        Opcode::FenceEpoch,
        Opcode::BarRegion,
        Opcode::ApplyH,
        Opcode::ApplyS,
        Opcode::ApplyX,
        Opcode::ApplyY,
        Opcode::ApplyZ,
        Opcode::ApplyCnot,
        Opcode::Reset,
        Opcode::MeasureZ,
        Opcode::MeasureX,
        Opcode::MeasureY,
        Opcode::MeasureAngle,
        Opcode::MeasureBell,
        Opcode::TeleportCnot,
        Opcode::InjectTState,
        Opcode::OpenChan,
        Opcode::UseChan,
        Opcode::CloseChan,
        Opcode::CondPauli,
        Opcode::SetPolicy,
    ];

    /// Wire name.
    pub fn name(self) -> &'static str {
        match self {
            Opcode::AllocLq => "ALLOC_LQ",
            Opcode::FreeLq => "FREE_LQ",
            Opcode::FenceEpoch => "FENCE_EPOCH",
            Opcode::BarRegion => "BAR_REGION",
            Opcode::ApplyH => "APPLY_H",
            Opcode::ApplyS => "APPLY_S",
            Opcode::ApplyX => "APPLY_X",
            Opcode::ApplyY => "APPLY_Y",
            Opcode::ApplyZ => "APPLY_Z",
            Opcode::ApplyCnot => "APPLY_CNOT",
            Opcode::Reset => "RESET",
            Opcode::MeasureZ => "MEASURE_Z",
            Opcode::MeasureX => "MEASURE_X",
            Opcode::MeasureY => "MEASURE_Y",
            Opcode::MeasureAngle => "MEASURE_ANGLE",
            Opcode::MeasureBell => "MEASURE_BELL",
            Opcode::TeleportCnot => "TELEPORT_CNOT",
            Opcode::InjectTState => "INJECT_T_STATE",
            Opcode::OpenChan => "OPEN_CHAN",
            Opcode::UseChan => "USE_CHAN",
            Opcode::CloseChan => "CLOSE_CHAN",
            Opcode::CondPauli => "COND_PAULI",
            Opcode::SetPolicy => "SET_POLICY",
        }
    }

    pub fn parse(name: &str) -> Option<Opcode> {
        Opcode::ALL.iter().copied().find(|op| op.name() == name)
    }

    /// Reversible operations: a synthesized inverse exists.
    pub fn is_reversible(self) -> bool {
        matches!(
            self,
            Opcode::ApplyH
                | Opcode::ApplyS
                | Opcode::ApplyX
                | Opcode::ApplyY
                | Opcode::ApplyZ
                | Opcode::ApplyCnot
                | Opcode::FenceEpoch
                | Opcode::BarRegion
                | Opcode::CondPauli
        )
    }

    pub fn is_measurement(self) -> bool {
        matches!(
            self,
            Opcode::MeasureZ
                | Opcode::MeasureX
                | Opcode::MeasureY
                | Opcode::MeasureAngle
                | Opcode::MeasureBell
        )
    }

    /// Operations that interact two qubits and are therefore subject to the
    /// entanglement firewall.
    pub fn is_two_qubit(self) -> bool {
        matches!(
            self,
            Opcode::ApplyCnot | Opcode::MeasureBell | Opcode::TeleportCnot
        )
    }

    /// Right the opcode demands even when the node declares none.
    pub fn implicit_right(self) -> Option<Right> {
        match self {
            Opcode::AllocLq | Opcode::FreeLq => Some(Right::Alloc),
            Opcode::TeleportCnot => Some(Right::Teleport),
            Opcode::InjectTState => Some(Right::Magic),
            Opcode::OpenChan | Opcode::UseChan | Opcode::CloseChan => Some(Right::Link),
            Opcode::SetPolicy => Some(Right::Admin),
            op if op.is_measurement() => Some(Right::Measure),
            _ => None,
        }
    }

    /// Operand signature table.
    pub fn signature(self) -> OpSignature {
        use Arity::*;
        let sig = OpSignature::default();
        match self {
            Opcode::AllocLq => OpSignature {
                vqs: AtLeast(1),
                vq_role: VqRole::Produce,
                ..sig
            },
            Opcode::FreeLq => OpSignature {
                vqs: AtLeast(1),
                vq_role: VqRole::Consume,
                ..sig
            },
            Opcode::FenceEpoch | Opcode::BarRegion | Opcode::SetPolicy => sig,
            Opcode::ApplyH | Opcode::ApplyS | Opcode::ApplyX | Opcode::ApplyY | Opcode::ApplyZ => {
                OpSignature {
                    vqs: Exactly(1),
                    vq_role: VqRole::Use,
                    ..sig
                }
            }
            Opcode::ApplyCnot => OpSignature {
                vqs: Exactly(2),
                vq_role: VqRole::Use,
                ..sig
            },
            Opcode::Reset => OpSignature {
                vqs: Exactly(1),
                vq_role: VqRole::Consume,
                ..sig
            },
            Opcode::MeasureZ | Opcode::MeasureX | Opcode::MeasureY => OpSignature {
                vqs: Exactly(1),
                vq_role: VqRole::Measure,
                produces: Exactly(1),
                ..sig
            },
            Opcode::MeasureAngle => OpSignature {
                vqs: Exactly(1),
                vq_role: VqRole::Measure,
                produces: Exactly(1),
                needs_angle: true,
                ..sig
            },
            Opcode::MeasureBell => OpSignature {
                vqs: Exactly(2),
                vq_role: VqRole::Measure,
                produces: Exactly(2),
                ..sig
            },
            Opcode::TeleportCnot => OpSignature {
                vqs: Exactly(2),
                vq_role: VqRole::Use,
                chs: UpTo(1),
                ch_role: ChRole::Use,
                ..sig
            },
            Opcode::InjectTState => OpSignature {
                vqs: Exactly(1),
                vq_role: VqRole::Produce,
                ..sig
            },
            Opcode::OpenChan => OpSignature {
                vqs: Exactly(2),
                vq_role: VqRole::Use,
                chs: Exactly(1),
                ch_role: ChRole::Produce,
                ..sig
            },
            Opcode::UseChan => OpSignature {
                vqs: UpTo(1),
                vq_role: VqRole::Consume,
                chs: Exactly(1),
                ch_role: ChRole::Use,
                ..sig
            },
            Opcode::CloseChan => OpSignature {
                chs: Exactly(1),
                ch_role: ChRole::Consume,
                ..sig
            },
            Opcode::CondPauli => OpSignature {
                vqs: Exactly(1),
                vq_role: VqRole::Use,
                inputs: Exactly(1),
                needs_mask: true,
                ..sig
            },
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Operand count constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exactly(usize),
    AtLeast(usize),
    UpTo(usize),
}

impl Arity {
    pub fn admits(self, n: usize) -> bool {
        match self {
            Arity::Exactly(k) => n == k,
            Arity::AtLeast(k) => n >= k,
            Arity::UpTo(k) => n <= k,
        }
    }
}

impl std::fmt::Display for Arity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arity::Exactly(k) => write!(f, "exactly {k}"),
            Arity::AtLeast(k) => write!(f, "at least {k}"),
            Arity::UpTo(k) => write!(f, "at most {k}"),
        }
    }
}

/// How a node treats its VQ operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VqRole {
    /// No VQ operands.
    None,
    /// Brings the listed VQs into existence.
    Produce,
    /// Consumes the current version and produces the next.
    Use,
    /// Terminates the handle.
    Consume,
    /// `Use` unless `args.destructive`, then `Consume`.
    Measure,
}

/// How a node treats its CH operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChRole {
    None,
    Produce,
    Use,
    Consume,
}

/// Expected operand shape for one opcode.
#[derive(Debug, Clone, Copy)]
pub struct OpSignature {
    pub vqs: Arity,
    pub chs: Arity,
    pub inputs: Arity,
    pub produces: Arity,
    pub vq_role: VqRole,
    pub ch_role: ChRole,
    pub needs_angle: bool,
    pub needs_mask: bool,
}

impl Default for OpSignature {
    fn default() -> Self {
        Self {
            vqs: Arity::Exactly(0),
            chs: Arity::Exactly(0),
            inputs: Arity::Exactly(0),
            produces: Arity::Exactly(0),
            vq_role: VqRole::None,
            ch_role: ChRole::None,
            needs_angle: false,
            needs_mask: false,
        }
    }
}

/// Conditional execution predicate: run the node iff `event == equals`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guard {
    pub event: String,
    pub equals: u8,
}

/// Typed, opcode-specific arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeArgs {
    pub profile: Option<String>,
    pub angle: Option<f64>,
    pub destructive: Option<bool>,
    pub mask: Option<String>,
    pub label: Option<String>,
    pub fidelity: Option<f64>,
    pub max_entanglements: Option<u32>,
    pub channel: Option<String>,
    pub policy: Option<Value>,
}

/// One operation in the program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub op: Opcode,
    pub args: NodeArgs,
    pub vqs: Vec<String>,
    pub chs: Vec<String>,
    pub inputs: Vec<String>,
    pub produces: Vec<String>,
    pub caps: RightSet,
    pub guard: Option<Guard>,
}

impl Node {
    /// Declared plus opcode-implicit rights.
    pub fn required_rights(&self) -> RightSet {
        let mut rights = self.caps.clone();
        if let Some(implicit) = self.op.implicit_right() {
            rights.insert(implicit);
        }
        rights
    }

    /// Whether a measurement node terminates its VQs.
    pub fn destructive(&self) -> bool {
        self.args.destructive.unwrap_or(false)
    }

    /// Effective disposition of the node's VQ operands.
    pub fn vq_role(&self) -> VqRole {
        match self.op.signature().vq_role {
            VqRole::Measure if self.destructive() => VqRole::Consume,
            VqRole::Measure => VqRole::Use,
            role => role,
        }
    }
}

/// A parsed, immutable QVM program.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QvmGraph {
    pub version: String,
    pub nodes: Vec<Node>,
    pub vqs: Vec<String>,
    pub chs: Vec<String>,
    pub events: Vec<String>,
    pub caps: RightSet,
    #[serde(skip)]
    content_hash: [u8; 32],
}

impl QvmGraph {
    /// Parse from JSON text. Malformed JSON is a `TYPE_MISMATCH` shape error.
    pub fn from_json(text: &str) -> Result<QvmGraph, GraphError> {
        let value: Value = serde_json::from_str(text).map_err(|e| {
            GraphError::new(GraphErrorKind::TypeMismatch, format!("malformed JSON: {e}"))
        })?;
        Self::from_value(&value)
    }

    /// Parse from a decoded JSON value, performing all schema-shape checks.
    pub fn from_value(value: &Value) -> Result<QvmGraph, GraphError> {
        let obj = value.as_object().ok_or_else(|| {
            GraphError::new(GraphErrorKind::TypeMismatch, "graph must be an object")
        })?;

        let version = obj
            .get("version")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                GraphError::new(GraphErrorKind::TypeMismatch, "missing string field: version")
            })?
            .to_string();
        if !ACCEPTED_VERSIONS.contains(&version.as_str()) {
            return Err(GraphError::new(
                GraphErrorKind::TypeMismatch,
                format!("unsupported graph version: {version}"),
            ));
        }

        let nodes_value = obj.get("program").and_then(|p| p.get("nodes"));
        let raw_nodes = match nodes_value {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(GraphError::new(
                    GraphErrorKind::NodesNotList,
                    "program.nodes must be a list",
                ));
            }
        };

        let resources = obj.get("resources").and_then(Value::as_object);
        let vqs = string_set(resources.and_then(|r| r.get("vqs")), "resources.vqs")?;
        let chs = string_set(resources.and_then(|r| r.get("chs")), "resources.chs")?;
        let events = string_set(resources.and_then(|r| r.get("events")), "resources.events")?;

        let caps = match obj.get("caps") {
            None => RightSet::empty(),
            Some(Value::Array(items)) => {
                let names = items
                    .iter()
                    .map(|v| {
                        v.as_str().ok_or_else(|| {
                            GraphError::new(GraphErrorKind::TypeMismatch, "caps entries must be strings")
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                RightSet::parse_names(names).map_err(|name| {
                    GraphError::new(
                        GraphErrorKind::CapMissing,
                        format!("unknown capability name: {name}"),
                    )
                })?
            }
            Some(_) => {
                return Err(GraphError::new(GraphErrorKind::TypeMismatch, "caps must be a list"));
            }
        };

        let mut nodes = Vec::with_capacity(raw_nodes.len());
        for raw in raw_nodes {
            nodes.push(parse_node(raw)?);
        }

        // serde_json maps are ordered; re-serialization is the canonical form.
        let canonical = serde_json::to_vec(value)
            .map_err(|e| GraphError::new(GraphErrorKind::TypeMismatch, e.to_string()))?;
        let content_hash = ContentHash::digest(&canonical);

        Ok(QvmGraph {
            version,
            nodes,
            vqs,
            chs,
            events,
            caps,
            content_hash,
        })
    }

    /// SHA3-256 over the canonical serialization; certification binds to it.
    pub fn content_hash(&self) -> [u8; 32] {
        self.content_hash
    }

    pub fn node_by_id(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

fn string_set(value: Option<&Value>, field: &str) -> Result<Vec<String>, GraphError> {
    let items = match value {
        None => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(_) => {
            return Err(GraphError::new(
                GraphErrorKind::TypeMismatch,
                format!("{field} must be a list"),
            ));
        }
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let name = item.as_str().ok_or_else(|| {
            GraphError::new(
                GraphErrorKind::TypeMismatch,
                format!("{field} entries must be strings"),
            )
        })?;
        if out.iter().any(|existing: &String| existing == name) {
            return Err(GraphError::new(
                GraphErrorKind::TypeMismatch,
                format!("{field} declares {name} twice"),
            ));
        }
        out.push(name.to_string());
    }
    Ok(out)
}

fn string_list(node: &str, value: Option<&Value>, field: &str) -> Result<Vec<String>, GraphError> {
    match value {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    GraphError::at_node(
                        GraphErrorKind::TypeMismatch,
                        node,
                        format!("{field} entries must be strings"),
                    )
                })
            })
            .collect(),
        Some(_) => Err(GraphError::at_node(
            GraphErrorKind::TypeMismatch,
            node,
            format!("{field} must be a list"),
        )),
    }
}

fn parse_node(raw: &Value) -> Result<Node, GraphError> {
    let obj = raw.as_object().ok_or_else(|| {
        GraphError::new(GraphErrorKind::TypeMismatch, "node must be an object")
    })?;
    let id = obj
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            GraphError::new(GraphErrorKind::TypeMismatch, "node missing string field: id")
        })?
        .to_string();
    let op_name = obj.get("op").and_then(Value::as_str).ok_or_else(|| {
        GraphError::at_node(GraphErrorKind::TypeMismatch, &id, "missing string field: op")
    })?;
    let op = Opcode::parse(op_name).ok_or_else(|| {
        GraphError::at_node(
            GraphErrorKind::TypeMismatch,
            &id,
            format!("unknown opcode: {op_name}"),
        )
    })?;

    let args = parse_args(&id, obj.get("args"))?;
    let vqs = string_list(&id, obj.get("vqs"), "vqs")?;
    let chs = string_list(&id, obj.get("chs"), "chs")?;
    let inputs = string_list(&id, obj.get("inputs"), "inputs")?;
    let produces = string_list(&id, obj.get("produces"), "produces")?;

    let caps = match obj.get("caps") {
        None => RightSet::empty(),
        Some(Value::Array(items)) => {
            let names = items
                .iter()
                .map(|v| {
                    v.as_str().ok_or_else(|| {
                        GraphError::at_node(
                            GraphErrorKind::TypeMismatch,
                            &id,
                            "caps entries must be strings",
                        )
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            RightSet::parse_names(names).map_err(|name| {
                GraphError::at_node(
                    GraphErrorKind::CapMissing,
                    &id,
                    format!("unknown capability name: {name}"),
                )
            })?
        }
        Some(_) => {
            return Err(GraphError::at_node(
                GraphErrorKind::TypeMismatch,
                &id,
                "caps must be a list",
            ));
        }
    };

    let guard = match obj.get("guard") {
        None => None,
        Some(Value::Object(g)) => {
            let event = g.get("event").and_then(Value::as_str).ok_or_else(|| {
                GraphError::at_node(GraphErrorKind::GuardInvalid, &id, "guard missing event")
            })?;
            let equals = g.get("equals").and_then(Value::as_u64);
            match equals {
                Some(v @ (0 | 1)) => Some(Guard {
                    event: event.to_string(),
                    equals: v as u8,
                }),
                _ => {
                    return Err(GraphError::at_node(
                        GraphErrorKind::GuardInvalid,
                        &id,
                        "guard.equals must be 0 or 1",
                    ));
                }
            }
        }
        Some(_) => {
            return Err(GraphError::at_node(
                GraphErrorKind::GuardInvalid,
                &id,
                "guard must be an object",
            ));
        }
    };

    Ok(Node {
        id,
        op,
        args,
        vqs,
        chs,
        inputs,
        produces,
        caps,
        guard,
    })
}

fn parse_args(node: &str, value: Option<&Value>) -> Result<NodeArgs, GraphError> {
    let obj = match value {
        None => return Ok(NodeArgs::default()),
        Some(Value::Object(obj)) => obj,
        Some(_) => {
            return Err(GraphError::at_node(
                GraphErrorKind::TypeMismatch,
                node,
                "args must be an object",
            ));
        }
    };

    let type_err = |field: &str, want: &str| {
        GraphError::at_node(
            GraphErrorKind::TypeMismatch,
            node,
            format!("args.{field} must be {want}"),
        )
    };

    let mut args = NodeArgs::default();
    for (key, v) in obj {
        match key.as_str() {
            "profile" => {
                args.profile = Some(v.as_str().ok_or_else(|| type_err("profile", "a string"))?.into());
            }
            "angle" => {
                args.angle = Some(v.as_f64().ok_or_else(|| type_err("angle", "a number"))?);
            }
            "destructive" => {
                args.destructive =
                    Some(v.as_bool().ok_or_else(|| type_err("destructive", "a boolean"))?);
            }
            "mask" => {
                args.mask = Some(v.as_str().ok_or_else(|| type_err("mask", "a string"))?.into());
            }
            "label" => {
                args.label = Some(v.as_str().ok_or_else(|| type_err("label", "a string"))?.into());
            }
            "fidelity" => {
                args.fidelity = Some(v.as_f64().ok_or_else(|| type_err("fidelity", "a number"))?);
            }
            "max_entanglements" => {
                let n = v
                    .as_u64()
                    .ok_or_else(|| type_err("max_entanglements", "a non-negative integer"))?;
                args.max_entanglements = Some(n as u32);
            }
            "channel" => {
                args.channel = Some(v.as_str().ok_or_else(|| type_err("channel", "a string"))?.into());
            }
            "policy" => {
                if !v.is_object() {
                    return Err(type_err("policy", "an object"));
                }
                args.policy = Some(v.clone());
            }
            // Unknown argument keys are tolerated for forward compatibility.
            _ => {}
        }
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bell_value() -> Value {
        json!({
            "version": "0.1",
            "program": {
                "nodes": [
                    {"id": "alloc", "op": "ALLOC_LQ", "vqs": ["q0", "q1"]},
                    {"id": "h0", "op": "APPLY_H", "vqs": ["q0"]},
                    {"id": "cx", "op": "APPLY_CNOT", "vqs": ["q0", "q1"]},
                    {"id": "m0", "op": "MEASURE_Z", "vqs": ["q0"], "produces": ["m0"]},
                    {"id": "m1", "op": "MEASURE_Z", "vqs": ["q1"], "produces": ["m1"]},
                    {"id": "free", "op": "FREE_LQ", "vqs": ["q0", "q1"]}
                ]
            },
            "resources": {"vqs": ["q0", "q1"], "events": ["m0", "m1"]},
            "caps": ["CAP_ALLOC", "CAP_MEASURE"]
        })
    }

    #[test]
    fn parses_a_well_formed_graph() {
        let graph = QvmGraph::from_value(&bell_value()).unwrap();
        assert_eq!(graph.nodes.len(), 6);
        assert_eq!(graph.nodes[0].op, Opcode::AllocLq);
        assert!(graph.caps.contains(Right::Measure));
        assert_eq!(graph.vqs, vec!["q0", "q1"]);
    }

    #[test]
    fn content_hash_is_stable_across_parses() {
        let a = QvmGraph::from_value(&bell_value()).unwrap();
        let b = QvmGraph::from_value(&bell_value()).unwrap();
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn nodes_must_be_a_list() {
        let bad = json!({"version": "0.1", "program": {"nodes": "nope"}, "resources": {}});
        let err = QvmGraph::from_value(&bad).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::NodesNotList);

        let missing = json!({"version": "0.1", "resources": {}});
        let err = QvmGraph::from_value(&missing).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::NodesNotList);
    }

    #[test]
    fn unknown_opcode_is_type_mismatch() {
        let bad = json!({
            "version": "0.1",
            "program": {"nodes": [{"id": "n", "op": "WARP_DRIVE"}]},
            "resources": {}
        });
        let err = QvmGraph::from_value(&bad).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::TypeMismatch);
        assert_eq!(err.node.as_deref(), Some("n"));
    }

    #[test]
    fn unknown_capability_name_is_rejected() {
        let bad = json!({
            "version": "0.1",
            "program": {"nodes": []},
            "resources": {},
            "caps": ["CAP_ALLOC", "CAP_FROBNICATE"]
        });
        let err = QvmGraph::from_value(&bad).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::CapMissing);
    }

    #[test]
    fn duplicate_resource_declaration_is_rejected() {
        let bad = json!({
            "version": "0.1",
            "program": {"nodes": []},
            "resources": {"vqs": ["q0", "q0"]}
        });
        let err = QvmGraph::from_value(&bad).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::TypeMismatch);
    }

    #[test]
    fn guard_equals_must_be_binary() {
        let bad = json!({
            "version": "0.1",
            "program": {"nodes": [
                {"id": "n", "op": "APPLY_X", "vqs": ["q0"], "guard": {"event": "m", "equals": 2}}
            ]},
            "resources": {"vqs": ["q0"], "events": ["m"]}
        });
        let err = QvmGraph::from_value(&bad).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::GuardInvalid);
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let bad = json!({"version": "9.9", "program": {"nodes": []}, "resources": {}});
        let err = QvmGraph::from_value(&bad).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::TypeMismatch);
    }

    #[test]
    fn measurement_nodes_know_their_disposition() {
        let graph = QvmGraph::from_value(&json!({
            "version": "0.1",
            "program": {"nodes": [
                {"id": "m", "op": "MEASURE_Z", "vqs": ["q0"], "produces": ["b"],
                 "args": {"destructive": true}}
            ]},
            "resources": {"vqs": ["q0"], "events": ["b"]}
        }))
        .unwrap();
        assert_eq!(graph.nodes[0].vq_role(), VqRole::Consume);
        assert!(graph.nodes[0].required_rights().contains(Right::Measure));
    }
}
