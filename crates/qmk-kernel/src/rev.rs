//! REV analyzer & uncomputer
//!
//! Finds the maximal run of already-executed reversible nodes behind a
//! program position, synthesizes the inverse sequence, and replays it through
//! the backend. A rollback only counts if the device's per-handle indicator
//! state returns to what it was at the segment's lower boundary; anything
//! else is `UNCOMPUTE_FAILURE`.

use qmk_core::{KernelError, QvmGraph, Result};
use qmk_device::{DeviceBackend, Gate, PhysQubit};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// A maximal reversible segment: ascending indices of executed nodes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RevSegment {
    pub nodes: Vec<usize>,
}

impl RevSegment {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}

/// One inverse operation to replay on the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum InverseStep {
    /// Apply `gate` to `vq`, `times` in a row (S-dagger is S three times).
    Apply { gate: Gate, vq: String, times: u8 },
    Cnot { control: String, target: String },
    /// Reapply the conditional Pauli with the recorded event value.
    CondPauli { mask: String, vq: String, event: String },
}

/// Walk backward through the executed (non-skipped) nodes and collect the
/// reversible run since the last irreversible boundary.
pub fn current_segment(graph: &QvmGraph, executed: &[usize]) -> RevSegment {
    let mut nodes = Vec::new();
    for &idx in executed.iter().rev() {
        let node = &graph.nodes[idx];
        if node.op.is_reversible() {
            nodes.push(idx);
        } else {
            break;
        }
    }
    nodes.reverse();
    RevSegment { nodes }
}

/// Synthesize the inverse sequence for a segment, in application order
/// (i.e. the segment reversed, each node inverted).
pub fn synthesize_inverse(graph: &QvmGraph, segment: &RevSegment) -> Vec<InverseStep> {
    use qmk_core::Opcode;
    let mut steps = Vec::new();
    for &idx in segment.nodes.iter().rev() {
        let node = &graph.nodes[idx];
        match node.op {
            Opcode::ApplyH => steps.push(InverseStep::Apply {
                gate: Gate::H,
                vq: node.vqs[0].clone(),
                times: 1,
            }),
            Opcode::ApplyX => steps.push(InverseStep::Apply {
                gate: Gate::X,
                vq: node.vqs[0].clone(),
                times: 1,
            }),
            Opcode::ApplyY => steps.push(InverseStep::Apply {
                gate: Gate::Y,
                vq: node.vqs[0].clone(),
                times: 1,
            }),
            Opcode::ApplyZ => steps.push(InverseStep::Apply {
                gate: Gate::Z,
                vq: node.vqs[0].clone(),
                times: 1,
            }),
            // S is not self-inverse; three more applications close the cycle.
            Opcode::ApplyS => steps.push(InverseStep::Apply {
                gate: Gate::S,
                vq: node.vqs[0].clone(),
                times: 3,
            }),
            Opcode::ApplyCnot => steps.push(InverseStep::Cnot {
                control: node.vqs[0].clone(),
                target: node.vqs[1].clone(),
            }),
            Opcode::CondPauli => steps.push(InverseStep::CondPauli {
                mask: node.args.mask.clone().unwrap_or_else(|| "X".into()),
                vq: node.vqs[0].clone(),
                event: node.inputs[0].clone(),
            }),
            // Fences and barriers invert to nothing.
            Opcode::FenceEpoch | Opcode::BarRegion => {}
            // The verifier keeps irreversible opcodes out of segments.
            _ => {}
        }
    }
    steps
}

/// Estimated rollback cost: the number of inverse gate applications.
pub fn uncompute_cost(steps: &[InverseStep]) -> usize {
    steps
        .iter()
        .map(|step| match step {
            InverseStep::Apply { times, .. } => *times as usize,
            InverseStep::Cnot { .. } | InverseStep::CondPauli { .. } => 1,
        })
        .sum()
}

/// Replays inverse sequences against a backend and verifies the result.
pub struct Uncomputer<'d> {
    device: &'d dyn DeviceBackend,
}

impl<'d> Uncomputer<'d> {
    pub fn new(device: &'d dyn DeviceBackend) -> Self {
        Self { device }
    }

    /// Apply `steps`, then require the indicator over `touched` to equal
    /// `expected`, the value recorded at the segment's lower boundary.
    pub async fn rollback(
        &self,
        steps: &[InverseStep],
        phys: &HashMap<String, PhysQubit>,
        events: &BTreeMap<String, u8>,
        touched: &[PhysQubit],
        expected: u64,
    ) -> Result<()> {
        let resolve = |name: &str| -> Result<PhysQubit> {
            phys.get(name).copied().ok_or_else(|| {
                KernelError::Uncompute(format!("no physical qubit bound to {name}"))
            })
        };

        for step in steps {
            match step {
                InverseStep::Apply { gate, vq, times } => {
                    let q = resolve(vq)?;
                    for _ in 0..*times {
                        self.device.apply(*gate, q).await?;
                    }
                }
                InverseStep::Cnot { control, target } => {
                    self.device
                        .apply_cnot(resolve(control)?, resolve(target)?)
                        .await?;
                }
                InverseStep::CondPauli { mask, vq, event } => {
                    let value = events.get(event).copied().ok_or_else(|| {
                        KernelError::Uncompute(format!("event {event} was never recorded"))
                    })?;
                    if value == 1 {
                        let gate = match mask.as_str() {
                            "X" => Gate::X,
                            "Y" => Gate::Y,
                            "Z" => Gate::Z,
                            other => {
                                return Err(KernelError::Uncompute(format!(
                                    "unknown Pauli mask {other}"
                                )));
                            }
                        };
                        self.device.apply(gate, resolve(vq)?).await?;
                    }
                }
            }
        }

        let indicator = self.device.indicator(touched).await?;
        if indicator != expected {
            debug!(expected, got = indicator, "uncompute verification mismatch");
            return Err(KernelError::Uncompute(
                "indicator state did not return to the segment boundary".into(),
            ));
        }
        Ok(())
    }
}
