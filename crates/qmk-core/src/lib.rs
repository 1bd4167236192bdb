//! QMK core primitives
//!
//! The graph model, static verifier, and capability machinery shared by the
//! kernel and the device backends. Nothing in this crate touches a device or
//! holds kernel state; it is the certified, deterministic foundation the
//! executor builds on.

pub mod capability;
pub mod determinism;
pub mod error;
pub mod graph;
pub mod handle;
pub mod rights;
pub mod time;
pub mod verify;

pub use capability::{CapabilityStore, CapabilityToken, SigningKey};
pub use determinism::{ContentHash, DeterministicRng};
pub use error::{ErrorCode, GraphError, GraphErrorKind, KernelError, Result};
pub use graph::{Arity, ChRole, Guard, Node, NodeArgs, Opcode, OpSignature, QvmGraph, VqRole};
pub use handle::{
    CapId, ChannelId, CheckpointId, HandleId, HandleIdGen, JobId, SessionId, TenantId,
};
pub use rights::{Right, RightSet};
pub use time::{MonotonicClock, SimulatedClock, SystemClock, Timestamp};
pub use verify::{Certification, CertifiedGraph, Verifier};
