//! Device backend interface
//!
//! The executor drives logical qubits through this trait and never looks
//! behind it: measurement outcomes are opaque bits, snapshots are opaque
//! bytes, and the physics (or the QEC stack of a real device) stays on the
//! far side. Backend calls are suspension points, so the surface is async.
//!
//! The crate ships one backend, the deterministic state-vector simulator in
//! [`sim`].

pub mod sim;

use async_trait::async_trait;
use qmk_core::{DeterministicRng, KernelError, TenantId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use sim::StateVectorBackend;

/// A physical (device-side) logical qubit slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhysQubit(pub u32);

/// A device-side entanglement link between two qubit slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkId(pub u64);

/// Single-qubit gates the backend must support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gate {
    H,
    S,
    X,
    Y,
    Z,
    T,
}

/// Measurement basis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Basis {
    Z,
    X,
    Y,
    /// Equatorial basis at the given angle from X.
    Angle(f64),
}

/// Backend failures, surfaced to jobs as `DEVICE_FAILURE`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DeviceError {
    #[error("device capacity exhausted")]
    CapacityExhausted,

    #[error("unknown qubit slot {0}")]
    UnknownQubit(u32),

    #[error("unknown link {0}")]
    UnknownLink(u64),

    #[error("snapshot rejected: {0}")]
    BadSnapshot(String),

    #[error("backend fault: {0}")]
    Fault(String),
}

pub type DeviceResult<T> = Result<T, DeviceError>;

impl From<DeviceError> for KernelError {
    fn from(err: DeviceError) -> Self {
        KernelError::Device(err.to_string())
    }
}

/// Opaque device snapshot, restorable on the backend that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot(pub Vec<u8>);

impl DeviceSnapshot {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Device-side counters, merged into kernel telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTelemetry {
    pub allocations: u64,
    pub releases: u64,
    pub gates_applied: u64,
    pub measurements: u64,
    pub links_opened: u64,
    pub links_used: u64,
}

/// Operations the executor invokes on a device.
///
/// Measurement draws come from the per-job RNG the caller passes in; a
/// backend must not consult any other entropy source, or determinism breaks.
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    /// Allocate a logical qubit in `|0⟩` under the named QEC profile.
    async fn allocate(&self, owner: &TenantId, profile: &str) -> DeviceResult<PhysQubit>;

    /// Return a qubit to the pool. The backend forces it back to `|0⟩`.
    async fn release(&self, qubit: PhysQubit) -> DeviceResult<()>;

    async fn apply(&self, gate: Gate, qubit: PhysQubit) -> DeviceResult<()>;

    async fn apply_cnot(&self, control: PhysQubit, target: PhysQubit) -> DeviceResult<()>;

    /// Measure one qubit, collapsing it. Returns the classical bit.
    async fn measure(
        &self,
        qubit: PhysQubit,
        basis: Basis,
        rng: &mut DeterministicRng,
    ) -> DeviceResult<u8>;

    /// Bell-basis measurement of a pair: (phase bit, parity bit).
    async fn measure_bell(
        &self,
        a: PhysQubit,
        b: PhysQubit,
        rng: &mut DeterministicRng,
    ) -> DeviceResult<(u8, u8)>;

    /// Prepare a magic (T) state on a fresh qubit.
    async fn inject_magic(&self, qubit: PhysQubit) -> DeviceResult<()>;

    /// Entangle two qubits as a channel endpoint pair.
    async fn open_link(&self, a: PhysQubit, b: PhysQubit) -> DeviceResult<LinkId>;

    /// Consume one entanglement from a link.
    async fn use_link(&self, link: LinkId) -> DeviceResult<()>;

    async fn close_link(&self, link: LinkId) -> DeviceResult<()>;

    /// Tenant that owns a slot; the runtime firewall consults this.
    async fn owner_of(&self, qubit: PhysQubit) -> DeviceResult<TenantId>;

    /// Per-handle indicator state over the given qubits. Two calls agree iff
    /// the observable state of those qubits agrees; uncompute verification
    /// compares indicators across a rollback.
    async fn indicator(&self, qubits: &[PhysQubit]) -> DeviceResult<u64>;

    async fn snapshot(&self) -> DeviceResult<DeviceSnapshot>;

    async fn restore(&self, snapshot: &DeviceSnapshot) -> DeviceResult<()>;

    fn telemetry(&self) -> DeviceTelemetry;
}
