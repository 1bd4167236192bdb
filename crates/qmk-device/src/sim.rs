//! Deterministic state-vector simulator
//!
//! A 12-qubit dense simulator: 4096 complex amplitudes, full gate kernels,
//! Born-rule measurement collapse driven entirely by the caller's RNG. Same
//! seed, same call sequence, same bits — the determinism property the kernel
//! tests lean on.
//!
//! Released qubits are forced back to `|0⟩` by projection (preferring the
//! higher-probability branch), so release needs no entropy.

use crate::{
    Basis, DeviceBackend, DeviceError, DeviceResult, DeviceSnapshot, DeviceTelemetry, Gate,
    LinkId, PhysQubit,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use qmk_core::{DeterministicRng, TenantId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::f32::consts::FRAC_1_SQRT_2;
use std::f32::consts::PI;
use tracing::debug;

/// Number of qubit slots in the simulated substrate.
pub const MAX_QUBITS: usize = 12;

/// State vector size: 2^12.
pub const STATE_SIZE: usize = 1 << MAX_QUBITS;

/// Probability below which a branch is treated as empty.
const EPSILON: f32 = 1e-7;

/// Complex amplitude. Arithmetic goes through the standard operator traits
/// so the gate kernels read as the math they implement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Complex {
    pub re: f32,
    pub im: f32,
}

impl Complex {
    pub const ZERO: Complex = Complex { re: 0.0, im: 0.0 };
    pub const ONE: Complex = Complex { re: 1.0, im: 0.0 };

    pub const fn new(re: f32, im: f32) -> Self {
        Complex { re, im }
    }

    /// Unit phasor `e^{iθ}`.
    pub fn phasor(theta: f32) -> Self {
        Complex::new(theta.cos(), theta.sin())
    }

    /// `|z|²`
    pub fn norm_sq(self) -> f32 {
        self.re.mul_add(self.re, self.im * self.im)
    }
}

impl std::ops::Add for Complex {
    type Output = Complex;

    fn add(self, rhs: Complex) -> Complex {
        Complex::new(self.re + rhs.re, self.im + rhs.im)
    }
}

impl std::ops::Sub for Complex {
    type Output = Complex;

    fn sub(self, rhs: Complex) -> Complex {
        Complex::new(self.re - rhs.re, self.im - rhs.im)
    }
}

impl std::ops::Mul for Complex {
    type Output = Complex;

    fn mul(self, rhs: Complex) -> Complex {
        // (a + bi)(c + di) = (ac - bd) + (ad + bc)i
        Complex::new(
            self.re * rhs.re - self.im * rhs.im,
            self.re * rhs.im + self.im * rhs.re,
        )
    }
}

impl std::ops::Mul<f32> for Complex {
    type Output = Complex;

    fn mul(self, rhs: f32) -> Complex {
        Complex::new(self.re * rhs, self.im * rhs)
    }
}

impl std::ops::Neg for Complex {
    type Output = Complex;

    fn neg(self) -> Complex {
        Complex::new(-self.re, -self.im)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SlotInfo {
    owner: TenantId,
    profile: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct LinkInfo {
    a: PhysQubit,
    b: PhysQubit,
}

/// Serialized form of the simulator state.
#[derive(Debug, Serialize, Deserialize)]
struct SimSnapshot {
    amps: Vec<(f32, f32)>,
    slots: Vec<Option<SlotInfo>>,
    links: Vec<(u64, LinkInfo)>,
    next_link: u64,
}

struct SimState {
    amps: Vec<Complex>,
    slots: Vec<Option<SlotInfo>>,
    links: HashMap<u64, LinkInfo>,
    next_link: u64,
    telemetry: DeviceTelemetry,
}

impl SimState {
    fn new() -> Self {
        let mut amps = vec![Complex::ZERO; STATE_SIZE];
        amps[0] = Complex::ONE;
        Self {
            amps,
            slots: vec![None; MAX_QUBITS],
            links: HashMap::new(),
            next_link: 0,
            telemetry: DeviceTelemetry::default(),
        }
    }

    fn slot(&self, qubit: PhysQubit) -> DeviceResult<usize> {
        let idx = qubit.0 as usize;
        match self.slots.get(idx) {
            Some(Some(_)) => Ok(idx),
            _ => Err(DeviceError::UnknownQubit(qubit.0)),
        }
    }

    fn hadamard(&mut self, q: usize) {
        let step = 1 << q;
        for base in (0..STATE_SIZE).step_by(2 * step) {
            for offset in 0..step {
                let i0 = base + offset;
                let i1 = i0 + step;
                let a0 = self.amps[i0];
                let a1 = self.amps[i1];
                self.amps[i0] = (a0 + a1) * FRAC_1_SQRT_2;
                self.amps[i1] = (a0 - a1) * FRAC_1_SQRT_2;
            }
        }
    }

    fn pauli_x(&mut self, q: usize) {
        let step = 1 << q;
        for base in (0..STATE_SIZE).step_by(2 * step) {
            for offset in 0..step {
                let i0 = base + offset;
                self.amps.swap(i0, i0 + step);
            }
        }
    }

    fn pauli_y(&mut self, q: usize) {
        let step = 1 << q;
        for base in (0..STATE_SIZE).step_by(2 * step) {
            for offset in 0..step {
                let i0 = base + offset;
                let i1 = i0 + step;
                let a0 = self.amps[i0];
                let a1 = self.amps[i1];
                // |0⟩ → i|1⟩, |1⟩ → -i|0⟩
                self.amps[i0] = Complex::new(a1.im, -a1.re);
                self.amps[i1] = Complex::new(-a0.im, a0.re);
            }
        }
    }

    fn pauli_z(&mut self, q: usize) {
        // Sign flip on every |1⟩-branch amplitude.
        for (i, amp) in self.amps.iter_mut().enumerate() {
            if (i >> q) & 1 == 1 {
                *amp = -*amp;
            }
        }
    }

    /// diag(1, e^{iθ}) on one qubit.
    fn phase_rot(&mut self, q: usize, theta: f32) {
        let phase = Complex::phasor(theta);
        for (i, amp) in self.amps.iter_mut().enumerate() {
            if (i >> q) & 1 == 1 {
                *amp = *amp * phase;
            }
        }
    }

    fn s_gate(&mut self, q: usize) {
        self.phase_rot(q, PI / 2.0);
    }

    fn t_gate(&mut self, q: usize) {
        self.phase_rot(q, PI / 4.0);
    }

    fn cnot(&mut self, control: usize, target: usize) {
        // Visit each swap pair exactly once: control set, target still clear.
        for i in 0..STATE_SIZE {
            let control_set = (i >> control) & 1 == 1;
            let target_clear = (i >> target) & 1 == 0;
            if control_set && target_clear {
                self.amps.swap(i, i | (1 << target));
            }
        }
    }

    fn prob_one(&self, q: usize) -> f32 {
        let mut p = 0.0;
        for (i, amp) in self.amps.iter().enumerate() {
            if (i >> q) & 1 == 1 {
                p += amp.norm_sq();
            }
        }
        p
    }

    /// Project qubit `q` onto `outcome` and renormalize.
    fn collapse(&mut self, q: usize, outcome: u8) {
        let mut kept = 0.0f32;
        for (i, amp) in self.amps.iter_mut().enumerate() {
            let bit = ((i >> q) & 1) as u8;
            if bit == outcome {
                kept += amp.norm_sq();
            } else {
                *amp = Complex::ZERO;
            }
        }
        if kept > EPSILON {
            let scale = 1.0 / kept.sqrt();
            for amp in &mut self.amps {
                *amp = *amp * scale;
            }
        }
    }

    fn measure_z(&mut self, q: usize, rng: &mut DeterministicRng) -> u8 {
        let p1 = self.prob_one(q);
        let outcome = if rng.chance(p1 as f64) { 1 } else { 0 };
        self.collapse(q, outcome);
        outcome
    }

    /// Rotate into the requested basis, collapse in Z, rotate back so the
    /// qubit is left in the measured eigenstate.
    fn measure_in(&mut self, q: usize, basis: Basis, rng: &mut DeterministicRng) -> u8 {
        match basis {
            Basis::Z => self.measure_z(q, rng),
            Basis::X => {
                self.hadamard(q);
                let bit = self.measure_z(q, rng);
                self.hadamard(q);
                bit
            }
            Basis::Y => {
                self.phase_rot(q, -PI / 2.0);
                self.hadamard(q);
                let bit = self.measure_z(q, rng);
                self.hadamard(q);
                self.phase_rot(q, PI / 2.0);
                bit
            }
            Basis::Angle(theta) => {
                let theta = theta as f32;
                self.phase_rot(q, -theta);
                self.hadamard(q);
                let bit = self.measure_z(q, rng);
                self.hadamard(q);
                self.phase_rot(q, theta);
                bit
            }
        }
    }

    /// Force a slot back to `|0⟩` without consuming entropy: keep the `|0⟩`
    /// branch when it has any weight, otherwise take `|1⟩` and flip.
    fn force_zero(&mut self, q: usize) {
        let p1 = self.prob_one(q);
        if 1.0 - p1 > EPSILON {
            self.collapse(q, 0);
        } else {
            self.collapse(q, 1);
            self.pauli_x(q);
        }
    }

    /// Marginal-probability fingerprint over a set of qubits.
    fn indicator(&self, qubits: &[usize]) -> u64 {
        let mut hash: u64 = 0x51_4d_4b_00;
        for &q in qubits {
            let quant = (self.prob_one(q) as f64 * 1.0e4).round() as u64;
            hash ^= quant.wrapping_mul(0x9e37_79b9_7f4a_7c15);
            hash = hash.rotate_left(13) ^ (q as u64);
        }
        hash
    }
}

/// The in-process simulated substrate.
pub struct StateVectorBackend {
    state: Mutex<SimState>,
}

impl StateVectorBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::new()),
        }
    }

    /// Full-state fingerprint, used by determinism tests: FNV-1a over the
    /// amplitude bit patterns in order.
    pub fn state_hash(&self) -> u64 {
        const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
        let state = self.state.lock();
        let mut hash = FNV_OFFSET;
        for amp in &state.amps {
            for word in [amp.re.to_bits(), amp.im.to_bits()] {
                for byte in word.to_le_bytes() {
                    hash ^= u64::from(byte);
                    hash = hash.wrapping_mul(FNV_PRIME);
                }
            }
        }
        hash
    }
}

impl Default for StateVectorBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceBackend for StateVectorBackend {
    async fn allocate(&self, owner: &TenantId, profile: &str) -> DeviceResult<PhysQubit> {
        let mut state = self.state.lock();
        let idx = state
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(DeviceError::CapacityExhausted)?;
        state.slots[idx] = Some(SlotInfo {
            owner: owner.clone(),
            profile: profile.to_string(),
        });
        state.telemetry.allocations += 1;
        debug!(slot = idx, tenant = %owner, profile, "allocated logical qubit");
        Ok(PhysQubit(idx as u32))
    }

    async fn release(&self, qubit: PhysQubit) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let idx = state.slot(qubit)?;
        state.force_zero(idx);
        state.slots[idx] = None;
        state.telemetry.releases += 1;
        Ok(())
    }

    async fn apply(&self, gate: Gate, qubit: PhysQubit) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let idx = state.slot(qubit)?;
        match gate {
            Gate::H => state.hadamard(idx),
            Gate::S => state.s_gate(idx),
            Gate::X => state.pauli_x(idx),
            Gate::Y => state.pauli_y(idx),
            Gate::Z => state.pauli_z(idx),
            Gate::T => state.t_gate(idx),
        }
        state.telemetry.gates_applied += 1;
        Ok(())
    }

    async fn apply_cnot(&self, control: PhysQubit, target: PhysQubit) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let c = state.slot(control)?;
        let t = state.slot(target)?;
        if c == t {
            return Err(DeviceError::Fault("CNOT control equals target".into()));
        }
        state.cnot(c, t);
        state.telemetry.gates_applied += 1;
        Ok(())
    }

    async fn measure(
        &self,
        qubit: PhysQubit,
        basis: Basis,
        rng: &mut DeterministicRng,
    ) -> DeviceResult<u8> {
        let mut state = self.state.lock();
        let idx = state.slot(qubit)?;
        let bit = state.measure_in(idx, basis, rng);
        state.telemetry.measurements += 1;
        Ok(bit)
    }

    async fn measure_bell(
        &self,
        a: PhysQubit,
        b: PhysQubit,
        rng: &mut DeterministicRng,
    ) -> DeviceResult<(u8, u8)> {
        let mut state = self.state.lock();
        let qa = state.slot(a)?;
        let qb = state.slot(b)?;
        if qa == qb {
            return Err(DeviceError::Fault("Bell measurement on a single qubit".into()));
        }
        // Rotate the Bell basis onto the computational one.
        state.cnot(qa, qb);
        state.hadamard(qa);
        let phase = state.measure_z(qa, rng);
        let parity = state.measure_z(qb, rng);
        state.telemetry.measurements += 2;
        Ok((phase, parity))
    }

    async fn inject_magic(&self, qubit: PhysQubit) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let idx = state.slot(qubit)?;
        // |T⟩ = T·H|0⟩
        state.hadamard(idx);
        state.t_gate(idx);
        state.telemetry.gates_applied += 2;
        Ok(())
    }

    async fn open_link(&self, a: PhysQubit, b: PhysQubit) -> DeviceResult<LinkId> {
        let mut state = self.state.lock();
        let qa = state.slot(a)?;
        let qb = state.slot(b)?;
        if qa == qb {
            return Err(DeviceError::Fault("link endpoints must differ".into()));
        }
        // Entangle the endpoints into a Bell pair.
        state.hadamard(qa);
        state.cnot(qa, qb);
        let id = state.next_link;
        state.next_link += 1;
        state.links.insert(id, LinkInfo { a, b });
        state.telemetry.links_opened += 1;
        Ok(LinkId(id))
    }

    async fn use_link(&self, link: LinkId) -> DeviceResult<()> {
        let mut state = self.state.lock();
        if !state.links.contains_key(&link.0) {
            return Err(DeviceError::UnknownLink(link.0));
        }
        state.telemetry.links_used += 1;
        Ok(())
    }

    async fn close_link(&self, link: LinkId) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state
            .links
            .remove(&link.0)
            .map(|_| ())
            .ok_or(DeviceError::UnknownLink(link.0))
    }

    async fn owner_of(&self, qubit: PhysQubit) -> DeviceResult<TenantId> {
        let state = self.state.lock();
        let idx = state.slot(qubit)?;
        match &state.slots[idx] {
            Some(info) => Ok(info.owner.clone()),
            None => Err(DeviceError::UnknownQubit(qubit.0)),
        }
    }

    async fn indicator(&self, qubits: &[PhysQubit]) -> DeviceResult<u64> {
        let state = self.state.lock();
        let mut indices = Vec::with_capacity(qubits.len());
        for &q in qubits {
            indices.push(state.slot(q)?);
        }
        Ok(state.indicator(&indices))
    }

    async fn snapshot(&self) -> DeviceResult<DeviceSnapshot> {
        let state = self.state.lock();
        let snap = SimSnapshot {
            amps: state.amps.iter().map(|c| (c.re, c.im)).collect(),
            slots: state.slots.clone(),
            links: state.links.iter().map(|(&id, &info)| (id, info)).collect(),
            next_link: state.next_link,
        };
        let bytes = serde_json::to_vec(&snap)
            .map_err(|e| DeviceError::Fault(format!("snapshot encode: {e}")))?;
        Ok(DeviceSnapshot(bytes))
    }

    async fn restore(&self, snapshot: &DeviceSnapshot) -> DeviceResult<()> {
        let snap: SimSnapshot = serde_json::from_slice(&snapshot.0)
            .map_err(|e| DeviceError::BadSnapshot(e.to_string()))?;
        if snap.amps.len() != STATE_SIZE || snap.slots.len() != MAX_QUBITS {
            return Err(DeviceError::BadSnapshot("state size mismatch".into()));
        }
        let mut state = self.state.lock();
        state.amps = snap.amps.iter().map(|&(re, im)| Complex::new(re, im)).collect();
        state.slots = snap.slots;
        state.links = snap.links.into_iter().collect();
        state.next_link = snap.next_link;
        Ok(())
    }

    fn telemetry(&self) -> DeviceTelemetry {
        self.state.lock().telemetry
    }
}
