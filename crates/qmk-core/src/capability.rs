//! Capability tokens
//!
//! A token is a keyed-MAC-signed statement that a tenant holds a set of
//! rights. The MAC key lives in one [`SigningKey`] holder handed to whoever
//! must verify; tokens themselves are plain data and can cross the RPC
//! boundary. Delegation attenuates: a child can never carry a right, a
//! lifetime, or a delegation budget its parent lacked.

use crate::error::{KernelError, Result};
use crate::handle::{CapId, TenantId};
use crate::rights::RightSet;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Separator for the canonical signing form. A control byte keeps field
/// boundaries unambiguous without escaping.
const CANON_SEP: u8 = 0x1f;

/// Holder of the kernel's MAC key.
#[derive(Clone)]
pub struct SigningKey {
    key: [u8; 32],
}

impl SigningKey {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Derive a key from a numeric seed. Test and single-node convenience;
    /// production deployments load 32 random bytes.
    pub fn from_seed(seed: u64) -> Self {
        let mut material = [0u8; 32];
        let digest = blake3::hash(&seed.to_le_bytes());
        material.copy_from_slice(digest.as_bytes());
        Self { key: material }
    }

    /// Keyed MAC over `bytes`.
    pub fn mac(&self, bytes: &[u8]) -> [u8; 32] {
        *blake3::keyed_hash(&self.key, bytes).as_bytes()
    }

    /// Keyed MAC over `bytes ∥ prev`, the audit-chain link form.
    pub fn mac_chained(&self, bytes: &[u8], prev: &[u8; 32]) -> [u8; 32] {
        let mut input = Vec::with_capacity(bytes.len() + 32);
        input.extend_from_slice(bytes);
        input.extend_from_slice(prev);
        self.mac(&input)
    }

    /// Constant-time comparison of a presented MAC against a computed one.
    pub fn mac_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
        // blake3::Hash equality is constant-time.
        blake3::Hash::from(*a) == blake3::Hash::from(*b)
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SigningKey(..)")
    }
}

/// An unforgeable capability token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityToken {
    pub cap_id: CapId,
    pub tenant: TenantId,
    pub issued_by: String,
    pub rights: RightSet,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_uses: Option<u32>,
    pub delegation_depth: u8,
    pub max_delegation_depth: u8,
    pub parent: Option<CapId>,
    pub issued_at: DateTime<Utc>,
    pub signature: [u8; 32],
}

impl CapabilityToken {
    /// Canonical byte form covered by the signature. Field order and
    /// rendering are fixed; both issuance and verification use this exact
    /// encoding.
    fn canonical_bytes(&self) -> Vec<u8> {
        let fields = [
            self.cap_id.to_string(),
            self.tenant.to_string(),
            self.issued_by.clone(),
            self.rights.canonical(),
            self.expires_at
                .map(|t| t.timestamp_millis().to_string())
                .unwrap_or_else(|| "-".into()),
            self.max_uses.map(|n| n.to_string()).unwrap_or_else(|| "-".into()),
            self.delegation_depth.to_string(),
            self.issued_at.timestamp_millis().to_string(),
        ];
        let mut out = Vec::new();
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                out.push(CANON_SEP);
            }
            out.extend_from_slice(field.as_bytes());
        }
        out
    }

    fn expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if now >= exp)
    }
}

/// Token registry: issued tokens, remaining-use counters, and a separate
/// revocation set for O(1) checks on the hot path.
pub struct CapabilityStore {
    key: SigningKey,
    tokens: RwLock<HashMap<CapId, CapabilityToken>>,
    uses_remaining: RwLock<HashMap<CapId, u32>>,
    revoked: RwLock<HashSet<CapId>>,
    children: RwLock<HashMap<CapId, Vec<CapId>>>,
}

impl CapabilityStore {
    pub fn new(key: SigningKey) -> Self {
        Self {
            key,
            tokens: RwLock::new(HashMap::new()),
            uses_remaining: RwLock::new(HashMap::new()),
            revoked: RwLock::new(HashSet::new()),
            children: RwLock::new(HashMap::new()),
        }
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.key
    }

    /// Issue and record a root token for `tenant`.
    pub fn issue(
        &self,
        tenant: TenantId,
        issued_by: &str,
        rights: RightSet,
        expires_at: Option<DateTime<Utc>>,
        max_uses: Option<u32>,
        max_delegation_depth: u8,
        now: DateTime<Utc>,
    ) -> CapabilityToken {
        let mut token = CapabilityToken {
            cap_id: CapId::generate(),
            tenant,
            issued_by: issued_by.to_string(),
            rights,
            expires_at,
            max_uses,
            delegation_depth: 0,
            max_delegation_depth,
            parent: None,
            issued_at: now,
            signature: [0u8; 32],
        };
        token.signature = self.key.mac(&token.canonical_bytes());
        self.record(token.clone());
        token
    }

    /// Delegate a child token from `parent`. Rights, expiry, and delegation
    /// budget all attenuate; violations are `CAP_DENIED`.
    pub fn delegate(
        &self,
        parent_id: CapId,
        rights: RightSet,
        expires_at: Option<DateTime<Utc>>,
        max_uses: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<CapabilityToken> {
        let parent = self.verify(parent_id, now)?;
        if !rights.is_subset(&parent.rights) {
            return Err(KernelError::CapDenied(format!(
                "delegated rights {} exceed parent {}",
                rights, parent.rights
            )));
        }
        if parent.delegation_depth >= parent.max_delegation_depth {
            return Err(KernelError::CapDenied("delegation depth exhausted".into()));
        }
        let child_expiry = match (expires_at, parent.expires_at) {
            (Some(child), Some(par)) if child > par => {
                return Err(KernelError::CapDenied(
                    "delegated expiry exceeds parent expiry".into(),
                ));
            }
            (Some(child), _) => Some(child),
            (None, inherited) => inherited,
        };
        let mut token = CapabilityToken {
            cap_id: CapId::generate(),
            tenant: parent.tenant.clone(),
            issued_by: parent.cap_id.to_string(),
            rights,
            expires_at: child_expiry,
            max_uses,
            delegation_depth: parent.delegation_depth + 1,
            max_delegation_depth: parent.max_delegation_depth,
            parent: Some(parent.cap_id),
            issued_at: now,
            signature: [0u8; 32],
        };
        token.signature = self.key.mac(&token.canonical_bytes());
        self.record(token.clone());
        self.children
            .write()
            .entry(parent_id)
            .or_default()
            .push(token.cap_id);
        Ok(token)
    }

    /// Revoke a token and all transitive children. Returns how many tokens
    /// the revocation covered.
    pub fn revoke(&self, id: CapId) -> usize {
        let children = self.children.read();
        let mut frontier = vec![id];
        let mut revoked = self.revoked.write();
        let mut count = 0;
        while let Some(next) = frontier.pop() {
            if revoked.insert(next) {
                count += 1;
                if let Some(kids) = children.get(&next) {
                    frontier.extend(kids.iter().copied());
                }
            }
        }
        count
    }

    pub fn is_revoked(&self, id: CapId) -> bool {
        self.revoked.read().contains(&id)
    }

    /// Full verification: signature, revocation, expiry, exhaustion — in that
    /// order. Expiry failures never touch the use counter.
    pub fn verify(&self, id: CapId, now: DateTime<Utc>) -> Result<CapabilityToken> {
        let token = self
            .tokens
            .read()
            .get(&id)
            .cloned()
            .ok_or(KernelError::BadSig)?;
        self.verify_signature(&token)?;
        if self.revoked.read().contains(&id) {
            return Err(KernelError::Revoked);
        }
        if token.expired_at(now) {
            return Err(KernelError::Expired);
        }
        if token.max_uses.is_some() {
            let remaining = self.uses_remaining.read().get(&id).copied().unwrap_or(0);
            if remaining == 0 {
                return Err(KernelError::Exhausted);
            }
        }
        Ok(token)
    }

    /// Signature check alone, constant-time.
    pub fn verify_signature(&self, token: &CapabilityToken) -> Result<()> {
        let expected = self.key.mac(&token.canonical_bytes());
        if SigningKey::mac_eq(&token.signature, &expected) {
            Ok(())
        } else {
            Err(KernelError::BadSig)
        }
    }

    /// Verify and burn one use where the token is use-counted.
    pub fn consume_use(&self, id: CapId, now: DateTime<Utc>) -> Result<CapabilityToken> {
        let token = self.verify(id, now)?;
        if token.max_uses.is_some() {
            let mut uses = self.uses_remaining.write();
            // Re-check under the write lock; a concurrent consumer may have
            // taken the last use since verify().
            match uses.get_mut(&id) {
                Some(remaining) if *remaining > 0 => *remaining -= 1,
                _ => return Err(KernelError::Exhausted),
            }
        }
        Ok(token)
    }

    pub fn token(&self, id: CapId) -> Option<CapabilityToken> {
        self.tokens.read().get(&id).cloned()
    }

    pub fn uses_remaining(&self, id: CapId) -> Option<u32> {
        self.uses_remaining.read().get(&id).copied()
    }

    fn record(&self, token: CapabilityToken) {
        if let Some(max) = token.max_uses {
            self.uses_remaining.write().insert(token.cap_id, max);
        }
        self.tokens.write().insert(token.cap_id, token);
    }
}
