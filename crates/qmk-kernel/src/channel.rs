//! Entanglement channel registry
//!
//! Channel tokens are the only door through the entanglement firewall: a
//! cross-tenant two-qubit operation must present one, and it must be bound to
//! both tenants, unrevoked, unexpired, and still carry entanglement budget.
//! Every failure on that path is a `FIREWALL_VIOLATION`; the registry does
//! not distinguish "no such channel" from "revoked channel" to callers.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use qmk_core::{ChannelId, KernelError, Result, SessionId, TenantId};
use qmk_device::LinkId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A bound, mutually-authorized channel between two sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelToken {
    pub chan_id: ChannelId,
    pub tenants: (TenantId, TenantId),
    pub sessions: (SessionId, SessionId),
    pub link: LinkId,
    pub fidelity: f64,
    pub max_entanglements: u32,
    pub expires_at: Option<DateTime<Utc>>,
}

struct ChannelEntry {
    token: ChannelToken,
    remaining: Mutex<u32>,
    revoked: AtomicBool,
}

/// The channel table.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<ChannelId, Arc<ChannelEntry>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, token: ChannelToken) -> ChannelId {
        let id = token.chan_id;
        let entry = Arc::new(ChannelEntry {
            remaining: Mutex::new(token.max_entanglements),
            revoked: AtomicBool::new(false),
            token,
        });
        self.channels.write().insert(id, entry);
        id
    }

    pub fn get(&self, id: ChannelId) -> Option<ChannelToken> {
        self.channels.read().get(&id).map(|e| e.token.clone())
    }

    pub fn remaining(&self, id: ChannelId) -> Option<u32> {
        self.channels.read().get(&id).map(|e| *e.remaining.lock())
    }

    /// Revoke a channel; existing holders fail their next use.
    pub fn revoke(&self, id: ChannelId) -> bool {
        match self.channels.read().get(&id) {
            Some(entry) => {
                entry.revoked.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Validate a presented token for `tenant` and burn one entanglement.
    pub fn authorize_use(
        &self,
        id: ChannelId,
        tenant: &TenantId,
        now: DateTime<Utc>,
    ) -> Result<ChannelToken> {
        let entry = self
            .channels
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| KernelError::Firewall(format!("channel {id} is not bound")))?;
        if entry.revoked.load(Ordering::SeqCst) {
            return Err(KernelError::Firewall(format!("channel {id} is revoked")));
        }
        let token = &entry.token;
        if &token.tenants.0 != tenant && &token.tenants.1 != tenant {
            return Err(KernelError::Firewall(format!(
                "channel {id} is not bound to tenant {tenant}"
            )));
        }
        if matches!(token.expires_at, Some(exp) if now >= exp) {
            return Err(KernelError::Firewall(format!("channel {id} is expired")));
        }
        let mut remaining = entry.remaining.lock();
        if *remaining == 0 {
            return Err(KernelError::Firewall(format!(
                "channel {id} entanglement budget exhausted"
            )));
        }
        *remaining -= 1;
        Ok(token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token(max: u32, expires_at: Option<DateTime<Utc>>) -> ChannelToken {
        ChannelToken {
            chan_id: ChannelId::generate(),
            tenants: (TenantId::new("acme"), TenantId::new("umbra")),
            sessions: (SessionId::generate(), SessionId::generate()),
            link: LinkId(0),
            fidelity: 0.97,
            max_entanglements: max,
            expires_at,
        }
    }

    #[test]
    fn budget_is_burned_per_use() {
        let registry = ChannelRegistry::new();
        let id = registry.register(token(2, None));
        let now = Utc::now();
        registry.authorize_use(id, &TenantId::new("acme"), now).unwrap();
        registry.authorize_use(id, &TenantId::new("umbra"), now).unwrap();
        assert!(matches!(
            registry.authorize_use(id, &TenantId::new("acme"), now),
            Err(KernelError::Firewall(_))
        ));
    }

    #[test]
    fn unbound_tenant_is_refused() {
        let registry = ChannelRegistry::new();
        let id = registry.register(token(4, None));
        assert!(matches!(
            registry.authorize_use(id, &TenantId::new("mallory"), Utc::now()),
            Err(KernelError::Firewall(_))
        ));
    }

    #[test]
    fn revocation_and_expiry_close_the_door() {
        let registry = ChannelRegistry::new();
        let now = Utc::now();
        let expired = registry.register(token(4, Some(now - Duration::seconds(1))));
        assert!(registry.authorize_use(expired, &TenantId::new("acme"), now).is_err());

        let id = registry.register(token(4, None));
        registry.authorize_use(id, &TenantId::new("acme"), now).unwrap();
        assert!(registry.revoke(id));
        assert!(registry.authorize_use(id, &TenantId::new("acme"), now).is_err());
    }

    #[test]
    fn unknown_channel_is_a_firewall_violation() {
        let registry = ChannelRegistry::new();
        let err = registry
            .authorize_use(ChannelId::generate(), &TenantId::new("acme"), Utc::now())
            .unwrap_err();
        assert_eq!(err.code(), qmk_core::ErrorCode::FirewallViolation);
    }
}
