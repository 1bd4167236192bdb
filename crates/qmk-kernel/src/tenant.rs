//! Tenant registry
//!
//! Tenants are the unit of isolation and accounting. Each registry row is an
//! `Arc` with its own interior locks, so operations on distinct tenants never
//! contend. Quota admission is synchronous: a reservation either lands inside
//! the row's lock or the operation fails with `QUOTA_EXCEEDED` before any
//! state moves.

use crate::config::RateLimitConfig;
use parking_lot::{Mutex, RwLock};
use qmk_core::{KernelError, MonotonicClock, Result, RightSet, TenantId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Resource ceilings per tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Quota {
    pub max_vqs: u32,
    pub max_chs: u32,
    pub max_sessions: u32,
    pub max_concurrent_jobs: u32,
}

impl Default for Quota {
    fn default() -> Self {
        Self {
            max_vqs: 8,
            max_chs: 4,
            max_sessions: 8,
            max_concurrent_jobs: 4,
        }
    }
}

/// Live usage, mutated under the row lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub live_vqs: u32,
    pub live_chs: u32,
    pub open_sessions: u32,
    pub running_jobs: u32,
}

/// Operation classes with independent rate-limit buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpClass {
    Session,
    Submit,
    Query,
    Channel,
}

/// Token bucket against the injected monotonic clock.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_ms: f64,
    last: Timestamp,
}

impl TokenBucket {
    fn new(cfg: RateLimitConfig, now: Timestamp) -> Self {
        Self {
            capacity: cfg.burst as f64,
            tokens: cfg.burst as f64,
            refill_per_ms: cfg.per_second as f64 / 1000.0,
            last: now,
        }
    }

    fn try_take(&mut self, now: Timestamp) -> bool {
        let elapsed = now.saturating_since(self.last) as f64;
        self.tokens = (self.tokens + elapsed * self.refill_per_ms).min(self.capacity);
        self.last = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// One tenant row.
pub struct Tenant {
    pub id: TenantId,
    pub rights: RightSet,
    pub quota: Quota,
    suspended: AtomicBool,
    usage: Mutex<Usage>,
    buckets: Mutex<HashMap<OpClass, TokenBucket>>,
}

impl Tenant {
    fn new(id: TenantId, quota: Quota, rights: RightSet) -> Self {
        Self {
            id,
            rights,
            quota,
            suspended: AtomicBool::new(false),
            usage: Mutex::new(Usage::default()),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::SeqCst);
    }

    pub fn usage(&self) -> Usage {
        *self.usage.lock()
    }

    pub fn admit_session(&self) -> Result<()> {
        let mut usage = self.usage.lock();
        if usage.open_sessions >= self.quota.max_sessions {
            return Err(KernelError::QuotaExceeded(format!(
                "tenant {} session limit {}",
                self.id, self.quota.max_sessions
            )));
        }
        usage.open_sessions += 1;
        Ok(())
    }

    pub fn release_session(&self) {
        let mut usage = self.usage.lock();
        usage.open_sessions = usage.open_sessions.saturating_sub(1);
    }

    pub fn admit_job(&self) -> Result<()> {
        let mut usage = self.usage.lock();
        if usage.running_jobs >= self.quota.max_concurrent_jobs {
            return Err(KernelError::QuotaExceeded(format!(
                "tenant {} concurrent job limit {}",
                self.id, self.quota.max_concurrent_jobs
            )));
        }
        usage.running_jobs += 1;
        Ok(())
    }

    pub fn release_job(&self) {
        let mut usage = self.usage.lock();
        usage.running_jobs = usage.running_jobs.saturating_sub(1);
    }

    pub fn reserve_vqs(&self, n: u32) -> Result<()> {
        let mut usage = self.usage.lock();
        if usage.live_vqs + n > self.quota.max_vqs {
            return Err(KernelError::QuotaExceeded(format!(
                "tenant {} VQ limit {}",
                self.id, self.quota.max_vqs
            )));
        }
        usage.live_vqs += n;
        Ok(())
    }

    pub fn release_vqs(&self, n: u32) {
        let mut usage = self.usage.lock();
        usage.live_vqs = usage.live_vqs.saturating_sub(n);
    }

    pub fn reserve_chs(&self, n: u32) -> Result<()> {
        let mut usage = self.usage.lock();
        if usage.live_chs + n > self.quota.max_chs {
            return Err(KernelError::QuotaExceeded(format!(
                "tenant {} channel limit {}",
                self.id, self.quota.max_chs
            )));
        }
        usage.live_chs += n;
        Ok(())
    }

    pub fn release_chs(&self, n: u32) {
        let mut usage = self.usage.lock();
        usage.live_chs = usage.live_chs.saturating_sub(n);
    }

    fn check_rate(&self, class: OpClass, cfg: RateLimitConfig, now: Timestamp) -> Result<()> {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(class).or_insert_with(|| TokenBucket::new(cfg, now));
        if bucket.try_take(now) {
            Ok(())
        } else {
            Err(KernelError::RateLimited(format!(
                "tenant {} class {class:?}",
                self.id
            )))
        }
    }
}

/// The tenant table.
pub struct TenantRegistry {
    clock: Arc<dyn MonotonicClock>,
    rate_cfg: RateLimitConfig,
    tenants: RwLock<HashMap<TenantId, Arc<Tenant>>>,
}

impl TenantRegistry {
    pub fn new(clock: Arc<dyn MonotonicClock>, rate_cfg: RateLimitConfig) -> Self {
        Self {
            clock,
            rate_cfg,
            tenants: RwLock::new(HashMap::new()),
        }
    }

    pub fn create(&self, id: TenantId, quota: Quota, rights: RightSet) -> Result<Arc<Tenant>> {
        let mut tenants = self.tenants.write();
        if tenants.contains_key(&id) {
            return Err(KernelError::BadRequest(format!("tenant {id} already exists")));
        }
        let tenant = Arc::new(Tenant::new(id.clone(), quota, rights));
        tenants.insert(id, tenant.clone());
        Ok(tenant)
    }

    pub fn get(&self, id: &TenantId) -> Result<Arc<Tenant>> {
        self.tenants
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| KernelError::BadRequest(format!("unknown tenant {id}")))
    }

    /// Lookup that also rejects suspended tenants, the shape every
    /// session-scoped operation wants.
    pub fn get_active(&self, id: &TenantId) -> Result<Arc<Tenant>> {
        let tenant = self.get(id)?;
        if tenant.is_suspended() {
            return Err(KernelError::SessionInvalid(format!("tenant {id} is suspended")));
        }
        Ok(tenant)
    }

    pub fn suspend(&self, id: &TenantId) -> Result<()> {
        self.get(id)?.suspend();
        Ok(())
    }

    pub fn resume(&self, id: &TenantId) -> Result<()> {
        self.get(id)?.resume();
        Ok(())
    }

    /// Consult the tenant's token bucket for one operation.
    pub fn check_rate(&self, tenant: &Tenant, class: OpClass) -> Result<()> {
        tenant.check_rate(class, self.rate_cfg, self.clock.now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qmk_core::{Right, SimulatedClock};

    fn registry_with_clock() -> (TenantRegistry, SimulatedClock) {
        let clock = SimulatedClock::new();
        let registry = TenantRegistry::new(
            Arc::new(clock.clone()),
            RateLimitConfig { burst: 2, per_second: 1 },
        );
        (registry, clock)
    }

    fn rights() -> RightSet {
        [Right::Alloc, Right::Measure].into_iter().collect()
    }

    #[test]
    fn duplicate_tenant_is_rejected() {
        let (registry, _clock) = registry_with_clock();
        registry.create(TenantId::new("acme"), Quota::default(), rights()).unwrap();
        assert!(matches!(
            registry.create(TenantId::new("acme"), Quota::default(), rights()),
            Err(KernelError::BadRequest(_))
        ));
    }

    #[test]
    fn session_quota_is_enforced() {
        let (registry, _clock) = registry_with_clock();
        let quota = Quota { max_sessions: 1, ..Quota::default() };
        let tenant = registry.create(TenantId::new("acme"), quota, rights()).unwrap();
        tenant.admit_session().unwrap();
        assert!(matches!(tenant.admit_session(), Err(KernelError::QuotaExceeded(_))));
        tenant.release_session();
        tenant.admit_session().unwrap();
    }

    #[test]
    fn vq_reservations_respect_the_ceiling() {
        let (registry, _clock) = registry_with_clock();
        let quota = Quota { max_vqs: 2, ..Quota::default() };
        let tenant = registry.create(TenantId::new("acme"), quota, rights()).unwrap();
        tenant.reserve_vqs(2).unwrap();
        assert!(tenant.reserve_vqs(1).is_err());
        tenant.release_vqs(1);
        tenant.reserve_vqs(1).unwrap();
    }

    #[test]
    fn rate_limit_refills_with_the_clock() {
        let (registry, clock) = registry_with_clock();
        let tenant = registry
            .create(TenantId::new("acme"), Quota::default(), rights())
            .unwrap();
        registry.check_rate(&tenant, OpClass::Submit).unwrap();
        registry.check_rate(&tenant, OpClass::Submit).unwrap();
        assert!(matches!(
            registry.check_rate(&tenant, OpClass::Submit),
            Err(KernelError::RateLimited(_))
        ));
        // Distinct classes have distinct buckets.
        registry.check_rate(&tenant, OpClass::Query).unwrap();
        // One token per second refills.
        clock.tick(1000);
        registry.check_rate(&tenant, OpClass::Submit).unwrap();
    }

    #[test]
    fn suspension_blocks_active_lookup() {
        let (registry, _clock) = registry_with_clock();
        let id = TenantId::new("acme");
        registry.create(id.clone(), Quota::default(), rights()).unwrap();
        registry.suspend(&id).unwrap();
        assert!(matches!(
            registry.get_active(&id),
            Err(KernelError::SessionInvalid(_))
        ));
        registry.resume(&id).unwrap();
        registry.get_active(&id).unwrap();
    }
}
