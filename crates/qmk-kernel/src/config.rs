//! Kernel configuration

use crate::tenant::Quota;
use qmk_core::RightSet;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// RPC listen address (loopback).
    pub listen_addr: String,
    /// Number of job worker tasks.
    pub workers: usize,
    /// Policy ceiling on negotiated session rights.
    pub policy_rights: RightSet,
    /// Session token lifetime in milliseconds; `None` is unbounded.
    pub session_ttl_ms: Option<u64>,
    /// Quota applied to tenants created without an explicit one.
    pub default_quota: Quota,
    /// Checkpointing policy.
    pub checkpoints: CheckpointConfig,
    /// Per-tenant rate limits.
    pub rate_limit: RateLimitConfig,
    /// Append-only JSONL audit sink; `None` keeps the log in memory only.
    pub audit_path: Option<PathBuf>,
    /// Seed for the kernel MAC key. Single-node convenience; deployments
    /// with real secrets construct the kernel with an explicit key.
    pub signing_seed: u64,
    /// QEC profile requested from the backend when a node names none.
    pub device_profile: String,
    /// Tenants created at startup.
    pub bootstrap_tenants: Vec<BootstrapTenant>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7177".into(),
            workers: 4,
            policy_rights: RightSet::all(),
            session_ttl_ms: None,
            default_quota: Quota::default(),
            checkpoints: CheckpointConfig::default(),
            rate_limit: RateLimitConfig::default(),
            audit_path: None,
            signing_seed: 20260801,
            device_profile: "surface-17".into(),
            bootstrap_tenants: Vec::new(),
        }
    }
}

/// Checkpoint and rollback policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// LRU bound on retained checkpoints.
    pub max_checkpoints: usize,
    /// Also snapshot immediately before measurements.
    pub before_measurements: bool,
    /// Device-failure recovery attempts per job (uncompute first, then
    /// checkpoint restore). Zero disables recovery.
    pub retry_limit: u32,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_checkpoints: 16,
            before_measurements: true,
            retry_limit: 0,
        }
    }
}

/// Token-bucket rate limiting per (tenant, operation class).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub burst: u32,
    pub per_second: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst: 32,
            per_second: 16,
        }
    }
}

/// A tenant provisioned at kernel startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapTenant {
    pub id: String,
    pub rights: RightSet,
    #[serde(default)]
    pub quota: Option<Quota>,
}
