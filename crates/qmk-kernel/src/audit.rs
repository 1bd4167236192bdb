//! Tamper-evident audit log
//!
//! An append-only sequence of security-relevant events. Each record's MAC is
//! keyed over its body bytes concatenated with the previous record's MAC, so
//! the head MAC attests the whole prefix. Appends serialize on the chain
//! head; queries are read-only.

use parking_lot::Mutex;
use qmk_core::{SessionId, SigningKey, TenantId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::warn;

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Security-relevant event classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditKind {
    CapabilityGranted,
    CapabilityDenied,
    CapabilityUsed,
    CapabilityRevoked,
    CapabilityDelegated,
    ResourceAllocated,
    ResourceFreed,
    JobStateChanged,
    ChannelRequested,
    ChannelApproved,
    ChannelUsed,
    ChannelRevoked,
    FirewallViolation,
    QuotaExceeded,
    RateLimited,
    CheckpointTaken,
    CheckpointRestored,
}

/// One chained record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub sequence: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub tenant: Option<TenantId>,
    pub session: Option<SessionId>,
    pub kind: AuditKind,
    pub severity: Severity,
    pub payload: Value,
    pub mac: [u8; 32],
}

impl AuditRecord {
    /// Bytes the MAC covers: everything except the MAC itself, in canonical
    /// (sorted-key) JSON.
    fn body_bytes(&self) -> Vec<u8> {
        let body = serde_json::json!({
            "sequence": self.sequence,
            "timestamp": self.timestamp,
            "tenant": self.tenant,
            "session": self.session,
            "kind": self.kind,
            "severity": self.severity,
            "payload": self.payload,
        });
        serde_json::to_vec(&body).unwrap_or_default()
    }
}

/// Query filter. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub tenant: Option<TenantId>,
    pub kind: Option<AuditKind>,
    pub min_severity: Option<Severity>,
}

impl AuditFilter {
    fn matches(&self, record: &AuditRecord) -> bool {
        if let Some(tenant) = &self.tenant {
            if record.tenant.as_ref() != Some(tenant) {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if record.kind != kind {
                return false;
            }
        }
        if let Some(min) = self.min_severity {
            if record.severity < min {
                return false;
            }
        }
        true
    }
}

/// Summary view exposed through the kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSummary {
    pub total: u64,
    pub info: u64,
    pub warning: u64,
    pub critical: u64,
    pub attestation_root: String,
}

struct Chain {
    records: Vec<AuditRecord>,
    head: [u8; 32],
    next_sequence: u64,
}

/// The log itself. One per kernel instance.
pub struct AuditLog {
    key: SigningKey,
    chain: Mutex<Chain>,
    sink: Option<Mutex<File>>,
}

impl AuditLog {
    pub fn new(key: SigningKey) -> Self {
        Self {
            key,
            chain: Mutex::new(Chain {
                records: Vec::new(),
                head: [0u8; 32],
                next_sequence: 0,
            }),
            sink: None,
        }
    }

    /// Log with an append-only JSONL sink alongside the in-memory chain.
    pub fn with_sink(key: SigningKey, path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut log = Self::new(key);
        log.sink = Some(Mutex::new(file));
        Ok(log)
    }

    /// Rebuild a chain from a persisted JSONL sink, verifying every link
    /// against the zero root on the way in. A broken link is corruption.
    pub fn load(key: SigningKey, path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let log = Self::new(key);
        {
            let mut chain = log.chain.lock();
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                let record: AuditRecord = serde_json::from_str(line)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                let expected = log.key.mac_chained(&record.body_bytes(), &chain.head);
                if !SigningKey::mac_eq(&record.mac, &expected) {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("audit chain broken at sequence {}", record.sequence),
                    ));
                }
                chain.head = record.mac;
                chain.next_sequence = record.sequence + 1;
                chain.records.push(record);
            }
        }
        Ok(log)
    }

    /// Append one event; returns its sequence number.
    pub fn append(
        &self,
        tenant: Option<TenantId>,
        session: Option<SessionId>,
        kind: AuditKind,
        severity: Severity,
        payload: Value,
    ) -> u64 {
        let mut chain = self.chain.lock();
        let sequence = chain.next_sequence;
        let mut record = AuditRecord {
            sequence,
            timestamp: chrono::Utc::now(),
            tenant,
            session,
            kind,
            severity,
            payload,
            mac: [0u8; 32],
        };
        record.mac = self.key.mac_chained(&record.body_bytes(), &chain.head);
        chain.head = record.mac;
        chain.next_sequence += 1;

        if let Some(sink) = &self.sink {
            let mut file = sink.lock();
            if let Ok(line) = serde_json::to_string(&record) {
                if let Err(err) = writeln!(file, "{line}") {
                    warn!(%err, "audit sink write failed");
                }
            }
        }

        chain.records.push(record);
        sequence
    }

    /// Current head MAC: the attestation root over the whole log.
    pub fn attestation_root(&self) -> [u8; 32] {
        self.chain.lock().head
    }

    /// Recompute every link from the zero root; true iff the stored chain
    /// and head are exactly what the key produces.
    pub fn verify_chain(&self) -> bool {
        let chain = self.chain.lock();
        let mut head = [0u8; 32];
        for record in &chain.records {
            let expected = self.key.mac_chained(&record.body_bytes(), &head);
            if !SigningKey::mac_eq(&record.mac, &expected) {
                return false;
            }
            head = expected;
        }
        SigningKey::mac_eq(&head, &chain.head)
    }

    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditRecord> {
        self.chain
            .lock()
            .records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.chain.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summary(&self) -> AuditSummary {
        let chain = self.chain.lock();
        let mut summary = AuditSummary {
            total: chain.records.len() as u64,
            info: 0,
            warning: 0,
            critical: 0,
            attestation_root: hex(&chain.head),
        };
        for record in &chain.records {
            match record.severity {
                Severity::Info => summary.info += 1,
                Severity::Warning => summary.warning += 1,
                Severity::Critical => summary.critical += 1,
            }
        }
        summary
    }

    /// Test hook: corrupt a stored record in place.
    #[cfg(test)]
    fn tamper(&self, sequence: u64) {
        let mut chain = self.chain.lock();
        if let Some(record) = chain.records.get_mut(sequence as usize) {
            record.payload = serde_json::json!({"tampered": true});
        }
    }
}

fn hex(digest: &[u8; 32]) -> String {
    qmk_core::ContentHash::hex(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn log() -> AuditLog {
        AuditLog::new(SigningKey::from_seed(42))
    }

    #[test]
    fn chain_verifies_and_root_moves() {
        let log = log();
        let empty_root = log.attestation_root();
        log.append(
            Some(TenantId::new("acme")),
            None,
            AuditKind::ResourceAllocated,
            Severity::Info,
            json!({"vq": "q0"}),
        );
        assert_ne!(log.attestation_root(), empty_root);
        log.append(None, None, AuditKind::JobStateChanged, Severity::Info, json!({}));
        assert!(log.verify_chain());
    }

    #[test]
    fn tampering_breaks_the_chain() {
        let log = log();
        log.append(None, None, AuditKind::CapabilityGranted, Severity::Info, json!({"r": 1}));
        log.append(None, None, AuditKind::CapabilityUsed, Severity::Info, json!({"r": 2}));
        assert!(log.verify_chain());
        log.tamper(0);
        assert!(!log.verify_chain());
    }

    #[test]
    fn queries_filter_by_tenant_kind_and_severity() {
        let log = log();
        let acme = TenantId::new("acme");
        log.append(
            Some(acme.clone()),
            None,
            AuditKind::FirewallViolation,
            Severity::Critical,
            json!({}),
        );
        log.append(Some(acme.clone()), None, AuditKind::ResourceFreed, Severity::Info, json!({}));
        log.append(
            Some(TenantId::new("umbra")),
            None,
            AuditKind::FirewallViolation,
            Severity::Critical,
            json!({}),
        );

        let hits = log.query(&AuditFilter {
            tenant: Some(acme),
            kind: Some(AuditKind::FirewallViolation),
            min_severity: None,
        });
        assert_eq!(hits.len(), 1);

        let severe = log.query(&AuditFilter {
            min_severity: Some(Severity::Critical),
            ..Default::default()
        });
        assert_eq!(severe.len(), 2);
    }

    #[test]
    fn persisted_log_replays_to_the_same_root() {
        let path = std::env::temp_dir().join(format!(
            "qmk-audit-replay-{}.jsonl",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);

        let key = SigningKey::from_seed(42);
        let log = AuditLog::with_sink(key.clone(), &path).unwrap();
        log.append(
            Some(TenantId::new("acme")),
            None,
            AuditKind::CapabilityGranted,
            Severity::Info,
            json!({"rights": ["CAP_ALLOC"]}),
        );
        log.append(None, None, AuditKind::JobStateChanged, Severity::Info, json!({}));
        let root = log.attestation_root();

        let recovered = AuditLog::load(key.clone(), &path).unwrap();
        assert_eq!(recovered.len(), 2);
        assert_eq!(recovered.attestation_root(), root);
        assert!(recovered.verify_chain());

        // Replay under the wrong key refuses the first record.
        assert!(AuditLog::load(SigningKey::from_seed(7), &path).is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn summary_counts_by_severity() {
        let log = log();
        log.append(None, None, AuditKind::RateLimited, Severity::Warning, json!({}));
        log.append(None, None, AuditKind::QuotaExceeded, Severity::Warning, json!({}));
        log.append(None, None, AuditKind::JobStateChanged, Severity::Info, json!({}));
        let summary = log.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.warning, 2);
        assert_eq!(summary.info, 1);
    }
}
