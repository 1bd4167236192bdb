//! Typed identifiers
//!
//! Handles are opaque; equality is identity. Linear handles (VQ, CH) get a
//! fresh [`HandleId`] at every production so a stale handle can never alias a
//! live one.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Tenant identifier. Chosen by the operator at tenant creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(Uuid);

        impl $name {
            /// Mint a fresh identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn parse(s: &str) -> Option<Self> {
                Uuid::parse_str(s).ok().map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id!(
    /// Session identifier, minted at `negotiate_capabilities`.
    SessionId
);
uuid_id!(
    /// Job identifier, minted at submission.
    JobId
);
uuid_id!(
    /// Capability token identifier.
    CapId
);
uuid_id!(
    /// Entanglement channel token identifier.
    ChannelId
);
uuid_id!(
    /// Checkpoint identifier.
    CheckpointId
);

/// Identity of one linear production. Never reused within a kernel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleId(u64);

impl HandleId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Monotone generator for [`HandleId`]s.
#[derive(Debug, Default)]
pub struct HandleIdGen {
    next: u64,
}

impl HandleIdGen {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next fresh id.
    pub fn fresh(&mut self) -> HandleId {
        let id = HandleId(self.next);
        self.next += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ids_never_repeat() {
        let mut gen = HandleIdGen::new();
        let a = gen.fresh();
        let b = gen.fresh();
        assert_ne!(a, b);
    }

    #[test]
    fn session_id_round_trips_through_text() {
        let id = SessionId::generate();
        assert_eq!(SessionId::parse(&id.to_string()), Some(id));
    }
}
