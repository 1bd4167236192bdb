//! Capability rights
//!
//! The closed set of privileged operation classes. Rights travel on the wire
//! by their `CAP_*` names; unknown names are rejected at parse time.

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// One privileged operation class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Right {
    Alloc,
    Teleport,
    Magic,
    Link,
    Measure,
    Checkpoint,
    Debug,
    Admin,
    Audit,
}

impl Right {
    pub const ALL: [Right; 9] = [
        Right::Alloc,
        Right::Teleport,
        Right::Magic,
        Right::Link,
        Right::Measure,
        Right::Checkpoint,
        Right::Debug,
        Right::Admin,
        Right::Audit,
    ];

    /// Wire name of the right.
    pub fn name(self) -> &'static str {
        match self {
            Right::Alloc => "CAP_ALLOC",
            Right::Teleport => "CAP_TELEPORT",
            Right::Magic => "CAP_MAGIC",
            Right::Link => "CAP_LINK",
            Right::Measure => "CAP_MEASURE",
            Right::Checkpoint => "CAP_CHECKPOINT",
            Right::Debug => "CAP_DEBUG",
            Right::Admin => "CAP_ADMIN",
            Right::Audit => "CAP_AUDIT",
        }
    }

    /// Parse a wire name. Unknown names are `None`, never a default.
    pub fn parse(name: &str) -> Option<Right> {
        Right::ALL.iter().copied().find(|r| r.name() == name)
    }
}

impl fmt::Display for Right {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for Right {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for Right {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RightVisitor;

        impl Visitor<'_> for RightVisitor {
            type Value = Right;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a CAP_* capability name")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Right, E> {
                Right::parse(v)
                    .ok_or_else(|| E::custom(format!("unknown capability name: {v}")))
            }
        }

        deserializer.deserialize_str(RightVisitor)
    }
}

/// An ordered set of rights. Iteration order is the canonical (sorted) order,
/// which the token MAC encoding depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RightSet(BTreeSet<Right>);

impl RightSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Right::ALL.iter().copied().collect()
    }

    /// Parse a list of wire names; any unknown name fails the whole set.
    pub fn parse_names<'a, I: IntoIterator<Item = &'a str>>(names: I) -> Result<Self, String> {
        let mut set = BTreeSet::new();
        for name in names {
            let right = Right::parse(name).ok_or_else(|| name.to_string())?;
            set.insert(right);
        }
        Ok(Self(set))
    }

    pub fn insert(&mut self, right: Right) {
        self.0.insert(right);
    }

    pub fn contains(&self, right: Right) -> bool {
        self.0.contains(&right)
    }

    pub fn is_subset(&self, other: &RightSet) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn intersection(&self, other: &RightSet) -> RightSet {
        RightSet(self.0.intersection(&other.0).copied().collect())
    }

    pub fn union(&self, other: &RightSet) -> RightSet {
        RightSet(self.0.union(&other.0).copied().collect())
    }

    pub fn difference(&self, other: &RightSet) -> RightSet {
        RightSet(self.0.difference(&other.0).copied().collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = Right> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Wire names in canonical order.
    pub fn names(&self) -> Vec<&'static str> {
        self.iter().map(Right::name).collect()
    }

    /// Canonical comma-joined form, used for token signing.
    pub fn canonical(&self) -> String {
        self.names().join(",")
    }
}

impl FromIterator<Right> for RightSet {
    fn from_iter<T: IntoIterator<Item = Right>>(iter: T) -> Self {
        RightSet(iter.into_iter().collect())
    }
}

impl fmt::Display for RightSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.canonical())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_unknown_names() {
        assert_eq!(Right::parse("CAP_MEASURE"), Some(Right::Measure));
        assert_eq!(Right::parse("CAP_WARP"), None);
        assert!(RightSet::parse_names(["CAP_ALLOC", "CAP_WARP"]).is_err());
    }

    #[test]
    fn canonical_form_is_sorted() {
        let set: RightSet = [Right::Measure, Right::Alloc].into_iter().collect();
        assert_eq!(set.canonical(), "CAP_ALLOC,CAP_MEASURE");
    }

    #[test]
    fn subset_and_intersection() {
        let granted: RightSet = [Right::Alloc, Right::Measure, Right::Link].into_iter().collect();
        let asked: RightSet = [Right::Measure, Right::Admin].into_iter().collect();
        let got = asked.intersection(&granted);
        assert!(got.contains(Right::Measure));
        assert!(!got.contains(Right::Admin));
        assert!(got.is_subset(&granted));
    }

    #[test]
    fn rights_serialize_as_wire_names() {
        let json = serde_json::to_string(&Right::Teleport).unwrap();
        assert_eq!(json, "\"CAP_TELEPORT\"");
        let back: Right = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Right::Teleport);
        assert!(serde_json::from_str::<Right>("\"CAP_NOPE\"").is_err());
    }
}
