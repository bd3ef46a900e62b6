//! Group/unit/camera identifiers and the addressing match predicate.
//!
//! Every controlled entity is keyed by the triple `(gid, uid, cid)`.
//! `uid=""` addresses every unit in a group; `gid=""` addresses every
//! group.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of matching an addressed protocol record against a concrete
/// `(gid, uid)` pair owned by an `ObservationSystem`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match {
    Exact,
    Wildcard,
    None,
}

impl Match {
    pub fn matches(self) -> bool {
        matches!(self, Match::Exact | Match::Wildcard)
    }
}

/// The `(gid, uid)` pair identifying an observation system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SystemId {
    pub gid: String,
    pub uid: String,
}

impl SystemId {
    pub fn new(gid: impl Into<String>, uid: impl Into<String>) -> Self {
        SystemId {
            gid: gid.into(),
            uid: uid.into(),
        }
    }

    /// Matches an addressed `(gid, uid)` pair from an inbound protocol
    /// record against this system's identity.
    ///
    /// `uid=""` in the address means "every unit in this group";
    /// `gid=""` means "every group". Both wildcards combine: an empty
    /// gid with a non-empty uid only matches systems with that exact
    /// uid in any group.
    pub fn matches(&self, addr_gid: &str, addr_uid: &str) -> Match {
        let gid_ok = addr_gid.is_empty() || addr_gid == self.gid;
        let uid_ok = addr_uid.is_empty() || addr_uid == self.uid;
        if !gid_ok || !uid_ok {
            return Match::None;
        }
        if addr_gid == self.gid && addr_uid == self.uid {
            Match::Exact
        } else {
            Match::Wildcard
        }
    }
}

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.gid, self.uid)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exact_match() {
        let id = SystemId::new("G1", "U1");
        assert_eq!(id.matches("G1", "U1"), Match::Exact);
    }

    #[test]
    fn uid_wildcard_matches_any_unit_in_group() {
        let id = SystemId::new("G1", "U1");
        assert_eq!(id.matches("G1", ""), Match::Wildcard);
        assert_eq!(id.matches("G1", "U2"), Match::None);
    }

    #[test]
    fn gid_wildcard_matches_any_group() {
        let id = SystemId::new("G1", "U1");
        assert_eq!(id.matches("", ""), Match::Wildcard);
        assert_eq!(id.matches("", "U1"), Match::Wildcard);
    }

    #[test]
    fn mismatched_group_never_matches() {
        let id = SystemId::new("G1", "U1");
        assert_eq!(id.matches("G2", "U1"), Match::None);
        assert_eq!(id.matches("G2", ""), Match::None);
    }
}
