//! Primary-peer election.
//!
//! Several administrators of the same world may run this client at once,
//! but only one of them should answer relayed requests. The tie-break is
//! deterministic: the lowest active administrator id wins. Every roster
//! change re-runs the election.

use std::sync::RwLock;

/// Election state for one peer identity.
pub struct Election {
    self_id: String,
    roster: RwLock<Vec<String>>,
}

impl Election {
    pub fn new(self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            roster: RwLock::new(Vec::new()),
        }
    }

    /// Replace the set of active administrator ids. Returns whether the
    /// elected primary changed.
    pub fn set_roster(&self, mut roster: Vec<String>) -> bool {
        roster.sort();
        roster.dedup();
        let mut current = self.roster.write().unwrap();
        let before = current.first().cloned();
        *current = roster;
        before != current.first().cloned()
    }

    /// The elected primary, if any administrator is active.
    pub fn primary(&self) -> Option<String> {
        self.roster.read().unwrap().first().cloned()
    }

    /// Whether this peer currently answers relayed requests. An empty
    /// roster means no contention, so a solo peer stays responsive.
    pub fn is_primary(&self) -> bool {
        match self.primary() {
            Some(primary) => primary == self.self_id,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowest_id_wins() {
        let election = Election::new("gm-b");
        election.set_roster(vec!["gm-c".into(), "gm-b".into(), "gm-a".into()]);
        assert_eq!(election.primary().as_deref(), Some("gm-a"));
        assert!(!election.is_primary());
    }

    #[test]
    fn test_stable_for_same_roster() {
        let election = Election::new("gm-a");
        assert!(election.set_roster(vec!["gm-b".into(), "gm-a".into()]));
        assert!(election.is_primary());
        // Same roster in a different order changes nothing.
        assert!(!election.set_roster(vec!["gm-a".into(), "gm-b".into(), "gm-b".into()]));
        assert!(election.is_primary());
    }

    #[test]
    fn test_roster_change_reelects() {
        let election = Election::new("gm-b");
        election.set_roster(vec!["gm-a".into(), "gm-b".into()]);
        assert!(!election.is_primary());
        // The primary leaves; this peer takes over.
        assert!(election.set_roster(vec!["gm-b".into(), "gm-c".into()]));
        assert!(election.is_primary());
    }

    #[test]
    fn test_empty_roster_is_solo_primary() {
        let election = Election::new("gm-z");
        assert!(election.is_primary());
    }
}
