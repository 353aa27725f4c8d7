//! Causal frontier over peer feeds.
//!
//! A [`Timeframe`] maps each peer to the highest sequence number observed in
//! that peer's feed. It acts as a vector clock: merging two timeframes takes
//! the pointwise maximum, and two timeframes are ordered only when one
//! dominates the other for every peer.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::keys::PeerId;

/// Highest observed sequence number per peer.
///
/// Peers that have not been observed are absent, which is distinct from
/// having observed sequence `0` (one message).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timeframe {
    frames: BTreeMap<PeerId, u64>,
}

impl Timeframe {
    /// Create an empty timeframe.
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest observed sequence for a peer.
    pub fn get(&self, peer: &PeerId) -> Option<u64> {
        self.frames.get(peer).copied()
    }

    /// Record `seq` for `peer`, overwriting whatever was there.
    pub fn set(&mut self, peer: PeerId, seq: u64) {
        self.frames.insert(peer, seq);
    }

    /// Raise the entry for `peer` to `seq` if it is lower or absent.
    pub fn advance(&mut self, peer: &PeerId, seq: u64) {
        match self.frames.get_mut(peer) {
            Some(current) if *current >= seq => {}
            Some(current) => *current = seq,
            None => {
                self.frames.insert(peer.clone(), seq);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Peers present in this timeframe, in key order.
    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.frames.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, u64)> {
        self.frames.iter().map(|(peer, seq)| (peer, *seq))
    }

    /// Pointwise maximum of two timeframes.
    pub fn merge(a: &Timeframe, b: &Timeframe) -> Timeframe {
        let mut merged = a.clone();
        merged.merge_with(b);
        merged
    }

    /// Merge `other` into `self` in place.
    pub fn merge_with(&mut self, other: &Timeframe) {
        for (peer, seq) in other.iter() {
            self.advance(peer, seq);
        }
    }

    /// Total number of messages covered: `Σ (seq + 1)`.
    pub fn total_messages(&self) -> u64 {
        self.frames.values().map(|seq| seq + 1).sum()
    }

    /// Messages in `self` that are not covered by `base`.
    ///
    /// For each peer this counts `seq - base_seq` when `base` knows the peer,
    /// or `seq + 1` when it does not, clamped at zero.
    pub fn new_messages(&self, base: &Timeframe) -> u64 {
        self.frames
            .iter()
            .map(|(peer, seq)| match base.get(peer) {
                Some(base_seq) => seq.saturating_sub(base_seq),
                None => seq + 1,
            })
            .sum()
    }

    /// Entries of `a` that are ahead of `b`.
    ///
    /// An empty result means `b` already covers everything `a` depends on.
    pub fn dependencies(a: &Timeframe, b: &Timeframe) -> Timeframe {
        let frames = a
            .frames
            .iter()
            .filter(|(peer, seq)| b.get(peer).is_none_or(|have| have < **seq))
            .map(|(peer, seq)| (peer.clone(), *seq))
            .collect();
        Timeframe { frames }
    }

    /// True when `self` has observed everything `other` has.
    pub fn covers(&self, other: &Timeframe) -> bool {
        Timeframe::dependencies(other, self).is_empty()
    }
}

impl PartialOrd for Timeframe {
    /// Vector-clock partial order. Concurrent timeframes compare as `None`.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self.covers(other), other.covers(self)) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Greater),
            (false, true) => Some(Ordering::Less),
            (false, false) => None,
        }
    }
}

impl FromIterator<(PeerId, u64)> for Timeframe {
    fn from_iter<I: IntoIterator<Item = (PeerId, u64)>>(iter: I) -> Self {
        let mut timeframe = Timeframe::new();
        for (peer, seq) in iter {
            timeframe.advance(&peer, seq);
        }
        timeframe
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, (peer, seq)) in self.frames.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}[{}]", peer, seq)?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tf(entries: &[(&str, u64)]) -> Timeframe {
        entries
            .iter()
            .map(|(peer, seq)| (PeerId::from(*peer), *seq))
            .collect()
    }

    #[test]
    fn test_merge_takes_pointwise_max() {
        let a = tf(&[("a", 2), ("b", 5)]);
        let b = tf(&[("b", 7), ("c", 0)]);
        assert_eq!(Timeframe::merge(&a, &b), tf(&[("a", 2), ("b", 7), ("c", 0)]));
    }

    #[test]
    fn test_merge_laws() {
        let a = tf(&[("a", 2), ("b", 5)]);
        let b = tf(&[("b", 7), ("c", 0)]);
        let c = tf(&[("a", 9)]);

        // commutative
        assert_eq!(Timeframe::merge(&a, &b), Timeframe::merge(&b, &a));
        // associative
        assert_eq!(
            Timeframe::merge(&Timeframe::merge(&a, &b), &c),
            Timeframe::merge(&a, &Timeframe::merge(&b, &c))
        );
        // idempotent
        assert_eq!(Timeframe::merge(&a, &a), a);
    }

    #[test]
    fn test_total_messages() {
        assert_eq!(Timeframe::new().total_messages(), 0);
        assert_eq!(tf(&[("a", 0)]).total_messages(), 1);
        assert_eq!(tf(&[("a", 2), ("b", 4)]).total_messages(), 8);
    }

    #[test]
    fn test_total_messages_monotonic_under_merge() {
        let a = tf(&[("a", 2), ("b", 5)]);
        let b = tf(&[("b", 1), ("c", 3)]);
        let merged = Timeframe::merge(&a, &b);
        assert!(merged.total_messages() >= a.total_messages());
        assert!(merged.total_messages() >= b.total_messages());
    }

    #[test]
    fn test_new_messages() {
        let base = tf(&[("a", 3)]);
        let current = tf(&[("a", 10), ("b", 1)]);
        assert_eq!(current.new_messages(&base), 7 + 2);
        assert_eq!(base.new_messages(&current), 0);
        assert_eq!(current.new_messages(&Timeframe::new()), current.total_messages());
    }

    #[test]
    fn test_dependencies() {
        let needed = tf(&[("a", 3), ("b", 1)]);
        let have = tf(&[("a", 5), ("b", 0)]);
        assert_eq!(Timeframe::dependencies(&needed, &have), tf(&[("b", 1)]));
        assert!(Timeframe::dependencies(&have, &have).is_empty());
    }

    #[test]
    fn test_partial_order() {
        let low = tf(&[("a", 1)]);
        let high = tf(&[("a", 2), ("b", 0)]);
        let other = tf(&[("b", 4)]);

        assert!(low < high);
        assert!(high > low);
        assert_eq!(low.partial_cmp(&low), Some(Ordering::Equal));
        assert_eq!(high.partial_cmp(&other), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(tf(&[("a", 1), ("b", 0)]).to_string(), "(a[1], b[0])");
    }
}
