//! Identifiers carried by device events

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Logical recording session an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(pub u64);

impl SegmentId {
    /// Sentinel for events that belong to no segment
    pub const INVALID: SegmentId = SegmentId(0);
    /// Sentinel for events addressed to every segment
    pub const ALL: SegmentId = SegmentId(u64::MAX);

    /// Create a segment id, rejecting the reserved sentinels
    pub fn new(id: u64) -> Option<Self> {
        let segment = SegmentId(id);
        if segment.is_reserved() {
            None
        } else {
            Some(segment)
        }
    }

    /// Whether this id is one of the reserved sentinels
    pub fn is_reserved(&self) -> bool {
        *self == Self::INVALID || *self == Self::ALL
    }

    /// Whether an event scoped to `self` applies to `other`
    pub fn covers(&self, other: SegmentId) -> bool {
        *self == Self::ALL || *self == other
    }
}

impl Default for SegmentId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            SegmentId::INVALID => write!(f, "Invalid"),
            SegmentId::ALL => write!(f, "All"),
            SegmentId(id) => write!(f, "{}", id),
        }
    }
}

/// Physiological quantity or control channel an event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalId(pub Uuid);

impl SignalId {
    /// No signal (lifecycle and text events)
    pub const NONE: SignalId = SignalId(Uuid::nil());
    /// Wildcard matching every signal
    pub const ALL: SignalId = SignalId(Uuid::from_u128(u128::MAX));

    pub const fn from_u128(value: u128) -> Self {
        SignalId(Uuid::from_u128(value))
    }

    /// Whether a filter configured for `self` should handle `other`
    pub fn matches(&self, other: SignalId) -> bool {
        *self == Self::ALL || *self == other
    }

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }
}

impl Default for SignalId {
    fn default() -> Self {
        Self::NONE
    }
}

impl From<Uuid> for SignalId {
    fn from(value: Uuid) -> Self {
        SignalId(value)
    }
}

impl std::fmt::Display for SignalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            SignalId::NONE => write!(f, "None"),
            SignalId::ALL => write!(f, "All"),
            SignalId(id) => write!(f, "{}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_sentinels() {
        assert!(SegmentId::new(0).is_none());
        assert!(SegmentId::new(u64::MAX).is_none());
        assert_eq!(SegmentId::new(7), Some(SegmentId(7)));
        assert!(SegmentId::ALL.covers(SegmentId(3)));
        assert!(!SegmentId(4).covers(SegmentId(3)));
        assert_eq!(SegmentId::ALL.to_string(), "All");
    }

    #[test]
    fn test_signal_matching() {
        let glucose = SignalId::from_u128(0x1234);
        let insulin = SignalId::from_u128(0x5678);
        assert!(SignalId::ALL.matches(glucose));
        assert!(glucose.matches(glucose));
        assert!(!glucose.matches(insulin));
        assert!(SignalId::default().is_none());
    }
}
