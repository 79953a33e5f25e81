//! Session id allocation.
//!
//! Ids are unique and monotonic within a node. When a gate id is
//! configured, it occupies the upper 32 bits so that ids are unique across
//! the whole cluster and any node can tell which gate owns a session.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

const SESSION_ID_MASK: i64 = 0xffff_ffff;
const GATE_ID_SHIFT: u32 = 32;

/// A session id with its gate component, formatted `gate_seq` when the
/// gate part is nonzero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sid(pub i64);

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let gate = self.0 >> GATE_ID_SHIFT;
        let seq = self.0 & SESSION_ID_MASK;
        if gate == 0 {
            write!(f, "{seq}")
        } else {
            write!(f, "{gate}_{seq}")
        }
    }
}

/// Per-node id source.
#[derive(Debug)]
pub struct ConnectionService {
    gate_id: u16,
    counter: AtomicU32,
}

impl ConnectionService {
    pub fn new(gate_id: u16) -> Self {
        Self {
            gate_id,
            counter: AtomicU32::new(0),
        }
    }

    /// Allocate the next session id.
    pub fn session_id(&self) -> i64 {
        let seq = i64::from(self.counter.fetch_add(1, Ordering::Relaxed) + 1);
        (i64::from(self.gate_id) << GATE_ID_SHIFT) | seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique_and_monotonic() {
        let svc = ConnectionService::new(0);
        let mut last = 0;
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let id = svc.session_id();
            assert!(id > last);
            assert!(seen.insert(id));
            last = id;
        }
    }

    #[test]
    fn gate_id_occupies_upper_bits() {
        let svc = ConnectionService::new(7);
        let id = svc.session_id();
        assert_eq!(id >> 32, 7);
        assert_eq!(id & 0xffff_ffff, 1);
        assert_eq!(Sid(id).to_string(), "7_1");
    }

    #[test]
    fn sid_display_without_gate() {
        assert_eq!(Sid(42).to_string(), "42");
    }
}
