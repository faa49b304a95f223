//! Stall detection keyed by `(menu fast digest, state fast digest)`.

use std::collections::HashMap;

/// Number of times one pair may be observed before the guard trips.
pub const LOOP_GUARD_LIMIT: u32 = 3;

#[derive(Debug, Clone, Default)]
pub struct LoopGuard {
    limit: u32,
    seen: HashMap<(String, String), u32>,
}

impl LoopGuard {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            seen: HashMap::new(),
        }
    }

    /// Record one observation. Returns true once the pair has been seen more
    /// than `limit` times.
    pub fn observe(&mut self, menu_fast: &str, state_fast: &str) -> bool {
        let count = self
            .seen
            .entry((menu_fast.to_string(), state_fast.to_string()))
            .or_insert(0);
        *count += 1;
        *count > self.limit
    }
}
