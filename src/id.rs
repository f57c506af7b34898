//! Process-wide monotone session-id allocator.
//!
//! Both the public and internal endpoints draw session identifiers from the
//! same counter so that a worker-side session id and its client-side
//! counterpart never collide within one process run.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotone session-id generator.
///
/// Uniqueness only needs to hold for the lifetime of one process; ids are
/// never persisted or compared across restarts.
#[derive(Debug, Default)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a generator whose first id is `1`.
    pub fn new() -> Self {
        Self { next: AtomicU64::new(1) }
    }

    /// Allocate the next id, formatted as a decimal string.
    pub fn next(&self) -> String {
        self.next.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotone_and_unique() {
        let gen = IdGenerator::new();
        let ids: Vec<String> = (0..100).map(|_| gen.next()).collect();
        let unique: std::collections::HashSet<&String> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
        assert_eq!(ids[0], "1");
        assert_eq!(ids[1], "2");
    }
}
