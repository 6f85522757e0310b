use std::{
    collections::HashSet,
    sync::Mutex,
};

use rand::Rng;

use crate::{config::PortRange, timeouts::ALLOC_MAX_ATTEMPTS};

/// Bounded-range random port allocation with collision retry, guarded by a
/// single mutex shared across allocate/release so the two can never race.
pub struct PortAllocator {
    range: PortRange,
    in_use: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self { range, in_use: Mutex::new(HashSet::new()) }
    }

    /// Draws a uniform random port in the configured range until a free one
    /// is found, bounded by `ALLOC_MAX_ATTEMPTS`. `None` means allocation
    /// failed; the caller does not retry further (spec §4.3).
    pub fn allocate(&self) -> Option<u16> {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        let mut rng = rand::rng();
        for _ in 0..ALLOC_MAX_ATTEMPTS {
            let candidate = rng.random_range(self.range.low..=self.range.high);
            if in_use.insert(candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Idempotent: releasing a port that is not allocated is a no-op.
    pub fn release(&self, port: u16) {
        self.in_use.lock().unwrap_or_else(|e| e.into_inner()).remove(&port);
    }

    #[cfg(test)]
    pub fn in_use_count(&self) -> usize {
        self.in_use.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_within_range_and_releases_idempotently() {
        let allocator = PortAllocator::new(PortRange { low: 20000, high: 20005 });
        let port = allocator.allocate().unwrap();
        assert!((20000..=20005).contains(&port));
        assert_eq!(allocator.in_use_count(), 1);
        allocator.release(port);
        allocator.release(port);
        assert_eq!(allocator.in_use_count(), 0);
    }

    #[test]
    fn fails_cleanly_once_the_range_is_exhausted() {
        let allocator = PortAllocator::new(PortRange { low: 20000, high: 20001 });
        let a = allocator.allocate().unwrap();
        let b = allocator.allocate().unwrap();
        assert_ne!(a, b);
        assert!(allocator.allocate().is_none());
    }
}
