use std::sync::atomic::{AtomicU64, Ordering};

use common::BlockId;

/// Namespace-wide block id counter. Ids are never handed out twice: every
/// allocation is journaled and replay feeds the ids back through `observe`.
#[derive(Debug)]
pub struct BlockAllocator {
    next: AtomicU64,
}

impl BlockAllocator {
    pub fn new(next: BlockId) -> Self {
        Self {
            next: AtomicU64::new(next.max(1)),
        }
    }

    pub fn allocate(&self) -> BlockId {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Make sure `id` is below the next allocation.
    pub fn observe(&self, id: BlockId) {
        self.next.fetch_max(id + 1, Ordering::SeqCst);
    }

    /// The high-water mark stored in checkpoints.
    pub fn next_id(&self) -> BlockId {
        self.next.load(Ordering::SeqCst)
    }
}

impl Default for BlockAllocator {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_strictly_increasing() {
        let alloc = BlockAllocator::default();
        let a = alloc.allocate();
        let b = alloc.allocate();
        assert!(a < b);
        alloc.observe(100);
        assert_eq!(alloc.allocate(), 101);
        alloc.observe(5);
        assert_eq!(alloc.next_id(), 102);
    }

    #[test]
    fn test_unique_across_threads() {
        let alloc = Arc::new(BlockAllocator::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let alloc = alloc.clone();
                std::thread::spawn(move || (0..250).map(|_| alloc.allocate()).collect::<Vec<_>>())
            })
            .collect();
        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 1000);
    }
}
