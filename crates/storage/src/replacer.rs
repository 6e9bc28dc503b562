use hashlink::LinkedHashSet;
use parking_lot::Mutex;

/// Identifies a frame in the buffer pool.
pub type FrameId = usize;

/// Eviction policy over the evictable buffer pool frames.
pub trait Replacer {
    /// Chooses a victim frame and removes it from consideration.
    fn victim(&self) -> Option<FrameId>;

    /// Makes a frame evictable, refreshing its recency if already tracked.
    fn insert(&self, frame_id: FrameId);

    /// Removes a frame from eviction consideration, reporting whether it
    /// was tracked.
    fn erase(&self, frame_id: FrameId) -> bool;

    /// Returns the number of evictable frames.
    fn size(&self) -> usize;
}

/// LRU replacer that evicts the frame least recently returned to pin
/// count zero. Recency is driven by `insert` alone, not by page access.
///
/// Backed by a linked hash set, so every operation is O(1). Carries its
/// own latch; callers do not need the pool latch to use it.
#[derive(Debug)]
pub struct LRUReplacer {
    entries: Mutex<LinkedHashSet<FrameId>>,
}

impl LRUReplacer {
    /// Creates an empty replacer sized for the given frame count.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(LinkedHashSet::with_capacity(capacity)),
        }
    }

    /// Reports whether a frame is currently evictable.
    pub fn contains(&self, frame_id: FrameId) -> bool {
        self.entries.lock().contains(&frame_id)
    }
}

impl Replacer for LRUReplacer {
    fn victim(&self) -> Option<FrameId> {
        self.entries.lock().pop_front()
    }

    fn insert(&self, frame_id: FrameId) {
        let mut entries = self.entries.lock();
        // Re-insertion moves the frame to the most-recent end.
        entries.remove(&frame_id);
        entries.insert(frame_id);
    }

    fn erase(&self, frame_id: FrameId) -> bool {
        self.entries.lock().remove(&frame_id)
    }

    fn size(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn victims_come_out_in_insertion_order() {
        let replacer = LRUReplacer::new(4);
        replacer.insert(1);
        replacer.insert(2);
        replacer.insert(3);

        assert_eq!(replacer.size(), 3);
        assert_eq!(replacer.victim(), Some(1));
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), Some(3));
        assert_eq!(replacer.victim(), None);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn reinsert_refreshes_recency() {
        let replacer = LRUReplacer::new(4);
        replacer.insert(1);
        replacer.insert(2);
        replacer.insert(1);

        // 1 was refreshed, so 2 is now the least recent.
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), Some(1));
        assert_eq!(replacer.victim(), None);
    }

    #[test]
    fn erase_reports_presence() {
        let replacer = LRUReplacer::new(4);
        replacer.insert(5);
        replacer.insert(6);

        assert!(replacer.erase(5));
        assert!(!replacer.erase(5));
        assert!(!replacer.erase(99));
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.victim(), Some(6));
    }

    #[test]
    fn contains_tracks_membership() {
        let replacer = LRUReplacer::new(2);
        assert!(!replacer.contains(0));
        replacer.insert(0);
        assert!(replacer.contains(0));
        replacer.victim();
        assert!(!replacer.contains(0));
    }
}
