use super::Replacement;
use crate::BlockId;
use std::collections::HashMap;
use tracing::trace;

/// Implements the [Clock](https://en.wikipedia.org/wiki/Page_replacement_algorithm#Clock)
/// replacement policy over unpinned blocks.
///
/// `entries` is a circular list of tracked blocks, and `hand` is the index of the next entry within
/// it to examine for replacement. When a victim is needed, we start the search at `hand`, skipping
/// any pinned entry, and selecting the first unpinned entry with a false reference bit. Any
/// unpinned entry skipped along the way has its reference bit cleared.
#[derive(Debug, Default)]
pub struct Clock {
    /// Maps each tracked block to the index of its entry in `entries`.
    ///
    /// # Invariants
    ///
    /// Each `index` entry maps to exactly one `entries` entry, and that entry always has a
    /// matching block.
    index: HashMap<BlockId, usize>,

    /// The tracked blocks.
    entries: Vec<Entry>,

    /// The clock hand's index into `entries`.
    hand: usize,
}

#[derive(Debug)]
struct Entry {
    block: BlockId,

    /// The number of outstanding pins. An entry is only evictable at zero.
    pins: usize,

    /// Whether this block was recently pinned.
    referenced: bool,
}

impl Clock {
    /// Create an empty policy.
    pub fn new() -> Self {
        Self::default()
    }

    fn entry_mut(&mut self, block: BlockId) -> Option<&mut Entry> {
        let index = *self.index.get(&block)?;
        let entry = &mut self.entries[index];
        assert_eq!(entry.block, block);
        Some(entry)
    }
}

impl Replacement for Clock {
    fn pin(&mut self, block: BlockId) {
        if let Some(entry) = self.entry_mut(block) {
            entry.pins += 1;
            entry.referenced = true;
            return;
        }
        self.index.insert(block, self.entries.len());
        self.entries.push(Entry {
            block,
            pins: 1,
            referenced: true,
        });
    }

    fn unpin(&mut self, block: BlockId) {
        let Some(entry) = self.entry_mut(block) else {
            panic!("unpin of untracked block {block}");
        };
        assert!(entry.pins > 0, "unpin of unpinned block {block}");
        entry.pins -= 1;
    }

    fn pins(&self, block: BlockId) -> usize {
        self.index
            .get(&block)
            .map_or(0, |&index| self.entries[index].pins)
    }

    fn contains(&self, block: BlockId) -> bool {
        self.index.contains_key(&block)
    }

    fn victim(&mut self) -> Option<BlockId> {
        // Two full sweeps are enough to clear every reference bit and come back around.
        for _ in 0..2 * self.entries.len() {
            let entry = &mut self.entries[self.hand];
            if entry.pins == 0 && !entry.referenced {
                let victim = self.entries.swap_remove(self.hand);
                assert_eq!(self.index.remove(&victim.block), Some(self.hand));
                if let Some(moved) = self.entries.get(self.hand) {
                    self.index.insert(moved.block, self.hand);
                }
                if self.hand >= self.entries.len() {
                    self.hand = 0;
                }
                trace!(block = %victim.block, "selected victim");
                return Some(victim.block);
            }
            if entry.pins == 0 {
                entry.referenced = false;
            }
            self.hand = (self.hand + 1) % self.entries.len();
        }
        None
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn rename(&mut self, from: BlockId, to: BlockId) {
        assert!(!self.index.contains_key(&to), "rename onto tracked block {to}");
        let Some(index) = self.index.remove(&from) else {
            panic!("rename of untracked block {from}");
        };
        self.entries[index].block = to;
        self.index.insert(to, index);
        trace!(%from, %to, "renamed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn id(raw: u64) -> BlockId {
        BlockId::new(raw)
    }

    #[test]
    fn test_clock_pin_counts() {
        let mut clock = Clock::new();
        assert_eq!(clock.pins(id(1)), 0);
        assert!(!clock.contains(id(1)));

        clock.pin(id(1));
        clock.pin(id(1));
        assert_eq!(clock.pins(id(1)), 2);
        clock.unpin(id(1));
        assert_eq!(clock.pins(id(1)), 1);
        assert!(clock.contains(id(1)));
        assert_eq!(clock.len(), 1);
    }

    #[test]
    #[should_panic(expected = "unpin of unpinned block")]
    fn test_clock_unpin_below_zero() {
        let mut clock = Clock::new();
        clock.pin(id(1));
        clock.unpin(id(1));
        clock.unpin(id(1));
    }

    #[test]
    #[should_panic(expected = "unpin of untracked block")]
    fn test_clock_unpin_untracked() {
        let mut clock = Clock::new();
        clock.unpin(id(1));
    }

    #[test]
    fn test_clock_rename_keeps_pins() {
        let mut clock = Clock::new();
        clock.pin(id(1));
        clock.pin(id(1));
        clock.pin(id(2));
        clock.rename(id(1), id(3));
        assert!(!clock.contains(id(1)));
        assert_eq!(clock.pins(id(3)), 2);
        assert_eq!(clock.len(), 2);

        // The renamed entry is evictable under its new id once unpinned.
        clock.unpin(id(3));
        clock.unpin(id(3));
        assert_eq!(clock.victim(), Some(id(3)));
        assert_eq!(clock.pins(id(2)), 1);
    }

    #[test]
    #[should_panic(expected = "rename onto tracked block")]
    fn test_clock_rename_onto_tracked() {
        let mut clock = Clock::new();
        clock.pin(id(1));
        clock.pin(id(2));
        clock.rename(id(1), id(2));
    }

    #[test]
    fn test_clock_never_selects_pinned() {
        let mut clock = Clock::new();
        clock.pin(id(1));
        clock.pin(id(2));
        assert_eq!(clock.victim(), None);

        clock.unpin(id(2));
        assert_eq!(clock.victim(), Some(id(2)));
        assert!(!clock.contains(id(2)));
        assert_eq!(clock.victim(), None);
        assert_eq!(clock.len(), 1);
    }

    #[test]
    fn test_clock_second_chance() {
        let mut clock = Clock::new();
        for raw in 0..3 {
            clock.pin(id(raw));
            clock.unpin(id(raw));
        }

        // All entries are referenced, so the first sweep clears them and the second chance goes
        // to the entry under the hand.
        assert_eq!(clock.victim(), Some(id(0)));

        // Re-referencing block 1 spares it from the next sweep.
        clock.pin(id(1));
        clock.unpin(id(1));
        let victim = clock.victim().unwrap();
        assert_ne!(victim, id(1));
        assert_eq!(clock.len(), 1);
    }

    #[test]
    fn test_clock_random_workload_respects_pins() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut clock = Clock::new();
        let mut pins: HashMap<BlockId, usize> = HashMap::new();
        for _ in 0..10_000 {
            let block = id(rng.gen_range(0..32));
            match rng.gen_range(0..3) {
                0 => {
                    clock.pin(block);
                    *pins.entry(block).or_default() += 1;
                }
                1 => {
                    if let Some(count) = pins.get_mut(&block).filter(|count| **count > 0) {
                        clock.unpin(block);
                        *count -= 1;
                    }
                }
                _ => {
                    if let Some(victim) = clock.victim() {
                        assert_eq!(pins.remove(&victim), Some(0));
                    }
                }
            }
            for (block, count) in &pins {
                assert_eq!(clock.pins(*block), *count);
            }
        }
    }
}
