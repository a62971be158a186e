//! Per-directory cache of scanned slots.
//!
//! Slot ranges are keyed by their first slot. A range is either a used entry
//! (its long name slots followed by the short entry), a run of free slots or
//! the end marker. Once the end marker was seen the cache is complete and
//! name lookups no longer need to read the directory.

use std::collections::{BTreeMap, HashSet};

use super::dir_entry::DirEntry;

/// What a cached slot range holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotKind {
    Used,
    Free,
    End,
}

/// A cached range of directory slots, `begin..=end`.
#[derive(Debug, Clone)]
pub struct CachedSlot {
    pub kind: SlotKind,
    pub begin: u32,
    pub end: u32,
    pub short_name: Option<String>,
    pub long_name: Option<String>,
    pub entry: Option<DirEntry>,
}

#[derive(Debug, Default)]
pub struct DirCache {
    slots: BTreeMap<u32, CachedSlot>,
    names: HashSet<String>,
    end: Option<u32>,
}

impl DirCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every range overlapping `begin..=end`.
    fn evict(&mut self, begin: u32, end: u32) {
        let overlapping: Vec<u32> = self
            .slots
            .range(..=end)
            .filter(|(_, slot)| slot.end >= begin)
            .map(|(&key, _)| key)
            .collect();

        for key in overlapping {
            if let Some(slot) = self.slots.remove(&key) {
                for name in [&slot.short_name, &slot.long_name].into_iter().flatten() {
                    self.names.remove(&name.to_uppercase());
                }
                if slot.kind == SlotKind::End {
                    self.end = None;
                }
            }
        }
    }

    fn insert(&mut self, slot: CachedSlot) {
        self.evict(slot.begin, slot.end);
        for name in [&slot.short_name, &slot.long_name].into_iter().flatten() {
            self.names.insert(name.to_uppercase());
        }
        self.slots.insert(slot.begin, slot);
    }

    /// Caches a used entry spanning `begin..=end`, the short entry being the last slot.
    pub fn add_used(
        &mut self,
        begin: u32,
        end: u32,
        short_name: String,
        long_name: Option<String>,
        entry: DirEntry,
    ) {
        self.insert(CachedSlot {
            kind: SlotKind::Used,
            begin,
            end,
            short_name: Some(short_name),
            long_name,
            entry: Some(entry),
        });
    }

    /// Caches a free slot, merging it with an adjacent free run.
    pub fn add_free(&mut self, slot: u32) {
        let mut begin = slot;
        let mut end = slot;

        if let Some((_, prev)) = self.slots.range(..slot).next_back() {
            if prev.kind == SlotKind::Free && prev.end + 1 >= slot {
                begin = prev.begin;
                end = end.max(prev.end);
            }
        }
        if let Some(next) = self.slots.get(&(slot + 1)) {
            if next.kind == SlotKind::Free {
                end = next.end;
            }
        }

        self.insert(CachedSlot {
            kind: SlotKind::Free,
            begin,
            end,
            short_name: None,
            long_name: None,
            entry: None,
        });
    }

    /// Caches the end marker. Slots after it are free and were never used.
    pub fn add_end(&mut self, slot: u32) {
        self.insert(CachedSlot {
            kind: SlotKind::End,
            begin: slot,
            end: slot,
            short_name: None,
            long_name: None,
            entry: None,
        });
        self.end = Some(slot);
    }

    /// Returns the cached range starting at `slot`.
    pub fn lookup_slot(&self, slot: u32) -> Option<&CachedSlot> {
        self.slots.get(&slot)
    }

    /// Iterates over the used ranges in slot order.
    pub fn used(&self) -> impl Iterator<Item = &CachedSlot> {
        self.slots.values().filter(|slot| slot.kind == SlotKind::Used)
    }

    /// Whether `name` is taken, as a short or long name.
    ///
    /// # Returns
    /// - `Some(true)`: The name is cached
    /// - `Some(false)`: The directory was scanned to its end and the name is absent
    /// - `None`: The directory must be scanned to tell
    pub fn contains_name(&self, name: &str) -> Option<bool> {
        if self.names.contains(&name.to_uppercase()) {
            Some(true)
        } else if self.is_complete() {
            Some(false)
        } else {
            None
        }
    }

    /// Returns the first slot of a free run of at least `count` slots.
    pub fn find_free_run(&self, count: u32) -> Option<u32> {
        self.slots
            .values()
            .find(|slot| slot.kind == SlotKind::Free && slot.end - slot.begin + 1 >= count)
            .map(|slot| slot.begin)
    }

    /// Returns the slot of the end marker, once seen.
    pub fn end(&self) -> Option<u32> {
        self.end
    }

    pub fn is_complete(&self) -> bool {
        self.end.is_some()
    }

    pub fn invalidate(&mut self) {
        self.slots.clear();
        self.names.clear();
        self.end = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &[u8; 11]) -> DirEntry {
        DirEntry::new(*name, 0x20, 0)
    }

    #[test]
    fn names_are_case_insensitive() {
        let mut cache = DirCache::new();
        cache.add_used(0, 2, "README.TXT".into(), Some("Read me.txt".into()), entry(b"README  TXT"));

        assert_eq!(cache.contains_name("readme.txt"), Some(true));
        assert_eq!(cache.contains_name("READ ME.TXT"), Some(true));
        assert_eq!(cache.contains_name("other"), None);

        cache.add_end(3);
        assert_eq!(cache.contains_name("other"), Some(false));
    }

    #[test]
    fn free_slots_merge_into_runs() {
        let mut cache = DirCache::new();
        cache.add_free(4);
        cache.add_free(5);
        cache.add_free(6);
        cache.add_free(9);

        assert_eq!(cache.find_free_run(3), Some(4));
        assert_eq!(cache.find_free_run(1), Some(4));
        assert_eq!(cache.find_free_run(4), None);
        assert_eq!(cache.lookup_slot(4).map(|s| s.end), Some(6));
    }

    #[test]
    fn overlapping_insert_replaces() {
        let mut cache = DirCache::new();
        cache.add_free(0);
        cache.add_free(1);
        cache.add_used(0, 1, "A".into(), None, entry(b"A          "));

        assert_eq!(cache.find_free_run(1), None);
        assert_eq!(cache.used().count(), 1);

        cache.add_free(1);
        assert_eq!(cache.contains_name("A"), None);
    }

    #[test]
    fn invalidate_forgets_everything() {
        let mut cache = DirCache::new();
        cache.add_used(0, 0, "A".into(), None, entry(b"A          "));
        cache.add_end(1);
        assert!(cache.is_complete());

        cache.invalidate();
        assert!(!cache.is_complete());
        assert_eq!(cache.contains_name("A"), None);
        assert!(cache.lookup_slot(0).is_none());
    }
}
