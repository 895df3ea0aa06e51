//! Bounded LRU cache for validation outcomes.
//!
//! Entries live in a slot arena linked by indices, so recency updates are
//! O(1) without reference-counted nodes. Both entry count and approximate
//! byte size are capped.

use super::ValidationOutcome;
use std::collections::HashMap;

/// Cache key: content digest plus the mode it was validated under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey {
    pub digest: [u8; 32],
    pub mode: u8,
}

struct Slot {
    key: CacheKey,
    value: ValidationOutcome,
    size: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

pub(crate) struct ValidationCache {
    capacity: usize,
    max_bytes: usize,
    bytes: usize,
    index: HashMap<CacheKey, usize>,
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    /// Most recently used.
    head: Option<usize>,
    /// Least recently used.
    tail: Option<usize>,
}

fn approx_size(value: &ValidationOutcome) -> usize {
    std::mem::size_of::<ValidationOutcome>()
        + std::mem::size_of::<CacheKey>()
        + value.sanitized_text.as_ref().map_or(0, String::len)
        + value.reason.as_ref().map_or(0, String::len)
        + value.threats.len() * std::mem::size_of::<super::ThreatKind>()
}

impl ValidationCache {
    pub fn new(capacity: usize, max_bytes: usize) -> Self {
        Self {
            capacity,
            max_bytes,
            bytes: 0,
            index: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn get(&mut self, key: &CacheKey) -> Option<ValidationOutcome> {
        let idx = *self.index.get(key)?;
        self.detach(idx);
        self.push_front(idx);
        self.slots[idx].as_ref().map(|slot| slot.value.clone())
    }

    pub fn insert(&mut self, key: CacheKey, value: ValidationOutcome) {
        if self.capacity == 0 {
            return;
        }
        let size = approx_size(&value);
        if size > self.max_bytes {
            return;
        }

        if let Some(&idx) = self.index.get(&key) {
            self.detach(idx);
            if let Some(slot) = self.slots[idx].as_mut() {
                self.bytes = self.bytes - slot.size + size;
                slot.value = value;
                slot.size = size;
            }
            self.push_front(idx);
        } else {
            let slot = Slot {
                key,
                value,
                size,
                prev: None,
                next: None,
            };
            let idx = match self.free.pop() {
                Some(idx) => {
                    self.slots[idx] = Some(slot);
                    idx
                }
                None => {
                    self.slots.push(Some(slot));
                    self.slots.len() - 1
                }
            };
            self.bytes += size;
            self.index.insert(key, idx);
            self.push_front(idx);
        }

        while self.index.len() > self.capacity || self.bytes > self.max_bytes {
            if !self.evict_lru() {
                break;
            }
        }
    }

    fn evict_lru(&mut self) -> bool {
        let Some(idx) = self.tail else {
            return false;
        };
        self.detach(idx);
        if let Some(slot) = self.slots[idx].take() {
            self.bytes -= slot.size;
            self.index.remove(&slot.key);
        }
        self.free.push(idx);
        true
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = match self.slots[idx].as_ref() {
            Some(slot) => (slot.prev, slot.next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(slot) = self.slots[p].as_mut() {
                    slot.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(slot) = self.slots[n].as_mut() {
                    slot.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(slot) = self.slots[idx].as_mut() {
            slot.prev = None;
            slot.next = None;
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(slot) = self.slots[idx].as_mut() {
            slot.prev = None;
            slot.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(slot) = self.slots[h].as_mut() {
                slot.prev = Some(idx);
            }
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }
}
