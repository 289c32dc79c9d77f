//! Intrusive doubly-linked list of live tracked allocations.
//!
//! `head` is the most recently registered record.  `next` points towards older records,
//! `prev` towards newer ones.

use std::ptr;

use crate::record::Record;

pub struct Registry {
    head: *mut Record,
    count: usize,
}

// Records are only reachable through the registry, which lives behind the tracker's mutex.
unsafe impl Send for Registry {}

impl Registry {
    pub const fn new() -> Self {
        Registry {
            head: ptr::null_mut(),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Insert `record` at the head.
    ///
    /// # Safety
    ///
    /// `record` must be valid and not currently registered.
    pub unsafe fn register(&mut self, record: *mut Record) {
        (*record).prev = ptr::null_mut();
        (*record).next = self.head;
        if !self.head.is_null() {
            (*self.head).prev = record;
        }
        self.head = record;
        self.count += 1;
    }

    /// Unlink `record` from wherever it sits, using only its own links.
    ///
    /// # Safety
    ///
    /// `record` must be currently registered in `self`.
    pub unsafe fn unregister(&mut self, record: *mut Record) {
        let prev = (*record).prev;
        let next = (*record).next;
        if prev.is_null() {
            debug_assert_eq!(self.head, record);
            self.head = next;
        } else {
            (*prev).next = next;
        }
        if !next.is_null() {
            (*next).prev = prev;
        }
        (*record).prev = ptr::null_mut();
        (*record).next = ptr::null_mut();
        self.count -= 1;
    }

    /// Detach and return the head record.
    pub fn pop(&mut self) -> Option<*mut Record> {
        if self.head.is_null() {
            return None;
        }
        let record = self.head;
        unsafe { self.unregister(record) };
        Some(record)
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            cur: self.head,
            _registry: self,
        }
    }
}

pub struct Iter<'a> {
    cur: *mut Record,
    _registry: &'a Registry,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Record;

    fn next(&mut self) -> Option<&'a Record> {
        if self.cur.is_null() {
            return None;
        }
        let record = unsafe { &*self.cur };
        self.cur = record.next;
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RECORD_OVERHEAD, TAG_TRACKED};
    use crate::stack::StackTrace;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::{
        alloc::{alloc, dealloc, Layout},
        collections::HashSet,
    };

    fn layout() -> Layout {
        Layout::from_size_align(RECORD_OVERHEAD, 16).unwrap()
    }

    fn new_record(size: usize) -> *mut Record {
        unsafe { Record::place(alloc(layout()), size, 16, StackTrace::empty(), TAG_TRACKED) }
    }

    fn free_record(record: *mut Record) {
        unsafe { dealloc(record as *mut u8, layout()) }
    }

    // Walk the list both ways and check it against the expected live set.
    fn assert_links(registry: &Registry, live: &HashSet<usize>) {
        let mut seen = HashSet::new();
        let mut prev: *const Record = ptr::null();
        for record in registry.iter() {
            assert!(seen.insert(record as *const Record as usize), "record visited twice");
            assert_eq!(record.prev as *const Record, prev);
            prev = record;
        }
        assert_eq!(&seen, live);
        assert_eq!(registry.len(), live.len());
        assert_eq!(registry.is_empty(), live.is_empty());
    }

    #[test]
    fn newest_record_is_head() {
        let mut registry = Registry::new();
        let records: Vec<_> = (1..=3).map(new_record).collect();
        for r in &records {
            unsafe { registry.register(*r) };
        }
        let sizes: Vec<_> = registry.iter().map(|r| r.size).collect();
        assert_eq!(sizes, vec![3, 2, 1]);
        while let Some(r) = registry.pop() {
            free_record(r);
        }
    }

    #[test]
    fn removing_sole_record_leaves_empty_registry() {
        let mut registry = Registry::new();
        let record = new_record(8);
        unsafe {
            registry.register(record);
            registry.unregister(record);
        }
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
        assert!(registry.iter().next().is_none());
        assert!(registry.pop().is_none());
        free_record(record);
    }

    #[test]
    fn remove_head_tail_and_interior() {
        let mut registry = Registry::new();
        let records: Vec<_> = (0..5).map(new_record).collect();
        let mut live = HashSet::new();
        for r in &records {
            unsafe { registry.register(*r) };
            live.insert(*r as usize);
        }
        // records[4] is the head, records[0] the tail.
        for &idx in &[4, 0, 2, 1, 3] {
            unsafe { registry.unregister(records[idx]) };
            live.remove(&(records[idx] as usize));
            assert_links(&registry, &live);
        }
        records.into_iter().for_each(free_record);
    }

    #[test]
    fn random_register_unregister_sequences() {
        let mut rng = StdRng::seed_from_u64(0x6c65_616b);
        for _ in 0..50 {
            let mut registry = Registry::new();
            let mut live: Vec<*mut Record> = Vec::new();
            let mut live_set = HashSet::new();
            for step in 0..200 {
                if live.is_empty() || rng.gen_bool(0.55) {
                    let record = new_record(step);
                    unsafe { registry.register(record) };
                    live.push(record);
                    live_set.insert(record as usize);
                } else {
                    let record = live.swap_remove(rng.gen_range(0..live.len()));
                    unsafe { registry.unregister(record) };
                    live_set.remove(&(record as usize));
                    free_record(record);
                }
                assert_links(&registry, &live_set);
            }
            let mut drained = 0;
            while let Some(record) = registry.pop() {
                assert!(live_set.remove(&(record as usize)));
                free_record(record);
                drained += 1;
            }
            assert_eq!(drained, live.len());
            assert!(live_set.is_empty());
            assert_eq!(registry.len(), 0);
        }
    }
}
