//! Capacity-bounded synchronized list backed by a preallocated slot arena.
//!
//! Records live in a fixed arena of slots. Occupied slots are threaded into a
//! doubly linked list (head = most recently added); free slots sit on a stack
//! so a removal followed by an insertion reuses the same slot in O(1).
//!
//! A single collection-wide [`OrderedMutex`] protects the topology. Callers
//! that walk the list must do so through a [`ListGuard`], which holds that lock
//! for the whole traversal.

use crate::error::{CollectionError, Full};
use crate::lock_order::{LockLevel, OrderedGuard, OrderedMutex};

/// Stable handle to an occupied slot.
///
/// The generation changes whenever the slot is released, so a handle kept
/// past the removal of its record resolves to nothing instead of aliasing the
/// slot's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotRef {
    index: u32,
    generation: u32,
}

impl SlotRef {
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

struct Slot<T> {
    value: Option<T>,
    prev: Option<u32>,
    next: Option<u32>,
    generation: u32,
}

struct Slab<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

impl<T> Slab<T> {
    fn with_capacity(capacity: usize) -> Result<Self, CollectionError> {
        if u32::try_from(capacity).is_err() {
            return Err(CollectionError::Allocation { capacity });
        }
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| CollectionError::Allocation { capacity })?;
        let mut free = Vec::new();
        free.try_reserve_exact(capacity)
            .map_err(|_| CollectionError::Allocation { capacity })?;

        for _ in 0..capacity {
            slots.push(Slot {
                value: None,
                prev: None,
                next: None,
                generation: 0,
            });
        }
        // Lowest index on top of the stack so slots fill in order.
        free.extend((0..capacity as u32).rev());

        Ok(Self {
            slots,
            free,
            head: None,
            tail: None,
            len: 0,
        })
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn push_head(&mut self, value: T) -> Result<SlotRef, Full<T>> {
        let Some(index) = self.free.pop() else {
            return Err(Full(value));
        };
        let old_head = self.head;

        let slot = &mut self.slots[index as usize];
        slot.value = Some(value);
        slot.prev = None;
        slot.next = old_head;
        let generation = slot.generation;

        match old_head {
            Some(h) => self.slots[h as usize].prev = Some(index),
            None => self.tail = Some(index),
        }
        self.head = Some(index);
        self.len += 1;

        Ok(SlotRef { index, generation })
    }

    fn resolve(&self, slot_ref: SlotRef) -> Option<u32> {
        let slot = self.slots.get(slot_ref.index as usize)?;
        (slot.generation == slot_ref.generation && slot.value.is_some()).then_some(slot_ref.index)
    }

    fn unlink(&mut self, index: u32) -> Option<T> {
        let slot = &mut self.slots[index as usize];
        let value = slot.value.take()?;
        let prev = slot.prev.take();
        let next = slot.next.take();
        slot.generation = slot.generation.wrapping_add(1);

        match prev {
            Some(p) => self.slots[p as usize].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n as usize].prev = prev,
            None => self.tail = prev,
        }
        self.free.push(index);
        self.len -= 1;
        Some(value)
    }

    fn slot_ref(&self, index: u32) -> SlotRef {
        SlotRef {
            index,
            generation: self.slots[index as usize].generation,
        }
    }
}

/// A capacity-bounded, mutex-protected doubly linked list.
pub struct SyncList<T> {
    slab: OrderedMutex<Slab<T>>,
}

impl<T> SyncList<T> {
    /// Preallocates `capacity` slots guarded by a lock at `level`.
    pub fn with_capacity(capacity: usize, level: LockLevel) -> Result<Self, CollectionError> {
        Ok(Self {
            slab: OrderedMutex::new(level, Slab::with_capacity(capacity)?),
        })
    }

    /// Takes the collection lock for a multi-step operation or a traversal.
    pub fn lock(&self) -> ListGuard<'_, T> {
        ListGuard {
            slab: self.slab.lock(),
        }
    }

    /// Links `value` at the head. Hands the value back when the list is full.
    pub fn add(&self, value: T) -> Result<SlotRef, Full<T>> {
        self.lock().add(value)
    }

    /// Unlinks and returns the head record.
    pub fn pop(&self) -> Option<T> {
        self.lock().pop()
    }

    /// Unlinks and returns the tail record, i.e. the oldest one.
    pub fn pop_back(&self) -> Option<T> {
        self.lock().pop_back()
    }

    /// Runs `f` against the head record without removing it.
    pub fn peek_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.lock().peek().map(f)
    }

    pub fn remove_ref(&self, slot_ref: SlotRef) -> Option<T> {
        self.lock().remove_ref(slot_ref)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    /// Releases the arena, returning whatever records were still linked,
    /// head first.
    pub fn destroy(self) -> Vec<T> {
        let mut slab = self.slab.into_inner();
        let mut out = Vec::with_capacity(slab.len);
        while let Some(head) = slab.head {
            if let Some(value) = slab.unlink(head) {
                out.push(value);
            }
        }
        out
    }
}

impl<T: Clone> SyncList<T> {
    pub fn peek(&self) -> Option<T> {
        self.peek_with(T::clone)
    }
}

impl<T: PartialEq> SyncList<T> {
    /// Removes the first record equal to `value`, scanning from the head.
    pub fn remove(&self, value: &T) -> Option<T> {
        let mut guard = self.lock();
        let found = guard.find(|candidate| candidate == value)?;
        guard.remove_ref(found)
    }
}

/// Exclusive access to a [`SyncList`] for as long as the guard lives.
pub struct ListGuard<'a, T> {
    slab: OrderedGuard<'a, Slab<T>>,
}

impl<'a, T> ListGuard<'a, T> {
    pub fn add(&mut self, value: T) -> Result<SlotRef, Full<T>> {
        self.slab.push_head(value)
    }

    pub fn pop(&mut self) -> Option<T> {
        let head = self.slab.head?;
        self.slab.unlink(head)
    }

    pub fn pop_back(&mut self) -> Option<T> {
        let tail = self.slab.tail?;
        self.slab.unlink(tail)
    }

    pub fn peek(&self) -> Option<&T> {
        let head = self.slab.head?;
        self.slab.slots[head as usize].value.as_ref()
    }

    pub fn get(&self, slot_ref: SlotRef) -> Option<&T> {
        let index = self.slab.resolve(slot_ref)?;
        self.slab.slots[index as usize].value.as_ref()
    }

    pub fn get_mut(&mut self, slot_ref: SlotRef) -> Option<&mut T> {
        let index = self.slab.resolve(slot_ref)?;
        self.slab.slots[index as usize].value.as_mut()
    }

    /// O(1) removal through a handle returned by [`add`](Self::add).
    pub fn remove_ref(&mut self, slot_ref: SlotRef) -> Option<T> {
        let index = self.slab.resolve(slot_ref)?;
        self.slab.unlink(index)
    }

    /// First record, from the head, matching `pred`.
    pub fn find(&self, mut pred: impl FnMut(&T) -> bool) -> Option<SlotRef> {
        self.iter()
            .find(|(_, value)| pred(value))
            .map(|(slot_ref, _)| slot_ref)
    }

    /// Head-to-tail traversal. Reverse it to walk oldest-first.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            slab: &*self.slab,
            front: self.slab.head,
            back: self.slab.tail,
            remaining: self.slab.len,
        }
    }

    pub fn len(&self) -> usize {
        self.slab.len
    }

    pub fn is_empty(&self) -> bool {
        self.slab.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slab.capacity()
    }

    pub fn is_full(&self) -> bool {
        self.slab.free.is_empty()
    }
}

pub struct Iter<'g, T> {
    slab: &'g Slab<T>,
    front: Option<u32>,
    back: Option<u32>,
    remaining: usize,
}

impl<'g, T> Iterator for Iter<'g, T> {
    type Item = (SlotRef, &'g T);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let index = self.front?;
        let slot = &self.slab.slots[index as usize];
        self.front = slot.next;
        self.remaining -= 1;
        Some((self.slab.slot_ref(index), slot.value.as_ref()?))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<T> DoubleEndedIterator for Iter<'_, T> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let index = self.back?;
        let slot = &self.slab.slots[index as usize];
        self.back = slot.prev;
        self.remaining -= 1;
        Some((self.slab.slot_ref(index), slot.value.as_ref()?))
    }
}

impl<T> ExactSizeIterator for Iter<'_, T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn list(capacity: usize) -> SyncList<&'static str> {
        SyncList::with_capacity(capacity, LockLevel::Fleet).expect("allocate list")
    }

    fn assert_consistent<T>(list: &SyncList<T>) {
        let guard = list.lock();
        let slab = &guard.slab;
        let linked = guard.iter().count();
        assert_eq!(linked, slab.len);
        assert_eq!(slab.len + slab.free.len(), slab.capacity());
        for &free in &slab.free {
            assert!(slab.slots[free as usize].value.is_none());
        }
        let forward: Vec<_> = guard.iter().map(|(r, _)| r).collect();
        let mut backward: Vec<_> = guard.iter().rev().map(|(r, _)| r).collect();
        backward.reverse();
        assert_eq!(forward, backward);
    }

    #[test]
    fn full_list_rejects_and_reuses_freed_slot() {
        let list = list(3);
        let a = list.add("A").expect("add A");
        list.add("B").expect("add B");
        list.add("C").expect("add C");

        let rejected = list.add("D").expect_err("fourth add must fail");
        assert_eq!(rejected.into_inner(), "D");
        assert_eq!(list.len(), 3);

        // Oldest record sits at the tail.
        assert_eq!(list.pop_back(), Some("A"));
        let d = list.add("D").expect("add after removal");
        assert_eq!(d.index(), a.index());
        assert_ne!(d, a, "generation must change on reuse");

        let guard = list.lock();
        let order: Vec<_> = guard.iter().map(|(_, v)| *v).collect();
        assert_eq!(order, vec!["D", "C", "B"]);
        drop(guard);
        assert_consistent(&list);
    }

    #[test]
    fn pop_returns_head() {
        let list = list(3);
        list.add("A").expect("add");
        list.add("B").expect("add");
        assert_eq!(list.peek(), Some("B"));
        assert_eq!(list.pop(), Some("B"));
        assert_eq!(list.pop(), Some("A"));
        assert_eq!(list.pop(), None);
        assert_eq!(list.peek(), None);
        assert_consistent(&list);
    }

    #[test]
    fn stale_reference_is_not_found() {
        let list = list(2);
        let a = list.add("A").expect("add");
        assert_eq!(list.remove_ref(a), Some("A"));
        assert_eq!(list.remove_ref(a), None);

        // The slot now belongs to B; the old handle must not reach it.
        let b = list.add("B").expect("add");
        assert_eq!(b.index(), a.index());
        assert_eq!(list.remove_ref(a), None);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn remove_by_identity_unlinks_middle() {
        let list = list(4);
        for v in ["A", "B", "C"] {
            list.add(v).expect("add");
        }
        assert_eq!(list.remove(&"B"), Some("B"));
        assert_eq!(list.remove(&"Z"), None);

        let guard = list.lock();
        let order: Vec<_> = guard.iter().map(|(_, v)| *v).collect();
        assert_eq!(order, vec!["C", "A"]);
        let oldest_first: Vec<_> = guard.iter().rev().map(|(_, v)| *v).collect();
        assert_eq!(oldest_first, vec!["A", "C"]);
        drop(guard);
        assert_consistent(&list);
    }

    #[test]
    fn guard_mutation_in_place() {
        let list: SyncList<u32> = SyncList::with_capacity(2, LockLevel::Tasks).expect("allocate");
        let r = list.add(1).expect("add");
        {
            let mut guard = list.lock();
            *guard.get_mut(r).expect("present") += 41;
        }
        assert_eq!(list.peek(), Some(42));
    }

    #[test]
    fn zero_capacity_is_always_full() {
        let list = list(0);
        assert!(list.add("A").is_err());
        assert!(list.is_empty());
    }

    #[test]
    fn destroy_returns_remaining_head_first() {
        let list = list(3);
        list.add("A").expect("add");
        list.add("B").expect("add");
        assert_eq!(list.destroy(), vec!["B", "A"]);
    }

    #[test]
    fn concurrent_adds_never_exceed_capacity() {
        let capacity = 64;
        let list: Arc<SyncList<u64>> =
            Arc::new(SyncList::with_capacity(capacity, LockLevel::Fleet).expect("allocate"));
        let threads = 8;
        let per_thread = 32;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads as u64)
            .map(|t| {
                let list = Arc::clone(&list);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let mut accepted = 0usize;
                    for i in 0..per_thread {
                        if list.add(t * 1000 + i).is_ok() {
                            accepted += 1;
                        }
                        // Churn a little so slots are recycled under contention.
                        if i % 5 == 0 {
                            list.pop_back();
                        }
                    }
                    accepted
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("worker panicked");
        }

        assert!(list.len() <= capacity);
        assert_consistent(&list);

        let guard = list.lock();
        let unique: HashSet<u64> = guard.iter().map(|(_, v)| *v).collect();
        assert_eq!(unique.len(), guard.len());
    }
}
