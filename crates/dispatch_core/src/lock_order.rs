//! Ordered mutexes.
//!
//! Every shared lock in the dispatch core belongs to one [`LockLevel`]. A
//! thread may only acquire a lock whose level is strictly greater than every
//! level it already holds:
//!
//! ```text
//! Fleet (collection topology) -> Drone (one record) -> Tasks (task registry)
//! ```
//!
//! The rule is checked on every acquisition and a violation panics, so a
//! deadlock-prone nesting fails the first test that exercises it instead of
//! hanging in production. Strictness also means no thread can hold two drone
//! locks at once.
//!
//! Guards are `!Send`, so they can never be held across an `.await` inside a
//! spawned task. That keeps the per-thread bookkeeping below accurate.

use parking_lot::{Mutex, MutexGuard};
use std::cell::Cell;
use std::fmt;
use std::ops::{Deref, DerefMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockLevel {
    Fleet = 0,
    Drone = 1,
    Tasks = 2,
}

impl LockLevel {
    const ALL: [LockLevel; 3] = [LockLevel::Fleet, LockLevel::Drone, LockLevel::Tasks];
}

thread_local! {
    static HELD: [Cell<u32>; 3] = const { [Cell::new(0), Cell::new(0), Cell::new(0)] };
}

fn enter(level: LockLevel) {
    HELD.with(|held| {
        let start = level as usize;
        if let Some(offset) = held[start..].iter().position(|count| count.get() > 0) {
            panic!(
                "lock order violation: acquiring {:?} while holding {:?}",
                level,
                LockLevel::ALL[start + offset]
            );
        }
        held[start].set(1);
    });
}

fn leave(level: LockLevel) {
    HELD.with(|held| {
        let slot = &held[level as usize];
        slot.set(slot.get().saturating_sub(1));
    });
}

/// A mutex that participates in the lock-order check.
pub struct OrderedMutex<T> {
    level: LockLevel,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    pub const fn new(level: LockLevel, value: T) -> Self {
        Self {
            level,
            inner: Mutex::new(value),
        }
    }

    pub fn level(&self) -> LockLevel {
        self.level
    }

    /// Acquires the lock, panicking if the calling thread already holds a lock
    /// at this level or above.
    pub fn lock(&self) -> OrderedGuard<'_, T> {
        enter(self.level);
        OrderedGuard {
            level: self.level,
            guard: self.inner.lock(),
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: fmt::Debug> fmt::Debug for OrderedMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedMutex")
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

pub struct OrderedGuard<'a, T> {
    level: LockLevel,
    guard: MutexGuard<'a, T>,
}

impl<T> Deref for OrderedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for OrderedGuard<'_, T> {
    fn drop(&mut self) {
        leave(self.level);
    }
}
