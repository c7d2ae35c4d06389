//! Single-writer cell with explicit hand-off.
//!
//! [`HandOff`] keeps a "being updated" flag next to the protected value.
//! Acquiring waits on a condition variable while the flag is set, raises it,
//! and moves the value out to the caller; dropping the guard moves the value
//! back, lowers the flag and wakes every waiter. The internal mutex is only
//! held for those flag flips, never while the owner works on the value, so
//! the owner may block (for example on storage calls) without pinning a lock.
//!
//! ```
//! use prometheus_flow_scheduler::HandOff;
//!
//! let cell = HandOff::new(vec![1, 2]);
//! {
//!     let mut items = cell.acquire();
//!     items.push(3);
//!     assert!(cell.is_held());
//! }
//! assert_eq!(cell.acquire().len(), 3);
//! ```

use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct Slot<T> {
    busy: bool,
    value: T,
}

/// A value guarded by a busy flag and condition variable.
pub struct HandOff<T: Default> {
    slot: Mutex<Slot<T>>,
    released: Condvar,
}

impl<T: Default> HandOff<T> {
    /// Wrap `value`.
    pub fn new(value: T) -> Self {
        Self {
            slot: Mutex::new(Slot { busy: false, value }),
            released: Condvar::new(),
        }
    }

    /// Wait until no one holds the value, then take it.
    pub fn acquire(&self) -> HandOffGuard<'_, T> {
        let mut slot = self.slot.lock();
        while slot.busy {
            self.released.wait(&mut slot);
        }
        self.take(&mut slot)
    }

    /// Take the value if it is free right now.
    pub fn try_acquire(&self) -> Option<HandOffGuard<'_, T>> {
        let mut slot = self.slot.lock();
        if slot.busy {
            return None;
        }
        Some(self.take(&mut slot))
    }

    /// Wait at most `timeout` for the value.
    pub fn acquire_for(&self, timeout: Duration) -> Option<HandOffGuard<'_, T>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        while slot.busy {
            if self.released.wait_until(&mut slot, deadline).timed_out() && slot.busy {
                return None;
            }
        }
        Some(self.take(&mut slot))
    }

    /// Whether some thread currently owns the value.
    pub fn is_held(&self) -> bool {
        self.slot.lock().busy
    }

    fn take(&self, slot: &mut Slot<T>) -> HandOffGuard<'_, T> {
        slot.busy = true;
        HandOffGuard {
            owner: self,
            value: std::mem::take(&mut slot.value),
        }
    }

    fn hand_back(&self, value: T) {
        let mut slot = self.slot.lock();
        slot.value = value;
        slot.busy = false;
        drop(slot);
        self.released.notify_all();
    }
}

impl<T: Default> Default for HandOff<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Exclusive access to a [`HandOff`] value; hands it back on drop.
pub struct HandOffGuard<'a, T: Default> {
    owner: &'a HandOff<T>,
    value: T,
}

impl<T: Default> Deref for HandOffGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Default> DerefMut for HandOffGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: Default> Drop for HandOffGuard<'_, T> {
    fn drop(&mut self) {
        self.owner.hand_back(std::mem::take(&mut self.value));
    }
}
