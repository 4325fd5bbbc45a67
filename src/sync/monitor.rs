use std::ops::{Deref, DerefMut};

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Mutex and condition variable bundled into one object, in the HotSpot
/// tradition. Waiting requires holding the lock through the guard.
pub struct Monitor<T> {
    mutex: Mutex<T>,
    cv: Condvar,
}

impl<T> Monitor<T> {
    pub const fn new(val: T) -> Self {
        Self {
            mutex: Mutex::new(val),
            cv: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MonitorGuard<'_, T> {
        MonitorGuard {
            guard: self.mutex.lock(),
            cv: &self.cv,
        }
    }

    pub fn notify_one(&self) -> bool {
        self.cv.notify_one()
    }

    pub fn notify_all(&self) -> usize {
        self.cv.notify_all()
    }
}

pub struct MonitorGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    cv: &'a Condvar,
}

impl<'a, T> MonitorGuard<'a, T> {
    pub fn wait(&mut self) {
        self.cv.wait(&mut self.guard);
    }

    pub fn wait_while(&mut self, condition: impl FnMut(&mut T) -> bool) {
        self.cv.wait_while(&mut self.guard, condition);
    }
}

impl<'a, T> Deref for MonitorGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T> DerefMut for MonitorGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
