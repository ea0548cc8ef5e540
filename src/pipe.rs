//! Single-slot window handoff
//!
//! Rendezvous between the ingest thread and the detection worker. The slot
//! holds at most one window snapshot:
//!
//! - [`WindowPipe::send`] overwrites whatever is in the slot (newest wins);
//!   a snapshot superseded by a fresher window is worthless in live capture;
//! - [`WindowPipe::send_wait`] blocks until the slot drains, so an offline
//!   replay that outruns the worker loses no windows;
//! - [`WindowPipe::recv`] blocks until a snapshot is available.

use parking_lot::{Condvar, Mutex};

pub struct WindowPipe<T> {
    slot: Mutex<Option<T>>,
    readable: Condvar,
    writable: Condvar,
}

impl<T> Default for WindowPipe<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WindowPipe<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            readable: Condvar::new(),
            writable: Condvar::new(),
        }
    }

    /// Put a snapshot in the slot, replacing any unconsumed one.
    pub fn send(&self, value: T) {
        let mut slot = self.slot.lock();
        *slot = Some(value);
        self.readable.notify_one();
    }

    /// Put a snapshot in the slot once it is empty.
    pub fn send_wait(&self, value: T) {
        let mut slot = self.slot.lock();
        while slot.is_some() {
            self.writable.wait(&mut slot);
        }
        *slot = Some(value);
        self.readable.notify_one();
    }

    /// Take the next snapshot, blocking until one arrives.
    pub fn recv(&self) -> T {
        let mut slot = self.slot.lock();
        loop {
            if let Some(value) = slot.take() {
                self.writable.notify_one();
                return value;
            }
            self.readable.wait(&mut slot);
        }
    }
}
