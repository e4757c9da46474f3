// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Condvar, Mutex,
};

/// Represents the current cancel state.
#[derive(PartialEq)]
enum CancelState {
    Untouched,
    Cancelled,
}

/// A cancel handle is passed to the device during a render operation. It's the
/// renderer's responsibility to respect a cancel request.
#[derive(Clone)]
pub struct CancelHandle {
    /// Set to cancelled when the underlying render should halt.
    cancelled: Arc<Mutex<CancelState>>,
    /// The condvar will handle notification of cancelling.
    condvar: Arc<Condvar>,
}

impl CancelHandle {
    /// Creates a new cancel handle.
    pub fn new() -> CancelHandle {
        CancelHandle {
            cancelled: Arc::new(Mutex::new(CancelState::Untouched)),
            condvar: Arc::new(Condvar::new()),
        }
    }

    /// Returns true if the render has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.lock().expect("Error getting lock") == CancelState::Cancelled
    }

    /// Waits for the handle to be cancelled or for finished to be set to true.
    pub fn wait(&self, finished: Arc<AtomicBool>) {
        let _unused = self
            .condvar
            .wait_while(
                self.cancelled.lock().expect("Error getting lock"),
                |cancelled| {
                    *cancelled == CancelState::Untouched && !finished.load(Ordering::Relaxed)
                },
            )
            .expect("Error getting lock");
    }

    /// Notifies the handle so waiters re-check whether the render was
    /// cancelled or finished.
    pub fn notify(&self) {
        self.condvar.notify_all();
    }

    /// Cancels the render.
    pub fn cancel(&self) {
        let mut cancel_state = self.cancelled.lock().expect("Error getting lock");
        if *cancel_state == CancelState::Untouched {
            *cancel_state = CancelState::Cancelled;
            self.notify();
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// A monotonically increasing token for asynchronous work whose result may
/// arrive after the caller has moved on. The submitter captures the current
/// value, advances it when superseding the work, and the completion path
/// compares against the live value to decide whether the result is stale.
#[derive(Clone)]
pub struct Generation {
    counter: Arc<AtomicU64>,
}

impl Generation {
    /// Creates a new generation starting at zero.
    pub fn new() -> Generation {
        Generation {
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns the current generation value.
    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }

    /// Advances the generation, invalidating any work captured against the
    /// previous value. Returns the new value.
    pub fn advance(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns true if the given captured value is still the live one.
    pub fn is_current(&self, captured: u64) -> bool {
        self.current() == captured
    }
}

impl Default for Generation {
    fn default() -> Self {
        Self::new()
    }
}
