//! Counting gate that bounds concurrent thumbnail transfers.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use log::debug;

use crate::ignore_poison::IgnorePoison;

/// Why a permit wasn't granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateError {
    /// Every slot stayed taken for the whole wait.
    TimedOut,
    /// No session; the gate isn't accepting work.
    Closed,
}

#[derive(Debug, Default)]
struct GateState {
    capacity: usize,
    in_use: usize,
    open: bool,
    /// Bumped on every open/close so permits from an earlier session don't skew the count.
    epoch: u64,
}

/// A counting semaphore with a timed acquire, opened per session.
#[derive(Debug, Default)]
pub struct ConcurrencyGate {
    state: Mutex<GateState>,
    available: Condvar,
}

impl ConcurrencyGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the gate with `capacity` free slots.
    pub fn open(&self, capacity: usize) {
        let mut state = self.state.lock_ignore_poison();
        state.capacity = capacity.max(1);
        state.in_use = 0;
        state.open = true;
        state.epoch += 1;
        debug!("Thumbnail gate open with {} slots", state.capacity);
        drop(state);
        self.available.notify_all();
    }

    /// Closes the gate. Waiters wake up with [`GateError::Closed`]; permits still held stay valid
    /// until dropped.
    pub fn close(&self) {
        let mut state = self.state.lock_ignore_poison();
        if state.open {
            debug!("Thumbnail gate closed ({} transfers still running)", state.in_use);
        }
        state.open = false;
        state.in_use = 0;
        state.epoch += 1;
        drop(state);
        self.available.notify_all();
    }

    pub fn is_open(&self) -> bool {
        self.state.lock_ignore_poison().open
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.state.lock_ignore_poison().in_use
    }

    /// Takes a slot, waiting at most `timeout` for one to free up.
    pub fn acquire(&self, timeout: Duration) -> Result<GatePermit<'_>, GateError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock_ignore_poison();
        loop {
            if !state.open {
                return Err(GateError::Closed);
            }
            if state.in_use < state.capacity {
                state.in_use += 1;
                return Ok(GatePermit {
                    gate: self,
                    epoch: state.epoch,
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(GateError::TimedOut);
            }
            let (next, _) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = next;
        }
    }

    fn release(&self, epoch: u64) {
        let mut state = self.state.lock_ignore_poison();
        if state.epoch == epoch && state.in_use > 0 {
            state.in_use -= 1;
        }
        drop(state);
        self.available.notify_one();
    }
}

/// One held slot. Released on drop.
#[derive(Debug)]
pub struct GatePermit<'a> {
    gate: &'a ConcurrencyGate,
    epoch: u64,
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        self.gate.release(self.epoch);
    }
}
