// dedup_runner/src/lifecycle.rs
//! Single start/stop state shared by every component of one server.
//!
//! Components never carry their own started flag. Loops poll this value
//! between iterations, and only the server drives transitions, each one a
//! compare-and-set so exactly one caller wins under contention.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl LifecycleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => LifecycleState::Starting,
            2 => LifecycleState::Running,
            3 => LifecycleState::Stopping,
            _ => LifecycleState::Stopped,
        }
    }
}

#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
    // Only used to park `wait_stopped` callers.
    gate: Mutex<()>,
    changed: Condvar,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Stopped as u8),
            gate: Mutex::new(()),
            changed: Condvar::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Admission and accept loops run only here.
    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Pipeline consumers keep looping while starting or running.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state(),
            LifecycleState::Starting | LifecycleState::Running
        )
    }

    /// Moves `from -> to` if and only if the current state is `from`.
    pub fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        let won = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            let _guard = self.gate.lock();
            self.changed.notify_all();
        }
        won
    }

    /// Blocks until the state reads `Stopped` or `timeout` elapses.
    /// `None` waits forever. Returns whether the state is `Stopped`.
    pub fn wait_stopped(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|limit| Instant::now() + limit);
        let mut guard = self.gate.lock();
        while self.state() != LifecycleState::Stopped {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut guard, deadline).timed_out() {
                        return self.state() == LifecycleState::Stopped;
                    }
                }
                None => self.changed.wait(&mut guard),
            }
        }
        true
    }
}
