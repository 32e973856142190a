//! Worker lifecycle state.
//!
//! Long-running loops (dispatcher, consumer) carry an explicit lifecycle
//! instead of a bare boolean: transitions are guarded, and `start`/`stop`
//! are idempotent so a duplicate call is a logged no-op rather than a
//! second loop.

use std::sync::{Mutex, PoisonError};

use crate::error::{Error, Result};

/// Lifecycle states for a worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Not running.
    Stopped,
    /// Start requested, loop not yet ticking.
    Starting,
    /// Loop is ticking.
    Running,
    /// Stop requested, in-flight work draining.
    Stopping,
}

impl LifecycleState {
    /// Returns a lowercase label suitable for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(self, target: Self) -> bool {
        match self {
            Self::Stopped => matches!(target, Self::Starting),
            Self::Starting => matches!(target, Self::Running | Self::Stopping),
            Self::Running => matches!(target, Self::Stopping),
            Self::Stopping => matches!(target, Self::Stopped),
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lifecycle lock poisoned")
}

/// Guarded lifecycle holder shared by a worker and its controller.
#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<LifecycleState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// Creates a stopped lifecycle.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LifecycleState::Stopped),
        }
    }

    /// Returns the current state.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn state(&self) -> Result<LifecycleState> {
        Ok(*self.state.lock().map_err(poison_err)?)
    }

    /// Attempts `stopped → starting`. Returns false (and changes nothing)
    /// if the worker is already starting, running, or stopping.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn begin_start(&self) -> Result<bool> {
        self.transition(LifecycleState::Starting)
    }

    /// Attempts `starting → running`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn mark_running(&self) -> Result<bool> {
        self.transition(LifecycleState::Running)
    }

    /// Attempts `{starting,running} → stopping`. Returns false if the
    /// worker was not running.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn begin_stop(&self) -> Result<bool> {
        self.transition(LifecycleState::Stopping)
    }

    /// Attempts `stopping → stopped`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn mark_stopped(&self) -> Result<bool> {
        self.transition(LifecycleState::Stopped)
    }

    fn transition(&self, target: LifecycleState) -> Result<bool> {
        let mut state = self.state.lock().map_err(poison_err)?;
        if !state.can_transition_to(target) {
            tracing::debug!(from = %*state, to = %target, "lifecycle transition ignored");
            return Ok(false);
        }
        *state = target;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_cycle() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.begin_start().unwrap());
        assert!(lifecycle.mark_running().unwrap());
        assert!(lifecycle.begin_stop().unwrap());
        assert!(lifecycle.mark_stopped().unwrap());
        assert_eq!(lifecycle.state().unwrap(), LifecycleState::Stopped);
    }

    #[test]
    fn duplicate_start_is_a_no_op() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.begin_start().unwrap());
        assert!(!lifecycle.begin_start().unwrap());
        lifecycle.mark_running().unwrap();
        assert!(!lifecycle.begin_start().unwrap());
    }

    #[test]
    fn stop_before_start_is_a_no_op() {
        let lifecycle = Lifecycle::new();
        assert!(!lifecycle.begin_stop().unwrap());
        assert_eq!(lifecycle.state().unwrap(), LifecycleState::Stopped);
    }

    #[test]
    fn starting_can_abort_to_stopping() {
        let lifecycle = Lifecycle::new();
        lifecycle.begin_start().unwrap();
        assert!(lifecycle.begin_stop().unwrap());
        assert!(lifecycle.mark_stopped().unwrap());
    }
}
