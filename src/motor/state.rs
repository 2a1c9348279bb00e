// Per-motor control/telemetry record and the lock that guards it
//
// Two parties touch a motor: its link worker (telemetry, clearing `dirty`) and
// callers going through the registry (params, raising `dirty`). Both go through
// `MotorCell`, so neither sees the other's half-written state.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::warn;

use crate::messages::{MotorParams, ParamsUpdate, Telemetry};

#[derive(Debug, Clone, Default)]
pub struct MotorState {
    pub params: MotorParams,
    pub telemetry: Telemetry,
    /// Parameters changed since the last push
    pub dirty: bool,
    /// When `telemetry` was last overwritten by a poll
    pub sampled_at: Option<Instant>,
}

impl MotorState {
    pub fn update(&mut self, update: &ParamsUpdate) {
        update.apply_to(&mut self.params);
        self.dirty = true;
    }

    /// Clear `dirty` and hand back the params to push, if any are pending
    pub fn take_pending(&mut self) -> Option<MotorParams> {
        if self.dirty {
            self.dirty = false;
            Some(self.params)
        } else {
            None
        }
    }

    pub fn record_sample(&mut self, telemetry: Telemetry, at: Instant) {
        self.telemetry = telemetry;
        self.sampled_at = Some(at);
    }
}

/// Read-only copy of a motor handed out past the registry boundary
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MotorView {
    pub params: MotorParams,
    pub telemetry: Telemetry,
    pub dirty: bool,
    #[serde(skip)]
    pub sampled_at: Option<Instant>,
}

impl MotorView {
    /// Age of the cached telemetry, `None` if the board never answered
    pub fn sample_age(&self) -> Option<Duration> {
        self.sampled_at.map(|at| at.elapsed())
    }
}

/// One lock per motor
#[derive(Debug, Default)]
pub struct MotorCell {
    state: Mutex<MotorState>,
}

impl MotorCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the motor. A poisoned lock is recovered: the record is plain data
    /// and every writer leaves it consistent between statements.
    pub fn lock(&self) -> MutexGuard<'_, MotorState> {
        self.state.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            warn!("Motor state lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn view(&self) -> MotorView {
        let state = self.lock();
        MotorView {
            params: state.params,
            telemetry: state.telemetry,
            dirty: state.dirty,
            sampled_at: state.sampled_at,
        }
    }
}
