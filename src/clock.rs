/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Time sources for the aggregation schedule, in real and simulated time.

use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

/// A monotonic time source. Readings are offsets from the clock's epoch;
/// only differences between readings are meaningful.
pub trait Clock {
    /// The time elapsed since the clock's epoch.
    fn now(&self) -> Duration;
}

static REAL_EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

/// The process monotonic clock, for production use.
#[derive(Debug, Clone, Default)]
pub struct RealClock;

impl Clock for RealClock {
    fn now(&self) -> Duration {
        REAL_EPOCH.elapsed()
    }
}

/// A manually advanced clock for deterministic tests. Clones share the
/// same time, so one handle can drive the schedules of many machines.
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    now: Arc<Mutex<Duration>>,
}

impl SimClock {
    /// Create a new simulated clock at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the simulated time.
    pub fn advance(&self, duration: Duration) {
        *self.now.lock().unwrap() += duration;
    }
}

impl Clock for SimClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap()
    }
}

/// An adapter that selects between real and simulated time.
#[derive(Debug, Clone)]
pub enum ClockKind {
    /// Real monotonic time.
    Real(RealClock),
    /// Simulated, manually advanced time.
    Sim(SimClock),
}

impl Clock for ClockKind {
    fn now(&self) -> Duration {
        match self {
            Self::Real(clock) => clock.now(),
            Self::Sim(clock) => clock.now(),
        }
    }
}

impl Default for ClockKind {
    fn default() -> Self {
        Self::Real(RealClock)
    }
}
