// Copyright (c) 2024 Graphcore Ltd. All rights reserved.

//! This module represents the time during a simulation.
//!
//! Time is a whole number of cycles; every component of a simulation is
//! stepped in lockstep, so a single counter is enough.

use std::ops::{Add, AddAssign, Sub};

/// A point in simulation time, measured in cycles.
///
/// Components never keep their own copy of the current time; the driver
/// threads the cycle through every call that needs it.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Cycle(pub u64);

impl Cycle {
    /// The first cycle of a simulation.
    pub const ZERO: Cycle = Cycle(0);

    /// Get the cycle count.
    pub fn tick(&self) -> u64 {
        self.0
    }

    /// The cycle after this one.
    #[must_use]
    pub fn next(self) -> Cycle {
        Cycle(self.0 + 1)
    }
}

impl Add<u64> for Cycle {
    type Output = Cycle;

    fn add(self, ticks: u64) -> Cycle {
        Cycle(self.0 + ticks)
    }
}

impl AddAssign<u64> for Cycle {
    fn add_assign(&mut self, ticks: u64) {
        self.0 += ticks;
    }
}

impl Sub<u64> for Cycle {
    type Output = Cycle;

    fn sub(self, ticks: u64) -> Cycle {
        Cycle(self.0 - ticks)
    }
}

impl std::fmt::Display for Cycle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
