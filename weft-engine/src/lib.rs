// Copyright (c) 2024 Graphcore Ltd. All rights reserved.

// Enable warnings for missing documentation
#![warn(missing_docs)]

//! `WEFT` - Wire-level Evaluation of Fabric Timing
//!
//! This library provides the substrate on which the WEFT router models run:
//! the simulation [time](crate::time) base, the per-stage
//! [delay queue](crate::delay), fixed-latency [channels](crate::channel),
//! the named-option [configuration](crate::config) table and the shared
//! error [types](crate::types).
//!
//! Simulations are cycle-stepped: the driver advances every component in
//! lockstep, one cycle at a time, threading the current [`Cycle`] through
//! every call. Within a cycle each component first reads its inputs, then
//! evaluates, then writes its outputs, so no component can observe another's
//! same-cycle updates.

pub mod channel;
pub mod config;
pub mod delay;
pub mod time;
pub mod types;

pub use time::Cycle;
pub use types::{SimError, SimResult};
