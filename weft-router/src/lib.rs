// Copyright (c) 2024 Graphcore Ltd. All rights reserved.

//! Cycle-accurate virtual-channel router models.
//!
//! The crate provides the microarchitectural core of a credit-based,
//! input-queued router: flit and credit message types, per-input virtual
//! channels, the output-side buffer mirror with its sharing policies and
//! power gating, separable allocators, the five-stage pipeline itself and a
//! registry for stepping a network of routers in lockstep.
//!
//! Simulation substrate (cycles, channels, delay queues, configuration)
//! comes from `weft-engine`; log and trace plumbing from `weft-track`.

// Enable warnings for missing documentation
#![warn(missing_docs)]

pub mod alloc;
pub mod buffer_state;
pub mod flit;
pub mod iq;
pub mod outputset;
pub mod registry;
pub mod vc;

pub use flit::{Credit, Flit};
pub use iq::{IqRouter, RouteFn, RouterView};
pub use outputset::OutputSet;
pub use registry::Registry;
