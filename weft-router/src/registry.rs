// Copyright (c) 2024 Graphcore Ltd. All rights reserved.

//! The driver-owned router registry.
//!
//! Routers never hold references to each other; cross-router effects travel
//! either through channels or as [`PowerNotice`] records applied here by id
//! after all routers have stepped.

use std::cell::RefCell;
use std::rc::Rc;

use weft_engine::Cycle;

use crate::buffer_state::PowerState;
use crate::iq::{IqRouter, PowerNotice};

/// Id-indexed collection of routers stepped in lockstep.
#[derive(Default)]
pub struct Registry {
    routers: Vec<Rc<RefCell<IqRouter>>>,
}

impl Registry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a router. Its configured id must equal its registry index.
    pub fn register(&mut self, router: Rc<RefCell<IqRouter>>) -> usize {
        let id = self.routers.len();
        assert_eq!(router.borrow().id(), id, "router id must match registry index");
        self.routers.push(router);
        id
    }

    /// Number of registered routers.
    pub fn len(&self) -> usize {
        self.routers.len()
    }

    /// Whether no routers are registered.
    pub fn is_empty(&self) -> bool {
        self.routers.is_empty()
    }

    /// Shared handle to one router.
    pub fn get(&self, id: usize) -> &Rc<RefCell<IqRouter>> {
        &self.routers[id]
    }

    /// Run one cycle: every router reads its inputs, then every router
    /// evaluates, then every router writes its outputs. Power notices are
    /// applied last so a drain observed this cycle idles the upstream gate
    /// before the next cycle begins.
    pub fn step(&mut self, now: Cycle) {
        for router in &self.routers {
            router.borrow_mut().read_inputs(now);
        }
        for router in &self.routers {
            router.borrow_mut().evaluate(now);
        }
        for router in &self.routers {
            router.borrow_mut().write_outputs(now);
        }

        let notices: Vec<PowerNotice> = self
            .routers
            .iter()
            .flat_map(|router| router.borrow_mut().drain_power_notices())
            .collect();
        for notice in notices {
            self.routers[notice.router]
                .borrow_mut()
                .apply_power_idle(notice.output);
        }
    }

    /// Power state of one (router, output) gate.
    pub fn power_state(&self, router: usize, output: usize) -> PowerState {
        self.routers[router].borrow().power_state(output)
    }

    /// Force one (router, output) gate idle.
    pub fn set_power_idle(&self, router: usize, output: usize) {
        self.routers[router].borrow_mut().apply_power_idle(output);
    }
}
