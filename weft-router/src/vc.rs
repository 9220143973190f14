// Copyright (c) 2024 Graphcore Ltd. All rights reserved.

//! Per-input virtual channels.

use std::collections::VecDeque;

use crate::flit::Flit;
use crate::outputset::OutputSet;

/// The allocation state of a virtual channel.
///
/// A VC advances monotonically through these states for each packet and
/// returns to `Idle` (or directly to `Routing`/`VcAlloc` for a queued packet)
/// once the packet's tail has left.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VcState {
    /// No packet occupies the VC.
    Idle,
    /// Route computation in progress for the head flit.
    Routing,
    /// Waiting for an output VC to be allocated.
    VcAlloc,
    /// Output VC assigned; flits compete for the switch.
    Active,
}

/// A single virtual channel: a flit FIFO plus allocation state.
#[derive(Debug)]
pub struct VirtualChannel {
    buffer: VecDeque<Flit>,
    state: VcState,

    /// Candidate outputs for the packet at the head of the buffer.
    route_set: OutputSet,

    /// The output port and VC assigned by VC allocation.
    output: Option<(usize, usize)>,
}

impl VirtualChannel {
    fn new() -> Self {
        Self {
            buffer: VecDeque::new(),
            state: VcState::Idle,
            route_set: OutputSet::new(),
            output: None,
        }
    }

    /// The current allocation state.
    pub fn state(&self) -> VcState {
        self.state
    }

    /// Move to a new allocation state.
    pub fn set_state(&mut self, state: VcState) {
        self.state = state;
    }

    /// The flit at the head of the FIFO.
    pub fn front(&self) -> Option<&Flit> {
        self.buffer.front()
    }

    /// Whether the FIFO is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Number of buffered flits.
    pub fn occupancy(&self) -> usize {
        self.buffer.len()
    }

    /// The candidate outputs for the head packet.
    pub fn route_set(&self) -> &OutputSet {
        &self.route_set
    }

    /// Install the candidate outputs for the head packet.
    pub fn set_route_set(&mut self, route_set: OutputSet) {
        self.route_set = route_set;
    }

    /// The assigned output port, once VC allocation has completed.
    pub fn output_port(&self) -> usize {
        self.output.expect("VC has no output assigned").0
    }

    /// The assigned output VC, once VC allocation has completed.
    pub fn output_vc(&self) -> usize {
        self.output.expect("VC has no output assigned").1
    }

    /// Record the output-side assignment made by VC allocation.
    pub fn set_output(&mut self, port: usize, vc: usize) {
        self.output = Some((port, vc));
    }

    /// Priority of the head packet; used as the out-priority in allocation.
    pub fn priority(&self) -> i64 {
        self.buffer.front().map_or(0, |f| f.pri)
    }
}

/// All the virtual channels behind one input port.
#[derive(Debug)]
pub struct InputBuffer {
    vcs: Vec<VirtualChannel>,
    occupancy: usize,
}

impl InputBuffer {
    /// Create `num_vcs` idle, empty VCs.
    #[must_use]
    pub fn new(num_vcs: usize) -> Self {
        Self {
            vcs: (0..num_vcs).map(|_| VirtualChannel::new()).collect(),
            occupancy: 0,
        }
    }

    /// Shared access to one VC.
    pub fn vc(&self, vc: usize) -> &VirtualChannel {
        &self.vcs[vc]
    }

    /// Exclusive access to one VC.
    pub fn vc_mut(&mut self, vc: usize) -> &mut VirtualChannel {
        &mut self.vcs[vc]
    }

    /// Append a flit to the given VC.
    pub fn add_flit(&mut self, vc: usize, flit: Flit) {
        self.occupancy += 1;
        self.vcs[vc].buffer.push_back(flit);
    }

    /// Remove and return the head flit of the given VC.
    pub fn remove_flit(&mut self, vc: usize) -> Flit {
        assert!(self.occupancy > 0);
        self.occupancy -= 1;
        self.vcs[vc]
            .buffer
            .pop_front()
            .expect("removing flit from empty VC")
    }

    /// Total flits buffered across all VCs.
    pub fn occupancy(&self) -> usize {
        self.occupancy
    }

    /// Whether every VC is idle and empty. This is what lets the upstream
    /// output start its idle-detection countdown.
    pub fn is_idle(&self) -> bool {
        self.occupancy == 0 && self.vcs.iter().all(|vc| vc.state == VcState::Idle)
    }
}
