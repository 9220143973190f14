// Copyright (c) 2024 Graphcore Ltd. All rights reserved.

//! The input-queued router pipeline.
//!
//! Flits pass through five stages: route computation, VC allocation, switch
//! allocation (with optional holding and speculation), crossbar traversal and
//! output queuing, with a credit sent upstream as each flit leaves its input
//! buffer. Every stage is a [`DelayQueue`]; a cycle runs all stage Evaluates
//! (which schedule or stall work) before all stage Updates (which commit it),
//! so no stage can observe a same-cycle change out of order.
//!
//! The driver calls [`read_inputs`](IqRouter::read_inputs),
//! [`evaluate`](IqRouter::evaluate) and [`write_outputs`](IqRouter::write_outputs)
//! once per cycle, in that order, for every router before moving to the next
//! phase.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

use weft_engine::Cycle;
use weft_engine::channel::{Channel, Endpoint};
use weft_engine::config::Config;
use weft_engine::delay::{DelayQueue, Timing};
use weft_engine::types::SimError;
use weft_track::entity::Entity;
use weft_track::{create_tag, debug, trace};

use crate::alloc::{Allocate, new_allocator, supersedes};
use crate::buffer_state::{BufferState, PowerState};
use crate::flit::{Credit, Flit};
use crate::outputset::{OutputSet, RouteCandidate};
use crate::vc::{InputBuffer, VcState};

/// A flit channel shared between a router and the driver that wired it.
pub type SharedFlitChannel = Rc<RefCell<Channel<Flit>>>;
/// A credit channel shared between a router and the driver that wired it.
pub type SharedCreditChannel = Rc<RefCell<Channel<Credit>>>;

/// What the routing function can see of the router it runs in.
#[derive(Clone, Copy, Debug)]
pub struct RouterView {
    /// Registry id of the router.
    pub id: usize,
    /// Number of input ports.
    pub inputs: usize,
    /// Number of output ports.
    pub outputs: usize,
    /// Number of VCs per port.
    pub vcs: usize,
}

/// A routing function: fill `set` with the candidate outputs for `flit`
/// arriving on `in_port`.
pub type RouteFn = Arc<dyn Fn(&RouterView, &Flit, usize, &mut OutputSet)>;

/// Why a VC failed to advance this cycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stall {
    /// Every candidate output VC is owned by another packet.
    BufferBusy,
    /// Allocation granted the resource to a competing request.
    BufferConflict,
    /// The downstream buffer has no credit.
    BufferFull,
    /// Candidate VCs are held until their tail credit returns.
    BufferReserved,
    /// A crossbar port is matched or held elsewhere.
    CrossbarConflict,
}

/// Per-class stall counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StallCounts {
    /// [`Stall::BufferBusy`] events.
    pub buffer_busy: u64,
    /// [`Stall::BufferConflict`] events.
    pub buffer_conflict: u64,
    /// [`Stall::BufferFull`] events.
    pub buffer_full: u64,
    /// [`Stall::BufferReserved`] events.
    pub buffer_reserved: u64,
    /// [`Stall::CrossbarConflict`] events.
    pub crossbar_conflict: u64,
}

impl StallCounts {
    fn count(&mut self, stall: Stall) {
        match stall {
            Stall::BufferBusy => self.buffer_busy += 1,
            Stall::BufferConflict => self.buffer_conflict += 1,
            Stall::BufferFull => self.buffer_full += 1,
            Stall::BufferReserved => self.buffer_reserved += 1,
            Stall::CrossbarConflict => self.crossbar_conflict += 1,
        }
    }
}

/// A drained input buffer at (router, output): the upstream gate may idle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PowerNotice {
    /// Registry id of the upstream router.
    pub router: usize,
    /// Output port on the upstream router feeding the drained buffer.
    pub output: usize,
}

struct RouteItem {
    input: usize,
    vc: usize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum VcAllocOutcome {
    Pending,
    Granted { output: usize, out_vc: usize },
    Stalled(Stall),
}

struct VcAllocItem {
    input: usize,
    vc: usize,
    outcome: VcAllocOutcome,
}

impl VcAllocItem {
    fn pending(input: usize, vc: usize) -> Self {
        Self {
            input,
            vc,
            outcome: VcAllocOutcome::Pending,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SwOutcome {
    Pending,
    Granted {
        expanded_output: usize,
        speculative: bool,
    },
    Stalled(Stall),
}

struct SwAllocItem {
    input: usize,
    vc: usize,
    outcome: SwOutcome,
}

impl SwAllocItem {
    fn pending(input: usize, vc: usize) -> Self {
        Self {
            input,
            vc,
            outcome: SwOutcome::Pending,
        }
    }
}

struct SwHoldItem {
    input: usize,
    vc: usize,
    expanded_output: usize,
    send: bool,
}

struct CrossbarItem {
    flit: Flit,
    expanded_input: usize,
    expanded_output: usize,
}

/// An input-queued VC router.
pub struct IqRouter {
    entity: Arc<Entity>,
    id: usize,
    inputs: usize,
    outputs: usize,
    vcs: usize,
    classes: usize,
    input_speedup: usize,
    output_speedup: usize,

    routing_delay: u64,
    vc_alloc_delay: u64,
    sw_alloc_delay: u64,
    crossbar_delay: u64,
    credit_delay: u64,

    speculative: bool,
    spec_check_elig: bool,
    spec_check_cred: bool,
    spec_mask_by_reqs: bool,
    vc_busy_when_full: bool,
    vc_prioritize_empty: bool,
    vc_shuffle_requests: bool,
    hold_switch_for_packet: bool,
    noq: bool,
    piggyback: bool,
    /// Routing delay zero: routes travel with head flits one hop ahead.
    lookahead: bool,
    output_buffer_size: Option<usize>,

    route_fn: RouteFn,

    buf: Vec<InputBuffer>,
    next_buf: Vec<BufferState>,

    vc_allocator: Option<Box<dyn Allocate>>,
    sw_allocator: Box<dyn Allocate>,
    spec_sw_allocator: Option<Box<dyn Allocate>>,

    /// Per (input, VC): the next hop's route, computed when the head
    /// arrived, so the output VC chosen here can encode the next router's
    /// output port (NOQ).
    noq_next: Vec<Option<RouteCandidate>>,

    /// Per expanded input: VC whose switch requests win ties.
    sw_rr_offset: Vec<usize>,
    /// Per (output, class): next VC the piggybacked allocation prefers.
    vc_rr_offset: Vec<usize>,

    switch_hold_in: Vec<Option<usize>>,
    switch_hold_out: Vec<Option<usize>>,
    switch_hold_vc: Vec<Option<usize>>,

    route_vcs: DelayQueue<RouteItem>,
    vc_alloc_vcs: DelayQueue<VcAllocItem>,
    sw_hold_vcs: DelayQueue<SwHoldItem>,
    sw_alloc_vcs: DelayQueue<SwAllocItem>,
    crossbar_flits: DelayQueue<CrossbarItem>,
    proc_credits: DelayQueue<(usize, Credit)>,

    in_queue_flits: BTreeMap<usize, Flit>,
    out_queue_credits: BTreeMap<usize, Credit>,
    output_buffer: Vec<VecDeque<Flit>>,

    input_channels: Vec<Option<SharedFlitChannel>>,
    input_credit_channels: Vec<Option<SharedCreditChannel>>,
    output_channels: Vec<Option<SharedFlitChannel>>,
    output_credit_channels: Vec<Option<SharedCreditChannel>>,

    stall_counts: Vec<StallCounts>,
    power_notices: Vec<PowerNotice>,
    credit_counter: u64,
}

impl IqRouter {
    /// Build a router with `inputs` x `outputs` ports from the shared
    /// configuration. Configuration contradictions are reported as errors;
    /// runtime invariant violations panic.
    pub fn new(
        parent: &Arc<Entity>,
        name: &str,
        id: usize,
        inputs: usize,
        outputs: usize,
        route_fn: RouteFn,
        config: &Config,
    ) -> Result<Self, SimError> {
        let entity = Arc::new(Entity::new(parent, name));

        let vcs = config.int_or("num_vcs", 1) as usize;
        let classes = config.int_or("classes", 1) as usize;
        let input_speedup = config.int_or("input_speedup", 1) as usize;
        let output_speedup = config.int_or("output_speedup", 1) as usize;
        if inputs == 0 || outputs == 0 || vcs == 0 || classes == 0 {
            return Err(SimError(format!(
                "router {name} needs ports, VCs and classes, got {inputs}x{outputs}, \
                 {vcs} VCs, {classes} classes"
            )));
        }
        if input_speedup == 0 || vcs % input_speedup != 0 {
            return Err(SimError(format!(
                "input speedup {input_speedup} must divide the VC count {vcs}"
            )));
        }
        if output_speedup == 0 {
            return Err(SimError("output speedup must be at least 1".to_owned()));
        }

        let routing_delay = config.int_or("routing_delay", 1);
        let vc_alloc_delay = config.int_or("vc_alloc_delay", 1);
        let sw_alloc_delay = config.int_or("sw_alloc_delay", 1);
        let crossbar_delay = config.int_or("crossbar_delay", 1);
        let credit_delay = config.int_or("credit_delay", 0);
        if routing_delay < 0 || vc_alloc_delay < 1 || sw_alloc_delay < 1 || crossbar_delay < 1 {
            return Err(SimError(format!(
                "allocation and crossbar delays must be at least 1 and the routing delay \
                 non-negative, got routing {routing_delay}, VC {vc_alloc_delay}, \
                 switch {sw_alloc_delay}, crossbar {crossbar_delay}"
            )));
        }

        let speculative = config.bool_or("speculative", false);
        let vc_alloc_kind = config.str_or("vc_allocator", "islip");
        let piggyback = vc_alloc_kind == "piggyback";
        if piggyback && !speculative {
            return Err(SimError(
                "piggybacked VC allocation requires speculative switch allocation".to_owned(),
            ));
        }
        if speculative && !piggyback && vc_alloc_delay != sw_alloc_delay {
            return Err(SimError(format!(
                "speculative allocation needs matching VC and switch allocation delays, \
                 got {vc_alloc_delay} and {sw_alloc_delay}"
            )));
        }

        let noq = config.bool_or("noq", false);
        if noq && routing_delay != 0 {
            return Err(SimError(
                "NOQ needs lookahead routing (routing_delay 0)".to_owned(),
            ));
        }
        if noq && vcs < outputs {
            return Err(SimError(format!(
                "NOQ needs at least one VC per output, got {vcs} VCs for {outputs} outputs"
            )));
        }

        let iters = config.int_or("alloc_iters", 1) as usize;
        let vc_allocator = if piggyback {
            None
        } else {
            Some(new_allocator(
                &entity,
                "vc_alloc",
                &vc_alloc_kind,
                inputs * vcs,
                outputs * vcs,
                iters,
            )?)
        };
        let sw_allocator = new_allocator(
            &entity,
            "sw_alloc",
            &config.str_or("sw_allocator", "islip"),
            inputs * input_speedup,
            outputs * output_speedup,
            iters,
        )?;
        let spec_kind = config.str_or("spec_sw_allocator", "prio");
        let spec_sw_allocator = if speculative && spec_kind != "prio" {
            Some(new_allocator(
                &entity,
                "spec_sw_alloc",
                &spec_kind,
                inputs * input_speedup,
                outputs * output_speedup,
                iters,
            )?)
        } else {
            None
        };

        let next_buf = (0..outputs)
            .map(|output| BufferState::new(&entity, &format!("next_buf{output}"), config))
            .collect::<Result<Vec<_>, _>>()?;

        let output_buffer_size = match config.int_or("output_buffer_size", -1) {
            n if n < 0 => None,
            n => Some(n as usize),
        };

        Ok(Self {
            id,
            inputs,
            outputs,
            vcs,
            classes,
            input_speedup,
            output_speedup,
            routing_delay: routing_delay as u64,
            vc_alloc_delay: vc_alloc_delay as u64,
            sw_alloc_delay: sw_alloc_delay as u64,
            crossbar_delay: crossbar_delay as u64,
            credit_delay: credit_delay.max(0) as u64,
            speculative,
            spec_check_elig: config.bool_or("spec_check_elig", true),
            spec_check_cred: config.bool_or("spec_check_cred", true),
            spec_mask_by_reqs: config.bool_or("spec_mask_by_reqs", true),
            vc_busy_when_full: config.bool_or("vc_busy_when_full", false),
            vc_prioritize_empty: config.bool_or("vc_prioritize_empty", false),
            vc_shuffle_requests: config.bool_or("vc_shuffle_requests", false),
            hold_switch_for_packet: config.bool_or("hold_switch_for_packet", false),
            noq,
            piggyback,
            lookahead: routing_delay == 0,
            output_buffer_size,
            route_fn,
            buf: (0..inputs).map(|_| InputBuffer::new(vcs)).collect(),
            next_buf,
            vc_allocator,
            sw_allocator,
            spec_sw_allocator,
            noq_next: vec![None; inputs * vcs],
            sw_rr_offset: vec![0; inputs * input_speedup],
            vc_rr_offset: vec![0; outputs * classes],
            switch_hold_in: vec![None; inputs * input_speedup],
            switch_hold_out: vec![None; outputs * output_speedup],
            switch_hold_vc: vec![None; inputs * input_speedup],
            route_vcs: DelayQueue::new(),
            vc_alloc_vcs: DelayQueue::new(),
            sw_hold_vcs: DelayQueue::new(),
            sw_alloc_vcs: DelayQueue::new(),
            crossbar_flits: DelayQueue::new(),
            proc_credits: DelayQueue::new(),
            in_queue_flits: BTreeMap::new(),
            out_queue_credits: BTreeMap::new(),
            output_buffer: (0..outputs).map(|_| VecDeque::new()).collect(),
            input_channels: (0..inputs).map(|_| None).collect(),
            input_credit_channels: (0..inputs).map(|_| None).collect(),
            output_channels: (0..outputs).map(|_| None).collect(),
            output_credit_channels: (0..outputs).map(|_| None).collect(),
            stall_counts: vec![StallCounts::default(); classes],
            power_notices: Vec::new(),
            credit_counter: 0,
            entity,
        })
    }

    /// Registry id.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Wire a flit channel and its credit backchannel into input `port`.
    pub fn add_input_channel(
        &mut self,
        port: usize,
        channel: SharedFlitChannel,
        credit_channel: SharedCreditChannel,
    ) {
        let here = Endpoint {
            router: self.id,
            port,
        };
        channel.borrow_mut().set_sink(here);
        credit_channel.borrow_mut().set_source(here);
        self.input_channels[port] = Some(channel);
        self.input_credit_channels[port] = Some(credit_channel);
    }

    /// Wire a flit channel and its credit backchannel onto output `port`.
    ///
    /// The minimum credit round trip through this output is installed into
    /// the output's buffer state for the feedback policies.
    pub fn add_output_channel(
        &mut self,
        port: usize,
        channel: SharedFlitChannel,
        credit_channel: SharedCreditChannel,
    ) {
        let here = Endpoint {
            router: self.id,
            port,
        };
        channel.borrow_mut().set_source(here);
        credit_channel.borrow_mut().set_sink(here);
        let min_latency = 1
            + self.crossbar_delay
            + channel.borrow().latency()
            + self.routing_delay
            + self.vc_alloc_delay
            + self.sw_alloc_delay
            + credit_channel.borrow().latency()
            + self.credit_delay;
        self.next_buf[port].set_min_latency(min_latency);
        self.output_channels[port] = Some(channel);
        self.output_credit_channels[port] = Some(credit_channel);
    }

    fn view(&self) -> RouterView {
        RouterView {
            id: self.id,
            inputs: self.inputs,
            outputs: self.outputs,
            vcs: self.vcs,
        }
    }

    fn expanded_input(&self, input: usize, vc: usize) -> usize {
        input * self.input_speedup + vc % self.input_speedup
    }

    fn expanded_output(&self, output: usize, input: usize) -> usize {
        output * self.output_speedup + input % self.output_speedup
    }

    /// The VC range of `cand` that (input, vc) may actually request, after
    /// NOQ partitioning and power-gate duty redirection.
    ///
    /// The NOQ partition was precomputed when the head arrived; it is absent
    /// when the chosen output has no downstream router.
    fn candidate_vc_range(&self, input: usize, vc: usize, cand: &RouteCandidate) -> (usize, usize) {
        let (mut start, mut end) = (cand.vc_start, cand.vc_end);
        if self.noq {
            if let Some(next) = &self.noq_next[input * self.vcs + vc] {
                start = next.vc_start;
                end = next.vc_end;
            }
        }
        if let Some(duty) = self.next_buf[cand.output_port].power().redirect() {
            start = duty;
            end = duty;
        }
        (start, end)
    }

    /// Route one hop further for an arriving head so the output VC chosen
    /// here can encode the output port the flit will take at the next
    /// router. Stores nothing when the output is not wired to a router.
    fn update_noq(&mut self, input: usize, vc: usize) {
        let out_port = self.buf[input].vc(vc).route_set().single().output_port;
        let Some(channel) = &self.output_channels[out_port] else {
            return;
        };
        let Some(sink) = channel.borrow().sink() else {
            return;
        };
        let next_view = RouterView {
            id: sink.router,
            inputs: self.inputs,
            outputs: self.outputs,
            vcs: self.vcs,
        };
        let mut set = OutputSet::new();
        {
            let head = self.buf[input].vc(vc).front().expect("no head flit");
            assert!(head.head);
            (self.route_fn)(&next_view, head, sink.port, &mut set);
        }
        let next = *set.single();
        let count = (next.vc_end - next.vc_start + 1) / self.outputs;
        assert!(count > 0, "next-hop VC range too narrow to partition");
        let partitioned = RouteCandidate {
            output_port: next.output_port,
            vc_start: next.vc_start + next.output_port * count,
            vc_end: next.vc_start + (next.output_port + 1) * count - 1,
            pri: next.pri,
        };
        assert!(partitioned.vc_end < self.vcs);
        let slot = input * self.vcs + vc;
        assert!(self.noq_next[slot].is_none(), "next-hop route already computed");
        self.noq_next[slot] = Some(partitioned);
    }

    fn has_work(&self) -> bool {
        !self.in_queue_flits.is_empty()
            || !self.proc_credits.is_empty()
            || !self.route_vcs.is_empty()
            || !self.vc_alloc_vcs.is_empty()
            || !self.sw_hold_vcs.is_empty()
            || !self.sw_alloc_vcs.is_empty()
            || !self.crossbar_flits.is_empty()
    }

    /// Pull arrived flits and credits off the wires. First phase of a cycle.
    pub fn read_inputs(&mut self, now: Cycle) {
        for input in 0..self.inputs {
            if let Some(channel) = &self.input_channels[input] {
                if let Some(flit) = channel.borrow_mut().receive(now) {
                    let previous = self.in_queue_flits.insert(input, flit);
                    assert!(previous.is_none(), "two flits on input {input} in one cycle");
                }
            }
        }
        for output in 0..self.outputs {
            if let Some(channel) = &self.output_credit_channels[output] {
                if let Some(credit) = channel.borrow_mut().receive(now) {
                    self.proc_credits
                        .push_at(now + self.credit_delay, (output, credit));
                }
            }
        }
    }

    /// Run one cycle of the pipeline. Second phase of a cycle.
    ///
    /// All stage Evaluates run before all stage Updates; an idle router only
    /// advances its power timers.
    pub fn evaluate(&mut self, now: Cycle) {
        if !self.has_work() {
            for output in 0..self.outputs {
                self.next_buf[output].power_tick(now);
            }
            return;
        }

        self.input_queuing(now);

        if !self.lookahead {
            self.route_evaluate(now);
        }
        if let Some(allocator) = self.vc_allocator.as_mut() {
            allocator.clear();
        }
        if !self.piggyback {
            self.vc_alloc_evaluate(now);
        }
        if self.hold_switch_for_packet {
            self.sw_hold_evaluate(now);
        }
        self.sw_allocator.clear();
        if let Some(spec) = self.spec_sw_allocator.as_mut() {
            spec.clear();
        }
        self.sw_alloc_evaluate(now);
        self.switch_evaluate(now);

        if !self.lookahead {
            self.route_update(now);
        }
        if !self.piggyback {
            self.vc_alloc_update(now);
        }
        if self.hold_switch_for_packet {
            self.sw_hold_update(now);
        }
        self.sw_alloc_update(now);
        self.switch_update(now);

        // A no-op for gates an arrival already advanced this cycle
        for output in 0..self.outputs {
            self.next_buf[output].power_tick(now);
        }
    }

    /// Push departing flits and merged credits onto the wires. Third phase.
    pub fn write_outputs(&mut self, now: Cycle) {
        for output in 0..self.outputs {
            if let Some(flit) = self.output_buffer[output].pop_front() {
                if let Some(channel) = &self.output_channels[output] {
                    channel.borrow_mut().send(flit, now);
                }
            }
        }
        let credits = std::mem::take(&mut self.out_queue_credits);
        for (input, credit) in credits {
            if let Some(channel) = &self.input_credit_channels[input] {
                channel.borrow_mut().send(credit, now);
            }
        }
    }

    fn input_queuing(&mut self, now: Cycle) {
        let arrivals = std::mem::take(&mut self.in_queue_flits);
        for (input, flit) in arrivals {
            let vc = flit.vc;
            trace!(self.entity; "{flit} arrived on input {input} VC {vc} at {now}");
            let was_empty = self.buf[input].vc(vc).is_empty();
            let state = self.buf[input].vc(vc).state();
            if state == VcState::Idle {
                assert!(flit.head, "non-head flit arrived at idle VC {vc}");
            }
            self.buf[input].add_flit(vc, flit);
            if was_empty {
                match state {
                    VcState::Idle => self.start_packet(input, vc),
                    VcState::Active => {
                        // A held port resumes through the hold pipeline
                        let expanded_input = self.expanded_input(input, vc);
                        if self.switch_hold_vc[expanded_input] != Some(vc) {
                            self.sw_alloc_vcs.push(SwAllocItem::pending(input, vc));
                        }
                    }
                    VcState::Routing | VcState::VcAlloc => {}
                }
            }
        }

        while let Some((output, credit)) = self.proc_credits.pop_due(now) {
            self.next_buf[output].process_credit(now, &credit);
        }
    }

    /// Begin the pipeline for the head flit now at the front of an idle VC.
    fn start_packet(&mut self, input: usize, vc: usize) {
        let head = self.buf[input].vc(vc).front().expect("no head flit");
        assert!(head.head, "packet starts with a non-head flit");
        if self.lookahead {
            let mut set = head.la_route_set.clone();
            if set.is_empty() {
                // Injected flits carry no lookahead; route locally
                let view = self.view();
                let head = self.buf[input].vc(vc).front().expect("no head flit");
                (self.route_fn)(&view, head, input, &mut set);
            }
            let cur_vc = self.buf[input].vc_mut(vc);
            cur_vc.set_route_set(set);
            cur_vc.set_state(VcState::VcAlloc);
            if self.noq {
                self.update_noq(input, vc);
            }
            if self.piggyback {
                self.sw_alloc_vcs.push(SwAllocItem::pending(input, vc));
            } else {
                self.vc_alloc_vcs.push(VcAllocItem::pending(input, vc));
                if self.speculative {
                    self.sw_alloc_vcs.push(SwAllocItem::pending(input, vc));
                }
            }
        } else {
            self.buf[input].vc_mut(vc).set_state(VcState::Routing);
            self.route_vcs.push(RouteItem { input, vc });
        }
    }

    fn route_evaluate(&mut self, now: Cycle) {
        let delay = self.routing_delay;
        self.route_vcs.schedule(|_| Timing::At(now + delay - 1));
    }

    fn route_update(&mut self, now: Cycle) {
        while let Some(RouteItem { input, vc }) = self.route_vcs.pop_due(now) {
            let mut set = OutputSet::new();
            {
                let view = self.view();
                let head = self.buf[input].vc(vc).front().expect("routing an empty VC");
                (self.route_fn)(&view, head, input, &mut set);
            }
            assert!(!set.is_empty(), "routing produced no candidates");
            trace!(self.entity; "routed input {input} VC {vc}: {} candidates", set.len());
            let cur_vc = self.buf[input].vc_mut(vc);
            cur_vc.set_route_set(set);
            cur_vc.set_state(VcState::VcAlloc);
            if self.piggyback {
                self.sw_alloc_vcs.push(SwAllocItem::pending(input, vc));
            } else {
                self.vc_alloc_vcs.push(VcAllocItem::pending(input, vc));
                if self.speculative {
                    self.sw_alloc_vcs.push(SwAllocItem::pending(input, vc));
                }
            }
        }
    }

    fn vc_alloc_input_index(&self, input: usize, vc: usize) -> usize {
        if self.vc_shuffle_requests {
            vc * self.inputs + input
        } else {
            input * self.vcs + vc
        }
    }

    fn vc_alloc_evaluate(&mut self, now: Cycle) {
        // Raise requests for every VC newly waiting on allocation
        let pending: Vec<(usize, usize)> = self
            .vc_alloc_vcs
            .iter()
            .filter(|item| item.outcome == VcAllocOutcome::Pending)
            .map(|item| (item.input, item.vc))
            .collect();

        let mut stalls: BTreeMap<(usize, usize), Stall> = BTreeMap::new();
        for &(input, vc) in &pending {
            assert_eq!(self.buf[input].vc(vc).state(), VcState::VcAlloc);
            let flit = self.buf[input].vc(vc).front().expect("empty VC in allocation").clone();
            assert!(flit.head);
            let input_and_vc = self.vc_alloc_input_index(input, vc);
            let candidates: Vec<RouteCandidate> =
                self.buf[input].vc(vc).route_set().iter().copied().collect();

            let mut any_full = false;
            let mut any_reserved = false;
            let mut raised = false;
            for cand in candidates {
                let output = cand.output_port;
                self.next_buf[output].power_arrival(now);
                let (start, end) = self.candidate_vc_range(input, vc, &cand);
                for out_vc in start..=end {
                    let dest = &self.next_buf[output];
                    if !dest.is_available_for(out_vc) {
                        if dest.is_reserved_for(out_vc) {
                            any_reserved = true;
                        }
                        continue;
                    }
                    if self.vc_busy_when_full && dest.is_full_for(out_vc) {
                        any_full = true;
                        continue;
                    }
                    let mut in_pri = cand.pri;
                    if self.vc_prioritize_empty && !dest.is_empty_for(out_vc) {
                        assert!(in_pri >= 0);
                        in_pri += i64::MIN;
                    }
                    raised = true;
                    self.vc_allocator.as_mut().expect("no VC allocator").add_request(
                        input_and_vc,
                        output * self.vcs + out_vc,
                        input_and_vc,
                        in_pri,
                        flit.pri,
                    );
                }
            }
            if !raised {
                let stall = if any_full {
                    Stall::BufferFull
                } else if any_reserved {
                    Stall::BufferReserved
                } else {
                    Stall::BufferBusy
                };
                stalls.insert((input, vc), stall);
            }
        }

        let allocator = self.vc_allocator.as_mut().expect("no VC allocator");
        allocator.allocate();

        // Record outcomes and consume the allocation delay
        let allocator = self.vc_allocator.as_ref().expect("no VC allocator");
        let vcs = self.vcs;
        let inputs = self.inputs;
        let shuffle = self.vc_shuffle_requests;
        let delay = self.vc_alloc_delay;
        self.vc_alloc_vcs.schedule(|item| {
            item.outcome = if let Some(&stall) = stalls.get(&(item.input, item.vc)) {
                VcAllocOutcome::Stalled(stall)
            } else {
                let input_and_vc = if shuffle {
                    item.vc * inputs + item.input
                } else {
                    item.input * vcs + item.vc
                };
                match allocator.output_assigned(input_and_vc) {
                    Some(out_and_vc) => VcAllocOutcome::Granted {
                        output: out_and_vc / vcs,
                        out_vc: out_and_vc % vcs,
                    },
                    None => VcAllocOutcome::Stalled(Stall::BufferConflict),
                }
            };
            Timing::At(now + delay - 1)
        });

        // With a multi-cycle allocator a grant can go stale before it
        // matures; push the VC back through allocation when it has
        if self.vc_alloc_delay > 1 {
            let next_buf = &self.next_buf;
            let vc_busy_when_full = self.vc_busy_when_full;
            for (due, item) in self.vc_alloc_vcs.iter_with_due_mut() {
                if due != Some(now) {
                    continue;
                }
                if let VcAllocOutcome::Granted { output, out_vc } = item.outcome {
                    let dest = &next_buf[output];
                    if !dest.is_available_for(out_vc) {
                        item.outcome = VcAllocOutcome::Stalled(Stall::BufferBusy);
                    } else if vc_busy_when_full && dest.is_full_for(out_vc) {
                        let stall = if dest.is_full() {
                            Stall::BufferFull
                        } else {
                            Stall::BufferReserved
                        };
                        item.outcome = VcAllocOutcome::Stalled(stall);
                    }
                }
            }
        }
    }

    fn vc_alloc_update(&mut self, now: Cycle) {
        while let Some(item) = self.vc_alloc_vcs.pop_due(now) {
            let VcAllocItem { input, vc, outcome } = item;
            match outcome {
                VcAllocOutcome::Granted { output, out_vc } => {
                    debug!(self.entity;
                        "granted output {output} VC {out_vc} to input {input} VC {vc} at {now}");
                    self.next_buf[output].take_buffer(out_vc, input * self.vcs + vc);
                    let cur_vc = self.buf[input].vc_mut(vc);
                    cur_vc.set_state(VcState::Active);
                    cur_vc.set_output(output, out_vc);
                    if !self.speculative {
                        self.sw_alloc_vcs.push(SwAllocItem::pending(input, vc));
                    }
                }
                VcAllocOutcome::Stalled(stall) => {
                    let cl = self.buf[input].vc(vc).front().map_or(0, |f| f.cl);
                    self.stall_counts[cl].count(stall);
                    trace!(self.entity; "input {input} VC {vc} stalled in VC allocation: {stall:?}");
                    self.vc_alloc_vcs.push(VcAllocItem::pending(input, vc));
                }
                VcAllocOutcome::Pending => unreachable!("pending entry matured"),
            }
        }
    }

    fn sw_hold_evaluate(&mut self, now: Cycle) {
        let buf = &self.buf;
        let next_buf = &self.next_buf;
        self.sw_hold_vcs.schedule(|item| {
            let cur_vc = buf[item.input].vc(item.vc);
            assert_eq!(cur_vc.state(), VcState::Active);
            item.send = match cur_vc.front() {
                Some(_) => !next_buf[cur_vc.output_port()].is_full_for(cur_vc.output_vc()),
                None => false,
            };
            Timing::At(now)
        });
    }

    fn sw_hold_update(&mut self, now: Cycle) {
        while let Some(item) = self.sw_hold_vcs.pop_due(now) {
            let expanded_input = self.expanded_input(item.input, item.vc);
            assert_eq!(self.switch_hold_in[expanded_input], Some(item.expanded_output));
            if item.send {
                self.forward_flit(now, item.input, item.vc, item.expanded_output, true);
            } else {
                // Hold is released as soon as the port cannot be used
                trace!(self.entity;
                    "releasing switch hold on expanded input {expanded_input} at {now}");
                self.release_hold(expanded_input, item.expanded_output);
                if !self.buf[item.input].vc(item.vc).is_empty() {
                    self.sw_alloc_vcs.push(SwAllocItem::pending(item.input, item.vc));
                }
            }
        }
    }

    fn release_hold(&mut self, expanded_input: usize, expanded_output: usize) {
        self.switch_hold_in[expanded_input] = None;
        self.switch_hold_out[expanded_output] = None;
        self.switch_hold_vc[expanded_input] = None;
    }

    /// Record a switch request, superseding the slot's recorded request only
    /// if the new one wins the round-robin tie break.
    fn sw_alloc_add_req(&mut self, input: usize, vc: usize, output: usize, pri: i64, spec: bool) {
        assert!(pri >= 0, "flit priorities must be non-negative");
        let expanded_input = self.expanded_input(input, vc);
        let expanded_output = self.expanded_output(output, input);
        let pri = if spec { pri + i64::MIN } else { pri };
        let offset = self.sw_rr_offset[expanded_input];
        let vcs = self.vcs;
        let allocator = if spec && self.spec_sw_allocator.is_some() {
            self.spec_sw_allocator.as_mut().expect("spec allocator")
        } else {
            &mut self.sw_allocator
        };
        if let Some(existing) = allocator.read_request(expanded_input, expanded_output) {
            if !supersedes(vc, pri, existing.label, existing.in_pri, offset, vcs) {
                return;
            }
            allocator.remove_request(expanded_input, expanded_output, existing.label);
        }
        allocator.add_request(expanded_input, expanded_output, vc, pri, pri);
    }

    fn output_buffer_blocked(&self, output: usize) -> bool {
        self.output_buffer_size
            .is_some_and(|cap| self.output_buffer[output].len() >= cap)
    }

    fn sw_alloc_evaluate(&mut self, now: Cycle) {
        let pending: Vec<(usize, usize)> = self
            .sw_alloc_vcs
            .iter()
            .filter(|item| item.outcome == SwOutcome::Pending)
            .map(|item| (item.input, item.vc))
            .collect();

        let mut stalls: BTreeMap<(usize, usize), Stall> = BTreeMap::new();
        for &(input, vc) in &pending {
            let expanded_input = self.expanded_input(input, vc);
            if self.switch_hold_in[expanded_input].is_some() {
                stalls.insert((input, vc), Stall::CrossbarConflict);
                continue;
            }
            let flit = self.buf[input].vc(vc).front().expect("empty VC in allocation").clone();
            match self.buf[input].vc(vc).state() {
                VcState::Active => {
                    let output = self.buf[input].vc(vc).output_port();
                    let out_vc = self.buf[input].vc(vc).output_vc();
                    let expanded_output = self.expanded_output(output, input);
                    if self.switch_hold_out[expanded_output].is_some() {
                        stalls.insert((input, vc), Stall::CrossbarConflict);
                    } else if self.next_buf[output].is_full_for(out_vc)
                        || self.output_buffer_blocked(output)
                    {
                        stalls.insert((input, vc), Stall::BufferFull);
                    } else {
                        self.sw_alloc_add_req(input, vc, output, flit.pri, false);
                    }
                }
                VcState::VcAlloc => {
                    assert!(self.speculative);
                    assert!(flit.head);
                    let candidates: Vec<RouteCandidate> =
                        self.buf[input].vc(vc).route_set().iter().copied().collect();
                    let mut raised = false;
                    for cand in candidates {
                        let output = cand.output_port;
                        let expanded_output = self.expanded_output(output, input);
                        if self.switch_hold_out[expanded_output].is_some()
                            || self.output_buffer_blocked(output)
                        {
                            continue;
                        }
                        self.next_buf[output].power_arrival(now);
                        let (start, end) = self.candidate_vc_range(input, vc, &cand);
                        let dest = &self.next_buf[output];
                        if self.spec_check_elig
                            && !(start..=end).any(|v| dest.is_available_for(v))
                        {
                            continue;
                        }
                        if self.spec_check_cred && !(start..=end).any(|v| !dest.is_full_for(v)) {
                            continue;
                        }
                        self.sw_alloc_add_req(input, vc, output, flit.pri, true);
                        raised = true;
                    }
                    if !raised {
                        stalls.insert((input, vc), Stall::BufferBusy);
                    }
                }
                state => panic!("switch request from VC in state {state:?}"),
            }
        }

        self.sw_allocator.allocate();
        if let Some(spec) = self.spec_sw_allocator.as_mut() {
            spec.allocate();
        }

        let buf = &self.buf;
        let sw_allocator = &self.sw_allocator;
        let spec_sw_allocator = &self.spec_sw_allocator;
        let input_speedup = self.input_speedup;
        let output_speedup = self.output_speedup;
        let spec_mask_by_reqs = self.spec_mask_by_reqs;
        let delay = self.sw_alloc_delay;
        self.sw_alloc_vcs.schedule(|item| {
            item.outcome = if let Some(&stall) = stalls.get(&(item.input, item.vc)) {
                SwOutcome::Stalled(stall)
            } else {
                let expanded_input = item.input * input_speedup + item.vc % input_speedup;
                let cur_vc = buf[item.input].vc(item.vc);
                match cur_vc.state() {
                    VcState::Active => {
                        let expanded_output = cur_vc.output_port() * output_speedup
                            + item.input % output_speedup;
                        let won = sw_allocator.output_assigned(expanded_input)
                            == Some(expanded_output)
                            && sw_allocator
                                .read_request(expanded_input, expanded_output)
                                .is_some_and(|r| r.label == item.vc);
                        if won {
                            SwOutcome::Granted {
                                expanded_output,
                                speculative: false,
                            }
                        } else {
                            SwOutcome::Stalled(Stall::CrossbarConflict)
                        }
                    }
                    VcState::VcAlloc => {
                        let allocator: &dyn Allocate = spec_sw_allocator
                            .as_ref()
                            .map_or(&**sw_allocator, |spec| &**spec);
                        match allocator.output_assigned(expanded_input) {
                            Some(expanded_output)
                                if allocator
                                    .read_request(expanded_input, expanded_output)
                                    .is_some_and(|r| r.label == item.vc)
                                    && cur_vc.route_set().iter().any(|c| {
                                        c.output_port == expanded_output / output_speedup
                                    }) =>
                            {
                                // A dedicated speculative allocator defers to
                                // non-speculative winners
                                let beaten = spec_sw_allocator.is_some()
                                    && if spec_mask_by_reqs {
                                        sw_allocator.output_has_requests(expanded_output)
                                    } else {
                                        sw_allocator.input_assigned(expanded_output).is_some()
                                    };
                                if beaten {
                                    SwOutcome::Stalled(Stall::CrossbarConflict)
                                } else {
                                    SwOutcome::Granted {
                                        expanded_output,
                                        speculative: true,
                                    }
                                }
                            }
                            _ => SwOutcome::Stalled(Stall::CrossbarConflict),
                        }
                    }
                    state => panic!("switch outcome for VC in state {state:?}"),
                }
            };
            Timing::At(now + delay - 1)
        });

        // Re-validate multi-cycle grants as they mature
        if self.sw_alloc_delay > 1 {
            let buf = &self.buf;
            let next_buf = &self.next_buf;
            let output_buffer = &self.output_buffer;
            let output_buffer_size = self.output_buffer_size;
            let output_speedup = self.output_speedup;
            for (due, item) in self.sw_alloc_vcs.iter_with_due_mut() {
                if due != Some(now) {
                    continue;
                }
                if let SwOutcome::Granted {
                    expanded_output,
                    speculative: false,
                } = item.outcome
                {
                    let output = expanded_output / output_speedup;
                    let out_vc = buf[item.input].vc(item.vc).output_vc();
                    let blocked = output_buffer_size
                        .is_some_and(|cap| output_buffer[output].len() >= cap);
                    if next_buf[output].is_full_for(out_vc) || blocked {
                        item.outcome = SwOutcome::Stalled(Stall::BufferFull);
                    }
                }
            }
        }
    }

    fn sw_alloc_update(&mut self, now: Cycle) {
        while let Some(item) = self.sw_alloc_vcs.pop_due(now) {
            let SwAllocItem { input, vc, outcome } = item;
            match outcome {
                SwOutcome::Granted {
                    expanded_output,
                    speculative,
                } => {
                    if speculative {
                        let output = expanded_output / self.output_speedup;
                        if self.piggyback {
                            if !self.piggyback_vc_alloc(now, input, vc, output) {
                                let cl = self.buf[input].vc(vc).front().map_or(0, |f| f.cl);
                                self.stall_counts[cl].count(Stall::BufferBusy);
                                self.sw_alloc_vcs.push(SwAllocItem::pending(input, vc));
                                continue;
                            }
                        } else {
                            let cur_vc = self.buf[input].vc(vc);
                            let confirmed = cur_vc.state() == VcState::Active
                                && cur_vc.output_port() == output;
                            if !confirmed {
                                trace!(self.entity;
                                    "misspeculated switch grant for input {input} VC {vc} at {now}");
                                self.sw_alloc_vcs.push(SwAllocItem::pending(input, vc));
                                continue;
                            }
                        }
                    }
                    self.forward_flit(now, input, vc, expanded_output, false);
                }
                SwOutcome::Stalled(stall) => {
                    let cl = self.buf[input].vc(vc).front().map_or(0, |f| f.cl);
                    self.stall_counts[cl].count(stall);
                    trace!(self.entity;
                        "input {input} VC {vc} stalled in switch allocation: {stall:?}");
                    self.sw_alloc_vcs.push(SwAllocItem::pending(input, vc));
                }
                SwOutcome::Pending => unreachable!("pending entry matured"),
            }
        }
    }

    /// Allocate an output VC on the fly for a speculatively granted head
    /// flit. Returns false on a miss; the flit then retries next cycle.
    fn piggyback_vc_alloc(&mut self, now: Cycle, input: usize, vc: usize, output: usize) -> bool {
        let flit = self.buf[input].vc(vc).front().expect("empty VC in allocation").clone();
        assert!(flit.head);
        let offset = self.vc_rr_offset[output * self.classes + flit.cl];
        let candidates: Vec<RouteCandidate> = self.buf[input]
            .vc(vc)
            .route_set()
            .iter()
            .filter(|c| c.output_port == output)
            .copied()
            .collect();

        let mut best: Option<(usize, i64)> = None;
        for cand in candidates {
            let (start, end) = self.candidate_vc_range(input, vc, &cand);
            for out_vc in start..=end {
                let dest = &self.next_buf[output];
                if !dest.is_available_for(out_vc) || dest.is_full_for(out_vc) {
                    continue;
                }
                let replace = match best {
                    None => true,
                    Some((best_vc, best_pri)) => {
                        supersedes(out_vc, cand.pri, best_vc, best_pri, offset, self.vcs)
                    }
                };
                if replace {
                    best = Some((out_vc, cand.pri));
                }
            }
        }

        match best {
            Some((out_vc, _)) => {
                self.vc_rr_offset[output * self.classes + flit.cl] = (out_vc + 1) % self.vcs;
                debug!(self.entity;
                    "piggybacked output {output} VC {out_vc} onto input {input} VC {vc} at {now}");
                self.next_buf[output].take_buffer(out_vc, input * self.vcs + vc);
                let cur_vc = self.buf[input].vc_mut(vc);
                cur_vc.set_state(VcState::Active);
                cur_vc.set_output(output, out_vc);
                true
            }
            None => false,
        }
    }

    /// Move the flit at the front of (input, vc) into the crossbar stage,
    /// crediting the freed slot upstream and scheduling whatever the VC does
    /// next.
    fn forward_flit(
        &mut self,
        now: Cycle,
        input: usize,
        vc: usize,
        expanded_output: usize,
        from_hold: bool,
    ) {
        let expanded_input = self.expanded_input(input, vc);
        let output = expanded_output / self.output_speedup;
        let out_vc = self.buf[input].vc(vc).output_vc();
        if !from_hold {
            self.sw_rr_offset[expanded_input] = (vc + self.input_speedup) % self.vcs;
        }

        let mut flit = self.buf[input].remove_flit(vc);
        trace!(self.entity;
            "{flit} crossing from input {input} VC {vc} to output {output} VC {out_vc} at {now}");

        if !self.out_queue_credits.contains_key(&input) {
            let credit = self.new_credit();
            self.out_queue_credits.insert(input, credit);
        }
        self.out_queue_credits
            .get_mut(&input)
            .expect("credit just inserted")
            .vcs
            .insert(vc);

        let tail = flit.tail;
        flit.vc = out_vc;
        flit.hops += 1;
        if self.lookahead && flit.head {
            self.update_lookahead(&mut flit, input, vc, output);
        }
        self.next_buf[output].sending_flit(now, &flit);
        self.crossbar_flits.push(CrossbarItem {
            flit,
            expanded_input,
            expanded_output,
        });

        if tail {
            if from_hold {
                self.release_hold(expanded_input, expanded_output);
            }
            self.buf[input].vc_mut(vc).set_state(VcState::Idle);
            if !self.buf[input].vc(vc).is_empty() {
                self.start_packet(input, vc);
            } else if self.buf[input].is_idle() {
                self.queue_power_notice(input);
            }
        } else if from_hold {
            self.sw_hold_vcs.push(SwHoldItem {
                input,
                vc,
                expanded_output,
                send: false,
            });
        } else if self.hold_switch_for_packet {
            self.switch_hold_in[expanded_input] = Some(expanded_output);
            self.switch_hold_out[expanded_output] = Some(expanded_input);
            self.switch_hold_vc[expanded_input] = Some(vc);
            self.sw_hold_vcs.push(SwHoldItem {
                input,
                vc,
                expanded_output,
                send: false,
            });
        } else if !self.buf[input].vc(vc).is_empty() {
            self.sw_alloc_vcs.push(SwAllocItem::pending(input, vc));
        }
    }

    fn new_credit(&mut self) -> Credit {
        self.credit_counter += 1;
        Credit {
            vcs: BTreeSet::new(),
            id: self.credit_counter,
            tag: create_tag!(self.entity),
        }
    }

    /// Tell the upstream router that this input buffer has fully drained.
    fn queue_power_notice(&mut self, input: usize) {
        if let Some(channel) = &self.input_channels[input] {
            if let Some(source) = channel.borrow().source() {
                self.power_notices.push(PowerNotice {
                    router: source.router,
                    output: source.port,
                });
            }
        }
    }

    fn switch_evaluate(&mut self, now: Cycle) {
        let delay = self.crossbar_delay;
        self.crossbar_flits.schedule(|_| Timing::At(now + delay - 1));
    }

    fn switch_update(&mut self, now: Cycle) {
        let mut used_inputs = BTreeSet::new();
        let mut used_outputs = BTreeSet::new();
        while let Some(item) = self.crossbar_flits.pop_due(now) {
            let CrossbarItem {
                flit,
                expanded_input,
                expanded_output,
            } = item;
            assert!(used_inputs.insert(expanded_input), "crossbar input used twice");
            assert!(used_outputs.insert(expanded_output), "crossbar output used twice");
            let output = expanded_output / self.output_speedup;

            self.output_buffer[output].push_back(flit);
            if let Some(cap) = self.output_buffer_size {
                // Grants already in the crossbar when the cap check ran may
                // still land here; the staging buffer absorbs them
                let slack = self.crossbar_delay as usize * self.output_speedup
                    + self.output_speedup
                    - 1;
                assert!(
                    self.output_buffer[output].len() <= cap + slack,
                    "output buffer overrun"
                );
            }
        }
    }

    /// Route one hop ahead so the next router can skip its routing stage.
    ///
    /// Under NOQ the next hop was already routed on arrival; the stored
    /// partitioned candidate is consumed here. A head leaving through an
    /// unwired output carries no lookahead at all.
    fn update_lookahead(&mut self, flit: &mut Flit, input: usize, vc: usize, output: usize) {
        let sink = self.output_channels[output]
            .as_ref()
            .and_then(|channel| channel.borrow().sink());
        let Some(sink) = sink else {
            flit.la_route_set.clear();
            return;
        };
        if self.noq {
            let next = self.noq_next[input * self.vcs + vc]
                .take()
                .expect("next-hop route was not computed");
            flit.la_route_set.clear();
            flit.la_route_set
                .add_range(next.output_port, next.vc_start, next.vc_end, next.pri);
            return;
        }
        let next_view = RouterView {
            id: sink.router,
            inputs: self.inputs,
            outputs: self.outputs,
            vcs: self.vcs,
        };
        let mut set = OutputSet::new();
        (self.route_fn)(&next_view, flit, sink.port, &mut set);
        flit.la_route_set = set;
    }

    /// Stall counters for one traffic class.
    pub fn stall_counts(&self, class: usize) -> StallCounts {
        self.stall_counts[class]
    }

    /// Credits in use at one output (flits sent and not yet credited back).
    pub fn used_credit(&self, output: usize) -> usize {
        self.next_buf[output].occupancy()
    }

    /// Credits still available across all outputs.
    pub fn free_credits(&self) -> usize {
        self.next_buf
            .iter()
            .map(|bs| bs.size() - bs.occupancy())
            .sum()
    }

    /// Total credit capacity across all outputs.
    pub fn max_credits(&self) -> usize {
        self.next_buf.iter().map(BufferState::size).sum()
    }

    /// Flits buffered at one input.
    pub fn buffer_occupancy(&self, input: usize) -> usize {
        self.buf[input].occupancy()
    }

    /// Flits buffered across all inputs.
    pub fn total_buffer_occupancy(&self) -> usize {
        self.buf.iter().map(InputBuffer::occupancy).sum()
    }

    /// Flits waiting in output staging buffers.
    pub fn total_output_buffered(&self) -> usize {
        self.output_buffer.iter().map(VecDeque::len).sum()
    }

    /// Flits anywhere inside the router: input buffers, crossbar stage and
    /// output staging buffers.
    pub fn total_flits_inside(&self) -> usize {
        self.total_buffer_occupancy() + self.crossbar_flits.len() + self.total_output_buffered()
    }

    /// Power state of the gate guarding one downstream buffer.
    pub fn power_state(&self, output: usize) -> PowerState {
        self.next_buf[output].power().state()
    }

    /// Apply a drain notice to one output's power gate.
    pub fn apply_power_idle(&mut self, output: usize) {
        self.next_buf[output].power_set_idle();
    }

    /// Take the power notices queued since the last drain.
    pub fn drain_power_notices(&mut self) -> Vec<PowerNotice> {
        std::mem::take(&mut self.power_notices)
    }

    /// The buffer-state mirror for one output.
    pub fn next_buffer_state(&self, output: usize) -> &BufferState {
        &self.next_buf[output]
    }
}
