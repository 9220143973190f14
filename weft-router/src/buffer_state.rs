// Copyright (c) 2024 Graphcore Ltd. All rights reserved.

//! Output-side view of a downstream input buffer.
//!
//! Each output port keeps a [`BufferState`] mirroring the buffer at the far
//! end of its channel. Flits sent decrement the mirrored space, credits
//! returned restore it. How the space is carved up between VCs is decided by
//! a [`PolicyKind`], and a [`PowerGate`] tracks whether the downstream buffer
//! is powered at all.

use std::collections::VecDeque;
use std::sync::Arc;

use weft_engine::Cycle;
use weft_engine::config::Config;
use weft_engine::types::SimError;
use weft_track::entity::Entity;
use weft_track::{debug, trace};

use crate::flit::{Credit, Flit};

/// Default idle-detection and wakeup timeouts, in cycles.
pub const DEFAULT_POWER_TIMEOUT: u64 = 10;

/// How a buffer's slots are shared between its VCs.
#[derive(Debug)]
pub enum PolicyKind {
    /// Each VC owns a fixed partition of the buffer.
    Private {
        /// Slots per VC.
        vc_buf_size: usize,
        /// Slots the duty VC may use while the buffer is waking up.
        duty_buf_size: usize,
    },
    /// A private allotment per VC plus a pool shared by all VCs.
    Shared {
        /// Private slots per VC.
        private_size: usize,
    },
    /// Shared pool with a fixed cap on slots any one VC may hold.
    LimitedShared {
        /// Private slots per VC.
        private_size: usize,
        /// Most slots a single VC may occupy.
        max_held_slots: usize,
    },
    /// Shared pool whose per-VC cap is the buffer divided by the number of
    /// VCs currently holding flits.
    DynamicLimitedShared {
        /// Private slots per VC.
        private_size: usize,
    },
    /// Shared pool whose per-VC cap halves with each additional active VC.
    ShiftingDynamicLimitedShared {
        /// Private slots per VC.
        private_size: usize,
    },
    /// Per-VC cap tracks an aged estimate of the credit round-trip time.
    Feedback {
        /// Private slots per VC.
        private_size: usize,
        /// Smoothing divisor for the round-trip estimate.
        aging_scale: i64,
        /// Slack added on top of the estimate.
        offset: usize,
        /// Per-VC round-trip estimate, in cycles.
        rtt_estimate: Vec<i64>,
        /// Send time of each in-flight flit, per VC.
        send_times: Vec<VecDeque<Cycle>>,
    },
    /// Per-VC cap fixed at the wiring-time minimum round trip plus slack.
    SimpleFeedback {
        /// Private slots per VC.
        private_size: usize,
        /// Slack added on top of the round trip.
        offset: usize,
        /// Minimum credit round trip installed when the output is wired.
        min_latency: Option<u64>,
    },
}

/// Power state of the downstream buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PowerState {
    /// Powered but empty; counting down towards sleep.
    Idle,
    /// Powered down. A head flit wanting this output starts the wakeup.
    Sleeping,
    /// Powering up; only the duty VC accepts flits.
    WakingUp,
    /// Fully powered.
    Active,
}

/// The idle-detect / wakeup machine guarding one downstream buffer.
///
/// Timers advance at most once per cycle regardless of how many candidates
/// consider the output in that cycle.
#[derive(Debug)]
pub struct PowerGate {
    state: PowerState,
    idle_time: u64,
    waking_time: u64,
    idle_timeout: u64,
    wakeup_timeout: u64,
    duty_vc: usize,
    advanced_at: Option<Cycle>,
}

impl PowerGate {
    fn new(vcs: usize, idle_timeout: u64, wakeup_timeout: u64) -> Self {
        assert!(vcs > 0);
        Self {
            state: PowerState::Idle,
            idle_time: 0,
            waking_time: 0,
            idle_timeout,
            wakeup_timeout,
            duty_vc: vcs - 1,
            advanced_at: None,
        }
    }

    /// The current power state.
    pub fn state(&self) -> PowerState {
        self.state
    }

    /// The VC that stays powered during wakeup.
    pub fn duty_vc(&self) -> usize {
        self.duty_vc
    }

    /// The VC arriving traffic must use instead, if the buffer is not fully
    /// powered.
    pub fn redirect(&self) -> Option<usize> {
        match self.state {
            PowerState::Sleeping | PowerState::WakingUp => Some(self.duty_vc),
            PowerState::Idle | PowerState::Active => None,
        }
    }

    /// A head flit wants this output in cycle `now`.
    fn on_arrival(&mut self, now: Cycle) {
        match self.state {
            PowerState::Idle => {
                self.state = PowerState::Active;
                self.idle_time = 0;
            }
            PowerState::Sleeping => {
                self.state = PowerState::WakingUp;
                self.waking_time = 0;
            }
            PowerState::WakingUp => {
                if self.advanced_at != Some(now) {
                    self.waking_time += 1;
                    if self.waking_time >= self.wakeup_timeout {
                        self.state = PowerState::Active;
                        self.waking_time = 0;
                    }
                }
            }
            PowerState::Active => {}
        }
        self.advanced_at = Some(now);
    }

    /// Advance the idle/waking timers for a cycle with no arrival.
    fn tick(&mut self, now: Cycle) {
        if self.advanced_at == Some(now) {
            return;
        }
        self.advanced_at = Some(now);
        match self.state {
            PowerState::Idle => {
                self.idle_time += 1;
                if self.idle_time >= self.idle_timeout {
                    self.state = PowerState::Sleeping;
                    self.idle_time = 0;
                }
            }
            PowerState::WakingUp => {
                self.waking_time += 1;
                if self.waking_time >= self.wakeup_timeout {
                    self.state = PowerState::Active;
                    self.waking_time = 0;
                }
            }
            PowerState::Sleeping | PowerState::Active => {}
        }
    }

    fn set_idle(&mut self) {
        self.state = PowerState::Idle;
        self.idle_time = 0;
        self.waking_time = 0;
    }
}

/// Credit-counted mirror of one downstream input buffer.
pub struct BufferState {
    entity: Entity,
    size: usize,
    vcs: usize,
    occupancy: usize,
    vc_occupancy: Vec<usize>,
    in_use_by: Vec<Option<usize>>,
    tail_sent: Vec<bool>,
    last_id: Vec<Option<u64>>,
    last_pid: Vec<Option<u64>>,
    wait_for_tail_credit: bool,
    policy: PolicyKind,
    power: PowerGate,
}

impl BufferState {
    /// Build the mirror for one output port from the shared configuration.
    pub fn new(parent: &Arc<Entity>, name: &str, config: &Config) -> Result<Self, SimError> {
        let entity = Entity::new(parent, name);
        let vcs = config.int_or("num_vcs", 1) as usize;
        let size = config.int_or("buf_size", 8) as usize;
        if vcs == 0 || size == 0 {
            return Err(SimError(format!(
                "buffer needs at least one VC and one slot, got {vcs} VCs of {size}"
            )));
        }
        let private_size = config.int_or("private_buf_size", (size / vcs.max(1)) as i64) as usize;
        let policy = match config.str_or("buffer_policy", "private").as_str() {
            "private" => PolicyKind::Private {
                vc_buf_size: size.div_ceil(vcs),
                duty_buf_size: config.int_or("duty_buf_size", 1) as usize,
            },
            "shared" => PolicyKind::Shared { private_size },
            "limited" => PolicyKind::LimitedShared {
                private_size,
                max_held_slots: config.int_or("max_held_slots", size as i64) as usize,
            },
            "dynamic" => PolicyKind::DynamicLimitedShared { private_size },
            "shifting" => PolicyKind::ShiftingDynamicLimitedShared { private_size },
            "feedback" => PolicyKind::Feedback {
                private_size,
                aging_scale: config.int_or("feedback_aging_scale", 16),
                offset: config.int_or("feedback_offset", 0) as usize,
                rtt_estimate: vec![0; vcs],
                send_times: (0..vcs).map(|_| VecDeque::new()).collect(),
            },
            "simple_feedback" => PolicyKind::SimpleFeedback {
                private_size,
                offset: config.int_or("feedback_offset", 0) as usize,
                min_latency: None,
            },
            other => {
                return Err(SimError(format!("unknown buffer_policy \"{other}\"")));
            }
        };
        let power = PowerGate::new(
            vcs,
            config.int_or("idle_detect_timeout", DEFAULT_POWER_TIMEOUT as i64) as u64,
            config.int_or("wakeup_timeout", DEFAULT_POWER_TIMEOUT as i64) as u64,
        );
        Ok(Self {
            entity,
            size,
            vcs,
            occupancy: 0,
            vc_occupancy: vec![0; vcs],
            in_use_by: vec![None; vcs],
            tail_sent: vec![false; vcs],
            last_id: vec![None; vcs],
            last_pid: vec![None; vcs],
            wait_for_tail_credit: config.bool_or("wait_for_tail_credit", false),
            policy,
            power,
        })
    }

    /// Install the minimum credit round trip computed when the output was
    /// wired. Only the feedback policies use it.
    pub fn set_min_latency(&mut self, latency: u64) {
        match &mut self.policy {
            PolicyKind::Feedback { rtt_estimate, .. } => {
                for estimate in rtt_estimate {
                    *estimate = latency as i64;
                }
            }
            PolicyKind::SimpleFeedback { min_latency, .. } => {
                *min_latency = Some(latency);
            }
            _ => {}
        }
    }

    /// Claim VC `vc` for the packet identified by `owner`.
    pub fn take_buffer(&mut self, vc: usize, owner: usize) {
        assert!(
            self.in_use_by[vc].is_none(),
            "output VC {vc} already owned by {:?}",
            self.in_use_by[vc]
        );
        self.in_use_by[vc] = Some(owner);
        self.tail_sent[vc] = false;
    }

    /// Account for a flit leaving through this output.
    pub fn sending_flit(&mut self, now: Cycle, flit: &Flit) {
        let vc = flit.vc;
        assert!(self.in_use_by[vc].is_some(), "sending on unowned VC {vc}");
        assert!(self.occupancy < self.size, "downstream buffer overrun");
        self.occupancy += 1;
        self.vc_occupancy[vc] += 1;
        self.last_id[vc] = Some(flit.id);
        self.last_pid[vc] = Some(flit.pid);
        if let PolicyKind::Feedback { send_times, .. } = &mut self.policy {
            send_times[vc].push_back(now);
        }
        if flit.tail {
            self.tail_sent[vc] = true;
            if !self.wait_for_tail_credit {
                self.in_use_by[vc] = None;
            }
        }
        trace!(self.entity; "sent {flit} on output VC {vc}, occupancy {}", self.occupancy);
    }

    /// Account for a returning credit.
    pub fn process_credit(&mut self, now: Cycle, credit: &Credit) {
        for &vc in &credit.vcs {
            assert!(self.occupancy > 0, "credit for empty buffer");
            assert!(self.vc_occupancy[vc] > 0, "credit for empty VC {vc}");
            self.occupancy -= 1;
            self.vc_occupancy[vc] -= 1;
            if let PolicyKind::Feedback {
                aging_scale,
                rtt_estimate,
                send_times,
                ..
            } = &mut self.policy
            {
                let sent = send_times[vc].pop_front().expect("credit without send");
                let sample = (now.tick() - sent.tick()) as i64;
                rtt_estimate[vc] += (sample - rtt_estimate[vc]) / *aging_scale;
            }
            if self.wait_for_tail_credit && self.vc_occupancy[vc] == 0 && self.tail_sent[vc] {
                self.in_use_by[vc] = None;
            }
            trace!(self.entity; "{credit} freed a slot on VC {vc}, occupancy {}", self.occupancy);
        }
    }

    /// Number of VCs with an owner or buffered flits.
    fn active_vcs(&self) -> usize {
        (0..self.vcs)
            .filter(|&vc| self.in_use_by[vc].is_some() || self.vc_occupancy[vc] > 0)
            .count()
    }

    fn private_size(&self) -> usize {
        match &self.policy {
            PolicyKind::Private { vc_buf_size, .. } => *vc_buf_size,
            PolicyKind::Shared { private_size }
            | PolicyKind::LimitedShared { private_size, .. }
            | PolicyKind::DynamicLimitedShared { private_size }
            | PolicyKind::ShiftingDynamicLimitedShared { private_size }
            | PolicyKind::Feedback { private_size, .. }
            | PolicyKind::SimpleFeedback { private_size, .. } => *private_size,
        }
    }

    /// Most slots VC `vc` may hold under the current policy and power state.
    pub fn limit_for(&self, vc: usize) -> usize {
        match &self.policy {
            PolicyKind::Private {
                vc_buf_size,
                duty_buf_size,
            } => {
                if self.power.state() == PowerState::WakingUp && vc == self.power.duty_vc() {
                    (*duty_buf_size).min(*vc_buf_size)
                } else {
                    *vc_buf_size
                }
            }
            PolicyKind::Shared { .. } => self.size,
            PolicyKind::LimitedShared { max_held_slots, .. } => *max_held_slots,
            PolicyKind::DynamicLimitedShared { .. } => self.size / self.active_vcs().max(1),
            PolicyKind::ShiftingDynamicLimitedShared { .. } => {
                let shift = self.active_vcs().saturating_sub(1).min(usize::BITS as usize - 1);
                (self.size >> shift).max(1)
            }
            PolicyKind::Feedback {
                rtt_estimate,
                offset,
                ..
            } => self.size.min(rtt_estimate[vc].max(1) as usize + offset),
            PolicyKind::SimpleFeedback {
                offset,
                min_latency,
                ..
            } => self
                .size
                .min(min_latency.unwrap_or(self.size as u64) as usize + offset),
        }
    }

    /// Slots VC `vc` could still fill before stalling.
    pub fn available_for(&self, vc: usize) -> usize {
        let occ = self.vc_occupancy[vc];
        let cap_headroom = self.limit_for(vc).saturating_sub(occ);
        match &self.policy {
            PolicyKind::Private { .. } => cap_headroom,
            _ => {
                let private = self.private_size();
                let shared_size = self.size.saturating_sub(private * self.vcs);
                let shared_used: usize = self
                    .vc_occupancy
                    .iter()
                    .map(|&o| o.saturating_sub(private))
                    .sum();
                let pool = private.saturating_sub(occ) + (shared_size - shared_used);
                cap_headroom.min(pool)
            }
        }
    }

    /// Whether the whole buffer is out of credit.
    pub fn is_full(&self) -> bool {
        self.occupancy >= self.size
    }

    /// Whether VC `vc` cannot accept another flit.
    pub fn is_full_for(&self, vc: usize) -> bool {
        self.available_for(vc) == 0
    }

    /// Whether VC `vc` can be claimed by a new packet.
    pub fn is_available_for(&self, vc: usize) -> bool {
        self.in_use_by[vc].is_none()
    }

    /// Whether no flit of this VC is buffered downstream.
    pub fn is_empty_for(&self, vc: usize) -> bool {
        self.vc_occupancy[vc] == 0
    }

    /// Whether VC `vc` is held only until its tail credit returns.
    pub fn is_reserved_for(&self, vc: usize) -> bool {
        self.wait_for_tail_credit && self.in_use_by[vc].is_some() && self.tail_sent[vc]
    }

    /// The owner tag recorded by [`take_buffer`](Self::take_buffer).
    pub fn used_by(&self, vc: usize) -> Option<usize> {
        self.in_use_by[vc]
    }

    /// Flits in flight or buffered downstream, all VCs.
    pub fn occupancy(&self) -> usize {
        self.occupancy
    }

    /// Flits in flight or buffered downstream on VC `vc`.
    pub fn occupancy_for(&self, vc: usize) -> usize {
        self.vc_occupancy[vc]
    }

    /// Total slots mirrored by this state.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Id of the last flit sent on VC `vc`.
    pub fn last_id(&self, vc: usize) -> Option<u64> {
        self.last_id[vc]
    }

    /// Id of the last packet sent on VC `vc`.
    pub fn last_pid(&self, vc: usize) -> Option<u64> {
        self.last_pid[vc]
    }

    /// The power machine guarding the downstream buffer.
    pub fn power(&self) -> &PowerGate {
        &self.power
    }

    /// A head flit is considering this output in cycle `now`.
    pub fn power_arrival(&mut self, now: Cycle) {
        let before = self.power.state();
        self.power.on_arrival(now);
        let after = self.power.state();
        if before != after {
            debug!(self.entity; "power {before:?} -> {after:?} on arrival at {now}");
        }
    }

    /// No head flit considered this output in cycle `now`.
    pub fn power_tick(&mut self, now: Cycle) {
        let before = self.power.state();
        self.power.tick(now);
        let after = self.power.state();
        if before != after {
            debug!(self.entity; "power {before:?} -> {after:?} at {now}");
        }
    }

    /// Downstream reported its buffer fully drained.
    pub fn power_set_idle(&mut self) {
        let before = self.power.state();
        self.power.set_idle();
        if before != PowerState::Idle {
            debug!(self.entity; "power {before:?} -> Idle on drain notice");
        }
    }
}
