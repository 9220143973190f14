// Copyright (c) 2024 Graphcore Ltd. All rights reserved.

//! A typed point-to-point link with a fixed latency in cycles.
//!
//! Channels carry flits in one direction and credits in the other. Items
//! sent at cycle `t` become visible to the receiver at `t + latency`.
//! Senders write at the end of their cycle and receivers read at the start
//! of theirs, so the two-phase step discipline never sees an item early.

use std::collections::VecDeque;
use std::sync::Arc;

use weft_track::entity::Entity;
use weft_track::tag::Tagged;
use weft_track::{enter, exit, log};

use crate::time::Cycle;

/// One end of a channel: a router id and a port number on that router.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Endpoint {
    /// Id of the router in the driver's registry.
    pub router: usize,
    /// Port number on that router.
    pub port: usize,
}

/// A fixed-latency FIFO link.
pub struct Channel<T: Tagged> {
    entity: Entity,

    /// Cycles from send to earliest receive. At least one.
    latency: u64,

    /// In-flight items with their arrival cycle.
    queue: VecDeque<(Cycle, T)>,

    source: Option<Endpoint>,
    sink: Option<Endpoint>,
}

impl<T: Tagged> Channel<T> {
    /// Create a channel below `parent` with the given latency.
    #[must_use]
    pub fn new(parent: &Arc<Entity>, name: &str, latency: u64) -> Self {
        assert!(latency >= 1, "channel latency must be at least one cycle");
        Self {
            entity: Entity::new(parent, name),
            latency,
            queue: VecDeque::new(),
            source: None,
            sink: None,
        }
    }

    /// The channel latency in cycles.
    pub fn latency(&self) -> u64 {
        self.latency
    }

    /// Record the sending end of this channel.
    pub fn set_source(&mut self, source: Endpoint) {
        self.source = Some(source);
    }

    /// Record the receiving end of this channel.
    pub fn set_sink(&mut self, sink: Endpoint) {
        self.sink = Some(sink);
    }

    /// The sending end, if wired.
    pub fn source(&self) -> Option<Endpoint> {
        self.source
    }

    /// The receiving end, if wired.
    pub fn sink(&self) -> Option<Endpoint> {
        self.sink
    }

    /// Whether anything is in flight.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Send an item; it arrives at `now + latency`.
    pub fn send(&mut self, item: T, now: Cycle) {
        enter!(self.entity ; item.tag());
        self.queue.push_back((now + self.latency, item));
    }

    /// Receive the item at the head of the channel if it has arrived.
    pub fn receive(&mut self, now: Cycle) -> Option<T> {
        match self.queue.front() {
            Some((arrival, _)) if *arrival <= now => {
                let (_, item) = self.queue.pop_front().unwrap();
                exit!(self.entity ; item.tag());
                Some(item)
            }
            _ => None,
        }
    }
}
