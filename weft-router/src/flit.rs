// Copyright (c) 2024 Graphcore Ltd. All rights reserved.

//! The units that move through the network: flits forward, credits back.

use std::collections::BTreeSet;
use std::fmt;

use itertools::Itertools;
use weft_track::Tag;
use weft_track::tag::Tagged;

use crate::outputset::OutputSet;

/// A flow-control unit.
///
/// Flits are moved, never shared: a flit lives in exactly one buffer, stage
/// entry or channel at any time.
#[derive(Clone, Debug, Default)]
pub struct Flit {
    /// Unique flit id.
    pub id: u64,

    /// Id of the packet this flit belongs to.
    pub pid: u64,

    /// First flit of its packet.
    pub head: bool,

    /// Last flit of its packet.
    pub tail: bool,

    /// Traffic class.
    pub cl: usize,

    /// The VC the flit currently travels on. Rewritten at each hop when the
    /// switch is traversed.
    pub vc: usize,

    /// Packet priority; arbitration prefers higher values.
    pub pri: i64,

    /// Number of hops taken so far.
    pub hops: u32,

    /// Destination terminal, consumed by the routing function.
    pub dest: usize,

    /// Route candidates computed one hop ahead (lookahead routing).
    pub la_route_set: OutputSet,

    /// Tracking tag for trace events.
    pub tag: Tag,
}

impl fmt::Display for Flit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "flit {} (packet {})", self.id, self.pid)
    }
}

impl Tagged for Flit {
    fn tag(&self) -> Tag {
        self.tag
    }
}

/// A credit returned upstream when buffer slots free up.
///
/// A single credit can release slots on several VCs of the same input port;
/// the sets are merged as the router drains flits within a cycle.
#[derive(Clone, Debug, Default)]
pub struct Credit {
    /// The VCs whose slots are released.
    pub vcs: BTreeSet<usize>,

    /// Unique credit id.
    pub id: u64,

    /// Tracking tag for trace events.
    pub tag: Tag,
}

impl fmt::Display for Credit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "credit {} (VCs {})", self.id, self.vcs.iter().join(","))
    }
}

impl Tagged for Credit {
    fn tag(&self) -> Tag {
        self.tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credit_merges_vcs() {
        let mut c = Credit::default();
        c.vcs.insert(2);
        c.vcs.insert(0);
        c.vcs.insert(2);
        assert_eq!(c.vcs.len(), 2);
        assert_eq!(c.vcs.iter().copied().collect::<Vec<_>>(), vec![0, 2]);
    }
}
