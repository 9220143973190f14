// Copyright (c) 2024 Graphcore Ltd. All rights reserved.

//! The candidate outputs produced by a routing function.

/// One candidate: an output port and a contiguous range of VCs on it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RouteCandidate {
    /// Output port at the current router.
    pub output_port: usize,
    /// First VC of the candidate range (inclusive).
    pub vc_start: usize,
    /// Last VC of the candidate range (inclusive).
    pub vc_end: usize,
    /// Priority the routing function attaches to this candidate.
    pub pri: i64,
}

/// The unordered set of candidates a routing function produced for one flit.
#[derive(Clone, Debug, Default)]
pub struct OutputSet {
    set: Vec<RouteCandidate>,
}

impl OutputSet {
    /// An empty candidate set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a candidate covering VCs `vc_start..=vc_end` at `output_port`.
    pub fn add_range(&mut self, output_port: usize, vc_start: usize, vc_end: usize, pri: i64) {
        assert!(vc_end >= vc_start);
        self.set.push(RouteCandidate {
            output_port,
            vc_start,
            vc_end,
            pri,
        });
    }

    /// Remove all candidates.
    pub fn clear(&mut self) {
        self.set.clear();
    }

    /// Whether the set holds no candidates.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Number of candidates.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// Iterate over the candidates.
    pub fn iter(&self) -> impl Iterator<Item = &RouteCandidate> {
        self.set.iter()
    }

    /// The only candidate. Panics unless the set holds exactly one, which is
    /// what deterministic lookahead routing produces.
    pub fn single(&self) -> &RouteCandidate {
        assert_eq!(self.set.len(), 1);
        &self.set[0]
    }
}
