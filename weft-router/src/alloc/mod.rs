// Copyright (c) 2024 Graphcore Ltd. All rights reserved.

//! Input-output matching for VC and switch allocation.
//!
//! Allocators consume a sparse table of requests, each labelled with the VC
//! that raised it, and produce a conflict-free matching: at most one input
//! per output and one output per input.

use std::collections::BTreeMap;
use std::sync::Arc;

use weft_engine::types::SimError;
use weft_track::entity::Entity;

pub mod islip;

pub use islip::Islip;

/// One arbitration request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Request {
    /// Caller-chosen label, reported back with the grant. The router pipeline
    /// uses the requesting VC (or expanded VC) here.
    pub label: usize,
    /// Priority seen by the input-side arbitration.
    pub in_pri: i64,
    /// Priority seen by the output-side arbitration.
    pub out_pri: i64,
}

/// A matching engine over a sparse request table.
pub trait Allocate {
    /// Number of input ports.
    fn inputs(&self) -> usize;

    /// Number of output ports.
    fn outputs(&self) -> usize;

    /// Drop all requests and any previous matching.
    fn clear(&mut self);

    /// The request currently recorded for `(input, output)`, if any.
    fn read_request(&self, input: usize, output: usize) -> Option<Request>;

    /// Record a request. A later request for the same `(input, output)` slot
    /// replaces an earlier one only if it carries a higher input priority.
    fn add_request(&mut self, input: usize, output: usize, label: usize, in_pri: i64, out_pri: i64);

    /// Withdraw the request for `(input, output)` if its label matches.
    fn remove_request(&mut self, input: usize, output: usize, label: usize);

    /// Compute the matching for the current request table.
    fn allocate(&mut self);

    /// The output matched to `input`, if any.
    fn output_assigned(&self, input: usize) -> Option<usize>;

    /// The input matched to `output`, if any.
    fn input_assigned(&self, output: usize) -> Option<usize>;

    /// Whether any request targets `output`.
    fn output_has_requests(&self, output: usize) -> bool;
}

/// Round-robin precedence: does a new `(label, pri)` beat a recorded one?
///
/// Higher priority always wins; on a tie, the label closer to `offset` in
/// round-robin order (wrapping at `size`) wins.
#[must_use]
pub fn supersedes(
    new_label: usize,
    new_pri: i64,
    old_label: usize,
    old_pri: i64,
    offset: usize,
    size: usize,
) -> bool {
    if new_pri != old_pri {
        return new_pri > old_pri;
    }
    let new_distance = (new_label + size - offset % size) % size;
    let old_distance = (old_label + size - offset % size) % size;
    new_distance < old_distance
}

/// The request table shared by allocator implementations.
///
/// Requests are kept in ordered maps keyed both ways so that either side can
/// scan its requests in port order starting from a round-robin pointer.
#[derive(Debug, Default)]
pub(crate) struct RequestTable {
    /// Per input: output -> request.
    by_input: Vec<BTreeMap<usize, Request>>,
    /// Per output: input -> request.
    by_output: Vec<BTreeMap<usize, Request>>,
}

impl RequestTable {
    pub(crate) fn new(inputs: usize, outputs: usize) -> Self {
        Self {
            by_input: vec![BTreeMap::new(); inputs],
            by_output: vec![BTreeMap::new(); outputs],
        }
    }

    pub(crate) fn clear(&mut self) {
        for requests in &mut self.by_input {
            requests.clear();
        }
        for requests in &mut self.by_output {
            requests.clear();
        }
    }

    pub(crate) fn add(
        &mut self,
        input: usize,
        output: usize,
        label: usize,
        in_pri: i64,
        out_pri: i64,
    ) {
        if let Some(existing) = self.by_input[input].get(&output) {
            if existing.in_pri >= in_pri {
                return;
            }
        }
        let request = Request {
            label,
            in_pri,
            out_pri,
        };
        self.by_input[input].insert(output, request);
        self.by_output[output].insert(input, request);
    }

    pub(crate) fn remove(&mut self, input: usize, output: usize, label: usize) {
        if self.by_input[input].get(&output).is_some_and(|r| r.label == label) {
            self.by_input[input].remove(&output);
            self.by_output[output].remove(&input);
        }
    }

    pub(crate) fn read(&self, input: usize, output: usize) -> Option<Request> {
        self.by_input[input].get(&output).copied()
    }

    pub(crate) fn outputs_requested_by(&self, input: usize) -> &BTreeMap<usize, Request> {
        &self.by_input[input]
    }

    pub(crate) fn inputs_requesting(&self, output: usize) -> &BTreeMap<usize, Request> {
        &self.by_output[output]
    }
}

/// Build an allocator by configured kind.
pub fn new_allocator(
    parent: &Arc<Entity>,
    name: &str,
    kind: &str,
    inputs: usize,
    outputs: usize,
    iters: usize,
) -> Result<Box<dyn Allocate>, SimError> {
    match kind {
        "islip" => Ok(Box::new(Islip::new(parent, name, inputs, outputs, iters))),
        other => Err(SimError(format!("unknown allocator \"{other}\""))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_priority_supersedes() {
        assert!(supersedes(3, 5, 0, 1, 0, 4));
        assert!(!supersedes(0, 1, 3, 5, 0, 4));
    }

    #[test]
    fn tie_breaks_by_pointer_distance() {
        // Offset 2: order is 2, 3, 0, 1
        assert!(supersedes(3, 0, 1, 0, 2, 4));
        assert!(supersedes(2, 0, 3, 0, 2, 4));
        assert!(!supersedes(0, 0, 3, 0, 2, 4));
    }

    #[test]
    fn add_keeps_highest_input_priority() {
        let mut table = RequestTable::new(2, 2);
        table.add(0, 1, 3, 5, 0);
        table.add(0, 1, 4, 2, 0);
        assert_eq!(table.read(0, 1).unwrap().label, 3);
        table.add(0, 1, 4, 9, 0);
        assert_eq!(table.read(0, 1).unwrap().label, 4);
    }

    #[test]
    fn remove_checks_label() {
        let mut table = RequestTable::new(2, 2);
        table.add(1, 0, 7, 0, 0);
        table.remove(1, 0, 6);
        assert!(table.read(1, 0).is_some());
        table.remove(1, 0, 7);
        assert!(table.read(1, 0).is_none());
    }
}
