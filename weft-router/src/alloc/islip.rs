// Copyright (c) 2024 Graphcore Ltd. All rights reserved.

//! The iSLIP separable allocator.
//!
//! Each iteration runs a grant phase (every unmatched output offers itself to
//! the first unmatched requesting input at or after its grant pointer) and an
//! accept phase (every unmatched input takes the first offering output at or
//! after its accept pointer). Pointers advance past a match only when it was
//! made in the first iteration, which is what desynchronises the pointers
//! under persistent contention.

use std::sync::Arc;

use weft_track::entity::Entity;
use weft_track::trace;

use crate::alloc::{Allocate, Request, RequestTable};

/// iSLIP matching state.
pub struct Islip {
    entity: Entity,
    inputs: usize,
    outputs: usize,
    iters: usize,
    table: RequestTable,
    inmatch: Vec<Option<usize>>,
    outmatch: Vec<Option<usize>>,
    /// Per output: the input its grant scan starts from.
    gptrs: Vec<usize>,
    /// Per input: the output its accept scan starts from.
    aptrs: Vec<usize>,
}

impl Islip {
    /// Create an allocator for `inputs` x `outputs` ports running `iters`
    /// grant/accept rounds per allocation.
    #[must_use]
    pub fn new(parent: &Arc<Entity>, name: &str, inputs: usize, outputs: usize, iters: usize) -> Self {
        assert!(inputs > 0 && outputs > 0 && iters > 0);
        Self {
            entity: Entity::new(parent, name),
            inputs,
            outputs,
            iters,
            table: RequestTable::new(inputs, outputs),
            inmatch: vec![None; inputs],
            outmatch: vec![None; outputs],
            gptrs: vec![0; outputs],
            aptrs: vec![0; inputs],
        }
    }
}

impl Allocate for Islip {
    fn inputs(&self) -> usize {
        self.inputs
    }

    fn outputs(&self) -> usize {
        self.outputs
    }

    fn clear(&mut self) {
        self.table.clear();
        self.inmatch.fill(None);
        self.outmatch.fill(None);
    }

    fn read_request(&self, input: usize, output: usize) -> Option<Request> {
        self.table.read(input, output)
    }

    fn add_request(&mut self, input: usize, output: usize, label: usize, in_pri: i64, out_pri: i64) {
        self.table.add(input, output, label, in_pri, out_pri);
    }

    fn remove_request(&mut self, input: usize, output: usize, label: usize) {
        self.table.remove(input, output, label);
    }

    fn allocate(&mut self) {
        for iter in 0..self.iters {
            // Grant phase
            let mut grants: Vec<Option<usize>> = vec![None; self.outputs];
            for output in 0..self.outputs {
                if self.outmatch[output].is_some() {
                    continue;
                }
                let requests = self.table.inputs_requesting(output);
                let gptr = self.gptrs[output];
                for (&input, _) in requests.range(gptr..).chain(requests.range(..gptr)) {
                    if self.inmatch[input].is_none() {
                        grants[output] = Some(input);
                        break;
                    }
                }
            }

            // Accept phase
            for input in 0..self.inputs {
                if self.inmatch[input].is_some() {
                    continue;
                }
                let requests = self.table.outputs_requested_by(input);
                let aptr = self.aptrs[input];
                for (&output, _) in requests.range(aptr..).chain(requests.range(..aptr)) {
                    if grants[output] == Some(input) {
                        self.inmatch[input] = Some(output);
                        self.outmatch[output] = Some(input);
                        if iter == 0 {
                            self.gptrs[output] = (input + 1) % self.inputs;
                            self.aptrs[input] = (output + 1) % self.outputs;
                        }
                        trace!(self.entity; "iter {iter}: matched input {input} to output {output}");
                        break;
                    }
                }
            }
        }
    }

    fn output_assigned(&self, input: usize) -> Option<usize> {
        self.inmatch[input]
    }

    fn input_assigned(&self, output: usize) -> Option<usize> {
        self.outmatch[output]
    }

    fn output_has_requests(&self, output: usize) -> bool {
        !self.table.inputs_requesting(output).is_empty()
    }
}
