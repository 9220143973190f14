// Copyright (c) 2024 Graphcore Ltd. All rights reserved.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::tracker::Track;
use crate::{ROOT, Tag};

/// A tracker that does nothing.
///
/// This can be useful for benchmarks that want to have minimum overheads.
/// Tags still have to be unique so that consumers can key state off them.
#[derive(Default)]
pub struct DevNullTracker {
    unique_tag: AtomicU64,
}

impl Track for DevNullTracker {
    fn unique_tag(&self) -> Tag {
        let tag = self.unique_tag.fetch_add(1, Ordering::SeqCst);
        Tag(tag + ROOT.0 + 1)
    }

    fn is_entity_enabled(&self, _tag: Tag, _level: log::Level) -> bool {
        false
    }
    fn add_entity(&self, _tag: Tag, _entity_name: &str) {}
    fn enter(&self, _tag: Tag, _obj: Tag) {}
    fn exit(&self, _tag: Tag, _obj: Tag) {}
    fn create(&self, _tag: Tag, _obj: Tag, _num_bytes: usize, _req_type: i8, _name: &str) {}
    fn destroy(&self, _tag: Tag, _obj: Tag) {}
    fn connect(&self, _from: Tag, _to: Tag) {}
    fn log(&self, _tag: Tag, _level: log::Level, _msg: std::fmt::Arguments) {}
    fn time(&self, _set_by: Tag, _time_ns: f64) {}
    fn shutdown(&self) {}
}
