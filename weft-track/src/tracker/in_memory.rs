// Copyright (c) 2024 Graphcore Ltd. All rights reserved.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::Tag;
use crate::tracker::{EntityManager, Track};

/// A [`Track`] event.
#[derive(Debug, Clone)]
pub struct EventCommon {
    /// The [`Tag`](crate::Tag) of the event originator.
    tag: Tag,

    /// The time at which the event occurred.
    #[allow(dead_code)]
    time: f64,

    /// Any event-specific state.
    event: Event,
}

impl EventCommon {
    fn new(tag: Tag, time: f64, event: Event) -> Self {
        Self { tag, time, event }
    }
}

#[derive(Debug, Clone)]
#[allow(dead_code)]
enum Event {
    Create { num_bytes: usize, req_type: i8 },
    Destroy { destroyed: Tag },
    Log { level: log::Level, text: String },
    Enter { entered: Tag },
    Exit { exited: Tag },
}

struct TrackedState {
    events: Vec<EventCommon>,
    name_to_tag: HashMap<String, Tag>,
}

const INITIAL_CAPACITY: usize = 10000;

impl TrackedState {
    fn new() -> Self {
        Self {
            events: Vec::with_capacity(INITIAL_CAPACITY),
            name_to_tag: HashMap::with_capacity(INITIAL_CAPACITY),
        }
    }

    fn add_event(&mut self, event: EventCommon) {
        self.events.push(event);
    }

    fn add_name_to_tag(&mut self, name: &str, tag: Tag) {
        self.name_to_tag.insert(name.to_owned(), tag);
    }

    fn tag_for_name(&self, name: &str) -> Option<Tag> {
        self.name_to_tag.get(name).copied()
    }

    fn count_ingress(&self, tag: Tag) -> usize {
        self.events
            .iter()
            .filter(|e| e.tag == tag)
            .filter(|e| matches!(e.event, Event::Enter { entered: _ }))
            .count()
    }

    fn count_egress(&self, tag: Tag) -> usize {
        self.events
            .iter()
            .filter(|e| e.tag == tag)
            .filter(|e| matches!(e.event, Event::Exit { exited: _ }))
            .count()
    }

    fn count_created(&self, tag: Tag) -> usize {
        self.events
            .iter()
            .filter(|e| e.tag == tag)
            .filter(|e| matches!(e.event, Event::Create { .. }))
            .count()
    }

    fn count_destroyed(&self, tag: Tag) -> usize {
        self.events
            .iter()
            .filter(|e| e.tag == tag)
            .filter(|e| matches!(e.event, Event::Destroy { .. }))
            .count()
    }
}

/// A tracker that keeps all track events in memory.
///
/// Tests use this to assert on flit movement: how many objects entered and
/// exited an entity, and how many were created and destroyed by it.
pub struct InMemoryTracker {
    entity_manager: Arc<EntityManager>,
    state: Mutex<TrackedState>,
}

impl InMemoryTracker {
    /// Create a new [`InMemoryTracker`] with an [`EntityManager`].
    pub fn new(entity_manager: Arc<EntityManager>) -> Self {
        Self {
            entity_manager,
            state: Mutex::new(TrackedState::new()),
        }
    }

    fn add_event(&self, event: EventCommon) {
        let mut state_guard = self.state.lock().unwrap();
        state_guard.add_event(event);
    }

    fn now(&self) -> f64 {
        self.entity_manager.time()
    }

    /// Get the [`Tag`] for the specified simulation entity/object.
    pub fn tag_for_name(&self, name: &str) -> Option<Tag> {
        let state_guard = self.state.lock().unwrap();
        state_guard.tag_for_name(name)
    }

    /// Return the number of objects that entered the entity specified by `tag`.
    pub fn count_ingress(&self, tag: Tag) -> usize {
        let state_guard = self.state.lock().unwrap();
        state_guard.count_ingress(tag)
    }

    /// Return the number of objects that exited the entity specified by `tag`.
    pub fn count_egress(&self, tag: Tag) -> usize {
        let state_guard = self.state.lock().unwrap();
        state_guard.count_egress(tag)
    }

    /// Return the number of objects created by the entity specified by `tag`.
    pub fn count_created(&self, tag: Tag) -> usize {
        let state_guard = self.state.lock().unwrap();
        state_guard.count_created(tag)
    }

    /// Return the number of objects destroyed by the entity specified by `tag`.
    pub fn count_destroyed(&self, tag: Tag) -> usize {
        let state_guard = self.state.lock().unwrap();
        state_guard.count_destroyed(tag)
    }
}

/// Implementation for each [`Track`] event
impl Track for InMemoryTracker {
    fn unique_tag(&self) -> Tag {
        self.entity_manager.unique_tag()
    }

    fn is_entity_enabled(&self, tag: Tag, level: log::Level) -> bool {
        self.entity_manager.is_enabled(tag, level)
    }

    fn add_entity(&self, tag: Tag, entity_name: &str) {
        self.entity_manager.add_entity(tag, entity_name);
        let mut state_guard = self.state.lock().unwrap();
        state_guard.add_name_to_tag(entity_name, tag);
    }

    fn enter(&self, tag: Tag, object: Tag) {
        let time = self.now();
        let enter = Event::Enter { entered: object };
        self.add_event(EventCommon::new(tag, time, enter));
    }

    fn exit(&self, tag: Tag, object: Tag) {
        let time = self.now();
        let exit = Event::Exit { exited: object };
        self.add_event(EventCommon::new(tag, time, exit));
    }

    fn create(&self, created_by: Tag, tag: Tag, num_bytes: usize, req_type: i8, name: &str) {
        let time = self.now();
        let create = Event::Create { num_bytes, req_type };
        let mut state_guard = self.state.lock().unwrap();
        state_guard.add_event(EventCommon::new(created_by, time, create));
        state_guard.add_name_to_tag(name, tag);
    }

    fn destroy(&self, destroyed_by: Tag, tag: Tag) {
        let time = self.now();
        let destroy = Event::Destroy { destroyed: tag };
        self.add_event(EventCommon::new(destroyed_by, time, destroy));
    }

    fn connect(&self, _connect_from: Tag, _connect_to: Tag) {
        // Topology is not needed for the in-memory counts
    }

    fn log(&self, tag: Tag, level: log::Level, msg: std::fmt::Arguments) {
        let time = self.now();
        let log = Event::Log {
            level,
            text: format!("{msg}"),
        };
        self.add_event(EventCommon::new(tag, time, log));
    }

    fn time(&self, _set_by: Tag, time_ns: f64) {
        self.entity_manager.set_time(time_ns);
    }

    fn shutdown(&self) {
        // Do nothing
    }
}
