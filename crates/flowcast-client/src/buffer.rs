//! Bounded, newest-first event buffer deduplicated by event id.

use std::collections::{HashSet, VecDeque};

use flowcast_core::FlowEvent;

/// Default, and maximum, number of retained events.
pub const DEFAULT_BUFFER_CAPACITY: usize = 100;

/// Most recent events, newest at the front.
///
/// An event whose id is already held is ignored. When a new event pushes the
/// length past capacity, the oldest is dropped.
#[derive(Debug, Clone)]
pub struct EventBuffer {
    events: VecDeque<FlowEvent>,
    ids: HashSet<String>,
    capacity: usize,
    revision: u64,
}

impl EventBuffer {
    /// Empty buffer holding at most `capacity` events, clamped to
    /// `1..=DEFAULT_BUFFER_CAPACITY`.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, DEFAULT_BUFFER_CAPACITY);
        Self {
            events: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity,
            revision: 0,
        }
    }

    /// Merge one event. Returns `false` if its id was already present.
    pub fn insert(&mut self, event: FlowEvent) -> bool {
        if self.ids.contains(&event.id) {
            return false;
        }
        let _ = self.ids.insert(event.id.clone());
        self.events.push_front(event);
        while self.events.len() > self.capacity {
            if let Some(oldest) = self.events.pop_back() {
                let _ = self.ids.remove(&oldest.id);
            }
        }
        self.revision += 1;
        true
    }

    /// Drop every event.
    pub fn clear(&mut self) {
        if self.events.is_empty() {
            return;
        }
        self.events.clear();
        self.ids.clear();
        self.revision += 1;
    }

    /// Whether an event with this id is held.
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Events newest first.
    pub fn iter(&self) -> impl Iterator<Item = &FlowEvent> {
        self.events.iter()
    }

    /// Owned copy, newest first.
    pub fn snapshot(&self) -> Vec<FlowEvent> {
        self.events.iter().cloned().collect()
    }

    /// Number of held events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Maximum number of held events.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bumped on every change; lets observers skip unchanged snapshots.
    pub fn revision(&self) -> u64 {
        self.revision
    }
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}
