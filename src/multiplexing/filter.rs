use serde::Deserialize;

use crate::catalogue::{Event, EventId};

/// Selects the events a subscriber (or an input endpoint) cares about.
///
/// An empty filter accepts everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EventFilter {
    pub categories: Vec<u16>,
    pub events: Vec<(u16, u16)>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_category(mut self, category: u16) -> Self {
        if !self.categories.contains(&category) {
            self.categories.push(category);
        }
        self
    }

    pub fn with_event(mut self, id: EventId) -> Self {
        let key = (id.category, id.element);
        if !self.events.contains(&key) {
            self.events.push(key);
        }
        self
    }

    pub fn is_all(&self) -> bool {
        self.categories.is_empty() && self.events.is_empty()
    }

    pub fn accepts(&self, id: EventId) -> bool {
        self.is_all()
            || self.categories.contains(&id.category)
            || self.events.contains(&(id.category, id.element))
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.accepts(event.id)
    }
}
