use std::collections::HashSet;

use crate::model::{EventId, MatchEvent, Side};

/// Display ordering for the timeline. The stored log is always arrival
/// order; `Tick` is a sorted view computed on demand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EventOrder {
    #[default]
    Arrival,
    Tick,
}

/// Delivery record of discrete match events, deduplicated by id.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    entries: Vec<MatchEvent>,
    seen: HashSet<EventId>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the id was already logged; the log is untouched
    /// in that case.
    pub fn append(&mut self, event: MatchEvent) -> bool {
        if self.seen.contains(&event.id) {
            tracing::trace!(
                target = "matchday::events",
                event_id = %event.id,
                "duplicate event delivery ignored"
            );
            return false;
        }
        self.seen.insert(event.id.clone());
        self.entries.push(event);
        true
    }

    /// Appends every event in order, returning how many were new.
    pub fn extend<I>(&mut self, events: I) -> usize
    where
        I: IntoIterator<Item = MatchEvent>,
    {
        events
            .into_iter()
            .map(|event| self.append(event))
            .filter(|inserted| *inserted)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.seen.contains(id)
    }

    pub fn get(&self, id: &EventId) -> Option<&MatchEvent> {
        if !self.seen.contains(id) {
            return None;
        }
        self.entries.iter().find(|event| &event.id == id)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MatchEvent> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&MatchEvent> {
        self.entries.last()
    }

    /// Lazy view in arrival order. The iterator is `Clone`, so a view can be
    /// walked again from the start.
    pub fn filtered<P>(&self, predicate: P) -> Filtered<'_, P>
    where
        P: Fn(&MatchEvent) -> bool,
    {
        Filtered {
            inner: self.entries.iter(),
            predicate,
        }
    }

    pub fn key_events(&self) -> Filtered<'_, fn(&MatchEvent) -> bool> {
        self.filtered(MatchEvent::is_key_event as fn(&MatchEvent) -> bool)
    }

    pub fn goals(&self) -> Filtered<'_, fn(&MatchEvent) -> bool> {
        fn is_goal(event: &MatchEvent) -> bool {
            event.kind.is_goal()
        }
        self.filtered(is_goal as fn(&MatchEvent) -> bool)
    }

    pub fn for_side(&self, side: Side) -> Filtered<'_, impl Fn(&MatchEvent) -> bool + Clone> {
        self.filtered(move |event: &MatchEvent| event.side == side)
    }

    pub fn ordered(&self, order: EventOrder) -> Vec<&MatchEvent> {
        let mut events: Vec<&MatchEvent> = self.entries.iter().collect();
        if order == EventOrder::Tick {
            // stable: equal ticks keep arrival order
            events.sort_by_key(|event| event.tick);
        }
        events
    }

    pub fn to_vec(&self) -> Vec<MatchEvent> {
        self.entries.clone()
    }
}

impl<'a> IntoIterator for &'a EventLog {
    type Item = &'a MatchEvent;
    type IntoIter = std::slice::Iter<'a, MatchEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

pub struct Filtered<'a, P> {
    inner: std::slice::Iter<'a, MatchEvent>,
    predicate: P,
}

impl<'a, P: Clone> Clone for Filtered<'a, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            predicate: self.predicate.clone(),
        }
    }
}

impl<'a, P> Iterator for Filtered<'a, P>
where
    P: Fn(&MatchEvent) -> bool,
{
    type Item = &'a MatchEvent;

    fn next(&mut self) -> Option<Self::Item> {
        let predicate = &self.predicate;
        self.inner.by_ref().find(|event| predicate(event))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, self.inner.size_hint().1)
    }
}
