//! In-memory cache of observed events.
//!
//! Answers filter lookups from history so already-seen data never generates
//! wire traffic. Grows for the lifetime of the pool: eviction is an explicit
//! non-goal, process-lifetime caching is the accepted tradeoff.

use std::collections::HashMap;

use crate::event::Event;
use crate::filter::Filter;

/// An event plus the time the pool first observed it. The received-at stamp
/// drives the older-events suppression rule, not the event's own `created_at`.
#[derive(Debug, Clone)]
pub struct CachedEvent {
    pub event: Event,
    pub received_at: u64,
}

/// Id-keyed store of every event the pool has observed.
///
/// Lookups are a linear scan over stored events. Secondary indexes (by
/// author, by kind) would speed this up without changing the observable
/// contract; the id-keyed map already makes pure id lookups cheap.
#[derive(Debug, Default)]
pub struct EventCache {
    events: HashMap<String, CachedEvent>,
}

impl EventCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an event, keyed by identity. No-op if already present: the
    /// first-seen `received_at` is kept.
    pub fn add(&mut self, event: &Event) {
        self.events
            .entry(event.id.clone())
            .or_insert_with(|| CachedEvent {
                event: event.clone(),
                received_at: now_secs(),
            });
    }

    /// Fetch a single event by id.
    pub fn get(&self, id: &str) -> Option<&Event> {
        self.events.get(id).map(|c| &c.event)
    }

    /// When the pool first observed the event, if ever.
    pub fn received_at(&self, id: &str) -> Option<u64> {
        self.events.get(id).map(|c| c.received_at)
    }

    /// All cached events matching the filter's constraints, honoring `limit`.
    /// Pure id lookups hit the map directly; everything else scans.
    pub fn lookup(&self, filter: &Filter) -> Vec<Event> {
        if filter.is_empty() {
            return Vec::new();
        }

        let mut hits: Vec<Event> = if filter.is_pure_id_lookup() {
            filter
                .ids
                .iter()
                .flatten()
                .filter_map(|id| self.events.get(id))
                .map(|c| c.event.clone())
                .collect()
        } else {
            self.events
                .values()
                .filter(|c| filter.matches(&c.event))
                .map(|c| c.event.clone())
                .collect()
        };

        if let Some(limit) = filter.limit {
            // Relays return the newest stored events first
            hits.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            hits.truncate(limit as usize);
        }
        hits
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

pub(crate) fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, pubkey: &str, kind: u16, created_at: u64) -> Event {
        Event {
            id: id.into(),
            pubkey: pubkey.into(),
            created_at,
            kind,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn add_is_idempotent_by_id() {
        let mut cache = EventCache::new();
        cache.add(&event("e1", "alice", 1, 10));

        let mut changed = event("e1", "alice", 1, 10);
        changed.content = "different body".into();
        cache.add(&changed);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("e1").unwrap().content, "");
    }

    #[test]
    fn lookup_by_id_and_constraints() {
        let mut cache = EventCache::new();
        cache.add(&event("e1", "alice", 1, 10));
        cache.add(&event("e2", "bob", 1, 20));
        cache.add(&event("e3", "alice", 7, 30));

        let hits = cache.lookup(&Filter::new().ids(["e2"]));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "e2");

        let mut hits = cache.lookup(&Filter::new().authors(["alice"]));
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "e1");

        let hits = cache.lookup(&Filter::new().kinds([1]).since(15));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "e2");
    }

    #[test]
    fn lookup_empty_filter_matches_nothing() {
        let mut cache = EventCache::new();
        cache.add(&event("e1", "alice", 1, 10));
        assert!(cache.lookup(&Filter::new()).is_empty());
        assert!(cache.lookup(&Filter::new().ids(Vec::<String>::new())).is_empty());
    }

    #[test]
    fn lookup_honors_limit_newest_first() {
        let mut cache = EventCache::new();
        for i in 0..5u64 {
            cache.add(&event(&format!("e{i}"), "alice", 1, i * 10));
        }
        let hits = cache.lookup(&Filter::new().authors(["alice"]).limit(2));
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "e4");
        assert_eq!(hits[1].id, "e3");
    }

    #[test]
    fn received_at_recorded_on_first_insert() {
        let mut cache = EventCache::new();
        assert_eq!(cache.received_at("e1"), None);
        cache.add(&event("e1", "alice", 1, 10));
        assert!(cache.received_at("e1").is_some());
    }
}
