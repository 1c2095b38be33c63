//! Declarative event filters and the per-relay filter merge step.
//!
//! A [`Filter`] selects a subset of events as the AND of its present
//! constraints. [`merge_filters`] collapses the filter list destined for one
//! relay into a minimal equivalent set before it generates wire traffic.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::event::Event;

/// A declarative query over events.
///
/// Wire-visible fields serialize into the relay REQ filter object; `relay`
/// and `no_cache` are client-side routing hints and never leave the process.
/// Equality is structural.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Filter {
    /// Event ids to match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    /// Author pubkeys to match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    /// Event kinds to match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,
    /// Only events created at or after this timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    /// Only events created at or before this timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    /// Maximum number of stored events the relay should return.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// Tag constraints, keyed by wire key (e.g. `"#e"`, `"#p"`).
    #[serde(flatten)]
    pub tags: BTreeMap<String, Vec<String>>,
    /// Per-filter relay override: send this filter only to the named relay.
    #[serde(skip)]
    pub relay: Option<String>,
    /// Skip the event cache for this filter.
    #[serde(skip)]
    pub no_cache: bool,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds<I: IntoIterator<Item = u16>>(mut self, kinds: I) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Constrain a single-letter tag, e.g. `tag("e", ["abc"])`.
    pub fn tag<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .insert(format!("#{name}"), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn relay(mut self, url: impl Into<String>) -> Self {
        self.relay = Some(url.into());
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.no_cache = true;
        self
    }

    /// True when the filter can never match anything, either because it has
    /// no constraining field at all or because a present list constraint is
    /// empty (AND semantics: an empty id list matches no event).
    pub fn is_empty(&self) -> bool {
        let empty_list = |list: &Option<Vec<String>>| matches!(list, Some(v) if v.is_empty());
        if empty_list(&self.ids) || empty_list(&self.authors) {
            return true;
        }
        if matches!(&self.kinds, Some(v) if v.is_empty()) {
            return true;
        }
        if self.tags.values().any(|v| v.is_empty()) {
            return true;
        }

        self.ids.is_none()
            && self.authors.is_none()
            && self.kinds.is_none()
            && self.since.is_none()
            && self.until.is_none()
            && self.tags.is_empty()
    }

    /// True when this filter constrains nothing but event ids.
    pub fn is_pure_id_lookup(&self) -> bool {
        self.ids.is_some()
            && self.authors.is_none()
            && self.kinds.is_none()
            && self.since.is_none()
            && self.until.is_none()
            && self.tags.is_empty()
    }

    /// Evaluate the AND of all present constraints against an event.
    /// `limit` is not a matching constraint.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == &event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        for (key, values) in &self.tags {
            let name = key.strip_prefix('#').unwrap_or(key);
            if !event
                .tag_values(name)
                .any(|v| values.iter().any(|want| want == v))
            {
                return false;
            }
        }
        true
    }
}

/// Collapse a filter list destined for one relay into a minimal equivalent
/// set: empty filters are dropped, and filters identical except in a single
/// list-valued dimension (ids, authors, kinds, or one tag key) are merged by
/// unioning that dimension. The union of results is preserved; anything that
/// cannot be merged soundly stays separate. Output order is unspecified.
pub fn merge_filters(filters: Vec<Filter>) -> Vec<Filter> {
    let mut out: Vec<Filter> = Vec::new();
    'next: for filter in filters.into_iter().filter(|f| !f.is_empty()) {
        for existing in out.iter_mut() {
            if let Some(merged) = try_merge(existing, &filter) {
                *existing = merged;
                continue 'next;
            }
        }
        out.push(filter);
    }
    out
}

/// Merge two filters when they differ in at most one list dimension.
/// A side missing the dimension is unconstrained there, so the merged filter
/// drops the constraint (strict superset, union preserved).
fn try_merge(a: &Filter, b: &Filter) -> Option<Filter> {
    if a.since != b.since
        || a.until != b.until
        || a.limit != b.limit
        || a.relay != b.relay
        || a.no_cache != b.no_cache
    {
        return None;
    }

    let mut merged = a.clone();
    let mut diffs = 0usize;

    if a.ids != b.ids {
        diffs += 1;
        merged.ids = union_lists(&a.ids, &b.ids);
    }
    if a.authors != b.authors {
        diffs += 1;
        merged.authors = union_lists(&a.authors, &b.authors);
    }
    if a.kinds != b.kinds {
        diffs += 1;
        merged.kinds = match (&a.kinds, &b.kinds) {
            (Some(x), Some(y)) => {
                let set: BTreeSet<u16> = x.iter().chain(y.iter()).copied().collect();
                Some(set.into_iter().collect())
            }
            _ => None,
        };
    }

    let keys: BTreeSet<&String> = a.tags.keys().chain(b.tags.keys()).collect();
    for key in keys {
        match (a.tags.get(key), b.tags.get(key)) {
            (Some(x), Some(y)) if x != y => {
                diffs += 1;
                let set: BTreeSet<String> = x.iter().chain(y.iter()).cloned().collect();
                merged.tags.insert(key.clone(), set.into_iter().collect());
            }
            (Some(_), None) => {
                // b is unconstrained on this tag; the union drops it
                diffs += 1;
                merged.tags.remove(key);
            }
            (None, Some(_)) => {
                diffs += 1;
            }
            _ => {}
        }
    }

    (diffs <= 1).then_some(merged)
}

fn union_lists(a: &Option<Vec<String>>, b: &Option<Vec<String>>) -> Option<Vec<String>> {
    match (a, b) {
        (Some(x), Some(y)) => {
            let set: BTreeSet<String> = x.iter().chain(y.iter()).cloned().collect();
            Some(set.into_iter().collect())
        }
        // One side unconstrained: the union is unconstrained
        _ => None,
    }
}
