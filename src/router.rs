//! Cache-aware routing of a batch of logical subscribe requests.
//!
//! Turns the accumulated pending batch into a per-relay filter mapping plus a
//! single merged event callback. Cache hits are answered synchronously before
//! any network activity; pure id lookups fully satisfied by the cache never
//! generate wire traffic at all.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::EventCache;
use crate::event::Event;
use crate::filter::Filter;
use crate::pool::{OnEvent, SubscribeOptions};

/// One logical subscribe request waiting in the pending batch.
pub struct PendingRequest {
    pub filters: Vec<Filter>,
    pub relays: Vec<String>,
    pub on_event: OnEvent,
    pub options: SubscribeOptions,
    /// When the request entered the batch; drives older-event suppression.
    pub started_at: u64,
}

/// Merged callback fed by every wire subscription a flush opens, called with
/// `(event, after_eose, relay_url)`.
pub type WireEventCallback = Arc<dyn Fn(&Event, bool, &str) + Send + Sync>;

/// Result of routing a batch: what to ask each relay, and the one callback
/// that fans incoming events back out to the batched requests.
pub struct BatchRoute {
    pub by_relay: HashMap<String, Vec<Filter>>,
    pub on_event: WireEventCallback,
}

struct RequestDispatch {
    /// The request's original filters; an incoming event is delivered to the
    /// request only if one of them matches (relay overrides respected).
    matchers: Vec<Filter>,
    on_event: OnEvent,
    options: SubscribeOptions,
    /// Event ids already delivered to this logical request.
    seen: Arc<Mutex<HashSet<String>>>,
    started_at: u64,
}

/// Route a batch: consult the cache, emit synchronous hits, narrow or drop
/// filters the cache fully or partially satisfied, and group the survivors
/// by target relay.
pub fn route_batch(
    batch: Vec<PendingRequest>,
    cache: &Arc<Mutex<EventCache>>,
    pool_no_cache: bool,
) -> BatchRoute {
    let mut by_relay: HashMap<String, Vec<Filter>> = HashMap::new();
    let mut dispatches: Vec<RequestDispatch> = Vec::new();

    for request in batch {
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let dedup = !request.options.allow_duplicate_events;

        for filter in &request.filters {
            let mut filter = filter.clone();
            if filter.is_empty() {
                continue;
            }

            let use_cache = !pool_no_cache && !filter.no_cache;
            if use_cache {
                let hits = cache.lock().lookup(&filter);
                for hit in &hits {
                    if dedup && !seen.lock().insert(hit.id.clone()) {
                        continue;
                    }
                    (request.on_event)(hit, false, None);
                }

                // A pure id lookup can be narrowed to the ids the cache did
                // not have, or dropped outright when it had them all. Other
                // filter shapes cannot be narrowed soundly and go out as-is.
                if dedup && filter.is_pure_id_lookup() && !hits.is_empty() {
                    let served: HashSet<&str> = hits.iter().map(|e| e.id.as_str()).collect();
                    let remaining: Vec<String> = filter
                        .ids
                        .iter()
                        .flatten()
                        .filter(|id| !served.contains(id.as_str()))
                        .cloned()
                        .collect();
                    if remaining.is_empty() {
                        continue;
                    }
                    filter.ids = Some(remaining);
                }
            }

            let targets: Vec<String> = match &filter.relay {
                Some(url) => vec![url.clone()],
                None => request.relays.clone(),
            };

            // Relay resolution is done; strip the client-side fields so
            // equal filters from different requests can merge.
            let mut routed = filter.clone();
            routed.relay = None;
            routed.no_cache = false;
            for relay in targets {
                by_relay.entry(relay).or_default().push(routed.clone());
            }
        }

        dispatches.push(RequestDispatch {
            matchers: request.filters,
            on_event: request.on_event,
            options: request.options,
            seen,
            started_at: request.started_at,
        });
    }

    let cache = Arc::clone(cache);
    let on_event: WireEventCallback = Arc::new(move |event, after_eose, relay_url| {
        for dispatch in &dispatches {
            let matched = dispatch.matchers.iter().any(|f| {
                f.relay.as_deref().map_or(true, |r| r == relay_url) && f.matches(event)
            });
            if !matched {
                continue;
            }
            if !dispatch.options.allow_duplicate_events
                && !dispatch.seen.lock().insert(event.id.clone())
            {
                continue;
            }
            if !dispatch.options.allow_older_events {
                // First observed before this request started: history the
                // caller has already had a chance to see.
                let stale = cache
                    .lock()
                    .received_at(&event.id)
                    .is_some_and(|t| t < dispatch.started_at);
                if stale {
                    continue;
                }
            }
            (dispatch.on_event)(event, after_eose, Some(relay_url));
        }
    });

    BatchRoute { by_relay, on_event }
}
