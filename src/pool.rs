//! The relay pool: subscription scheduler and public API surface.
//!
//! Logical subscribe calls accumulate in a pending batch. A call with a
//! `max_delay` arms (or lowers) a single debounce timer; when it fires, or
//! when a call without a delay arrives, the whole batch is flushed at once:
//! cache hits are answered synchronously, the remaining filters are grouped
//! per relay and merged, and one wire subscription per relay fans results
//! back to every batched caller.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::{now_secs, EventCache};
use crate::conn::{
    ConnectionRegistry, Connector, DisconnectCallback, ErrorCallback, NoticeCallback,
    RelayConnection, WireSubHandlers,
};
use crate::error::PoolError;
use crate::event::Event;
use crate::filter::{merge_filters, Filter};
use crate::router::{route_batch, PendingRequest};
use crate::ws::WsConnector;

/// Event delivery callback: `(event, after_eose, relay_url)`. `relay_url` is
/// `None` for synchronous cache hits; `after_eose` is true once the relay the
/// event came from has sent its end-of-stored-events marker (the event is
/// "live" rather than historical).
pub type OnEvent = Arc<dyn Fn(&Event, bool, Option<&str>) + Send + Sync>;

/// End-of-stored-events callback: `(events_seen_on_that_relay, relay_url)`.
/// Called once per relay a flush subscribed to, when that relay's end marker
/// arrives.
pub type OnEose = Arc<dyn Fn(&[Event], &str) + Send + Sync>;

/// Tears down every wire subscription a flush opened. For a debounced
/// subscribe this is a no-op: individual cancellation of a batched request
/// is not supported.
pub type Unsubscribe = Box<dyn FnOnce() + Send>;

/// Per-subscription behavior switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    /// Disable per-subscription dedup: the same event id may be delivered
    /// once per relay it arrives from.
    pub allow_duplicate_events: bool,
    /// Deliver events first observed before this subscription started.
    pub allow_older_events: bool,
}

/// Pool-level configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolOptions {
    /// Disable the event cache entirely: no short-circuit, no narrowing.
    pub no_cache: bool,
}

/// At most one timer is armed at a time; its deadline is the smallest delay
/// requested by any not-yet-flushed subscribe call, measured from the moment
/// that minimum last changed.
struct DebounceState {
    min_delay: Option<Duration>,
    timer: Option<JoinHandle<()>>,
}

struct PoolInner {
    registry: ConnectionRegistry,
    cache: Arc<Mutex<EventCache>>,
    pending: Mutex<Vec<PendingRequest>>,
    debounce: Mutex<DebounceState>,
    options: PoolOptions,
}

/// A pool of relay connections multiplexing many logical subscriptions onto
/// a bounded set of wire subscriptions.
///
/// Cheap to clone; clones share the same connections, cache, and pending
/// batch. Independent pools do not share anything. Methods that open
/// connections must run inside a tokio runtime.
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<PoolInner>,
}

/// How long `get_event_by_id` waits for a relay to answer, on top of the
/// debounce delay it was given.
const GET_EVENT_TIMEOUT: Duration = Duration::from_secs(10);

impl RelayPool {
    pub fn new(connector: Arc<dyn Connector>, options: PoolOptions) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                registry: ConnectionRegistry::new(connector),
                cache: Arc::new(Mutex::new(EventCache::new())),
                pending: Mutex::new(Vec::new()),
                debounce: Mutex::new(DebounceState {
                    min_delay: None,
                    timer: None,
                }),
                options,
            }),
        }
    }

    /// A pool over the default WebSocket transport.
    pub fn with_defaults() -> Self {
        Self::new(Arc::new(WsConnector::new()), PoolOptions::default())
    }

    /// Register a logical subscription over `filters` against `relays`.
    ///
    /// With `max_delay`, the request joins the pending batch and the debounce
    /// timer is lowered to the new minimum; the returned function is a no-op
    /// (a batched request cannot be individually cancelled). Without it, the
    /// whole pending batch is flushed immediately and the returned function
    /// tears down every wire subscription that flush opened.
    ///
    /// `max_delay` and `on_eose` are mutually exclusive: a debounced batch
    /// merges several subscriptions' end markers, so one marker cannot be
    /// attributed to one caller.
    pub fn subscribe(
        &self,
        filters: Vec<Filter>,
        relays: Vec<String>,
        on_event: OnEvent,
        max_delay: Option<Duration>,
        on_eose: Option<OnEose>,
        options: SubscribeOptions,
    ) -> Result<Unsubscribe, PoolError> {
        if max_delay.is_some() && on_eose.is_some() {
            return Err(PoolError::ConflictingOptions);
        }

        self.inner.pending.lock().push(PendingRequest {
            filters,
            relays,
            on_event,
            options,
            started_at: now_secs(),
        });

        match max_delay {
            Some(delay) => {
                self.rearm_timer(delay);
                Ok(Box::new(|| {}))
            }
            None => Ok(self.inner.flush(on_eose)),
        }
    }

    /// Cancel the debounce timer and flush the accumulated batch now.
    pub fn flush_now(&self, on_eose: Option<OnEose>) -> Unsubscribe {
        self.inner.flush(on_eose)
    }

    /// Lower the single debounce timer to `min(current, delay)`, rearmed
    /// from now.
    fn rearm_timer(&self, delay: Duration) {
        let mut debounce = self.inner.debounce.lock();
        let min_delay = match debounce.min_delay {
            Some(current) => current.min(delay),
            None => delay,
        };
        debounce.min_delay = Some(min_delay);
        if let Some(timer) = debounce.timer.take() {
            timer.abort();
        }

        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        debounce.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(min_delay).await;
            if let Some(inner) = weak.upgrade() {
                drop(inner.flush(None));
            }
        }));
    }

    /// Fetch a single event by id: a thin convenience over [`Self::subscribe`]
    /// with an id filter, resolving on the first match from cache or any
    /// relay. Returns `None` when nothing answered in time.
    pub async fn get_event_by_id(
        &self,
        id: &str,
        relays: &[String],
        max_delay: Duration,
    ) -> Option<Event> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let on_event: OnEvent = Arc::new(move |event, _after_eose, _relay| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(event.clone());
            }
        });

        self.subscribe(
            vec![Filter::new().ids([id])],
            relays.to_vec(),
            on_event,
            Some(max_delay),
            None,
            SubscribeOptions {
                // An already-cached event must still resolve the lookup
                allow_older_events: true,
                ..Default::default()
            },
        )
        .ok()?;

        match tokio::time::timeout(max_delay + GET_EVENT_TIMEOUT, rx).await {
            Ok(Ok(event)) => Some(event),
            _ => None,
        }
    }

    /// Publish an event to each of the given relays, connecting lazily.
    pub fn publish(&self, event: &Event, relays: &[String]) {
        for url in relays {
            self.inner.registry.get_or_create(url).publish(event);
        }
    }

    /// The connection for `url`, created and connected on first use.
    pub fn connection(&self, url: &str) -> Arc<RelayConnection> {
        self.inner.registry.get_or_create(url)
    }

    /// Number of distinct relay URLs this pool has ever connected to.
    pub fn relay_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Number of events the pool has observed.
    pub fn cached_event_count(&self) -> usize {
        self.inner.cache.lock().len()
    }

    /// Observe relay notices on every present and future connection.
    pub fn on_notice(&self, cb: NoticeCallback) {
        self.inner.registry.on_notice(cb);
    }

    /// Observe connection errors on connections that exist right now; relays
    /// added later are not wired retroactively.
    pub fn on_error(&self, cb: ErrorCallback) {
        self.inner.registry.on_error(cb);
    }

    /// Observe disconnects on connections that exist right now; same
    /// forward-wiring caveat as [`Self::on_error`].
    pub fn on_disconnect(&self, cb: DisconnectCallback) {
        self.inner.registry.on_disconnect(cb);
    }

    /// Cancel any pending flush, close every relay connection, and wait for
    /// their reader tasks to finish.
    pub async fn close(&self) {
        {
            let mut debounce = self.inner.debounce.lock();
            if let Some(timer) = debounce.timer.take() {
                timer.abort();
            }
            debounce.min_delay = None;
        }
        self.inner.pending.lock().clear();
        self.inner.registry.close_all().await;
    }
}

impl PoolInner {
    /// Flush the accumulated batch: route it through the cache, merge the
    /// per-relay filters, and open one wire subscription per relay.
    fn flush(&self, on_eose: Option<OnEose>) -> Unsubscribe {
        {
            let mut debounce = self.debounce.lock();
            if let Some(timer) = debounce.timer.take() {
                timer.abort();
            }
            debounce.min_delay = None;
        }

        let batch: Vec<PendingRequest> = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return Box::new(|| {});
        }
        debug!("Flushing {} pending subscription(s)", batch.len());

        let route = route_batch(batch, &self.cache, self.options.no_cache);
        let mut opened: Vec<(Arc<RelayConnection>, String)> = Vec::new();

        for (relay, filters) in route.by_relay {
            let merged = merge_filters(filters);
            if merged.is_empty() {
                continue;
            }
            let conn = self.registry.get_or_create(&relay);

            // Stored events seen on this relay before its end marker; None
            // once the marker fired, making later events "live".
            let accumulator: Arc<Mutex<Option<Vec<Event>>>> = Arc::new(Mutex::new(Some(Vec::new())));

            let cache = Arc::clone(&self.cache);
            let wire_cb = Arc::clone(&route.on_event);
            let acc = Arc::clone(&accumulator);
            let relay_for_events = relay.clone();
            let on_wire_event = Arc::new(move |event: Event| {
                cache.lock().add(&event);
                let after_eose = {
                    let mut acc = acc.lock();
                    match acc.as_mut() {
                        Some(stored) => {
                            stored.push(event.clone());
                            false
                        }
                        None => true,
                    }
                };
                wire_cb(&event, after_eose, &relay_for_events);
            });

            let eose_cb = on_eose.clone();
            let relay_for_eose = relay.clone();
            let on_wire_eose = Arc::new(move || {
                // Take exactly once; a second EOSE from the relay is ignored
                if let Some(stored) = accumulator.lock().take() {
                    if let Some(cb) = &eose_cb {
                        cb(&stored, &relay_for_eose);
                    }
                }
            });

            let sub_id = conn.subscribe(
                &merged,
                WireSubHandlers {
                    on_event: on_wire_event,
                    on_eose: on_wire_eose,
                },
            );
            opened.push((conn, sub_id));
        }

        Box::new(move || {
            for (conn, sub_id) in opened {
                conn.unsubscribe(&sub_id);
            }
        })
    }
}
