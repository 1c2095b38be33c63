//! Per-relay connection lifecycle.
//!
//! One long-lived connection per relay URL, lazily created and reused for the
//! lifetime of the registry. Subscribe and publish frames queue while the
//! transport is still connecting; a relay that never connects silently yields
//! no events rather than an error, matching the best-effort-across-many-relays
//! policy. Connect failures are reported through the notice observers.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::event::Event;
use crate::filter::Filter;
use crate::wire::{self, RelayMessage};

/// Observer for relay notices, called with `(relay_url, message)`.
pub type NoticeCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;
/// Observer for connection-level errors, called with `(relay_url, message)`.
pub type ErrorCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;
/// Observer for disconnects, called with the relay URL.
pub type DisconnectCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Channels handed back by a [`Connector`] once the transport is up.
///
/// Raw outbound frames go into `outbound`; the transport parses inbound
/// traffic into [`RelayMessage`]s on `inbound` and surfaces transport errors
/// on `errors`. Dropping `outbound` tells the transport to close. The
/// transport closes `inbound` when the connection is gone.
pub struct ConnectorHandle {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<RelayMessage>,
    pub errors: mpsc::UnboundedReceiver<String>,
}

/// The transport collaborator: everything the pool needs from a duplex
/// relay connection, and nothing else. The default implementation is
/// [`crate::ws::WsConnector`]; tests plug in an in-process mock.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<ConnectorHandle>;
}

/// Callbacks attached to one wire subscription for its lifetime.
pub struct WireSubHandlers {
    pub on_event: Arc<dyn Fn(Event) + Send + Sync>,
    pub on_eose: Arc<dyn Fn() + Send + Sync>,
}

enum ConnState {
    /// Transport still connecting; frames queue in order.
    Connecting { queued: Vec<String> },
    Connected { outbound: mpsc::UnboundedSender<String> },
    /// Connect failed or the connection was closed; frames are dropped.
    Closed,
}

/// One relay connection: owns its wire subscriptions and a frame channel.
pub struct RelayConnection {
    url: String,
    state: Mutex<ConnState>,
    subs: Mutex<HashMap<String, WireSubHandlers>>,
    notice_observers: Mutex<Vec<NoticeCallback>>,
    error_observers: Mutex<Vec<ErrorCallback>>,
    disconnect_observers: Mutex<Vec<DisconnectCallback>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl RelayConnection {
    fn new(url: &str, notice_observers: Vec<NoticeCallback>) -> Self {
        Self {
            url: url.to_string(),
            state: Mutex::new(ConnState::Connecting { queued: Vec::new() }),
            subs: Mutex::new(HashMap::new()),
            notice_observers: Mutex::new(notice_observers),
            error_observers: Mutex::new(Vec::new()),
            disconnect_observers: Mutex::new(Vec::new()),
            reader: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Open a wire subscription over the merged filter set. Returns the
    /// subscription id; the REQ queues if the transport is not up yet.
    pub fn subscribe(&self, filters: &[Filter], handlers: WireSubHandlers) -> String {
        let sub_id = uuid::Uuid::new_v4().simple().to_string();
        self.subs.lock().insert(sub_id.clone(), handlers);
        match wire::req_frame(&sub_id, filters) {
            Ok(frame) => self.send_frame(frame),
            Err(e) => warn!("Dropping subscription to {}: {e}", self.url),
        }
        sub_id
    }

    /// Close one wire subscription; further events for it are not delivered.
    pub fn unsubscribe(&self, sub_id: &str) {
        if self.subs.lock().remove(sub_id).is_some() {
            self.send_frame(wire::close_frame(sub_id));
        }
    }

    /// Send (or queue) a publish frame for the event.
    pub fn publish(&self, event: &Event) {
        match wire::event_frame(event) {
            Ok(frame) => self.send_frame(frame),
            Err(e) => warn!("Dropping publish to {}: {e}", self.url),
        }
    }

    fn send_frame(&self, frame: String) {
        let mut state = self.state.lock();
        match &mut *state {
            ConnState::Connecting { queued } => queued.push(frame),
            ConnState::Connected { outbound } => {
                if outbound.send(frame).is_err() {
                    debug!("Transport for {} gone, dropping frame", self.url);
                }
            }
            ConnState::Closed => {
                debug!("Connection to {} is closed, dropping frame", self.url);
            }
        }
    }

    pub fn on_notice(&self, cb: NoticeCallback) {
        self.notice_observers.lock().push(cb);
    }

    pub fn on_error(&self, cb: ErrorCallback) {
        self.error_observers.lock().push(cb);
    }

    pub fn on_disconnect(&self, cb: DisconnectCallback) {
        self.disconnect_observers.lock().push(cb);
    }

    /// Wire up a connected transport: flush queued frames and start the
    /// reader task dispatching inbound messages to wire subscriptions.
    fn attach(self: Arc<Self>, handle: ConnectorHandle) {
        let ConnectorHandle {
            outbound,
            mut inbound,
            mut errors,
        } = handle;

        {
            let mut state = self.state.lock();
            if let ConnState::Connecting { queued } = &mut *state {
                for frame in queued.drain(..) {
                    if outbound.send(frame).is_err() {
                        break;
                    }
                }
            } else {
                // close() raced the connect; drop the transport
                return;
            }
            *state = ConnState::Connected { outbound };
        }
        info!("Connected to relay {}", self.url);

        let conn = Arc::clone(&self);
        let reader = tokio::spawn(async move {
            let mut errors_open = true;
            loop {
                tokio::select! {
                    msg = inbound.recv() => match msg {
                        Some(msg) => conn.dispatch(msg),
                        None => break,
                    },
                    err = errors.recv(), if errors_open => match err {
                        Some(message) => {
                            warn!("Relay {} error: {message}", conn.url);
                            for cb in conn.error_observers.lock().iter() {
                                cb(&conn.url, &message);
                            }
                        }
                        None => errors_open = false,
                    }
                }
            }
            debug!("Relay {} reader ended", conn.url);
            for cb in conn.disconnect_observers.lock().iter() {
                cb(&conn.url);
            }
        });
        *self.reader.lock() = Some(reader);
    }

    fn dispatch(&self, msg: RelayMessage) {
        match msg {
            RelayMessage::Event { sub_id, event } => {
                let handler = self
                    .subs
                    .lock()
                    .get(&sub_id)
                    .map(|h| Arc::clone(&h.on_event));
                match handler {
                    Some(on_event) => on_event(event),
                    None => debug!("Event for unknown sub {sub_id} from {}", self.url),
                }
            }
            RelayMessage::EndOfStoredEvents { sub_id } => {
                let handler = self
                    .subs
                    .lock()
                    .get(&sub_id)
                    .map(|h| Arc::clone(&h.on_eose));
                if let Some(on_eose) = handler {
                    on_eose();
                }
            }
            RelayMessage::Notice { message } => {
                warn!("Relay {} notice: {message}", self.url);
                for cb in self.notice_observers.lock().iter() {
                    cb(&self.url, &message);
                }
            }
            RelayMessage::Ok {
                event_id, accepted, ..
            } => {
                debug!("Relay {} ack {event_id}: accepted={accepted}", self.url);
            }
            RelayMessage::Closed { sub_id, message } => {
                warn!("Relay {} closed sub {sub_id}: {message}", self.url);
                self.subs.lock().remove(&sub_id);
            }
            RelayMessage::Unknown(raw) => {
                debug!("Relay {} sent unrecognized message: {raw}", self.url);
            }
        }
    }

    /// Mark the connection failed and tell the notice observers. Queued
    /// frames are dropped; the relay contributes no events from here on.
    fn fail(&self, reason: &str) {
        warn!("Failed to connect to relay {}: {reason}", self.url);
        *self.state.lock() = ConnState::Closed;
        let message = format!("failed to connect: {reason}");
        for cb in self.notice_observers.lock().iter() {
            cb(&self.url, &message);
        }
    }

    /// Drop the transport (its task exits once the frame channel closes) and
    /// hand back the reader task so close_all can await it.
    fn close(&self) -> Option<JoinHandle<()>> {
        *self.state.lock() = ConnState::Closed;
        self.subs.lock().clear();
        self.reader.lock().take()
    }
}

/// Registry of relay connections, one per distinct URL string.
pub struct ConnectionRegistry {
    connector: Arc<dyn Connector>,
    conns: Mutex<HashMap<String, Arc<RelayConnection>>>,
    /// Notice observers are wired to every connection, present and future.
    notice_observers: Mutex<Vec<NoticeCallback>>,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            conns: Mutex::new(HashMap::new()),
            notice_observers: Mutex::new(Vec::new()),
        }
    }

    /// Return the connection for `url`, creating and asynchronously
    /// connecting it on first use. Idempotent by exact URL string; the
    /// returned connection is usable immediately (operations queue until
    /// the transport is up). Connect failures go to the notice observers,
    /// never to the caller.
    pub fn get_or_create(&self, url: &str) -> Arc<RelayConnection> {
        let conn = {
            let mut conns = self.conns.lock();
            if let Some(conn) = conns.get(url) {
                return Arc::clone(conn);
            }
            let conn = Arc::new(RelayConnection::new(
                url,
                self.notice_observers.lock().clone(),
            ));
            conns.insert(url.to_string(), Arc::clone(&conn));
            conn
        };

        let connector = Arc::clone(&self.connector);
        let task_conn = Arc::clone(&conn);
        let url = url.to_string();
        tokio::spawn(async move {
            match connector.connect(&url).await {
                Ok(handle) => task_conn.attach(handle),
                Err(e) => task_conn.fail(&e.to_string()),
            }
        });
        conn
    }

    /// Number of distinct relay URLs ever requested.
    pub fn len(&self) -> usize {
        self.conns.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.lock().is_empty()
    }

    /// Register a notice observer on every present and future connection.
    pub fn on_notice(&self, cb: NoticeCallback) {
        self.notice_observers.lock().push(Arc::clone(&cb));
        for conn in self.conns.lock().values() {
            conn.on_notice(Arc::clone(&cb));
        }
    }

    /// Register an error observer on connections that exist right now.
    /// Connections created later are not wired retroactively; callers that
    /// add relays afterwards miss those relays' errors. This asymmetry with
    /// [`Self::on_notice`] is deliberate and part of the contract.
    pub fn on_error(&self, cb: ErrorCallback) {
        for conn in self.conns.lock().values() {
            conn.on_error(Arc::clone(&cb));
        }
    }

    /// Register a disconnect observer on connections that exist right now.
    /// Same forward-wiring caveat as [`Self::on_error`].
    pub fn on_disconnect(&self, cb: DisconnectCallback) {
        for conn in self.conns.lock().values() {
            conn.on_disconnect(Arc::clone(&cb));
        }
    }

    /// Close every connection, clear the registry, and wait for the reader
    /// tasks to finish.
    pub async fn close_all(&self) {
        let conns: Vec<Arc<RelayConnection>> = self.conns.lock().drain().map(|(_, c)| c).collect();
        let mut readers = Vec::new();
        for conn in &conns {
            if let Some(reader) = conn.close() {
                readers.push(reader);
            }
        }
        for reader in readers {
            let _ = reader.await;
        }
        info!("Closed {} relay connection(s)", conns.len());
    }
}
