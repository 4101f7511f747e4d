//! The public client handle and its shared inner state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use pulse_core::{Frame, ResourceConfig};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::auth::{self, AuthError, SessionState};
use crate::config::ClientConfig;
use crate::connection::heartbeat;
use crate::connection::manager;
use crate::connection::socket::{Connector, WsConnector};
use crate::connection::state::ConnectionState;
use crate::correlator::{RequestContext, RequestTracker};
use crate::events::ClientEvent;
use crate::live::{CollectionOptions, LiveDataManager};
use crate::pubsub::{PushHandler, PushRegistry};
use crate::scheduler::JobQueue;

/// Capacity of the client-wide event channel. Slow subscribers lose the
/// oldest events, which is the right failure mode for notifications.
const EVENT_CHANNEL_DEPTH: usize = 64;

pub(crate) struct ConnHandle {
    pub(crate) state: ConnectionState,
    pub(crate) writer: Option<mpsc::Sender<Frame>>,
    /// Cancelled to tear down the current socket's supervisor task.
    pub(crate) shutdown: Option<CancellationToken>,
    pub(crate) reconnect_attempts: u32,
}

/// State shared by every [`Client`] clone and every background task.
pub(crate) struct ClientInner {
    pub(crate) config: ClientConfig,
    pub(crate) http: reqwest::Client,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) queue: JobQueue,
    queue_started: AtomicBool,
    pub(crate) tracker: Arc<RequestTracker>,
    pub(crate) registry: PushRegistry,
    pub(crate) session: Mutex<SessionState>,
    pub(crate) conn: Mutex<ConnHandle>,
    pub(crate) waiting: Mutex<Vec<RequestContext>>,
    pub(crate) events: broadcast::Sender<ClientEvent>,
    heartbeat: Mutex<Option<CancellationToken>>,
}

impl ClientInner {
    /// Route a request: straight onto the queue when the connection is
    /// open, otherwise parked until it is. Parking while fully closed
    /// also kicks off a connection attempt.
    pub(crate) fn submit(self: &Arc<Self>, ctx: RequestContext) {
        self.ensure_queue_started();
        let writer = self.writer();
        if let Some(writer) = writer {
            let tracker = Arc::clone(&self.tracker);
            self.queue.enqueue(move |job| async move {
                tracker.send(ctx, &writer, job).await;
            });
            return;
        }
        let state = {
            let mut waiting = self.waiting.lock();
            waiting.push(ctx);
            self.conn.lock().state
        };
        debug!(?state, "request parked until the connection is up");
        if state == ConnectionState::Closed {
            manager::open_connection(self);
        }
    }

    /// The frame writer, if the connection is open.
    pub(crate) fn writer(&self) -> Option<mpsc::Sender<Frame>> {
        let conn = self.conn.lock();
        if conn.state == ConnectionState::Open {
            conn.writer.clone()
        } else {
            None
        }
    }

    pub(crate) fn ensure_queue_started(&self) {
        if self.queue_started.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.config.concurrent_limit > 0 {
            if let Err(err) = self.queue.set_limit(self.config.concurrent_limit) {
                warn!(error = %err, "could not apply concurrency limit");
            }
        }
        if let Err(err) = self.queue.start() {
            warn!(error = %err, "scheduler start raced");
        }
    }

    /// Spawn the heartbeat loop if one is not already running.
    pub(crate) fn ensure_heartbeat(self: &Arc<Self>) {
        let mut slot = self.heartbeat.lock();
        if slot.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        tokio::spawn(heartbeat::run_heartbeat(Arc::clone(self), cancel.clone()));
        *slot = Some(cancel);
    }

    pub(crate) fn stop_heartbeat(&self) {
        if let Some(cancel) = self.heartbeat.lock().take() {
            cancel.cancel();
        }
    }

    /// Move an open or opening connection to `Closing` and cancel its
    /// supervisor so the socket actually shuts down. The supervisor's
    /// exit path completes the transition to `Closed`.
    pub(crate) fn begin_close(&self) {
        let shutdown = {
            let mut conn = self.conn.lock();
            if !matches!(conn.state, ConnectionState::Opening | ConnectionState::Open) {
                return;
            }
            conn.state = ConnectionState::Closing;
            conn.writer = None;
            conn.shutdown.take()
        };
        if let Some(shutdown) = shutdown {
            shutdown.cancel();
        }
    }

    /// Tear the session down locally after the server rejected it. No
    /// HTTP log-off is attempted; the server already considers the
    /// session dead.
    pub(crate) fn force_log_off(self: &Arc<Self>) {
        *self.session.lock() = SessionState::default();
        self.stop_heartbeat();
        self.begin_close();
        self.tracker.fail_all(pulse_core::STATUS_TIMEOUT);
        let _ = self.events.send(ClientEvent::SessionExpired);
    }
}

/// A handle on one logical connection to the backend.
///
/// Cheap to clone; all clones share the connection, the scheduler, and
/// the subscription registry. Requests may be issued before logging on;
/// they are parked and flushed once the connection comes up.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

impl Client {
    /// A client for `config` using the production WebSocket transport.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_DEPTH);
        let connector = Arc::new(WsConnector::new(events.clone()));
        Self::build(config, connector, events)
    }

    /// A client with a caller-supplied transport. This is the seam test
    /// harnesses use to run the whole stack in memory.
    #[must_use]
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_DEPTH);
        Self::build(config, connector, events)
    }

    fn build(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        let tracker = Arc::new(RequestTracker::new(config.request_timeout(), events.clone()));
        Self {
            inner: Arc::new(ClientInner {
                config,
                http: reqwest::Client::new(),
                connector,
                queue: JobQueue::new(),
                queue_started: AtomicBool::new(false),
                tracker,
                registry: PushRegistry::default(),
                session: Mutex::new(SessionState::default()),
                conn: Mutex::new(ConnHandle {
                    state: ConnectionState::Closed,
                    writer: None,
                    shutdown: None,
                    reconnect_attempts: 0,
                }),
                waiting: Mutex::new(Vec::new()),
                events,
                heartbeat: Mutex::new(None),
            }),
        }
    }

    /// Authenticate with the configured username and password and start
    /// the heartbeat. May be called again on an authenticated client to
    /// refresh the session.
    pub async fn log_on(&self) -> Result<(), AuthError> {
        auth::log_on(&self.inner).await
    }

    /// End the session deliberately: close the connection without
    /// reconnecting, tell the server, and drop the token.
    pub async fn log_off(&self) -> Result<(), AuthError> {
        auth::log_off(&self.inner).await
    }

    /// Authenticate with a long-lived API key instead of a session.
    pub fn set_key(&self, key: impl Into<String>) -> Result<(), AuthError> {
        auth::set_key(&self.inner, key.into())
    }

    /// Issue a request over the persistent connection.
    pub fn request(&self, ctx: RequestContext) {
        self.inner.submit(ctx);
    }

    /// Register `handler` for `topics`, subscribing server-side to any
    /// topic nobody wanted before.
    pub fn register_push_handler(&self, topics: &[String], handler: &PushHandler) {
        let fresh = self.inner.registry.register(topics, handler);
        if fresh.is_empty() {
            return;
        }
        let credentialed = {
            let session = self.inner.session.lock();
            session.authenticated || session.use_key
        };
        if let Some(writer) = self.inner.writer() {
            tokio::spawn(async move {
                for topic in fresh {
                    if writer.send(Frame::Sub { topic }).await.is_err() {
                        break;
                    }
                }
            });
        } else if credentialed && self.inner.conn.lock().state == ConnectionState::Closed {
            manager::open_connection(&self.inner);
        }
    }

    /// Drop `handler`'s registrations, unsubscribing server-side from
    /// topics left with no interest.
    pub fn unregister_push_handler(&self, topics: &[String], handler: &PushHandler) {
        let released = self.inner.registry.unregister(topics, handler);
        if released.is_empty() {
            return;
        }
        if let Some(writer) = self.inner.writer() {
            tokio::spawn(async move {
                for topic in released {
                    if writer.send(Frame::Unsub { topic }).await.is_err() {
                        break;
                    }
                }
            });
        }
    }

    /// A live, server-maintained view of one collection.
    #[must_use]
    pub fn maintained_list(
        &self,
        config: ResourceConfig,
        options: CollectionOptions,
    ) -> Arc<LiveDataManager> {
        LiveDataManager::new(self.clone(), config, options)
    }

    /// Subscribe to client-wide events.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Current connection lifecycle state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.conn.lock().state
    }
}
