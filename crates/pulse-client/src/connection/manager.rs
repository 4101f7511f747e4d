//! Connection lifecycle: opening, supervising, and restoring the socket.
//!
//! A connect attempt rides the job queue like any other work so it is
//! ordered with the requests already waiting. Once open, a supervisor
//! task replays subscriptions, flushes parked requests, and pumps
//! inbound frames until the socket dies; what happens then depends on
//! whether the closure was deliberate.

use std::sync::Arc;

use pulse_core::Frame;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::{self, AuthError};
use crate::client::ClientInner;
use crate::connection::backoff::probe_delay;
use crate::connection::socket::Socket;
use crate::connection::state::ConnectionState;
use crate::correlator::{Directive, RequestContext};
use crate::events::ClientEvent;
use crate::scheduler::{JobContext, SchedulerError};

/// Begin opening the connection if it is fully closed. Safe to call at
/// any time; every other state already has a path back to open.
pub(crate) fn open_connection(inner: &Arc<ClientInner>) {
    {
        let mut conn = inner.conn.lock();
        if conn.state != ConnectionState::Closed {
            return;
        }
        conn.state = ConnectionState::Opening;
    }
    enqueue_connect(inner);
}

pub(crate) fn enqueue_connect(inner: &Arc<ClientInner>) {
    inner.ensure_queue_started();
    let task = Arc::clone(inner);
    inner.queue.enqueue(move |job| connect_job(task, job));
}

async fn connect_job(inner: Arc<ClientInner>, job: JobContext) {
    let token = inner.session.lock().token.clone();
    let url = inner.config.socket_url();
    match inner.connector.connect(&url, &token).await {
        Ok(socket) => on_open(&inner, socket, &job),
        Err(err) => {
            warn!(error = %err, "connect attempt failed");
            let probe = {
                let mut conn = inner.conn.lock();
                match conn.state {
                    ConnectionState::Closing | ConnectionState::Closed => {
                        conn.state = ConnectionState::Closed;
                        false
                    }
                    _ => {
                        conn.state = ConnectionState::Reconnecting;
                        true
                    }
                }
            };
            complete(&job);
            if probe {
                tokio::spawn(probe_loop(inner));
            }
        }
    }
}

/// Adopt a freshly opened socket: publish the writer, replay every
/// subscribed topic, flush requests parked while offline, and start the
/// inbound pump. The connect job's slot is released before the pump so
/// the queue is free for the flushed requests.
fn on_open(inner: &Arc<ClientInner>, socket: Socket, job: &JobContext) {
    let Socket {
        outbound,
        mut inbound,
    } = socket;
    let shutdown = CancellationToken::new();
    let adopted = {
        let mut conn = inner.conn.lock();
        match conn.state {
            // A log-off won the race; dropping `outbound` closes the socket.
            ConnectionState::Closing | ConnectionState::Closed => {
                conn.state = ConnectionState::Closed;
                false
            }
            _ => {
                conn.state = ConnectionState::Open;
                conn.writer = Some(outbound.clone());
                conn.shutdown = Some(shutdown.clone());
                conn.reconnect_attempts = 0;
                true
            }
        }
    };
    if !adopted {
        complete(job);
        return;
    }
    info!("connection established");
    let _ = inner.events.send(ClientEvent::ConnectionRestored);

    let topics = inner.registry.topics();
    let parked: Vec<RequestContext> = std::mem::take(&mut *inner.waiting.lock());
    let supervisor = Arc::clone(inner);
    tokio::spawn(async move {
        for topic in topics {
            if outbound.send(Frame::Sub { topic }).await.is_err() {
                break;
            }
        }
        for ctx in parked {
            supervisor.submit(ctx);
        }
        // A cancelled token means a deliberate close; dropping `inbound`
        // and the supervisor's `outbound` clone releases the socket.
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                frame = inbound.recv() => match frame {
                    Some(frame) => handle_frame(&supervisor, frame).await,
                    None => break,
                },
            }
        }
        on_close(&supervisor);
    });
    complete(job);
}

fn on_close(inner: &Arc<ClientInner>) {
    let reconnect = {
        let mut conn = inner.conn.lock();
        conn.writer = None;
        conn.shutdown = None;
        match conn.state {
            ConnectionState::Closing | ConnectionState::Closed => {
                conn.state = ConnectionState::Closed;
                false
            }
            _ => {
                conn.state = ConnectionState::Reconnecting;
                true
            }
        }
    };
    if reconnect {
        warn!("connection lost, restoring");
        enqueue_connect(inner);
    } else {
        debug!("connection closed");
    }
}

async fn handle_frame(inner: &Arc<ClientInner>, frame: Frame) {
    match frame {
        Frame::Res {
            id,
            code,
            data,
            additional,
        } => match inner.tracker.on_response(id, code, data, additional) {
            Ok(Directive::Continue) => {}
            Ok(Directive::ForceLogOff) => {
                warn!("server rejected the session");
                inner.force_log_off();
            }
            Err(fatal) => {
                error!(error = %fatal, "request failed fatally");
                let _ = inner.events.send(ClientEvent::Fatal(fatal));
            }
        },
        Frame::Pub { topic, data } => {
            let delivered = inner.registry.dispatch(&topic, &data);
            if delivered == 0 {
                debug!(topic = %topic, "publication with no local subscribers");
            }
        }
        Frame::Pong => debug!("heartbeat answered"),
        Frame::Ping => {
            if let Some(writer) = inner.writer() {
                let _ = writer.send(Frame::Pong).await;
            }
        }
        Frame::Req { .. } | Frame::Sub { .. } | Frame::Unsub { .. } => {
            warn!("server sent a client-only frame");
            let _ = inner.events.send(ClientEvent::Error(
                "received message in unrecognised format".into(),
            ));
        }
    }
}

/// Poll the server until it answers, then restore the connection. Key
/// clients reconnect directly; cookie-session clients authenticate
/// again first, since the break may have outlived the session.
async fn probe_loop(inner: Arc<ClientInner>) {
    loop {
        let attempt = {
            let mut conn = inner.conn.lock();
            if conn.state != ConnectionState::Reconnecting {
                return;
            }
            conn.reconnect_attempts += 1;
            conn.reconnect_attempts
        };
        tokio::time::sleep(probe_delay(attempt)).await;

        let url = inner.config.http_url("/ping");
        let reachable = matches!(
            inner.http.get(&url).send().await,
            Ok(response) if response.status().is_success()
        );
        if !reachable {
            debug!(attempt, "server not reachable yet");
            continue;
        }

        let (authenticated, use_key) = {
            let session = inner.session.lock();
            (session.authenticated, session.use_key)
        };
        if use_key {
            enqueue_connect(&inner);
            return;
        }
        if authenticated {
            match auth::log_on(&inner).await {
                Ok(()) => {
                    enqueue_connect(&inner);
                    return;
                }
                Err(AuthError::Transport(err)) => {
                    warn!(error = %err, attempt, "reauthentication unreachable, will retry");
                }
                Err(err) => {
                    warn!(error = %err, "reauthentication refused");
                    give_up(&inner);
                    return;
                }
            }
            continue;
        }
        give_up(&inner);
        return;
    }
}

fn give_up(inner: &Arc<ClientInner>) {
    inner.conn.lock().state = ConnectionState::Closed;
    let _ = inner.events.send(ClientEvent::Error(
        "unable to reauthenticate following a connection break".into(),
    ));
}

fn complete(job: &JobContext) {
    if let Err(SchedulerError::DoubleCompletion) = job.complete() {
        warn!("connect job slot already released");
    }
}
