//! Request/response correlation and the deadline sweep.
//!
//! Every outbound `REQ` frame is assigned an identifier and parked here
//! until its `RES` arrives or its deadline passes. A single sweep task
//! sleeps until the earliest pending deadline rather than one timer per
//! request.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use pulse_core::{FatalError, Frame, STATUS_TIMEOUT};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::events::ClientEvent;
use crate::scheduler::JobContext;

/// Callback for a successful response, receiving the payload.
pub type SuccessFn = Box<dyn FnOnce(Value) + Send>;
/// Callback for a failed response, receiving the status code and any
/// diagnostic text. Timeouts arrive with [`STATUS_TIMEOUT`].
pub type FailureFn = Box<dyn FnOnce(i32, Option<String>) + Send>;

/// Everything that describes one request before it is sent.
pub struct RequestContext {
    pub(crate) resource: String,
    pub(crate) params: Value,
    pub(crate) on_success: Option<SuccessFn>,
    pub(crate) on_failure: Option<FailureFn>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) critical: Option<bool>,
}

impl RequestContext {
    /// A request for `resource` with empty parameters and no callbacks.
    #[must_use]
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            params: Value::Null,
            on_success: None,
            on_failure: None,
            timeout: None,
            critical: None,
        }
    }

    /// Set the request parameters.
    #[must_use]
    pub fn params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Set the success callback.
    #[must_use]
    pub fn on_success(mut self, hook: impl FnOnce(Value) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(hook));
        self
    }

    /// Set the failure callback. Registering one also makes the request
    /// non-critical unless [`critical`](Self::critical) says otherwise.
    #[must_use]
    pub fn on_failure(mut self, hook: impl FnOnce(i32, Option<String>) + Send + 'static) -> Self {
        self.on_failure = Some(Box::new(hook));
        self
    }

    /// Override the default deadline.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Force the request to be treated as critical (failures without a
    /// handler become fatal) or not.
    #[must_use]
    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = Some(critical);
        self
    }
}

struct PendingRequest {
    resource: String,
    on_success: Option<SuccessFn>,
    on_failure: Option<FailureFn>,
    critical: bool,
    job: JobContext,
    deadline: Instant,
}

/// What the connection layer must do after a response was processed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Directive {
    /// Nothing further.
    Continue,
    /// The server rejected the session; force a local log-off.
    ForceLogOff,
}

/// The table of in-flight requests.
pub struct RequestTracker {
    pending: Mutex<HashMap<u64, PendingRequest>>,
    next_id: AtomicU64,
    default_timeout: Duration,
    sweep: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<ClientEvent>,
}

impl RequestTracker {
    pub(crate) fn new(default_timeout: Duration, events: broadcast::Sender<ClientEvent>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            default_timeout,
            sweep: Mutex::new(None),
            events,
        }
    }

    /// Track `ctx`, transmit its `REQ` frame, and arm the sweep. The
    /// entry is inserted before the frame goes out so a reply cannot
    /// race past it; a transmit failure is left for the sweep to evict.
    pub(crate) async fn send(
        self: &Arc<Self>,
        ctx: RequestContext,
        writer: &mpsc::Sender<Frame>,
        job: JobContext,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let critical = ctx.critical.unwrap_or(ctx.on_failure.is_none());
        let deadline = Instant::now() + ctx.timeout.unwrap_or(self.default_timeout);
        let frame = Frame::Req {
            id,
            resource: ctx.resource.clone(),
            params: ctx.params,
        };
        self.pending.lock().insert(
            id,
            PendingRequest {
                resource: ctx.resource,
                on_success: ctx.on_success,
                on_failure: ctx.on_failure,
                critical,
                job,
                deadline,
            },
        );
        if writer.send(frame).await.is_err() {
            debug!(id, "socket closed before request left, awaiting sweep");
        }
        self.arm_sweep();
        id
    }

    /// Process a `RES` frame. Unknown identifiers (already swept, or a
    /// duplicate reply) are dropped with a debug log.
    pub(crate) fn on_response(
        self: &Arc<Self>,
        id: u64,
        code: u16,
        data: Option<Value>,
        additional: Option<String>,
    ) -> Result<Directive, FatalError> {
        let Some(entry) = self.pending.lock().remove(&id) else {
            debug!(id, code, "response for unknown request id");
            return Ok(Directive::Continue);
        };
        if code < 300 {
            if let Some(hook) = entry.on_success {
                hook(data.unwrap_or(Value::Null));
            }
            complete_job(&entry.job);
            return Ok(Directive::Continue);
        }
        apply_failure(entry, i32::from(code), additional)
    }

    /// How many requests are awaiting a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// (Re)arm the sweep task for the earliest pending deadline.
    fn arm_sweep(self: &Arc<Self>) {
        let earliest = self.pending.lock().values().map(|e| e.deadline).min();
        let mut slot = self.sweep.lock();
        if let Some(handle) = slot.take() {
            handle.abort();
        }
        let Some(deadline) = earliest else {
            return;
        };
        let tracker = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            tracker.sweep();
        }));
    }

    /// Fail every request whose deadline has passed, then re-arm.
    fn sweep(self: &Arc<Self>) {
        let now = Instant::now();
        let expired: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, e)| e.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        for entry in expired {
            warn!(resource = %entry.resource, "request deadline passed");
            if let Err(fatal) = apply_failure(entry, STATUS_TIMEOUT, None) {
                let _ = self.events.send(ClientEvent::Fatal(fatal));
            }
        }
        self.arm_sweep();
    }

    /// Fail everything still pending, as when the socket drops. Entries
    /// go through the same status table as a timeout.
    pub(crate) fn fail_all(self: &Arc<Self>, status: i32) {
        let entries: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            let ids: Vec<u64> = pending.keys().copied().collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        for entry in entries {
            if let Err(fatal) = apply_failure(entry, status, None) {
                let _ = self.events.send(ClientEvent::Fatal(fatal));
            }
        }
        self.arm_sweep();
    }
}

/// Route a failed response through the status table.
///
/// 401 always forces a log-off. For critical requests, client and server
/// faults escalate to [`FatalError`]; 429 never does since the scheduler
/// limit is meant to keep the client below the server's rate cap. The
/// job slot is released on every path.
fn apply_failure(
    entry: PendingRequest,
    status: i32,
    additional: Option<String>,
) -> Result<Directive, FatalError> {
    let PendingRequest {
        resource,
        on_failure,
        critical,
        job,
        ..
    } = entry;

    if status == 401 {
        if let Some(hook) = on_failure {
            hook(status, additional);
        }
        complete_job(&job);
        return Ok(Directive::ForceLogOff);
    }

    if !critical {
        if let Some(hook) = on_failure {
            hook(status, additional);
        } else {
            warn!(status, resource = %resource, "request failed without a handler");
        }
        complete_job(&job);
        return Ok(Directive::Continue);
    }

    let outcome = match status {
        STATUS_TIMEOUT | -1 => {
            if let Some(hook) = on_failure {
                hook(status, additional);
                Ok(Directive::Continue)
            } else {
                Err(FatalError::Transport { resource })
            }
        }
        400 => Err(FatalError::BadRequest { resource }),
        403 => Err(FatalError::Forbidden { resource }),
        404 => Err(FatalError::NotFound { resource }),
        405 => Err(FatalError::MethodNotAllowed { resource }),
        500 => Err(FatalError::ServerError { resource }),
        429 => {
            if let Some(hook) = on_failure {
                hook(status, additional);
            } else {
                warn!(resource = %resource, "rate limited with no handler registered");
            }
            Ok(Directive::Continue)
        }
        other => Err(FatalError::Unrecognized {
            status: other,
            resource,
        }),
    };
    complete_job(&job);
    outcome
}

fn complete_job(job: &JobContext) {
    if let Err(err) = job.complete() {
        warn!(error = %err, "request job slot already released");
    }
}
