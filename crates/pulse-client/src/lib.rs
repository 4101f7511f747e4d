//! Client runtime maintaining one logical connection to a pulse
//! monitoring backend.
//!
//! The pieces, bottom up:
//!
//! - [`scheduler`]: the FIFO job queue every outbound unit of work
//!   rides, with a concurrency cap.
//! - [`correlator`]: pairs `REQ` frames with their `RES`, applies the
//!   failure status table, and sweeps deadlines with a single timer.
//! - [`connection`]: the WebSocket transport behind a
//!   [`Connector`](connection::socket::Connector) seam, the lifecycle
//!   manager that opens, supervises, and restores the socket, and the
//!   session heartbeat.
//! - [`pubsub`]: local topic registrations and publication fan-out.
//! - [`auth`]: cookie-session and API-key credential handling.
//! - [`live`]: server-maintained collection views built on all of the
//!   above.
//! - [`client`]: the public handle tying the runtime together.

pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod events;
pub mod live;
pub mod pubsub;
pub mod scheduler;
#[cfg(test)]
pub(crate) mod testing;

pub use auth::AuthError;
pub use client::Client;
pub use config::ClientConfig;
pub use connection::socket::{ConnectError, Connector, Socket};
pub use connection::state::ConnectionState;
pub use correlator::{FailureFn, RequestContext, RequestTracker, SuccessFn};
pub use events::ClientEvent;
pub use live::{
    CollectionObserver, CollectionOptions, HookDecision, LiveDataError, LiveDataManager,
    LoadFailureFn, UpdateFn,
};
pub use pubsub::{PushHandler, PushRegistry};
pub use scheduler::{JobContext, JobQueue, SchedulerError};

pub use pulse_core::{ChangeKind, FatalError, Frame, ResourceConfig, STATUS_TIMEOUT};
