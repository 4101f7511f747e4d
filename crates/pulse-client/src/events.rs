//! Client-wide event notifications.

use pulse_core::FatalError;

/// Events broadcast to every subscriber of [`Client::subscribe_events`].
///
/// These are the conditions an embedding application must react to but
/// that no single request callback owns.
///
/// [`Client::subscribe_events`]: crate::Client::subscribe_events
#[derive(Clone, Debug)]
pub enum ClientEvent {
    /// The persistent connection was (re)established and subscriptions
    /// have been replayed.
    ConnectionRestored,
    /// The backend rejected the session token; the client has logged
    /// itself off and will not reconnect until re-authenticated.
    SessionExpired,
    /// An unrecoverable failure. The application should surface it and
    /// stop relying on the affected resource.
    Fatal(FatalError),
    /// A recoverable oddity worth reporting, such as an unparseable
    /// message from the server.
    Error(String),
}
