//! Connection lifecycle states.

/// Where the persistent connection currently is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none wanted.
    Closed,
    /// A connect attempt is in flight.
    Opening,
    /// The socket is up and frames are flowing.
    Open,
    /// A deliberate shutdown is in progress; no reconnect will follow.
    Closing,
    /// The connection broke and the probe loop is working to restore it.
    Reconnecting,
}
