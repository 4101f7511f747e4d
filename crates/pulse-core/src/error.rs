//! Failure taxonomy shared across the runtime.

use thiserror::Error;

/// Status marker handed to failure callbacks when a request timed out or
/// the transport broke underneath it.
pub const STATUS_TIMEOUT: i32 = 0;

/// An unrecoverable client-side condition.
///
/// These are the bug-class failures: a malformed request, a mis-spelt
/// route, or a server fault the client cannot recover from. They are only
/// raised for requests marked critical, and each carries the resource name
/// so the diagnostic points at the offending call site.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FatalError {
    /// 400: the request itself was malformed.
    #[error("400 - bad request ({resource})")]
    BadRequest {
        /// Resource the request was for.
        resource: String,
    },

    /// 403: the client attempted something it is not permitted to do.
    #[error("403 - forbidden ({resource})")]
    Forbidden {
        /// Resource the request was for.
        resource: String,
    },

    /// 404: no such route; almost always a mis-spelt resource name.
    #[error("404 - not found ({resource})")]
    NotFound {
        /// Resource the request was for.
        resource: String,
    },

    /// 405: the route exists but not for this method.
    #[error("405 - method not allowed ({resource})")]
    MethodNotAllowed {
        /// Resource the request was for.
        resource: String,
    },

    /// 500: the backend faulted while handling the request.
    #[error("500 - internal server error ({resource})")]
    ServerError {
        /// Resource the request was for.
        resource: String,
    },

    /// The request timed out or the connection broke, and no failure
    /// handler was registered to absorb it.
    #[error("transport failure ({resource})")]
    Transport {
        /// Resource the request was for.
        resource: String,
    },

    /// A status code outside the known table.
    #[error("unrecognised error condition {status} ({resource})")]
    Unrecognized {
        /// The status code as received.
        status: i32,
        /// Resource the request was for.
        resource: String,
    },
}

impl FatalError {
    /// The resource name carried in the diagnostic.
    #[must_use]
    pub fn resource(&self) -> &str {
        match self {
            Self::BadRequest { resource }
            | Self::Forbidden { resource }
            | Self::NotFound { resource }
            | Self::MethodNotAllowed { resource }
            | Self::ServerError { resource }
            | Self::Transport { resource }
            | Self::Unrecognized { resource, .. } => resource,
        }
    }
}
