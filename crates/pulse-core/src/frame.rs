//! Wire-format frames exchanged over the persistent socket.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A JSON message on the persistent connection, tagged by `"type"`.
///
/// `Req`, `Sub` and `Unsub` are client-to-server; `Res` and `Pub` are
/// server-to-client. `Ping`/`Pong` are the socket heartbeat. Anything the
/// transport cannot parse into one of these is dropped and reported as a
/// client-wide error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Outbound request for a resource.
    #[serde(rename = "REQ")]
    Req {
        /// Correlation identifier, unique per client instance.
        id: u64,
        /// Logical resource (API path) being requested.
        resource: String,
        /// Request parameters.
        params: Value,
    },

    /// Inbound reply to an earlier request.
    #[serde(rename = "RES")]
    Res {
        /// Correlation identifier of the originating request.
        id: u64,
        /// HTTP-style status code.
        code: u16,
        /// Response payload (present on success).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        /// Supplementary diagnostic text (present on failure).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        additional: Option<String>,
    },

    /// Outbound subscription to a topic.
    #[serde(rename = "SUB")]
    Sub {
        /// Topic name.
        topic: String,
    },

    /// Outbound unsubscription from a topic.
    #[serde(rename = "UNSUB")]
    Unsub {
        /// Topic name.
        topic: String,
    },

    /// Inbound publication on a subscribed topic.
    #[serde(rename = "PUB")]
    Pub {
        /// Topic the event was published to.
        topic: String,
        /// Published record.
        data: Value,
    },

    /// Heartbeat probe.
    #[serde(rename = "PING")]
    Ping,

    /// Heartbeat answer.
    #[serde(rename = "PONG")]
    Pong,
}
