//! The WebSocket transport behind a [`Connector`] seam.
//!
//! The rest of the runtime only ever sees a [`Socket`]: a frame writer
//! and a frame reader. [`WsConnector`] is the production implementation;
//! tests substitute their own to drive both ends in memory.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use pulse_core::Frame;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tracing::{debug, warn};

use crate::events::ClientEvent;

/// Frame capacity of each direction's channel.
const CHANNEL_DEPTH: usize = 64;

/// A connect attempt that never got as far as a live socket.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The connect request could not be constructed.
    #[error("bad connect request: {0}")]
    Request(String),
    /// The WebSocket handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// A live connection, as a pair of frame channels. Dropping or closing
/// the outbound sender closes the socket; the inbound receiver yielding
/// `None` means the socket is gone.
pub struct Socket {
    pub(crate) outbound: mpsc::Sender<Frame>,
    pub(crate) inbound: mpsc::Receiver<Frame>,
}

impl Socket {
    /// Assemble a socket from raw frame channels. This is how custom
    /// [`Connector`] implementations hand connections back.
    #[must_use]
    pub fn new(outbound: mpsc::Sender<Frame>, inbound: mpsc::Receiver<Frame>) -> Self {
        Self { outbound, inbound }
    }
}

/// How the connection manager obtains a live socket.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a connection to `url`, authenticating with `token` (a
    /// session cookie or an API key; empty for neither).
    async fn connect(&self, url: &str, token: &str) -> Result<Socket, ConnectError>;
}

/// Production [`Connector`] over `tokio-tungstenite`.
pub struct WsConnector {
    events: broadcast::Sender<ClientEvent>,
}

impl WsConnector {
    pub(crate) fn new(events: broadcast::Sender<ClientEvent>) -> Self {
        Self { events }
    }
}

/// Session cookies ride in a `Cookie` header; API keys go in the query
/// string so intermediaries that strip unknown headers cannot lose them.
fn build_request(url: &str, token: &str) -> Result<Request, ConnectError> {
    let token = token.trim();
    if token.starts_with("token") {
        let mut request = url
            .into_client_request()
            .map_err(|err| ConnectError::Request(err.to_string()))?;
        let value = token
            .parse()
            .map_err(|_| ConnectError::Request("session token is not a valid header value".into()))?;
        request.headers_mut().insert(COOKIE, value);
        Ok(request)
    } else if token.is_empty() {
        url.into_client_request()
            .map_err(|err| ConnectError::Request(err.to_string()))
    } else {
        let key = utf8_percent_encode(token, NON_ALPHANUMERIC);
        format!("{url}?api_key={key}")
            .into_client_request()
            .map_err(|err| ConnectError::Request(err.to_string()))
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str, token: &str) -> Result<Socket, ConnectError> {
        let request = build_request(url, token)?;
        let (stream, _response) = connect_async(request)
            .await
            .map_err(|err| ConnectError::Handshake(err.to_string()))?;
        debug!(url, "socket established");

        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(CHANNEL_DEPTH);
        let (in_tx, in_rx) = mpsc::channel::<Frame>(CHANNEL_DEPTH);
        let events = self.events.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = out_rx.recv() => match frame {
                        Some(frame) => {
                            let Ok(text) = serde_json::to_string(&frame) else {
                                warn!("unserializable outbound frame dropped");
                                continue;
                            };
                            if sink.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    },
                    message = source.next() => match message {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<Frame>(text.as_str()) {
                                Ok(frame) => {
                                    if in_tx.send(frame).await.is_err() {
                                        break;
                                    }
                                }
                                Err(err) => {
                                    warn!(error = %err, "dropping unparseable server message");
                                    let _ = events.send(ClientEvent::Error(
                                        "unable to understand message from server".into(),
                                    ));
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(error = %err, "socket read failed");
                            break;
                        }
                    },
                }
            }
            debug!("socket pump stopped");
        });

        Ok(Socket {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_token_rides_in_cookie_header() {
        let request = build_request("wss://dvr.example.com/API/primary", "token=abc123").unwrap();
        assert_eq!(
            request.headers().get(COOKIE).unwrap().to_str().unwrap(),
            "token=abc123"
        );
        assert_eq!(request.uri().query(), None);
    }

    #[test]
    fn api_key_rides_in_query_string_encoded() {
        let request = build_request("wss://dvr.example.com/API/primary", "k&y 9").unwrap();
        assert_eq!(request.headers().get(COOKIE), None);
        assert_eq!(request.uri().query(), Some("api_key=k%26y%209"));
    }

    #[test]
    fn empty_token_adds_nothing() {
        let request = build_request("wss://dvr.example.com/API/primary", "").unwrap();
        assert_eq!(request.headers().get(COOKIE), None);
        assert_eq!(request.uri().query(), None);
    }

    #[test]
    fn whitespace_around_token_is_trimmed() {
        let request = build_request("wss://dvr.example.com/API/primary", "  token=abc  ").unwrap();
        assert_eq!(
            request.headers().get(COOKIE).unwrap().to_str().unwrap(),
            "token=abc"
        );
    }

    #[test]
    fn malformed_url_is_a_request_error() {
        let err = build_request("not a url", "").unwrap_err();
        assert!(matches!(err, ConnectError::Request(_)));
    }
}
