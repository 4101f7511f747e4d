//! In-memory transport and client builders shared by the unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pulse_core::Frame;
use tokio::sync::mpsc;
use wiremock::MockServer;

use crate::client::Client;
use crate::config::ClientConfig;
use crate::connection::socket::{ConnectError, Connector, Socket};

const DEPTH: usize = 64;

/// The server half of an in-memory connection.
pub(crate) struct ServerEnd {
    pub(crate) from_client: mpsc::Receiver<Frame>,
    pub(crate) to_client: mpsc::Sender<Frame>,
}

impl ServerEnd {
    pub(crate) async fn send(&self, frame: Frame) {
        self.to_client.send(frame).await.expect("client hung up");
    }
}

/// Next frame from the client, or `None` once it disconnected. Bounded
/// by a generous timeout so a broken test fails instead of hanging.
pub(crate) async fn recv_frame(server: &mut ServerEnd) -> Option<Frame> {
    tokio::time::timeout(Duration::from_secs(5), server.from_client.recv())
        .await
        .expect("timed out waiting for a frame")
}

/// A [`Connector`] handing out channel-backed sockets, reporting each
/// server end on a side channel. Connect attempts can be scripted to
/// fail.
pub(crate) struct ChannelConnector {
    sessions: mpsc::UnboundedSender<ServerEnd>,
    fail_next: AtomicUsize,
    pub(crate) tokens: Mutex<Vec<String>>,
}

impl ChannelConnector {
    pub(crate) fn pair() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                sessions: tx,
                fail_next: AtomicUsize::new(0),
                tokens: Mutex::new(Vec::new()),
            }),
            rx,
        )
    }

    /// Make the next `count` connect calls fail.
    pub(crate) fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self, _url: &str, token: &str) -> Result<Socket, ConnectError> {
        self.tokens.lock().push(token.to_string());
        let scripted_failure = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure {
            return Err(ConnectError::Handshake("scripted failure".into()));
        }
        let (c2s_tx, c2s_rx) = mpsc::channel(DEPTH);
        let (s2c_tx, s2c_rx) = mpsc::channel(DEPTH);
        let _ = self.sessions.send(ServerEnd {
            from_client: c2s_rx,
            to_client: s2c_tx,
        });
        Ok(Socket {
            outbound: c2s_tx,
            inbound: s2c_rx,
        })
    }
}

/// A client over a [`ChannelConnector`], with `mutate` applied to the
/// configuration before the client is built.
pub(crate) fn test_client(
    mutate: impl FnOnce(&mut ClientConfig),
) -> (Client, Arc<ChannelConnector>, mpsc::UnboundedReceiver<ServerEnd>) {
    let mut config = ClientConfig::new("dvr.test.invalid");
    config.use_tls = false;
    mutate(&mut config);
    let (connector, sessions) = ChannelConnector::pair();
    let transport: Arc<dyn Connector> = connector.clone();
    let client = Client::with_connector(config, transport);
    (client, connector, sessions)
}

/// A client whose HTTP side points at a wiremock server.
pub(crate) fn test_client_for(
    server: &MockServer,
    credentials: Option<(&str, &str)>,
) -> (Client, Arc<ChannelConnector>, mpsc::UnboundedReceiver<ServerEnd>) {
    test_client_for_with(server, credentials, |_| {})
}

/// Like [`test_client_for`], with a configuration hook.
pub(crate) fn test_client_for_with(
    server: &MockServer,
    credentials: Option<(&str, &str)>,
    mutate: impl FnOnce(&mut ClientConfig),
) -> (Client, Arc<ChannelConnector>, mpsc::UnboundedReceiver<ServerEnd>) {
    let domain = server.uri().trim_start_matches("http://").to_string();
    test_client(move |config| {
        config.domain = domain;
        if let Some((username, password)) = credentials {
            config.username = Some(username.to_string());
            config.password = Some(password.to_string());
        }
        mutate(config);
    })
}
