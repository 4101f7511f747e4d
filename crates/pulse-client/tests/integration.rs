//! End-to-end scenarios over an in-memory transport: a live collection
//! loading under concurrent stream traffic, the failure status table,
//! and recovery from a dropped socket.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use pulse_client::connection::socket::{ConnectError, Connector, Socket};
use pulse_client::{
    Client, ClientConfig, ClientEvent, CollectionOptions, FatalError, Frame, RequestContext,
    ResourceConfig, STATUS_TIMEOUT,
};
use serde_json::json;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

struct ServerEnd {
    from_client: mpsc::Receiver<Frame>,
    to_client: mpsc::Sender<Frame>,
}

impl ServerEnd {
    async fn recv(&mut self) -> Frame {
        tokio::time::timeout(Duration::from_secs(10), self.from_client.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("client hung up")
    }

    async fn send(&self, frame: Frame) {
        self.to_client.send(frame).await.expect("client hung up");
    }
}

struct MockConnector {
    sessions: mpsc::UnboundedSender<ServerEnd>,
    fail_next: AtomicUsize,
}

impl MockConnector {
    fn pair() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                sessions: tx,
                fail_next: AtomicUsize::new(0),
            }),
            rx,
        )
    }

    /// Make the next `count` connect calls fail.
    fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _url: &str, _token: &str) -> Result<Socket, ConnectError> {
        let scripted_failure = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure {
            return Err(ConnectError::Handshake("scripted failure".into()));
        }
        let (c2s_tx, c2s_rx) = mpsc::channel(64);
        let (s2c_tx, s2c_rx) = mpsc::channel(64);
        let _ = self.sessions.send(ServerEnd {
            from_client: c2s_rx,
            to_client: s2c_tx,
        });
        Ok(Socket::new(c2s_tx, s2c_rx))
    }
}

fn offline_client(mutate: impl FnOnce(&mut ClientConfig)) -> (Client, Arc<MockConnector>, mpsc::UnboundedReceiver<ServerEnd>) {
    let mut config = ClientConfig::new("dvr.test.invalid");
    config.use_tls = false;
    mutate(&mut config);
    let (connector, sessions) = MockConnector::pair();
    let transport: Arc<dyn Connector> = connector.clone();
    let client = Client::with_connector(config, transport);
    (client, connector, sessions)
}

async fn wait_for<T>(
    mut poll: impl FnMut() -> Option<T>,
    what: &str,
) -> T {
    for _ in 0..400 {
        if let Some(value) = poll() {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn collection_load_keeps_records_streamed_during_the_read() {
    init_tracing();
    let (client, _connector, mut sessions) = offline_client(|_| {});
    client.set_key("key-9000").unwrap();

    let manager = client.maintained_list(
        ResourceConfig {
            id_field: "locationID".into(),
            subscribe_topics: vec!["SRV/sites".into()],
            create_api: None,
            read_api: "/API/setup/getSites".into(),
            read_api_array_field: "sites".into(),
            update_api: None,
            delete_api: None,
        },
        CollectionOptions::default(),
    );

    let mut server = sessions.recv().await.expect("no connection opened");
    assert_matches!(server.recv().await, Frame::Sub { topic } if topic == "SRV/sites");
    let Frame::Req { id, resource, .. } = server.recv().await else {
        panic!("expected the bulk read");
    };
    assert_eq!(resource, "/API/setup/getSites");

    // A newer version of site 5 streams in before the read answers.
    server
        .send(Frame::Pub {
            topic: "SRV/sites".into(),
            data: json!({"locationID": 5, "crud": 1, "name": "A"}),
        })
        .await;
    server
        .send(Frame::Res {
            id,
            code: 200,
            data: Some(json!({"sites": [
                {"locationID": 5, "name": "OLD", "online": true},
                {"locationID": 6, "name": "B"},
            ]})),
            additional: None,
        })
        .await;

    let records = wait_for(
        || {
            let records = manager.records();
            (records.len() == 2).then_some(records)
        },
        "the reconciled collection",
    )
    .await;
    let site5 = records
        .iter()
        .find(|r| r["locationID"] == json!(5))
        .expect("site 5 present");
    assert_eq!(site5["name"], "A", "streamed record must win");
    assert_eq!(site5["online"], true, "snapshot-only fields must survive");
    let site6 = records
        .iter()
        .find(|r| r["locationID"] == json!(6))
        .expect("site 6 present");
    assert_eq!(site6["name"], "B");
}

#[tokio::test]
async fn failure_status_table_routes_to_handler_or_fatal_event() {
    init_tracing();
    let (client, _connector, mut sessions) = offline_client(|_| {});
    client.set_key("key-9000").unwrap();
    let mut events = client.subscribe_events();

    // No failure handler: a 404 is a client bug and must surface as a
    // fatal event naming the resource.
    client.request(RequestContext::new("/API/getUserz"));
    let mut server = sessions.recv().await.expect("no connection opened");
    assert_matches!(events.recv().await, Ok(ClientEvent::ConnectionRestored));
    let Frame::Req { id, .. } = server.recv().await else {
        panic!("expected REQ");
    };
    server
        .send(Frame::Res {
            id,
            code: 404,
            data: None,
            additional: None,
        })
        .await;
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_matches!(
        event,
        ClientEvent::Fatal(FatalError::NotFound { resource }) if resource == "/API/getUserz"
    );

    // With a handler, the same status is the handler's problem.
    let (fail_tx, mut fail_rx) = mpsc::unbounded_channel();
    client.request(RequestContext::new("/API/getUserz").on_failure(
        move |status, additional| {
            fail_tx.send((status, additional)).unwrap();
        },
    ));
    let Frame::Req { id, .. } = server.recv().await else {
        panic!("expected REQ");
    };
    server
        .send(Frame::Res {
            id,
            code: 404,
            data: None,
            additional: Some("no such route".into()),
        })
        .await;
    assert_eq!(
        fail_rx.recv().await.unwrap(),
        (404, Some("no such route".into()))
    );
    assert!(events.try_recv().is_err(), "handled failure must not escalate");
}

#[tokio::test]
async fn dropped_socket_times_out_requests_and_reconnects() {
    init_tracing();
    let ping = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&ping)
        .await;

    let domain = ping.uri().trim_start_matches("http://").to_string();
    let (client, connector, mut sessions) = offline_client(|config| {
        config.domain = domain;
        config.request_timeout_ms = 200;
    });
    client.set_key("key-9000").unwrap();
    let mut events = client.subscribe_events();

    let (fail_tx, mut fail_rx) = mpsc::unbounded_channel();
    for name in ["/API/a", "/API/b", "/API/c"] {
        let fail_tx = fail_tx.clone();
        client.request(RequestContext::new(name).on_failure(move |status, _| {
            fail_tx.send(status).unwrap();
        }));
    }

    let mut server = sessions.recv().await.expect("no connection opened");
    assert_matches!(events.recv().await, Ok(ClientEvent::ConnectionRestored));
    for _ in 0..3 {
        assert_matches!(server.recv().await, Frame::Req { .. });
    }

    // Kill the socket with all three replies outstanding; make the
    // immediate reconnect fail so recovery goes through the probe loop.
    connector.fail_next(1);
    drop(server);

    let mut statuses = Vec::new();
    for _ in 0..3 {
        let status = tokio::time::timeout(Duration::from_secs(10), fail_rx.recv())
            .await
            .expect("request failure never reported")
            .unwrap();
        statuses.push(status);
    }
    assert_eq!(statuses, vec![STATUS_TIMEOUT; 3]);

    // The probe loop pings the server over HTTP, then reconnects.
    let restored = async {
        loop {
            match events.recv().await {
                Ok(ClientEvent::ConnectionRestored) => break,
                Ok(_) => {}
                Err(err) => panic!("event stream broke: {err}"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(15), restored)
        .await
        .expect("connection never restored");
    assert!(sessions.recv().await.is_some(), "no replacement socket");
}
