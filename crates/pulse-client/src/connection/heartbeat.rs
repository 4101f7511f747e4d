//! Session keep-alive.

use std::sync::Arc;

use pulse_core::Frame;
use reqwest::header::COOKIE;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::ClientInner;

/// Periodic keep-alive. Sends a `PING` frame when the socket is up;
/// while it is down, cookie sessions fall back to an HTTP heartbeat so
/// the session does not expire before the connection is restored. Key
/// clients have nothing to keep alive server-side and skip the
/// fallback. Exits once the client holds no credentials at all.
pub(crate) async fn run_heartbeat(inner: Arc<ClientInner>, cancel: CancellationToken) {
    let interval = inner.config.heartbeat_interval();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
        let (authenticated, use_key, token) = {
            let session = inner.session.lock();
            (session.authenticated, session.use_key, session.token.clone())
        };
        if !authenticated && !use_key {
            break;
        }

        if let Some(writer) = inner.writer() {
            if writer.send(Frame::Ping).await.is_err() {
                debug!("heartbeat ping not delivered, socket is closing");
            }
            continue;
        }
        if use_key {
            continue;
        }

        let url = inner.config.http_url("/heartbeat");
        match inner.http.get(&url).header(COOKIE, &token).send().await {
            Ok(response) if response.status().as_u16() == 401 => {
                warn!("session rejected during heartbeat");
                inner.force_log_off();
                break;
            }
            Ok(response) if !response.status().is_success() => {
                warn!(status = %response.status(), "http heartbeat refused");
            }
            Ok(_) => debug!("http heartbeat acknowledged"),
            Err(err) => warn!(error = %err, "http heartbeat unreachable"),
        }
    }
    debug!("heartbeat stopped");
}
