//! Session establishment and teardown over HTTP.
//!
//! The socket itself never authenticates; it presents whatever token
//! this module obtained. Cookie sessions come from `/API/logOn.js` and
//! must be kept alive by the heartbeat; API keys are static and never
//! expire server-side.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{COOKIE, SET_COOKIE};
use thiserror::Error;
use tracing::{debug, warn};

use crate::client::ClientInner;

/// How long a deliberate log-off waits on the server before giving up.
/// The session is cleared locally regardless.
const LOG_OFF_TIMEOUT: Duration = Duration::from_secs(2);

/// Credential state for the connection.
#[derive(Default)]
pub(crate) struct SessionState {
    /// Session cookie (`token=...`) or raw API key.
    pub(crate) token: String,
    /// The token is an API key rather than a cookie session.
    pub(crate) use_key: bool,
    /// A cookie session is currently held.
    pub(crate) authenticated: bool,
}

/// Authentication failures.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Log-on was requested but the configuration has no credentials.
    #[error("no credentials configured")]
    MissingCredentials,
    /// Log-on was requested while an API key is in use.
    #[error("an API key is in use; session log-on is not available")]
    KeyInUse,
    /// A key was supplied while a session is active.
    #[error("a session is active; log off before setting an API key")]
    SessionActive,
    /// The server refused the request.
    #[error("server refused with status {0}")]
    Rejected(u16),
    /// The log-on reply carried no session cookie.
    #[error("log-on reply carried no session cookie")]
    MissingCookie,
    /// The request never reached the server.
    #[error("transport failure during authentication")]
    Transport(#[from] reqwest::Error),
}

/// Exchange the configured credentials for a session cookie. Safe to
/// call on an already-authenticated client; the new token replaces the
/// old one, which is how re-authentication after a connection break
/// works.
pub(crate) async fn log_on(inner: &Arc<ClientInner>) -> Result<(), AuthError> {
    if inner.session.lock().use_key {
        return Err(AuthError::KeyInUse);
    }
    let (Some(username), Some(password)) = (&inner.config.username, &inner.config.password) else {
        return Err(AuthError::MissingCredentials);
    };

    let url = inner.config.http_url("/API/logOn.js");
    let response = inner
        .http
        .get(&url)
        .query(&[("un", username.as_str()), ("pw", password.as_str())])
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        return Err(AuthError::Rejected(status.as_u16()));
    }

    let cookie = response
        .headers()
        .get(SET_COOKIE)
        .ok_or(AuthError::MissingCookie)?
        .to_str()
        .map_err(|_| AuthError::MissingCookie)?;
    // Keep only the name=value part, not the cookie attributes.
    let token = cookie.split(';').next().unwrap_or("").trim().to_string();
    if token.is_empty() {
        return Err(AuthError::MissingCookie);
    }
    debug!("session established");

    {
        let mut session = inner.session.lock();
        session.token = token;
        session.authenticated = true;
        session.use_key = false;
    }
    inner.ensure_heartbeat();
    Ok(())
}

/// Deliberately end the session. The connection is marked closing first
/// so its shutdown is not mistaken for a break worth reconnecting from.
pub(crate) async fn log_off(inner: &Arc<ClientInner>) -> Result<(), AuthError> {
    let (token, authenticated, use_key) = {
        let session = inner.session.lock();
        (session.token.clone(), session.authenticated, session.use_key)
    };
    if !authenticated && !use_key {
        return Ok(());
    }

    inner.begin_close();
    inner.stop_heartbeat();

    if use_key {
        *inner.session.lock() = SessionState::default();
        return Ok(());
    }

    let url = inner.config.http_url("/API/logOff.js");
    let result = inner
        .http
        .get(&url)
        .header(COOKIE, &token)
        .timeout(LOG_OFF_TIMEOUT)
        .send()
        .await;
    *inner.session.lock() = SessionState::default();

    let response = result?;
    if !response.status().is_success() {
        warn!(status = %response.status(), "server-side log-off refused");
        return Err(AuthError::Rejected(response.status().as_u16()));
    }
    Ok(())
}

/// Adopt a long-lived API key. Key clients skip the log-on exchange but
/// still run the heartbeat so socket breaks are noticed promptly.
pub(crate) fn set_key(inner: &Arc<ClientInner>, key: String) -> Result<(), AuthError> {
    {
        let mut session = inner.session.lock();
        if session.authenticated {
            return Err(AuthError::SessionActive);
        }
        session.token = key;
        session.use_key = true;
    }
    inner.ensure_heartbeat();
    Ok(())
}
