//! Tunnel client: the side that connects outward and performs the dials
//!
//! A [`TunnelClient`] opens the persistent WebSocket to the tunnel server
//! and serves the session: incoming Connect frames are gated by the connect
//! authorizer and dialed with the configured (or default TCP) dialer,
//! TokenConnect requests are answered from the token source. [`run`] keeps
//! the session alive with exponential reconnect backoff;
//! [`run_once`] performs a single connect-and-serve cycle.
//!
//! [`run`]: TunnelClient::run
//! [`run_once`]: TunnelClient::run_once

use std::sync::Arc;

use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};

use crate::config::ClientConfig;
use crate::dial::Dialer;
use crate::error::{Result, TunnelError};
use crate::session::{ConnectAuthorizer, Session, SessionParams};
use crate::token::TokenSource;

/// Tunnel client connecting outward to a tunnel server
pub struct TunnelClient {
    config: ClientConfig,
    connect_auth: Option<ConnectAuthorizer>,
    dialer: Option<Dialer>,
    token_source: Option<TokenSource>,
}

impl TunnelClient {
    /// Create a client with the given configuration
    ///
    /// Without a connect authorizer every Connect request is denied; install
    /// one with [`TunnelClient::with_connect_authorizer`].
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            connect_auth: None,
            dialer: None,
            token_source: None,
        }
    }

    /// Set the gate for incoming Connect requests (builder pattern)
    #[must_use]
    pub fn with_connect_authorizer(mut self, auth: ConnectAuthorizer) -> Self {
        self.connect_auth = Some(auth);
        self
    }

    /// Replace the default TCP dialer (builder pattern)
    #[must_use]
    pub fn with_dialer(mut self, dialer: Dialer) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Set the token source answering TokenConnect requests (builder
    /// pattern); falls back to the process-wide registration
    #[must_use]
    pub fn with_token_source(mut self, source: TokenSource) -> Self {
        self.token_source = Some(source);
        self
    }

    /// Connect and serve one session to completion
    ///
    /// # Errors
    ///
    /// Returns the configuration, connection, or serve error that ended the
    /// session.
    pub async fn run_once(&self) -> Result<()> {
        self.config.validate().map_err(TunnelError::config)?;

        let request = self.build_request()?;
        let (ws, _) = connect_async(request)
            .await
            .map_err(TunnelError::transport)?;

        tracing::info!(url = %self.config.server_url, "connected to tunnel server");

        let session = Session::new(
            ws,
            SessionParams {
                is_client: true,
                connect_auth: self.connect_auth.clone(),
                dialer: self.dialer.clone(),
                token_source: self.token_source.clone(),
                ping_interval: self.config.ping_interval,
                ..SessionParams::default()
            },
        );
        let result = session.serve().await;
        session.close().await;
        result
    }

    /// Connect and serve, reconnecting with exponential backoff on failure
    ///
    /// # Errors
    ///
    /// Returns only when the configuration is invalid or a shutdown is
    /// requested; transport failures are retried.
    pub async fn run(&self) -> Result<()> {
        self.config.validate().map_err(TunnelError::config)?;

        let mut interval = self.config.reconnect_interval;
        loop {
            match self.run_once().await {
                Ok(()) => {
                    tracing::info!("tunnel session closed, reconnecting");
                    interval = self.config.reconnect_interval;
                }
                Err(TunnelError::Shutdown) => return Ok(()),
                Err(e @ TunnelError::Config { .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, "tunnel session failed, will reconnect");
                }
            }

            tokio::time::sleep(interval).await;
            interval = std::cmp::min(
                interval.saturating_mul(2),
                self.config.max_reconnect_interval,
            );
        }
    }

    fn build_request(&self) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
        let mut request = self
            .config
            .server_url
            .as_str()
            .into_client_request()
            .map_err(|e| TunnelError::config(format!("invalid server url: {e}")))?;
        for (name, value) in &self.config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TunnelError::config(format!("invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TunnelError::config(format!("invalid header value: {e}")))?;
            request.headers_mut().insert(name, value);
        }
        Ok(request)
    }
}

/// Convenience: allow every Connect request
#[must_use]
pub fn allow_all_connections() -> ConnectAuthorizer {
    Arc::new(|_, _| true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request_carries_headers() {
        let config = ClientConfig::new("ws://localhost:9000/connect")
            .with_header("x-tunnel-id", "cluster-a")
            .with_header("Authorization", "Bearer abc");
        let client = TunnelClient::new(config);

        let request = client.build_request().unwrap();
        assert_eq!(
            request.headers().get("x-tunnel-id").unwrap(),
            &HeaderValue::from_static("cluster-a")
        );
        assert_eq!(
            request.headers().get("Authorization").unwrap(),
            &HeaderValue::from_static("Bearer abc")
        );
    }

    #[test]
    fn test_build_request_rejects_bad_url() {
        let client = TunnelClient::new(ClientConfig::new("not a url"));
        assert!(client.build_request().is_err());
    }

    #[test]
    fn test_build_request_rejects_bad_header() {
        let config = ClientConfig::new("ws://localhost:9000").with_header("bad header", "v");
        let client = TunnelClient::new(config);
        assert!(client.build_request().is_err());
    }

    #[tokio::test]
    async fn test_run_once_rejects_invalid_config() {
        let client = TunnelClient::new(ClientConfig::new(""));
        let err = client.run_once().await.unwrap_err();
        assert!(matches!(err, TunnelError::Config { .. }));
    }

    #[test]
    fn test_allow_all_connections() {
        let auth = allow_all_connections();
        assert!(auth("tcp", "127.0.0.1:80"));
    }
}
