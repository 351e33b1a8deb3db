//! One NNTP session
//!
//! ```text
//! INIT --connect--> GREETING --auth--> IDLE --dispatch--> FETCHING
//!                      |                 ^                   |
//!                      +--fail--> DEAD   +-------ok----------+
//!                                  ^                         |
//!                                  +----------fail-----------+
//! ```
//!
//! A connection is owned by exactly one task at a time: the server pool while
//! idle, a fetch task while fetching. Only transport failures kill it.

use super::{auth_error, bracketed, fetch_error};
use crate::config::ServerConfig;
use crate::error::FetchError;
use crate::speed_limiter::SpeedLimiter;
use crate::types::ServerId;
use nntp_rs::NntpClient;
use std::sync::Arc;
use std::time::Duration;

/// Session state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected yet
    Init,
    /// Socket open, greeting and authentication in progress
    Greeting,
    /// Ready for a command
    Idle,
    /// Command outstanding
    Fetching,
    /// Transport failed; must be reopened
    Dead,
}

/// Session to one news server
pub struct Connection {
    server: ServerId,
    state: ConnectionState,
    client: Option<NntpClient>,
    timeout: Duration,
    limiter: Option<SpeedLimiter>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("server", &self.server)
            .field("state", &self.state)
            .finish()
    }
}

impl Connection {
    /// New, unconnected session for `server`
    pub fn new(server: ServerId, limiter: Option<SpeedLimiter>) -> Self {
        Self {
            server,
            state: ConnectionState::Init,
            client: None,
            timeout: Duration::from_secs(60),
            limiter,
        }
    }

    /// Server this session belongs to
    pub fn server(&self) -> &ServerId {
        &self.server
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Needs `connect` before use
    pub fn needs_connect(&self) -> bool {
        matches!(self.state, ConnectionState::Init | ConnectionState::Dead)
    }

    /// Drop the client and mark the session dead
    pub fn mark_dead(&mut self) {
        self.client = None;
        self.state = ConnectionState::Dead;
    }

    /// Open the session and authenticate when credentials are configured
    pub async fn connect(&mut self, config: &ServerConfig) -> Result<(), FetchError> {
        self.timeout = config.timeout;
        self.state = ConnectionState::Greeting;
        match self.open(config).await {
            Ok(client) => {
                self.client = Some(client);
                self.state = ConnectionState::Idle;
                tracing::debug!(server = %self.server, "connection ready");
                Ok(())
            }
            Err(e) => {
                self.mark_dead();
                Err(e)
            }
        }
    }

    async fn open(&self, config: &ServerConfig) -> Result<NntpClient, FetchError> {
        let settings = Arc::new(nntp_rs::ServerConfig::from(config));
        let mut client = tokio::time::timeout(self.timeout, NntpClient::connect(settings))
            .await
            .map_err(|_| FetchError::TransportFailure("connect timed out".into()))?
            .map_err(|e| FetchError::TransportFailure(format!("connect failed: {e}")))?;

        if config.username.is_some() {
            tokio::time::timeout(self.timeout, client.authenticate())
                .await
                .map_err(|_| FetchError::TransportFailure("authentication timed out".into()))?
                .map_err(|e| auth_error(&e))?;
        }
        Ok(client)
    }

    /// Retrieve an article body
    pub async fn fetch_body(&mut self, message_id: &str) -> Result<Vec<u8>, FetchError> {
        let id = bracketed(message_id);
        let timeout = self.timeout;
        let client = self.begin()?;
        let result = match tokio::time::timeout(
            timeout,
            client.fetch_articles_pipelined(&[id.as_str()], 1),
        )
        .await
        {
            Err(_) => Err(FetchError::TransportFailure("fetch timed out".into())),
            Ok(Err(e)) => Err(fetch_error(&e)),
            Ok(Ok(responses)) => responses
                .into_iter()
                .next()
                .map(|response| response.data)
                .ok_or_else(|| FetchError::TransportFailure(format!("no response for {id}"))),
        };
        self.finish(result).await
    }

    /// Confirm the article is served here.
    ///
    /// The client offers no `STAT`, so the article is retrieved and its
    /// header block returned for the caller to inspect.
    pub async fn check(&mut self, message_id: &str) -> Result<Vec<u8>, FetchError> {
        let id = bracketed(message_id);
        let timeout = self.timeout;
        let client = self.begin()?;
        let result = match tokio::time::timeout(timeout, client.fetch_article_binary(&id)).await {
            Err(_) => Err(FetchError::TransportFailure("check timed out".into())),
            Ok(Err(e)) => Err(fetch_error(&e)),
            Ok(Ok(response)) => Ok(response.data),
        };
        self.finish(result).await
    }

    /// Close the session
    pub fn close(&mut self) {
        if self.client.take().is_some() {
            tracing::debug!(server = %self.server, "connection closed");
        }
        self.state = ConnectionState::Init;
    }

    fn begin(&mut self) -> Result<&mut NntpClient, FetchError> {
        if self.state != ConnectionState::Idle {
            return Err(FetchError::TransportFailure(format!(
                "connection not ready ({:?})",
                self.state
            )));
        }
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| FetchError::TransportFailure("not connected".into()))?;
        self.state = ConnectionState::Fetching;
        Ok(client)
    }

    async fn finish(&mut self, result: Result<Vec<u8>, FetchError>) -> Result<Vec<u8>, FetchError> {
        match &result {
            Ok(data) => {
                self.state = ConnectionState::Idle;
                if let Some(limiter) = &self.limiter {
                    limiter.acquire(data.len() as u64).await;
                }
            }
            Err(FetchError::TransportFailure(reason)) => {
                tracing::debug!(server = %self.server, reason = %reason, "connection died");
                self.mark_dead();
            }
            Err(_) => self.state = ConnectionState::Idle,
        }
        result
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::test_helpers::{MockServer, Script, file_bytes, posted_file};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn server(mock: &MockServer) -> ServerConfig {
        let mut cfg = mock.config("s");
        cfg.timeout = Duration::from_secs(5);
        cfg
    }

    #[tokio::test]
    async fn body_comes_back_and_session_stays_idle() {
        let mock = MockServer::start().await;
        let parts = posted_file("a.bin", 300, 300);
        let mut conn = Connection::new("s".into(), None);
        conn.connect(&server(&mock)).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Idle);

        let body = conn.fetch_body(&parts[0].0).await.unwrap();
        let decoded = crate::decoder::decode(&body, Default::default()).unwrap();
        assert_eq!(decoded.data, file_bytes("a.bin", 300));
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert_eq!(mock.fetches_for(&parts[0].0), 1);
    }

    #[tokio::test]
    async fn missing_and_removed_articles_keep_the_session() {
        let mock = MockServer::start().await;
        let parts = posted_file("b.bin", 600, 300);
        mock.script(&parts[0].0, Script::Missing);
        mock.script(&parts[1].0, Script::Removed);
        let mut conn = Connection::new("s".into(), None);
        conn.connect(&server(&mock)).await.unwrap();

        assert_eq!(
            conn.fetch_body(&parts[0].0).await,
            Err(FetchError::NotFoundHere)
        );
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert!(matches!(
            conn.fetch_body(&parts[1].0).await,
            Err(FetchError::Removed(_))
        ));
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let mock = MockServer::with_credentials("reader", "sesame").await;
        let mut cfg = server(&mock);
        cfg.password = Some("wrong".into());
        let mut conn = Connection::new("s".into(), None);
        assert!(matches!(
            conn.connect(&cfg).await,
            Err(FetchError::AuthRejected(_))
        ));
        assert_eq!(conn.state(), ConnectionState::Dead);

        let mut conn = Connection::new("s".into(), None);
        conn.connect(&server(&mock)).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn refused_greeting_is_transport_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"400 too many connections\r\n").await.unwrap();
        });
        let mut cfg = ServerConfig::new("127.0.0.1", port);
        cfg.timeout = Duration::from_secs(5);
        let mut conn = Connection::new("s".into(), None);
        assert!(matches!(
            conn.connect(&cfg).await,
            Err(FetchError::TransportFailure(_))
        ));
        assert!(conn.needs_connect());
    }

    #[tokio::test]
    async fn dropped_socket_kills_the_session() {
        let mock = MockServer::start().await;
        let parts = posted_file("c.bin", 300, 300);
        mock.script(&parts[0].0, Script::Drop);
        let mut conn = Connection::new("s".into(), None);
        conn.connect(&server(&mock)).await.unwrap();
        assert!(matches!(
            conn.fetch_body(&parts[0].0).await,
            Err(FetchError::TransportFailure(_))
        ));
        assert_eq!(conn.state(), ConnectionState::Dead);
        assert!(conn.needs_connect());
    }

    #[tokio::test]
    async fn check_returns_the_served_article() {
        let mock = MockServer::start().await;
        let parts = posted_file("d.bin", 300, 300);
        let mut conn = Connection::new("s".into(), None);
        conn.connect(&server(&mock)).await.unwrap();
        let served = conn.check(&parts[0].0).await.unwrap();
        assert!(!served.is_empty());
        assert_eq!(conn.state(), ConnectionState::Idle);

        conn.close();
        assert_eq!(conn.state(), ConnectionState::Init);
        assert!(conn.needs_connect());
    }

    #[tokio::test]
    async fn fetch_before_connect_is_refused() {
        let mut conn = Connection::new("s".into(), None);
        assert!(matches!(
            conn.fetch_body("a@b").await,
            Err(FetchError::TransportFailure(_))
        ));
    }
}
