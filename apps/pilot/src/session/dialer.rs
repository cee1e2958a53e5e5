use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};
use url::Url;

use super::SessionError;
use crate::credentials::{ClientCredentials, TrustVerdict};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens the underlying socket for a session.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, endpoint: &Url) -> Result<WsStream, SessionError>;
}

/// Dials `wss://` endpoints presenting the client identity on every handshake,
/// then runs the explicit trust evaluation on the server's leaf certificate.
pub struct MutualTlsDialer {
    credentials: ClientCredentials,
    connect_timeout: Duration,
}

impl MutualTlsDialer {
    pub fn new(credentials: ClientCredentials, connect_timeout: Duration) -> Self {
        Self {
            credentials,
            connect_timeout,
        }
    }
}

#[async_trait]
impl Dialer for MutualTlsDialer {
    async fn dial(&self, endpoint: &Url) -> Result<WsStream, SessionError> {
        if endpoint.scheme() != "wss" {
            return Err(SessionError::InsecureEndpoint(endpoint.to_string()));
        }
        let connector = self
            .credentials
            .connector()
            .map_err(|err| SessionError::Credentials(err.to_string()))?;

        let handshake = connect_async_tls_with_config(
            endpoint.as_str(),
            None,
            false,
            Some(Connector::NativeTls(connector)),
        );
        let (stream, _response) = match timeout(self.connect_timeout, handshake).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => return Err(classify_handshake_error(err)),
            Err(_) => return Err(SessionError::Timeout(self.connect_timeout)),
        };

        let leaf = peer_certificate_der(&stream);
        match self.credentials.trust.evaluate(leaf.as_deref()) {
            TrustVerdict::Trusted { fingerprint } => {
                info!(
                    target: "pilot::session",
                    endpoint = %endpoint,
                    fingerprint = %fingerprint,
                    pinned = self.credentials.trust.is_pinned(),
                    "server certificate trusted"
                );
                Ok(stream)
            }
            TrustVerdict::Rejected { reason } => {
                warn!(
                    target: "pilot::session",
                    endpoint = %endpoint,
                    reason = %reason,
                    "server certificate rejected"
                );
                Err(SessionError::ServerTrustInvalid(reason))
            }
        }
    }
}

fn peer_certificate_der(stream: &WsStream) -> Option<Vec<u8>> {
    match stream.get_ref() {
        MaybeTlsStream::NativeTls(tls) => tls
            .get_ref()
            .peer_certificate()
            .ok()
            .flatten()
            .and_then(|cert| cert.to_der().ok()),
        _ => None,
    }
}

// A failed TLS handshake means the platform chain evaluation (or the server's
// check of our certificate) refused the peer; it is never retried.
fn classify_handshake_error(err: tungstenite::Error) -> SessionError {
    match err {
        tungstenite::Error::Tls(tls) => {
            warn!(
                target: "pilot::session",
                error = %tls,
                "tls handshake rejected"
            );
            SessionError::ServerTrustInvalid(tls.to_string())
        }
        tungstenite::Error::Io(io) => SessionError::Transport(io.to_string()),
        other => SessionError::Handshake(other.to_string()),
    }
}
