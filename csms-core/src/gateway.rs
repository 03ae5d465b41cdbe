//! Connection gateway
//!
//! Accepts TCP connections, upgrades them to WebSocket and negotiates the
//! OCPP subprotocol. A connection that offers no subprotocol, or none the
//! server supports, completes the handshake without one and is then closed;
//! it never becomes a session. Everything else is handed to
//! [`CentralSystem::attach`] under the identity taken from the request path.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderMap, HeaderValue};
use tracing::{debug, error, info, warn};

use crate::central::CentralSystem;
use crate::error::GatewayError;
use crate::session::SessionHandle;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Subprotocols offered by the client, across all header values
pub fn offered_subprotocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// Pick the first server-preferred subprotocol the client offered
pub fn negotiate(offered: &[String], supported: &[String]) -> Result<String, GatewayError> {
    if offered.is_empty() {
        return Err(GatewayError::NoSubprotocol);
    }

    supported
        .iter()
        .find(|protocol| offered.contains(protocol))
        .cloned()
        .ok_or_else(|| GatewayError::SubprotocolMismatch {
            offered: offered.to_vec(),
            supported: supported.to_vec(),
        })
}

/// Charge point identity from the request path
pub fn identity_from_path(path: &str) -> &str {
    path.trim_matches('/')
}

/// WebSocket listener for charge point connections
pub struct Gateway {
    listener: TcpListener,
    central: CentralSystem,
}

impl Gateway {
    /// Bind to the configured listen address
    pub async fn bind(central: CentralSystem) -> Result<Self, GatewayError> {
        let addr = central.config().listen_addr.clone();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| GatewayError::Bind { addr, source })?;

        Ok(Self { listener, central })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, GatewayError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn central(&self) -> &CentralSystem {
        &self.central
    }

    /// Accept connections until `shutdown` resolves, then close all sessions
    ///
    /// Returns once every session and in-flight handshake has finished or
    /// been aborted after the configured grace period.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), GatewayError>
    where
        F: Future<Output = ()>,
    {
        let Gateway { listener, central } = self;
        info!(
            "Listening on {} (subprotocols: {:?})",
            listener.local_addr()?,
            central.config().subprotocols
        );

        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }

                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };

                    while connections.try_join_next().is_some() {}

                    let central = central.clone();
                    connections.spawn(async move {
                        match handle_connection(central, stream, peer).await {
                            Ok(_) => {}
                            Err(GatewayError::ShuttingDown) => {
                                debug!("Connection from {} arrived during shutdown", peer)
                            }
                            Err(e) => warn!("Connection from {} failed: {}", peer, e),
                        }
                    });
                }
            }
        }

        // sessions first, so handshakes finishing now are refused by attach
        let grace = central.config().shutdown_grace;
        central.shutdown(grace).await;

        let drained = tokio::time::timeout(grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} handshake(s) still pending after {:?}, aborting",
                connections.len(),
                grace
            );
            connections.shutdown().await;
        }

        info!("Gateway stopped");
        Ok(())
    }
}

/// Handshake one connection and attach it if negotiation succeeds
async fn handle_connection(
    central: CentralSystem,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<Option<SessionHandle>, GatewayError> {
    debug!("TCP connection from {}", peer);

    let supported = central.config().subprotocols.clone();
    let mut path = String::new();
    let mut negotiated = Err(GatewayError::NoSubprotocol);

    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        path = request.uri().path().to_string();
        negotiated = negotiate(&offered_subprotocols(request.headers()), &supported);

        if let Ok(protocol) = &negotiated {
            match HeaderValue::from_str(protocol) {
                Ok(value) => {
                    response
                        .headers_mut()
                        .insert(header::SEC_WEBSOCKET_PROTOCOL, value);
                }
                Err(e) => error!("Cannot echo subprotocol {:?}: {}", protocol, e),
            }
        }
        Ok(response)
    };

    let mut ws = tokio::time::timeout(HANDSHAKE_TIMEOUT, accept_hdr_async(stream, callback))
        .await
        .map_err(|_| GatewayError::HandshakeTimeout)??;

    let identity = identity_from_path(&path).to_string();
    let protocol = match negotiated {
        Ok(protocol) => protocol,
        Err(e) => {
            warn!("[{}] Closing connection from {}: {}", identity, peer, e);
            let _ = ws.close(None).await;
            return Ok(None);
        }
    };

    info!(
        "[{}] Charge point connected from {} using {}",
        identity, peer, protocol
    );

    let attached = central.attach(&identity, ws).await?;
    Ok(Some(attached.handle))
}
