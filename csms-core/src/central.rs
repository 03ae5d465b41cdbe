//! Central system state
//!
//! `CentralSystem` owns everything shared between connections: the
//! configuration, the session registry and the provisioning status. It is
//! cheap to clone and is handed to the gateway; tests build isolated
//! instances.
//!
//! ## Connection flow
//!
//! ```text
//! Gateway ──attach()──► Session::new ──► Registry::insert (replaces + closes old)
//!                            │
//!                            ├── spawn: Session::run      (inbound loop + writer)
//!                            └── spawn: Provisioner::provision (first connect only)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_tungstenite::WebSocketStream;
use tracing::{info, warn};

use crate::config::CentralSystemConfig;
use crate::error::GatewayError;
use crate::provisioning::{Provisioner, ProvisioningOutcome, ProvisioningStatus};
use crate::registry::SessionRegistry;
use crate::router::Router;
use crate::session::{CloseReason, Session, SessionHandle};

/// An attached connection and the results of its tasks
#[derive(Debug)]
pub struct AttachedSession {
    pub handle: SessionHandle,
    /// Resolves when the inbound loop has stopped and the writer is done
    pub inbound: oneshot::Receiver<CloseReason>,
    pub provisioning: oneshot::Receiver<ProvisioningOutcome>,
}

/// The central system: configuration plus shared connection state
#[derive(Debug, Clone)]
pub struct CentralSystem {
    config: Arc<CentralSystemConfig>,
    registry: SessionRegistry,
    provisioner: Provisioner,
    router: Arc<Router>,
    closing: Arc<AtomicBool>,
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl CentralSystem {
    pub fn new(config: CentralSystemConfig) -> Self {
        Self::with_state(config, SessionRegistry::new(), ProvisioningStatus::new())
    }

    /// Build around existing registry / provisioning state
    pub fn with_state(
        config: CentralSystemConfig,
        registry: SessionRegistry,
        provisioning: ProvisioningStatus,
    ) -> Self {
        let router = Arc::new(Router::new(config.heartbeat_interval));
        let provisioner = Provisioner::new(config.provisioning.clone(), provisioning);

        Self {
            config: Arc::new(config),
            registry,
            provisioner,
            router,
            closing: Arc::new(AtomicBool::new(false)),
            tasks: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    pub fn config(&self) -> &CentralSystemConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn provisioning_status(&self) -> &ProvisioningStatus {
        self.provisioner.status()
    }

    /// Whether [`CentralSystem::shutdown`] has started
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Take over a negotiated connection for `identity`
    ///
    /// Refused with [`GatewayError::ShuttingDown`] once shutdown has
    /// started; the connection is closed in that case.
    pub async fn attach<S>(
        &self,
        identity: &str,
        mut ws: WebSocketStream<S>,
    ) -> Result<AttachedSession, GatewayError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.is_closing() {
            warn!("[{}] Refusing connection during shutdown", identity);
            let _ = ws.close(None).await;
            return Err(GatewayError::ShuttingDown);
        }

        if identity.is_empty() {
            warn!("Charge point connected with an empty identity");
        }

        let (session, handle) = Session::new(
            identity,
            self.config.outbound_queue,
            self.router.clone(),
            self.registry.clone(),
            self.config.max_decode_failures,
        );

        if let Some(previous) = self.registry.insert(handle.clone()).await {
            warn!(
                "[{}] New connection {} replaces {}, closing the old one",
                identity,
                handle.connection_id(),
                previous.connection_id()
            );
            previous.close();
        }

        let (inbound_tx, inbound) = oneshot::channel();
        let (provisioning_tx, provisioning) = oneshot::channel();
        let provisioner = self.provisioner.clone();
        let provisioning_handle = handle.clone();

        {
            let mut tasks = self.tasks.lock();
            // reap finished connections
            while tasks.try_join_next().is_some() {}

            tasks.spawn(async move {
                let _ = inbound_tx.send(session.run(ws).await);
            });
            tasks.spawn(async move {
                let _ = provisioning_tx.send(provisioner.provision(&provisioning_handle).await);
            });
        }

        // shutdown may have swept the registry before this session was in it
        if self.is_closing() {
            handle.close();
        }

        Ok(AttachedSession {
            handle,
            inbound,
            provisioning,
        })
    }

    /// Close every connected session and wait for their tasks
    ///
    /// New connections are refused from here on. Tasks still running after
    /// `grace` are aborted.
    pub async fn shutdown(&self, grace: Duration) {
        self.closing.store(true, Ordering::SeqCst);
        let count = self.registry.close_all().await;
        info!("Closing {} session(s)", count);

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let mut tasks = std::mem::take(&mut *self.tasks.lock());
            if tasks.is_empty() {
                break;
            }

            let drained = tokio::time::timeout_at(deadline, async {
                while tasks.join_next().await.is_some() {}
            })
            .await;

            if drained.is_err() {
                warn!(
                    "{} session task(s) still running after {:?}, aborting",
                    tasks.len(),
                    grace
                );
                tasks.shutdown().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommandTimeouts;
    use crate::error::CommandError;
    use crate::ocpp::{CallResult, GetConfigurationRequest, OcppMessage};
    use crate::session::tests::{next_message, send, ws_pair};
    use futures_util::StreamExt;
    use tokio_tungstenite::tungstenite::Message;

    fn config() -> CentralSystemConfig {
        let mut config = CentralSystemConfig::new("127.0.0.1:0");
        config.provisioning.fetch_configuration = false;
        config.provisioning.timeouts = CommandTimeouts::uniform(Duration::from_secs(5));
        config
    }

    #[tokio::test]
    async fn test_provisioning_runs_once_across_reconnects() {
        let central = CentralSystem::new(config());
        let mut profile_calls = 0;

        for _cycle in 0..2 {
            let (server, mut client) = ws_pair().await;
            let attached = central.attach("UKAGKHTV", server).await.unwrap();
            assert!(central.registry().contains("UKAGKHTV").await);

            if profile_calls == 0 {
                let call = match next_message(&mut client).await {
                    OcppMessage::Call(call) => call,
                    other => panic!("expected Call, got {:?}", other),
                };
                assert_eq!(call.action, "SetChargingProfile");
                profile_calls += 1;
                send(
                    &mut client,
                    OcppMessage::CallResult(CallResult {
                        message_id: call.message_id,
                        payload: serde_json::json!({"status": "Accepted"}),
                    }),
                )
                .await;
                assert!(matches!(
                    attached.provisioning.await.unwrap(),
                    ProvisioningOutcome::Completed(_)
                ));
            } else {
                assert!(matches!(
                    attached.provisioning.await.unwrap(),
                    ProvisioningOutcome::AlreadyProvisioned
                ));
            }

            client.close(None).await.unwrap();
            attached.inbound.await.unwrap();
            assert!(!central.registry().contains("UKAGKHTV").await);
        }

        assert_eq!(profile_calls, 1);
        assert!(central.provisioning_status().is_provisioned("UKAGKHTV"));
    }

    #[tokio::test]
    async fn test_second_connection_replaces_first() {
        let central = CentralSystem::new(config().without_provisioning());

        let (server_a, _client_a) = ws_pair().await;
        let first = central.attach("CP_1", server_a).await.unwrap();
        let (server_b, _client_b) = ws_pair().await;
        let mut second = central.attach("CP_1", server_b).await.unwrap();

        // the first session is told to close and must not evict the second
        assert_eq!(first.inbound.await.unwrap(), CloseReason::Shutdown);
        assert_eq!(central.registry().len().await, 1);
        let current = central.registry().get("CP_1").await.unwrap();
        assert_eq!(current.connection_id(), second.handle.connection_id());

        // shutdown returns only after the session tasks have finished
        central.shutdown(Duration::from_secs(5)).await;
        assert_eq!(second.inbound.try_recv().unwrap(), CloseReason::Shutdown);
        assert!(central.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_attach_after_shutdown_is_refused() {
        let central = CentralSystem::new(config().without_provisioning());
        central.shutdown(Duration::from_secs(1)).await;
        assert!(central.is_closing());

        let (server, mut client) = ws_pair().await;
        assert!(matches!(
            central.attach("CP_LATE", server).await,
            Err(GatewayError::ShuttingDown)
        ));
        assert!(central.registry().is_empty().await);
        assert!(central.provisioning_status().state("CP_LATE").is_none());
        assert!(matches!(client.next().await, Some(Ok(Message::Close(_)))));
    }

    #[tokio::test]
    async fn test_shutdown_fails_calls_and_closes() {
        let central = CentralSystem::new(config().without_provisioning());
        let (server, mut client) = ws_pair().await;
        let mut attached = central.attach("CP_2", server).await.unwrap();

        let caller = {
            let handle = attached.handle.clone();
            tokio::spawn(async move {
                handle
                    .call(&GetConfigurationRequest::default(), Duration::from_secs(30))
                    .await
            })
        };
        match next_message(&mut client).await {
            OcppMessage::Call(call) => assert_eq!(call.action, "GetConfiguration"),
            other => panic!("expected Call, got {:?}", other),
        }

        central.shutdown(Duration::from_secs(5)).await;
        assert_eq!(attached.inbound.try_recv().unwrap(), CloseReason::Shutdown);
        assert!(attached.handle.pending().is_empty());
        assert!(matches!(
            caller.await.unwrap(),
            Err(CommandError::ConnectionClosed)
        ));
        assert!(matches!(client.next().await, Some(Ok(Message::Close(_)))));
    }
}
