//! End-to-end tests over real TCP sockets
//!
//! Each test binds a gateway on 127.0.0.1:0 and drives it with the
//! charge point simulator or a raw WebSocket client.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use csms_core::{
    CentralSystem, CentralSystemConfig, ChargePointClient, Gateway, ProvisioningState,
    SimulatorConfig,
};
use futures_util::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_test::assert_ok;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing_subscriber::EnvFilter;

struct Server {
    central: CentralSystem,
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Server {
    async fn start(config: CentralSystemConfig) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let central = CentralSystem::new(CentralSystemConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            ..config
        });
        let gateway = Gateway::bind(central.clone()).await.unwrap();
        let addr = gateway.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            gateway
                .run_until(async {
                    let _ = stopped.await;
                })
                .await
                .unwrap();
        });

        Self {
            central,
            addr,
            stop,
            task,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    fn simulator(&self, identity: &str) -> SimulatorConfig {
        SimulatorConfig {
            request_timeout: Duration::from_secs(5),
            ..SimulatorConfig::new(self.url(), identity)
        }
    }

    async fn stop(self) {
        let _ = self.stop.send(());
        self.task.await.unwrap();
    }
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 3s");
}

/// Raw client offering `protocols`; returns whether the server closed it
async fn connect_raw(addr: SocketAddr, path: &str, protocols: Option<&str>) -> bool {
    let mut request = format!("ws://{}/{}", addr, path)
        .into_client_request()
        .unwrap();
    if let Some(protocols) = protocols {
        request.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(protocols).unwrap(),
        );
    }

    match tokio_tungstenite::connect_async(request).await {
        // client side refuses a handshake response without the subprotocol
        Err(_) => true,
        Ok((mut ws, _)) => {
            let next = tokio::time::timeout(Duration::from_secs(3), ws.next())
                .await
                .unwrap();
            matches!(next, None | Some(Ok(Message::Close(_))) | Some(Err(_)))
        }
    }
}

fn quiet_config() -> CentralSystemConfig {
    CentralSystemConfig::default().without_provisioning()
}

#[tokio::test]
async fn connection_without_subprotocol_is_closed() {
    let server = Server::start(quiet_config()).await;

    assert!(connect_raw(server.addr, "CP_NONE", None).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server.central.registry().is_empty().await);
    assert!(server.central.provisioning_status().state("CP_NONE").is_none());

    server.stop().await;
}

#[tokio::test]
async fn disjoint_subprotocols_are_closed() {
    let server = Server::start(CentralSystemConfig::default()).await;

    assert!(connect_raw(server.addr, "CP_V2", Some("ocpp2.0.1, ocpp2.0")).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server.central.registry().is_empty().await);
    assert!(server.central.provisioning_status().state("CP_V2").is_none());

    server.stop().await;
}

#[tokio::test]
async fn simulator_refuses_server_without_common_protocol() {
    let server = Server::start(quiet_config()).await;

    let config = SimulatorConfig {
        subprotocols: vec!["ocpp2.0.1".to_string()],
        ..server.simulator("CP_V2")
    };
    assert!(ChargePointClient::connect(config).await.is_err());
    assert!(server.central.registry().is_empty().await);

    server.stop().await;
}

#[tokio::test]
async fn second_connection_replaces_first() {
    let server = Server::start(quiet_config()).await;

    let first = assert_ok!(ChargePointClient::connect(server.simulator("CP_DUP")).await);
    assert_eq!(first.accepted_protocol(), Some("ocpp1.6"));
    let central = server.central.clone();
    wait_until(|| {
        let central = central.clone();
        async move { central.registry().contains("CP_DUP").await }
    })
    .await;

    let second = assert_ok!(ChargePointClient::connect(server.simulator("CP_DUP")).await);
    tokio::time::timeout(Duration::from_secs(3), first.closed())
        .await
        .unwrap();

    assert_eq!(server.central.registry().len().await, 1);
    assert!(!second.is_closed());
    assert_ok!(second.boot_notification().await);

    let summary = server.central.registry().snapshot().await;
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0].identity, "CP_DUP");
    assert_eq!(summary[0].boot.as_ref().unwrap().vendor, "The Mobility House");

    first.close().await;
    second.close().await;
    server.stop().await;
}

#[tokio::test]
async fn new_identity_is_provisioned_exactly_once() {
    let server = Server::start(CentralSystemConfig::default()).await;
    let central = server.central.clone();

    let sim = assert_ok!(ChargePointClient::connect(server.simulator("UKAGKHTV")).await);
    wait_until(|| {
        let central = central.clone();
        async move { central.provisioning_status().is_provisioned("UKAGKHTV") }
    })
    .await;

    let installed = sim.installed_profiles();
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].connector_id, 1);
    assert_eq!(installed[0].profile, csms_core::default_daily_profile());

    sim.close().await;
    wait_until(|| {
        let central = central.clone();
        async move { central.registry().is_empty().await }
    })
    .await;

    // reconnect: a fresh simulator sees no provisioning traffic
    let sim = assert_ok!(ChargePointClient::connect(server.simulator("UKAGKHTV")).await);
    assert_ok!(sim.boot_notification().await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(sim.installed_profiles().is_empty());
    assert_eq!(
        server.central.provisioning_status().state("UKAGKHTV"),
        Some(ProvisioningState::Done)
    );

    sim.close().await;
    server.stop().await;
}

#[tokio::test]
async fn full_session_with_configuration_changes() {
    let config = CentralSystemConfig::default()
        .with_heartbeat_interval(1)
        .with_configuration_change("HeartbeatInterval", "30")
        .with_configuration_change("NumberOfConnectors", "4");
    let server = Server::start(config).await;
    let central = server.central.clone();

    let sim = assert_ok!(ChargePointClient::connect(server.simulator("UKF78PEM")).await);
    assert_ok!(
        sim.run_until(tokio::time::sleep(Duration::from_millis(1500)))
            .await
    );

    wait_until(|| {
        let central = central.clone();
        async move { central.provisioning_status().is_provisioned("UKF78PEM") }
    })
    .await;
    assert_eq!(sim.configuration_value("HeartbeatInterval").as_deref(), Some("30"));
    // readonly key is rejected and left alone
    assert_eq!(sim.configuration_value("NumberOfConnectors").as_deref(), Some("1"));

    let handle = server.central.registry().get("UKF78PEM").await.unwrap();
    assert_eq!(handle.boot_info().unwrap().model, "Optimus");

    sim.close().await;
    server.stop().await;
}

#[tokio::test]
async fn shutdown_closes_connected_charge_points() {
    let server = Server::start(quiet_config()).await;

    let sim = assert_ok!(ChargePointClient::connect(server.simulator("CP_STOP")).await);
    assert_ok!(sim.boot_notification().await);

    server.stop().await;
    tokio::time::timeout(Duration::from_secs(3), sim.closed())
        .await
        .unwrap();
    assert!(sim.is_closed());
    sim.close().await;
}

#[tokio::test]
async fn stop_returns_after_close_frames_are_sent() {
    let server = Server::start(quiet_config()).await;
    let central = server.central.clone();

    let mut request = format!("ws://{}/CP_RAW", server.addr)
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(
        header::SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static("ocpp1.6"),
    );
    let (mut ws, _) = assert_ok!(tokio_tungstenite::connect_async(request).await);
    wait_until(|| {
        let central = central.clone();
        async move { central.registry().contains("CP_RAW").await }
    })
    .await;

    server.stop().await;
    assert!(central.is_closing());
    assert!(central.registry().is_empty().await);

    // already on the wire when stop returns
    let next = tokio::time::timeout(Duration::from_millis(100), ws.next())
        .await
        .unwrap();
    assert!(matches!(next, Some(Ok(Message::Close(_)))));
}

#[tokio::test]
async fn stop_is_bounded_by_stalled_handshake() {
    let server =
        Server::start(quiet_config().with_shutdown_grace(Duration::from_millis(300))).await;
    let central = server.central.clone();

    // TCP connected, upgrade request never sent
    let _stalled = assert_ok!(tokio::net::TcpStream::connect(server.addr).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_ok!(tokio::time::timeout(Duration::from_secs(3), server.stop()).await);
    assert!(central.registry().is_empty().await);
}
