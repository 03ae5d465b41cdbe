//! CSMS Node - CLI for the OCPP 1.6 central system
//!
//! Runs the central system, or a simulated charge point to talk to one.
//!
//! # Usage
//!
//! ```bash
//! # Central system on the default port
//! csms-node serve
//!
//! # Provision only one charger and bump its heartbeat interval
//! csms-node serve --listen 0.0.0.0:9000 \
//!     --provision-only UKAGKHTV --set HeartbeatInterval=30
//!
//! # Simulated charge point against a local central system
//! csms-node simulate --url ws://127.0.0.1:8080 --identity UKAGKHTV
//! ```
//!
//! `RUST_LOG` overrides `--log-level` when set.

use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use csms_core::{
    CentralSystem, CentralSystemConfig, ChargePointClient, Gateway, SimulatorConfig,
    OCPP16_SUBPROTOCOL,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// OCPP 1.6 central system node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept charge point connections
    Serve(ServeArgs),
    /// Connect as a simulated charge point
    Simulate(SimulateArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Listen address
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Accepted subprotocols in order of preference (can be repeated)
    #[arg(long = "subprotocol", default_value = OCPP16_SUBPROTOCOL)]
    subprotocols: Vec<String>,

    /// Heartbeat interval handed out in BootNotification (seconds)
    #[arg(long, default_value = "10")]
    heartbeat_interval: i32,

    /// Consecutive undecodable frames before a session is dropped
    #[arg(long, default_value = "3")]
    max_decode_failures: u32,

    /// Only provision these identities (can be repeated; default: all)
    #[arg(long = "provision-only")]
    provision_only: Vec<String>,

    /// ChangeConfiguration sent during provisioning, KEY=VALUE (can be repeated)
    #[arg(long = "set", value_parser = parse_key_val)]
    set: Vec<(String, String)>,

    /// Do not provision new charge points
    #[arg(long)]
    no_provisioning: bool,

    /// Skip reading back the full configuration after provisioning
    #[arg(long)]
    no_fetch_configuration: bool,

    /// Seconds between connected-session reports (0 disables)
    #[arg(long, default_value = "60")]
    status_interval: u64,
}

#[derive(Args, Debug)]
struct SimulateArgs {
    /// Central system WebSocket URL (identity is appended)
    #[arg(long, default_value = "ws://127.0.0.1:8080")]
    url: String,

    /// Charge point identity
    #[arg(short, long, default_value = "CP_1")]
    identity: String,

    /// Vendor name
    #[arg(long, default_value = "The Mobility House")]
    vendor: String,

    /// Model name
    #[arg(long, default_value = "Optimus")]
    model: String,

    /// Number of connectors
    #[arg(long, default_value = "1")]
    connectors: i32,

    /// Offered subprotocols (can be repeated)
    #[arg(long = "subprotocol", default_value = OCPP16_SUBPROTOCOL)]
    subprotocols: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Simulate(args) => simulate(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = CentralSystemConfig::new(&args.listen)
        .with_subprotocols(args.subprotocols.iter().cloned())
        .with_heartbeat_interval(args.heartbeat_interval)
        .with_max_decode_failures(args.max_decode_failures);

    for identity in &args.provision_only {
        config = config.with_provisioning_target(identity.as_str());
    }
    for (key, value) in &args.set {
        config = config.with_configuration_change(key.as_str(), value.as_str());
    }
    if args.no_provisioning {
        config = config.without_provisioning();
    }
    config.provisioning.fetch_configuration = !args.no_fetch_configuration;

    let provisioning = if !config.provisioning.enabled {
        "disabled".to_string()
    } else if config.provisioning.targets.is_empty() {
        "all new charge points".to_string()
    } else {
        config.provisioning.targets.join(", ")
    };

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              CSMS Node - OCPP 1.6 Central System             ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Listen:       {:<45} ║", truncate(&args.listen, 45));
    println!("║  Subprotocols: {:<45} ║", truncate(&args.subprotocols.join(", "), 45));
    println!("║  Heartbeat:    {:<45} ║", format!("{}s", config.heartbeat_interval));
    println!("║  Provisioning: {:<45} ║", truncate(&provisioning, 45));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let central = CentralSystem::new(config);
    let gateway = Gateway::bind(central.clone()).await?;

    if args.status_interval > 0 {
        tokio::spawn(report_sessions(
            central.clone(),
            Duration::from_secs(args.status_interval),
        ));
    }

    info!("Starting central system...");
    gateway
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("Central system stopped");
    Ok(())
}

/// Periodically log connected charge points
async fn report_sessions(central: CentralSystem, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let sessions = central.registry().snapshot().await;
        info!("{} charge point(s) connected", sessions.len());
        for s in sessions {
            let boot = s
                .boot
                .map(|b| format!("{} {}", b.vendor, b.model))
                .unwrap_or_else(|| "not booted".to_string());
            info!(
                "  {} [{}] since {} ({:?}, {}, {} pending)",
                s.identity,
                s.connection_id,
                s.connected_at.format("%Y-%m-%d %H:%M:%S"),
                s.state,
                boot,
                s.pending_calls
            );
        }
    }
}

async fn simulate(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = SimulatorConfig {
        central_url: args.url,
        identity: args.identity,
        vendor: args.vendor,
        model: args.model,
        subprotocols: args.subprotocols,
        connectors: args.connectors.max(1),
        ..Default::default()
    };

    info!("Starting simulated charge point {}...", config.identity);
    let client = ChargePointClient::connect(config).await?;

    let result = client
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    client.close().await;

    result?;
    Ok(())
}

/// Parse a KEY=VALUE pair
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("HeartbeatInterval=30").unwrap(),
            ("HeartbeatInterval".to_string(), "30".to_string())
        );
        assert_eq!(
            parse_key_val("AuthorizationKey=a=b").unwrap(),
            ("AuthorizationKey".to_string(), "a=b".to_string())
        );
        assert!(parse_key_val("HeartbeatInterval").is_err());
        assert!(parse_key_val("=30").is_err());
    }

    #[test]
    fn test_cli_parses_serve() {
        let cli = Cli::parse_from([
            "csms-node",
            "serve",
            "--provision-only",
            "UKAGKHTV",
            "--set",
            "HeartbeatInterval=30",
            "--status-interval",
            "0",
        ]);
        match cli.command {
            Command::Serve(args) => {
                assert_eq!(args.listen, "0.0.0.0:8080");
                assert_eq!(args.subprotocols, vec![OCPP16_SUBPROTOCOL]);
                assert_eq!(args.provision_only, vec!["UKAGKHTV"]);
                assert_eq!(args.set.len(), 1);
                assert_eq!(args.status_interval, 0);
            }
            other => panic!("expected serve, got {:?}", other),
        }
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("ocpp1.6", 45), "ocpp1.6");
        assert_eq!(truncate("abcdefghij", 8), "abcde...");
        // widths below the ellipsis still yield just the ellipsis
        assert_eq!(truncate("abcdef", 2), "...");
        assert_eq!(truncate("abcdef", 0), "...");
    }
}
