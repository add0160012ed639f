// ===============================
// src/main.rs
// ===============================
/*
 # quick checks
 curl -s localhost:9898/metrics | egrep '^(venue_ws_connected|auth_state|downstream_clients)'
 websocat ws://127.0.0.1:9002
*/
/*
=============================================================================
Project : deribit_bridge: Deribit JSON-RPC gateway with websocket fan-out
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Keeps one authenticated session to Deribit, correlates JSON-RPC
          replies, stores order books and orders from push channels, and
          re-publishes normalized events to every downstream websocket client.
          Exposes Prometheus metrics.
=============================================================================
*/
use std::process::ExitCode;
use std::sync::Arc;

use tokio::{select, sync::mpsc, time::Duration};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use deribit_bridge::broadcast::Broadcaster;
use deribit_bridge::protocol::OutboundFrame;
use deribit_bridge::{config, metrics, server, transport, Gateway};

#[tokio::main]
async fn main() -> ExitCode {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Config ----
    let args = match config::load() {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    let credentials = match args.credentials() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid credentials");
            return ExitCode::FAILURE;
        }
    };

    // ---- Metrics ----
    metrics::init();
    metrics::serve_metrics(args.metrics_port);

    let venue_url = args.venue_url();
    info!(
        venue_mode = args.venue_mode.as_str(),
        venue_url = %venue_url,
        instruments = ?args.instruments(),
        authenticated = credentials.is_some(),
        listen = %args.listen_addr,
        metrics_port = args.metrics_port,
        "startup config"
    );

    // ---- Wiring ----
    let (outbound_tx, outbound_rx) = mpsc::channel::<OutboundFrame>(1024);
    let (events_tx, events_rx) = mpsc::channel(4096);
    let broadcaster = Arc::new(Broadcaster::new());
    let gateway = Gateway::new(args.gateway_config(), credentials, outbound_tx, broadcaster.clone());

    let mut session = tokio::spawn(transport::run_session(
        venue_url,
        outbound_rx,
        events_tx,
        args.reconnect_policy(),
    ));
    tokio::spawn(gateway.clone().run(events_rx));

    let mut downstream = tokio::spawn({
        let gateway = gateway.clone();
        let addr = args.listen_addr.clone();
        let buffer = args.downstream_buffer;
        async move { server::run_server(&addr, gateway, buffer).await }
    });

    // ---- Heartbeat ----
    loop {
        select! {
            _ = tokio::time::sleep(Duration::from_secs(10)) => {
                info!(
                    connected = gateway.is_connected(),
                    auth = ?gateway.auth().state(),
                    books = gateway.books().len(),
                    orders = gateway.orders().len(),
                    pending = gateway.pending_requests(),
                    clients = broadcaster.len(),
                    "heartbeat"
                );
            }
            res = &mut downstream => {
                match res {
                    Ok(Err(e)) => error!(error = %e, "downstream server stopped"),
                    Ok(Ok(())) => error!("downstream server stopped"),
                    Err(e) => error!(?e, "downstream server task failed"),
                }
                return ExitCode::FAILURE;
            }
            _ = &mut session => {
                error!("venue session task ended");
                return ExitCode::FAILURE;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c, shutting down");
                return ExitCode::SUCCESS;
            }
        }
    }
}
