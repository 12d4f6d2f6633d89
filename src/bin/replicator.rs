//! `distmail-replicator`: the CRDT transport for one worker replica
//! (spec.md §4.7, §4.8).
//!
//! Runs the broker and shipper tasks that stamp, log, and fan local
//! mutations out to every peer, and serves the internal mTLS listener that
//! accepts peers' `Incoming` batches.

use std::net::IpAddr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use distmail::config::ReplicatorConfig;
use distmail::errors::{AppError, AppResult};
use distmail::replication::{CrdtReceiver, CrdtSender, PeerTarget, ReplicationLog};
use distmail::rpc::server;
use distmail::tls;
use rustls::pki_types::ServerName;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing_subscriber::EnvFilter;

/// Distributed IMAPv4 mail service: CRDT replicator.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Load environment variables from this file before reading config.
    #[arg(long, default_value = ".env")]
    env_file: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    dotenvy::from_filename(&cli.env_file).ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "replicator exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> AppResult<()> {
    let config = ReplicatorConfig::load_from_env()?;

    let internal_server_tls = tls::build_internal_server_config(
        &config.internal_ca_path,
        &config.internal_cert_path,
        &config.internal_key_path,
    )?;
    let internal_client_tls = tls::build_internal_client_config(
        &config.internal_ca_path,
        &config.internal_cert_path,
        &config.internal_key_path,
    )?;

    let log = Arc::new(ReplicationLog::new(config.log_path.clone()));

    let peers: Vec<PeerTarget> = config
        .peers
        .iter()
        .map(|p| {
            Ok(PeerTarget {
                name: p.name.clone(),
                addr: p.addr.clone(),
                server_name: server_name_for_addr(&p.addr)?,
            })
        })
        .collect::<AppResult<Vec<_>>>()?;

    // `ops_tx` feeds locally originated mutations into the broker; no
    // producer exists inside this crate, so it's kept alive for the
    // process lifetime by staying bound in `run`'s (non-returning) scope.
    let (ops_tx, ops_rx) = mpsc::channel::<Vec<u8>>(256);
    let (applier_tx, mut applier_rx) = mpsc::channel::<Vec<u8>>(256);

    let sender = Arc::new(CrdtSender::new(log.clone()));
    let broker_sender = sender.clone();
    let replica_name = config.replica_name.clone();
    tokio::spawn(async move {
        if let Err(e) = broker_sender.run_broker(replica_name, ops_rx).await {
            tracing::error!(error = %e, "broker task exited");
        }
    });

    let shipper_sender = sender.clone();
    let shipper_interval = config.ship_interval;
    let shipper_peers = peers.clone();
    let shipper_tls = internal_client_tls.clone();
    tokio::spawn(async move {
        if let Err(e) = shipper_sender
            .run_shipper(shipper_peers, shipper_tls, shipper_interval)
            .await
        {
            tracing::error!(error = %e, "shipper task aborted, replica is no longer replicating");
        }
    });

    // Applier: hands received batches to local state. No in-scope consumer
    // exists in this crate, so drain and log what would be applied.
    tokio::spawn(async move {
        while let Some(batch) = applier_rx.recv().await {
            tracing::debug!(bytes = batch.len(), "received batch ready to apply");
        }
    });

    let receiver = Arc::new(CrdtReceiver::new(log, applier_tx));
    let acceptor = TlsAcceptor::from(internal_server_tls);
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .map_err(|e| AppError::config(format!("cannot bind {}: {e}", config.listen_addr)))?;
    tracing::info!(addr = %config.listen_addr, replica = %config.replica_name, "replicator listening");

    loop {
        let (tcp, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let receiver = receiver.clone();

        tokio::spawn(async move {
            let stream = match acceptor.accept(tcp).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(peer = %peer_addr, error = %e, "TLS handshake failed");
                    return;
                }
            };
            if let Err(e) = server::serve_connection(stream, receiver).await {
                tracing::warn!(peer = %peer_addr, error = %e, "peer connection ended with an error");
            }
        });
    }
}

fn server_name_for_addr(addr: &str) -> AppResult<ServerName<'static>> {
    let host = addr.rsplit_once(':').map(|(host, _port)| host).unwrap_or(addr);
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_owned())
        .map_err(|e| AppError::config(format!("invalid peer address '{addr}': {e}")))
}
