//! `distmail-distributor`: the stateless IMAP front end (spec.md §4).
//!
//! Accepts client TLS connections on the public listener, authenticates
//! LOGIN against the configured backend, and proxies every subsequent
//! command to the worker that owns the authenticated user, over internal
//! mTLS.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use distmail::auth::file_store::FileAuthenticator;
use distmail::auth::sql_store::SqlAuthenticator;
use distmail::auth::Authenticator;
use distmail::config::{AuthBackendConfig, DistributorConfig};
use distmail::errors::AppResult;
use distmail::imap::session::{self, SessionContext};
use distmail::proxy::ProxyRouter;
use distmail::tls;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing_subscriber::EnvFilter;

/// Distributed IMAPv4 mail service: proxy distributor.
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
            tracing::error!(error = %e, "distributor exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> AppResult<()> {
    let config = DistributorConfig::load_from_env()?;

    let authenticator: Arc<dyn Authenticator> = match &config.auth_backend {
        AuthBackendConfig::File { path, separator } => {
            Arc::new(FileAuthenticator::load(path, *separator).await?)
        }
        AuthBackendConfig::Sql { database_url } => {
            Arc::new(SqlAuthenticator::connect(database_url).await?)
        }
    };

    let public_tls = tls::build_public_server_config(&config.public_cert_path, &config.public_key_path)?;
    let internal_client_tls = tls::build_internal_client_config(
        &config.internal_ca_path,
        &config.internal_cert_path,
        &config.internal_key_path,
    )?;

    let ctx = SessionContext {
        authenticator,
        workers: config.workers.into(),
        router: Arc::new(ProxyRouter::new(internal_client_tls)),
    };

    let acceptor = TlsAcceptor::from(public_tls);
    let listener = TcpListener::bind(&config.listen_addr).await.map_err(|e| {
        distmail::errors::AppError::Config(format!("cannot bind {}: {e}", config.listen_addr))
    })?;
    tracing::info!(addr = %config.listen_addr, "distributor listening");

    loop {
        let (tcp, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let ctx = ctx.clone();
        let client_addr = peer_addr.to_string();

        tokio::spawn(async move {
            let stream = match acceptor.accept(tcp).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(client = %client_addr, error = %e, "TLS handshake failed");
                    return;
                }
            };
            if let Err(e) = session::run(stream, client_addr.clone(), ctx).await {
                tracing::warn!(client = %client_addr, error = %e, "session ended with an error");
            }
        });
    }
}
