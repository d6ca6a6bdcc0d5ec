//! Enclave service binary.
//!
//! Startup is atomic and failure-fatal: platform session, RSA keypair from
//! the attested RNG, initial attestation document. After that the service
//! answers framed requests on vsock (or TCP in local development) until
//! SIGINT/SIGTERM.

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use gardbase::config::EnclaveConfig;
use gardbase::enclave::nsm::PlatformAdapter;
use gardbase::enclave::{server, session, start_attestation_refresher, EnclaveState};

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("starting gardbase enclave service");

    let config = EnclaveConfig::from_env();
    let platform = PlatformAdapter::open();
    let in_enclave = !platform.is_local_mode();

    let state = Arc::new(EnclaveState::initialize(platform)?);

    start_attestation_refresher(Arc::clone(&state), config.attestation_refresh_interval);
    session::start_sweeper(Arc::clone(&state.sessions), config.session_sweep_interval);

    let use_vsock = in_enclave || std::env::var("USE_VSOCK").is_ok();

    let serve = async {
        if use_vsock {
            info!(port = config.port, "serving over vsock");
            server::run_vsock(Arc::clone(&state), config.port, config.idle_timeout).await
        } else {
            info!(port = config.port, "serving over tcp (local mode)");
            server::run_tcp(Arc::clone(&state), config.port as u16, config.idle_timeout).await
        }
    };

    tokio::select! {
        result = serve => result?,
        _ = shutdown_signal() => {
            info!("shutting down enclave service");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
