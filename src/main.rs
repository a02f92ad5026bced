//! GPU scheduler entry point - runs either role as its own process

use std::net::SocketAddr;
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gpu_scheduler::config::{Cli, Command, SchedulerArgs, WebhookArgs};
use gpu_scheduler::webhook::{webhook_router, WebhookState};
use gpu_scheduler::{health, scheduler, Error};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install crypto provider: {:?}. \
             The webhook cannot serve TLS without a working provider.",
            e
        );
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Scheduler(args) => run_scheduler(args).await,
        Command::Webhook(args) => run_webhook(args).await,
    }
}

/// Cancel the returned token when SIGINT/SIGTERM arrives.
///
/// The loops check the token cooperatively between iterations, so shutdown
/// waits for the current event to finish rather than tearing mid-flight.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("Shutdown signal received");
        trigger.cancel();
    });
    cancel
}

/// Run the watch-driven scheduler role
async fn run_scheduler(args: SchedulerArgs) -> anyhow::Result<()> {
    info!(scheduler = %args.scheduler_name, "GPU scheduler starting");

    // In-cluster config first, kubeconfig fallback
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let cancel = shutdown_token();
    tokio::spawn(health::serve(
        args.health_port,
        "gpu-scheduler",
        cancel.clone(),
    ));

    match scheduler::run(client, args.reconciler_config(), cancel).await {
        Ok(()) => {
            info!("GPU scheduler stopped");
            Ok(())
        }
        Err(e @ Error::RetriesExhausted { .. }) => {
            // Fatal by design: the process owner restarts us with a clean slate
            Err(anyhow::anyhow!("{}", e))
        }
        Err(e) => Err(anyhow::anyhow!("{}", e)),
    }
}

/// Run the mutating admission webhook role
async fn run_webhook(args: WebhookArgs) -> anyhow::Result<()> {
    let state = Arc::new(WebhookState {
        scheduler_name: args.scheduler_name.clone(),
        parse_policy: args.parse_policy(),
    });
    let app = webhook_router(state);

    let tls_config = RustlsConfig::from_pem_file(&args.cert, &args.key)
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "Failed to load TLS material from {:?} / {:?}: {}",
                args.cert,
                args.key,
                e
            )
        })?;

    let cancel = shutdown_token();
    tokio::spawn(health::serve(
        args.health_port,
        "gpu-webhook",
        cancel.clone(),
    ));

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let handle = axum_server::Handle::new();

    // Stop accepting on shutdown; in-flight admission requests drain
    let graceful = handle.clone();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        warn!("Draining webhook connections");
        graceful.graceful_shutdown(None);
    });

    info!(addr = %addr, "Webhook server ready");
    axum_server::bind_rustls(addr, tls_config)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(|e| anyhow::anyhow!("Webhook server error: {}", e))?;

    info!("Webhook server stopped");
    Ok(())
}
