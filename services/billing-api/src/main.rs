//! Agenda Billing API binary
//!
//! `billing-api serve` (default) runs the HTTP server and the job timers;
//! `billing-api run <job>` runs one job and prints its report.

use std::net::SocketAddr;
use std::sync::Arc;

use agenda_billing_core::{
    BillingService, HttpMailTransport, Job, LogMailTransport, MailTransport, MercadoPagoGateway,
    Scheduler, Stores, Sweeper,
};
use agenda_db::pg::Repositories;
use axum::extract::connect_info::IntoMakeServiceWithConnectInfo;
use axum::Router;
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use billing_api::cli::{Cli, Commands};
use billing_api::config::Config;
use billing_api::state::AppState;
use billing_api::{build_router, setup_metrics};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("billing_api=debug".parse()?)
                .add_directive("agenda_billing_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!(
        http_port = config.http_port,
        scheduler_enabled = config.scheduler_enabled,
        grace_expiry = ?config.billing.grace_expiry_action,
        "Configuration loaded"
    );

    match cli.command() {
        Commands::Serve => serve(config).await,
        Commands::Run { job } => run_job(config, *job).await,
    }
}

/// Wire the database, gateway and mailer into a scheduler-backed state
async fn build_state(config: Config) -> anyhow::Result<AppState> {
    let pool = agenda_db::create_pool(&config.database_url).await?;
    agenda_db::run_migrations(&pool).await?;
    tracing::info!("Database pool created, migrations applied");

    let repos = Repositories::new(pool.clone());
    let gateway = Arc::new(MercadoPagoGateway::new(&config.billing));
    let mail: Arc<dyn MailTransport> = match &config.mail.service_url {
        Some(url) => Arc::new(HttpMailTransport::new(
            url.clone(),
            config.mail.service_token.clone(),
            config.mail.from.clone(),
        )),
        None => {
            tracing::warn!("MAIL_SERVICE_URL not set, lifecycle emails will only be logged");
            Arc::new(LogMailTransport)
        }
    };

    let billing = BillingService::new(Stores::from(repos), gateway, mail, config.billing.clone());
    let scheduler = Scheduler::new(Sweeper::new(billing.clone()));

    Ok(AppState::new(billing, scheduler, pool, config))
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!("Starting Agenda Billing API");

    let metrics_handle = if config.metrics_enabled {
        Some(setup_metrics()?)
    } else {
        None
    };

    let http_addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let state = build_state(config).await?;

    // Job timers stop when the sender flips or drops
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let job_handles = if state.config.scheduler_enabled {
        state.scheduler.spawn(shutdown_rx)
    } else {
        tracing::info!("Scheduler disabled, jobs must be run externally");
        Vec::new()
    };

    let app = build_router(state, metrics_handle);
    let result = run_http_server(app, http_addr).await;

    let _ = shutdown_tx.send(true);
    for handle in job_handles {
        if let Err(e) = handle.await {
            tracing::error!(error = ?e, "Job loop panicked");
        }
    }

    if let Err(e) = &result {
        tracing::error!(error = ?e, "HTTP server error");
    }
    tracing::info!("Shutdown complete");
    result
}

async fn run_job(config: Config, job: Job) -> anyhow::Result<()> {
    let state = build_state(config).await?;

    match state.scheduler.run_once(job).await {
        Some(Ok(report)) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Some(Err(e)) => Err(anyhow::anyhow!("{job} aborted: {e}")),
        None => Err(anyhow::anyhow!("{job} is already running")),
    }
}

async fn run_http_server(app: Router, addr: SocketAddr) -> anyhow::Result<()> {
    tracing::info!("HTTP server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let service: IntoMakeServiceWithConnectInfo<Router, SocketAddr> =
        app.into_make_service_with_connect_info();

    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
