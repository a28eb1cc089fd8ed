use std::sync::Arc;

use color_eyre::eyre::{Context, Result};
use owo_colors::OwoColorize;
use recado_db::RecadoDb;
use recado_gateway::HttpGateway;
use recado_server::{AppState, Config, build_app};
use recado_worker::{RecadoWorker, WorkerEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn print_banner(config: &Config) {
    let banner = r#"
  ____                     _
 |  _ \ ___  ___ __ _  __| | ___
 | |_) / _ \/ __/ _` |/ _` |/ _ \
 |  _ <  __/ (_| (_| | (_| | (_) |
 |_| \_\___|\___\__,_|\__,_|\___/

    WhatsApp para escolas
"#;
    println!("{}", banner.bright_green());
    println!("  {} {}", "API:".bold(), config.bind.cyan());
    println!("  {} {}", "Gateway:".bold(), config.gateway.base_url.cyan());
    println!();
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::builder()
        .from_env_lossy()
        .add_directive("recado_server=info".parse()?)
        .add_directive("recado_worker=info".parse()?)
        .add_directive("recado_gateway=info".parse()?)
        .add_directive("recado_db=info".parse()?)
        .add_directive("tower_http=info".parse()?);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

fn log_event(event: WorkerEvent) {
    match event {
        WorkerEvent::InstanceStatusChanged {
            instance_id,
            status,
        } => info!(%instance_id, %status, "Instance status changed"),
        WorkerEvent::QrIssued {
            instance_id,
            expires_at,
            attempt,
        } => info!(%instance_id, expires_at, attempt, "QR code ready to scan"),
        WorkerEvent::MessageReceived {
            instance_id,
            contact_id,
            message_id,
        } => info!(%instance_id, contact_id, message_id, "New message"),
        WorkerEvent::MessageStatusChanged {
            instance_id,
            message_id,
            status,
        } => tracing::debug!(%instance_id, message_id, %status, "Message status changed"),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Could not listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Shutting down...");
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    let config = Config::from_env().wrap_err("Invalid configuration")?;
    init_tracing(config.log_json)?;
    if !config.log_json {
        print_banner(&config);
    }

    let db = match &config.db_path {
        Some(path) => RecadoDb::new_with_path(path).await,
        None => RecadoDb::new().await,
    }
    .wrap_err("Failed to open database")?;

    let gateway = HttpGateway::new(config.gateway.clone()).wrap_err("Failed to build gateway client")?;
    let worker = Arc::new(RecadoWorker::new(
        Arc::new(db),
        Arc::new(gateway),
        config.service.clone(),
    ));

    let mut events = worker.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event log fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    worker.start().await.wrap_err("Failed to start worker")?;

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .wrap_err_with(|| format!("Failed to bind {}", config.bind))?;
    info!(addr = %config.bind, "Listening");

    axum::serve(listener, build_app(AppState::new(worker.clone())))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .wrap_err("Server error")?;

    worker.stop().await;
    Ok(())
}
