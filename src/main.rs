//! Harbormaster - Main entry point.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use harbormaster::{
    cli::{Cli, Command, log_directive, render_check, render_cleanup, render_sweep},
    config::Config,
    context::AppContext,
    controller::{Controller, cleanup_all},
    plugins::PluginRegistry,
    runtime::DockerRuntime,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before parsing so HARBORMASTER_CONFIG can come from it
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    // RUST_LOG beats --log-level, which beats logLevel from the document
    let rust_log = std::env::var("RUST_LOG").ok();
    let directive = log_directive(
        rust_log.as_deref(),
        cli.log_level.as_deref(),
        Some(config.log_level.as_str()),
    );
    tracing_subscriber::registry()
        .with(EnvFilter::new(&directive))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let command = cli.command.unwrap_or(Command::Run);
    if command == Command::Check {
        print!("{}", render_check(&config)?);
        return Ok(());
    }

    let runtime = DockerRuntime::connect()
        .await
        .context("Failed to connect to the Docker daemon")?;
    let ctx = Arc::new(AppContext::new(config, Arc::new(runtime)));

    match command {
        Command::Cleanup => {
            let report = cleanup_all(ctx.runtime.as_ref()).await;
            println!("{}", render_cleanup(&report));
        }
        Command::Sweep => {
            let controller = Controller::new(ctx, PluginRegistry::with_builtins())
                .context("Failed to set up the idle detector")?;
            let (sweep, age) = controller.sweep_once().await;
            println!("{}", render_sweep(&sweep, &age));
        }
        Command::Run | Command::Check => {
            tracing::info!(
                config = %cli.config.display(),
                sets = ctx.config.containers.len(),
                "Starting harbormaster"
            );
            let controller = Controller::new(ctx, PluginRegistry::with_builtins())
                .context("Failed to set up the idle detector")?;
            controller.run_until(shutdown_signal()).await?;
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
