mod cli;
mod demo;
mod ui;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::Instrument;

use certflow::collaborators::Collaborators;
use certflow::config::CertflowConfig;
use certflow::repository::FileRepository;
use certflow::service::CertificationService;
use certflow::telemetry;
use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = CertflowConfig::load_from(&cli.config)?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if cli.verbose {
        config.log_level = "debug".to_string();
    }
    config.json_logs |= cli.json_logs;
    telemetry::init_tracing(&config.log_level, config.json_logs)?;

    let repository = FileRepository::open(&config.data_dir)
        .await
        .with_context(|| format!("opening data directory {}", config.data_dir.display()))?;
    let service = CertificationService::from_config(
        &config,
        Arc::new(repository),
        Collaborators::simulated(&config.fees),
    )?;

    let span = telemetry::command_span(cli.command.name());
    execute(cli.command, &config, &service).instrument(span).await
}

async fn execute(
    command: Command,
    config: &CertflowConfig,
    service: &CertificationService,
) -> Result<()> {
    match command {
        Command::Demo { revision, on_site } => {
            println!("Running certification demo in {}", config.data_dir.display());
            let options = demo::DemoOptions { revision, on_site };
            let id = demo::run(service, &config.documents.required, options).await?;
            let view = service.get_state(id).await?;
            println!();
            ui::print_view(&view);
            ui::print_audit(&service.audit_record(id).await?);
        }
        Command::Status { id } => {
            let view = service.get_state(id).await?;
            ui::print_view(&view);
        }
        Command::List {
            state,
            limit,
            offset,
        } => {
            let apps = service.list_by_state(state, limit, offset).await?;
            ui::print_list(&apps);
        }
        Command::Stats => {
            ui::print_statistics(&service.statistics().await?);
        }
        Command::Drain { follow: false } => {
            let progress = ui::DrainProgress::start("draining outbox");
            let report = service.drain().await?;
            progress.finish(&report);
        }
        Command::Drain { follow: true } => {
            let (tx, rx) = watch::channel(false);
            let orchestrator = service.orchestrator().clone();
            let runner = tokio::spawn(async move { orchestrator.run(rx).await });
            let progress = ui::DrainProgress::start("draining outbox, Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            progress.update("stopping");
            tx.send(true).ok();
            runner.await.context("drainer task panicked")??;
            progress.stop("drainer stopped");
        }
        Command::Expire => {
            let expired = service.expire_stale(chrono::Utc::now()).await?;
            println!("  {} application(s) expired", expired.len());
            for id in expired {
                println!("    {id}");
            }
        }
    }
    Ok(())
}
