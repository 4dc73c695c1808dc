use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use monitoramento_quedas::config::Config;
use monitoramento_quedas::diagnostics::{
    Diagnostics, DiagnosticsTrigger, NoDiagnostics, ProcessRunner,
};
use monitoramento_quedas::dispatch::{self, Cli, Event};
use monitoramento_quedas::interface::InterfaceWatcher;
use monitoramento_quedas::outage::OutageDetector;
use monitoramento_quedas::reporter::{
    DeviceConfigFile, HttpTransport, RetryPolicy, TagReporter, TagSink,
};
use monitoramento_quedas::storage::Storage;
use monitoramento_quedas::types::ConnectivityState;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// Sempre sai com código 0: falhas ficam só no log, o dispatcher nunca é bloqueado.
#[tokio::main]
async fn main() {
    // Inicializa o sistema de logging (tracing), nível via RUST_LOG
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        error!("[DISPATCH] Notificação não processada: {:#}", e);
    }
}

async fn run() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            error!("[DISPATCH] Argumentos inválidos: {}", e);
            return Ok(());
        }
    };

    let config = Config::load()?;
    let connectivity = std::env::var("CONNECTIVITY_STATE").ok();
    let event = dispatch::classify(
        &cli.interface,
        &cli.action,
        connectivity.as_deref(),
        &config.watched_interface,
    );
    debug!(
        "[DISPATCH] interface={:?} action={:?} -> {:?}",
        cli.interface, cli.action, event
    );

    let storage = Storage::new(&config.state_dir, config.lock_timeout());
    let transport = HttpTransport::new(RetryPolicy::from_config(&config.api))?;
    let reporter = TagReporter::new(
        transport,
        DeviceConfigFile::new(&config.api.credentials_file),
    );
    let now = Utc::now().timestamp();

    match event {
        Event::Connectivity(state) => {
            if config.diagnostics.enabled {
                let diagnostics = Diagnostics::new(
                    config.diagnostics.clone(),
                    ProcessRunner::new(config.diagnostics.clone()),
                );
                handle_connectivity(&config, &storage, &reporter, &diagnostics, state, now).await
            } else {
                handle_connectivity(&config, &storage, &reporter, &NoDiagnostics, state, now)
                    .await
            }
        }
        Event::Interface { name, kind } => {
            InterfaceWatcher::new(&storage, &reporter, &config.tags)
                .handle_event(&name, kind, now)
                .await?;
            Ok(())
        }
        Event::Ignored(reason) => {
            debug!("[DISPATCH] Ignorado: {}", reason);
            Ok(())
        }
    }
}

async fn handle_connectivity<S: TagSink, D: DiagnosticsTrigger>(
    config: &Config,
    storage: &Storage,
    sink: &S,
    diagnostics: &D,
    state: ConnectivityState,
    now: i64,
) -> Result<()> {
    let step = OutageDetector::new(
        storage,
        sink,
        diagnostics,
        &config.tags,
        config.con_lost_min_len,
    )
    .handle(state, now)
    .await?;
    info!("[DISPATCH] Conectividade processada: {:?}", step);
    Ok(())
}
