pub mod actions;
pub mod config;
pub mod definitions;
pub mod delegates;
pub mod engine;
pub mod error;
pub mod events;
pub mod expr;
pub mod matcher;
pub mod registry;
pub mod scheduler;
pub mod scope;
pub mod tailer;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Startup options, usually filled from the command line.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Directory holding `config.toml`; relative config paths resolve here.
    pub config_dir:        PathBuf,
    /// Overrides `log_path` from the config.
    pub log_override:      Option<PathBuf>,
    /// Overrides `triggers_path` from the config.
    pub triggers_override: Option<PathBuf>,
}

pub fn run(opts: Options) -> Result<()> {
    let mut cfg = config::load_or_default(&opts.config_dir)?;
    if let Some(p) = opts.log_override {
        cfg.log_path = p;
    }
    if let Some(p) = opts.triggers_override {
        cfg.triggers_path = p;
    }
    let cfg = cfg.resolve_paths(&opts.config_dir);

    // -----------------------------------------------------------------------
    // Logging: a daily rolling file under `log_dir`, set up before anything
    // else so startup failures end up in it.
    // -----------------------------------------------------------------------
    std::fs::create_dir_all(&cfg.log_dir)
        .with_context(|| format!("creating log directory {:?}", cfg.log_dir))?;
    let file_appender = tracing_appender::rolling::daily(&cfg.log_dir, "triggerwatch.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("triggerwatch_lib=debug".parse()?),
        )
        .with_writer(non_blocking)
        .with_ansi(false)
        .init();

    // Panic hook: log panics through tracing before the thread dies.
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown location".to_string());
        let message = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        tracing::error!("PANIC at {}: {}", location, message);
    }));

    tracing::info!(
        "triggerwatch {} starting, logs in {}",
        env!("CARGO_PKG_VERSION"),
        cfg.log_dir.display()
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building the async runtime")?;
    runtime.block_on(run_pipeline(cfg))
}

/// Wires tailer → engine → event relay and runs until Ctrl-C.
async fn run_pipeline(cfg: config::AppConfig) -> Result<()> {
    let defs = if cfg.triggers_path.exists() {
        definitions::load(&cfg.triggers_path)?
    } else {
        tracing::warn!("No trigger definitions at {:?}; starting empty", cfg.triggers_path);
        definitions::Definitions {
            root:      registry::Folder::root(),
            variables: Vec::new(),
            problems:  0,
        }
    };
    tracing::info!(
        "Loaded trigger definitions ({} problem trigger(s), {} variable(s))",
        defs.problems,
        defs.variables.len()
    );

    // --- Channels ---
    let (line_tx,  line_rx)  = mpsc::channel::<tailer::LogLine>(cfg.line_buffer);
    let (tree_tx,  tree_rx)  = mpsc::channel::<registry::Folder>(4);
    let (event_tx, event_rx) = mpsc::channel::<events::EngineEvent>(cfg.event_buffer);

    let event_log = events::EventLog::new(cfg.event_history);
    let relay = tokio::spawn(events::run(event_rx, event_log.clone()));

    let engine = engine::Engine::new(
        defs.root,
        scope::VarTable::with_values(defs.variables),
        Arc::new(delegates::LoggingEffects),
        events::EventSink::new(event_tx),
    );

    // --- Blocking producers ---
    if cfg.log_path.as_os_str().is_empty() {
        tracing::info!("No log path configured; waiting for Ctrl-C");
    } else {
        let tailer_cfg = cfg.clone();
        let tx = line_tx.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = tailer::run(tailer_cfg, tx) {
                tracing::error!("Tailer failed: {:#}", e);
            }
        });
    }
    if cfg.watch_triggers {
        let path = cfg.triggers_path.clone();
        let tx = tree_tx.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = definitions::watch(path, tx) {
                tracing::error!("Definitions watcher failed: {:#}", e);
            }
        });
    }

    let result = tokio::select! {
        res = engine::run(engine.clone(), line_rx, tree_rx) => res,
        res = tokio::signal::ctrl_c() => {
            tracing::info!("Ctrl-C received, shutting down");
            res.map_err(Into::into)
        }
    };

    // Closing our senders lets the blocking producers notice and return
    drop(line_tx);
    drop(tree_tx);
    engine.shutdown().await;
    drop(engine);
    if let Ok(Err(e)) = relay.await {
        tracing::warn!("Event relay ended with error: {:#}", e);
    }
    tracing::info!("{} event(s) in history at exit", event_log.recent().len());
    result
}
