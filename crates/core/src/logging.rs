use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::OnceLock;
use tracing::info;
use tracing_appender::{non_blocking, non_blocking::WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt};

static LOGGING_INIT: OnceLock<()> = OnceLock::new();
static LOG_GUARD: OnceLock<Option<WorkerGuard>> = OnceLock::new();

/// Initialize the global tracing subscriber according to `LoggingConfig`.
/// `ECHOBEATS_LOG` overrides the configured level. Subsequent calls are no-ops.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    if LOGGING_INIT.get().is_some() {
        return Ok(());
    }

    let level = resolve_level(std::env::var("ECHOBEATS_LOG").ok().as_deref(), config);
    let env_filter = EnvFilter::try_new(level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));

    let base_builder = fmt::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_thread_names(true);

    // Files always get JSON so structured fields stay separate keys on disk.
    let mut emit_json = config.json;
    let mut guard: Option<WorkerGuard> = None;
    let init_result = if let Some(path) = &config.log_path {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory {:?}", dir))?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {:?}", path))?;
        let (writer, file_guard) = non_blocking(file);
        guard = Some(file_guard);
        emit_json = true;
        base_builder.with_writer(writer).json().try_init()
    } else if emit_json {
        base_builder.json().try_init()
    } else {
        base_builder.compact().try_init()
    };
    init_result.map_err(|err| anyhow::anyhow!("failed to initialize logging: {err}"))?;
    LOGGING_INIT.set(()).ok();
    LOG_GUARD.set(guard).ok();

    info!(
        target: "echobeats::logging",
        level = level.as_str(),
        json = emit_json,
        log_path = ?config.log_path,
        "logging initialized"
    );
    Ok(())
}

fn resolve_level(env_override: Option<&str>, config: &LoggingConfig) -> String {
    env_override
        .filter(|value| !value.trim().is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| config.log_level.clone())
}
