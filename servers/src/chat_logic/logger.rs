use anyhow::{Context, Result};
use log::LevelFilter;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const LOG_FILE_PREFIX: &str = "server_chat_";
// Including the file opened by this run.
const KEEP_LOG_FILES: usize = 5;
// Network and TLS crates that flood the log below info.
const QUIET_TARGETS: &[&str] = &["hyper", "hyper_util", "tungstenite", "tokio_tungstenite", "redis", "rustls", "axum_server"];

/// Installs the global logger: stdout plus a fresh file in `log_dir`.
/// Returns the path of that file.
pub fn setup_logging(log_dir: &Path, log_level: &str) -> Result<PathBuf> {
    fs::create_dir_all(log_dir).with_context(|| format!("Cannot create log directory {}", log_dir.display()))?;
    prune_log_files(log_dir, KEEP_LOG_FILES - 1)?;

    let log_path = log_dir.join(log_file_name(chrono::Local::now()));
    let log_file = fern::log_file(&log_path).with_context(|| format!("Cannot open log file {}", log_path.display()))?;

    dispatch(parse_level(log_level))
        .chain(std::io::stdout())
        .chain(log_file)
        .apply()
        .context("A global logger is already installed")?;

    Ok(log_path)
}

fn dispatch(level: LevelFilter) -> fern::Dispatch {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} {:<5} {}: {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level);
    for target in QUIET_TARGETS {
        dispatch = dispatch.level_for(*target, level.min(LevelFilter::Info));
    }
    dispatch
}

fn log_file_name(started: chrono::DateTime<chrono::Local>) -> String {
    format!("{}{}.log", LOG_FILE_PREFIX, started.format("%Y-%m-%d_%H-%M-%S"))
}

fn parse_level(log_level: &str) -> LevelFilter {
    match log_level.to_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    }
}

/// Deletes all but the `keep` newest relay log files in `log_dir`.
fn prune_log_files(log_dir: &Path, keep: usize) -> Result<()> {
    let mut logs: Vec<(SystemTime, PathBuf)> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            name.starts_with(LOG_FILE_PREFIX) && name.ends_with(".log")
        })
        .map(|e| {
            let modified = e.metadata().and_then(|m| m.modified()).unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, e.path())
        })
        .collect();

    logs.sort_by(|a, b| b.0.cmp(&a.0));

    for (_, path) in logs.iter().skip(keep) {
        if let Err(e) = fs::remove_file(path) {
            eprintln!("Failed to delete old log file {}: {}", path.display(), e);
        }
    }
    Ok(())
}
