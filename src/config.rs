/// Application configuration: persisted as TOML in `<config dir>/config.toml`.
///
/// Relative paths are resolved against the config directory, so a config
/// dir can be moved around together with its trigger definitions.
///
/// NOTE: `log_path` may name either a file or a directory. For a directory
/// the tailer follows the newest `<prefix>*.<extension>` file inside it and
/// switches when a new one appears.
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.toml";

// ---------------------------------------------------------------------------
// AppConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Telemetry log file, or a directory of rotating log files.
    #[serde(default)]
    pub log_path: PathBuf,

    /// File name prefix used when `log_path` is a directory (empty = any).
    #[serde(default)]
    pub log_file_prefix: String,

    /// File extension used when `log_path` is a directory.
    #[serde(default = "default_log_file_extension")]
    pub log_file_extension: String,

    /// Process lines already in the file at startup instead of only new ones.
    #[serde(default)]
    pub read_existing: bool,

    /// Trigger definitions file.
    #[serde(default = "default_triggers_path")]
    pub triggers_path: PathBuf,

    /// Reload the definitions file when it changes.
    #[serde(default = "default_true")]
    pub watch_triggers: bool,

    /// Directory for our own rolling log files.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Capacity of the tailer → engine line channel.
    #[serde(default = "default_line_buffer")]
    pub line_buffer: usize,

    /// Capacity of the engine event channel; events beyond it are dropped.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Number of recent events kept for polling.
    #[serde(default = "default_event_history")]
    pub event_history: usize,
}

fn default_log_file_extension() -> String { "log".to_owned() }
fn default_triggers_path() -> PathBuf     { PathBuf::from("triggers.toml") }
fn default_log_dir() -> PathBuf           { PathBuf::from("logs") }
fn default_true() -> bool                 { true }
fn default_line_buffer() -> usize         { 2_048 }
fn default_event_buffer() -> usize        { 256 }
fn default_event_history() -> usize       { 50 }

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_path:           PathBuf::new(),
            log_file_prefix:    String::new(),
            log_file_extension: default_log_file_extension(),
            read_existing:      false,
            triggers_path:      default_triggers_path(),
            watch_triggers:     true,
            log_dir:            default_log_dir(),
            line_buffer:        default_line_buffer(),
            event_buffer:       default_event_buffer(),
            event_history:      default_event_history(),
        }
    }
}

impl AppConfig {
    /// Make relative paths absolute against `base`.
    pub fn resolve_paths(mut self, base: &Path) -> Self {
        for p in [&mut self.log_path, &mut self.triggers_path, &mut self.log_dir] {
            if !p.as_os_str().is_empty() && p.is_relative() {
                *p = base.join(&*p);
            }
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

pub fn load_or_default(config_dir: &Path) -> Result<AppConfig> {
    let path = config_dir.join(CONFIG_FILE);
    if path.exists() {
        let raw = std::fs::read_to_string(&path)?;
        let cfg: AppConfig = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Config parse error in {:?}: {}", path, e))?;
        Ok(cfg)
    } else {
        Ok(AppConfig::default())
    }
}

pub fn save(config: &AppConfig, config_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(config_dir)?;
    let raw = toml::to_string_pretty(config)
        .map_err(|e| anyhow::anyhow!("Config serialize error: {}", e))?;
    std::fs::write(config_dir.join(CONFIG_FILE), raw)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Log directory helpers (used by tailer.rs)
// ---------------------------------------------------------------------------

/// Scans `logs_dir` for `<prefix>*.<extension>` files and returns the one
/// with the most recent `modified` timestamp. `None` if nothing matches.
pub fn find_latest_log(logs_dir: &Path, prefix: &str, extension: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(logs_dir).ok()?;

    let mut best: Option<(PathBuf, std::time::SystemTime)> = None;

    for entry in entries.flatten() {
        let path = entry.path();
        if !crate::tailer::is_log_file(&path, prefix, extension) {
            continue;
        }
        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => continue,
        };

        match &best {
            None => best = Some((path, modified)),
            Some((_, best_time)) if modified > *best_time => best = Some((path, modified)),
            _ => {}
        }
    }

    if let Some((ref p, _)) = best {
        tracing::debug!("find_latest_log: selected {:?}", p);
    }
    best.map(|(p, _)| p)
}
