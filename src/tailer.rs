/// Tails the telemetry log, emitting complete new lines as they are written.
///
/// Uses the `notify` crate to detect file modifications, then reads from the
/// last known byte offset. Only lines terminated by `\n` are emitted; a
/// partially written line stays unread until its terminator arrives.
///
/// Rotation handling: when the file shrinks below our position it was
/// truncated or recreated, so we restart from byte 0. When `log_path` is a
/// directory, the newest matching file is followed and a newly created one
/// takes over.
use crate::config::{find_latest_log, AppConfig};
use anyhow::Result;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc::Sender;

/// One line as delivered to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub timestamp: SystemTime,
    pub text:      String,
}

impl LogLine {
    /// A line stamped with the current time.
    pub fn new(text: impl Into<String>) -> Self {
        Self { timestamp: SystemTime::now(), text: text.into() }
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

pub struct TailerState {
    path:     PathBuf,
    position: u64,
}

impl TailerState {
    fn new(path: PathBuf) -> Self {
        Self { path, position: 0 }
    }

    /// Start at the current end of the file, skipping what is already there.
    fn at_end(path: PathBuf) -> Self {
        let position = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Self { path, position }
    }

    /// Returns false once the receiver is gone.
    fn read_new_lines(&mut self, tx: &Sender<LogLine>) -> Result<bool> {
        let file_len = match std::fs::metadata(&self.path) {
            Ok(m) => m.len(),
            Err(_) => return Ok(true), // not created yet: wait
        };

        if file_len < self.position {
            tracing::info!("Log rotation detected: restarting from byte 0");
            self.position = 0;
        }
        if file_len == self.position {
            return Ok(true);
        }

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.position))?;
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf)?;
            if n == 0 || buf.last() != Some(&b'\n') {
                break; // EOF, possibly mid-line
            }
            self.position += n as u64;

            let text = String::from_utf8_lossy(&buf);
            let text = text.trim_end_matches(['\n', '\r']);
            if text.is_empty() {
                continue;
            }
            if tx.blocking_send(LogLine::new(text)).is_err() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn switch_to(&mut self, path: PathBuf) {
        tracing::info!("Following new log file {:?}", path);
        self.path = path;
        self.position = 0;
    }
}

/// Which file to follow for `config.log_path`, and the directory to watch.
fn resolve(config: &AppConfig) -> (Option<PathBuf>, PathBuf) {
    let path = &config.log_path;
    if path.is_dir() {
        let file = find_latest_log(path, &config.log_file_prefix, &config.log_file_extension);
        (file, path.clone())
    } else {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        (Some(path.clone()), dir.to_path_buf())
    }
}

/// Blocking; run it on a dedicated thread. Returns when `tx` is closed.
pub fn run(config: AppConfig, tx: Sender<LogLine>) -> Result<()> {
    let follow_dir = config.log_path.is_dir();
    let (file, watch_dir) = resolve(&config);
    tracing::info!("Tailer starting: {:?} (watching {:?})", file, watch_dir);

    let (fs_tx, fs_rx) = std_mpsc::channel::<notify::Result<Event>>();
    let notify_config = notify::Config::default().with_poll_interval(Duration::from_millis(500));
    let mut watcher = RecommendedWatcher::new(fs_tx, notify_config)?;
    watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;

    let mut state = match file {
        Some(f) if config.read_existing => TailerState::new(f),
        Some(f) => TailerState::at_end(f),
        None => TailerState::new(PathBuf::new()),
    };
    if !state.read_new_lines(&tx)? {
        return Ok(());
    }

    loop {
        match fs_rx.recv_timeout(Duration::from_millis(500)) {
            Ok(Ok(Event { kind: EventKind::Create(_), paths, .. })) if follow_dir => {
                let newest = paths
                    .into_iter()
                    .find(|p| is_log_file(p, &config.log_file_prefix, &config.log_file_extension));
                if let Some(p) = newest {
                    state.switch_to(p);
                }
            }
            Ok(Ok(Event { kind: EventKind::Create(_) | EventKind::Modify(_), paths, .. })) => {
                if paths.iter().any(|p| p == &state.path) {
                    match state.read_new_lines(&tx) {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => tracing::warn!("Tailer read error: {}", e),
                    }
                }
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::error!("Watcher error: {}", e),
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                if tx.is_closed() {
                    break;
                }
            }
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                tracing::warn!("Watcher channel closed: tailer exiting");
                break;
            }
        }
    }
    tracing::info!("Tailer stopped");
    Ok(())
}

pub(crate) fn is_log_file(path: &Path, prefix: &str, extension: &str) -> bool {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
        return false;
    };
    name.starts_with(prefix)
        && path.extension().is_some_and(|e| e.eq_ignore_ascii_case(extension))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tokio::sync::mpsc;

    fn drain(rx: &mut mpsc::Receiver<LogLine>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(line) = rx.try_recv() {
            out.push(line.text);
        }
        out
    }

    #[test]
    fn reads_initial_lines() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "line one").unwrap();
        writeln!(f, "line two").unwrap();
        f.flush().unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let mut state = TailerState::new(f.path().to_path_buf());
        assert!(state.read_new_lines(&tx).unwrap());
        assert_eq!(drain(&mut rx), vec!["line one", "line two"]);
    }

    #[test]
    fn holds_back_partial_lines() {
        let mut f = NamedTempFile::new().unwrap();
        write!(f, "Boss HP: 1").unwrap();
        f.flush().unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let mut state = TailerState::new(f.path().to_path_buf());
        state.read_new_lines(&tx).unwrap();
        assert!(drain(&mut rx).is_empty());

        writeln!(f, "5%\r").unwrap();
        f.flush().unwrap();
        state.read_new_lines(&tx).unwrap();
        assert_eq!(drain(&mut rx), vec!["Boss HP: 15%"]);
    }

    #[test]
    fn at_end_skips_existing_content() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "old").unwrap();
        f.flush().unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let mut state = TailerState::at_end(f.path().to_path_buf());
        writeln!(f, "new").unwrap();
        f.flush().unwrap();
        state.read_new_lines(&tx).unwrap();
        assert_eq!(drain(&mut rx), vec!["new"]);
    }

    #[test]
    fn detects_rotation() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "original content").unwrap();
        f.flush().unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let mut state = TailerState::new(f.path().to_path_buf());
        state.read_new_lines(&tx).unwrap();
        drain(&mut rx);

        // Simulate rotation: overwrite with shorter content
        let mut f2 = std::fs::File::create(f.path()).unwrap();
        writeln!(f2, "new").unwrap();
        f2.flush().unwrap();

        state.read_new_lines(&tx).unwrap();
        assert_eq!(drain(&mut rx), vec!["new"]);
    }

    #[test]
    fn stops_when_receiver_is_gone() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "a").unwrap();
        f.flush().unwrap();

        let (tx, rx) = mpsc::channel(16);
        drop(rx);
        let mut state = TailerState::new(f.path().to_path_buf());
        assert!(!state.read_new_lines(&tx).unwrap());
    }

    #[test]
    fn log_file_filter() {
        assert!(is_log_file(Path::new("/logs/Network_2024.log"), "Network_", "log"));
        assert!(!is_log_file(Path::new("/logs/Network_2024.txt"), "Network_", "log"));
        assert!(!is_log_file(Path::new("/logs/Other.log"), "Network_", "log"));
    }
}
