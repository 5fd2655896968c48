/// Effect delegates: where pipeline effects leave the engine.
///
/// The engine only ever talks to `Effects`. Delivering a keypress to a
/// window, playing a sound or speaking text is the collaborator's job;
/// each call should return within a bounded, implementation-defined time.
/// No engine lock is held while one of these calls is in flight.
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Window targeting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessFilter {
    /// First window whose title matches.
    FirstMatch,
    /// Every window whose title matches.
    All,
    /// Windows of one process whose titles match.
    Process(u32),
}

impl ProcessFilter {
    /// 0 = first match, negative = all, positive = that process.
    pub fn from_id(id: i64) -> Self {
        match id {
            0          => ProcessFilter::FirstMatch,
            i if i < 0 => ProcessFilter::All,
            i          => ProcessFilter::Process(u32::try_from(i).unwrap_or(u32::MAX)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowTarget {
    pub process: ProcessFilter,
    /// Regex on the window title; empty means any title.
    pub title:   String,
}

impl WindowTarget {
    pub fn new(process: ProcessFilter, title: &str) -> Self {
        let title = if title.trim().is_empty() { ".*" } else { title };
        Self { process, title: title.to_owned() }
    }
}

impl fmt::Display for WindowTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.process {
            ProcessFilter::FirstMatch => {
                write!(f, "the first window whose title match ({})", self.title)
            }
            ProcessFilter::All => write!(f, "all windows whose titles match ({})", self.title),
            ProcessFilter::Process(pid) => write!(
                f,
                "windows in the process with id ({}) whose titles match ({})",
                pid, self.title
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Capability trait
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DelegateError {
    #[error("no window matches {0}")]
    WindowNotFound(String),
    #[error("resource '{0}' is unavailable")]
    ResourceUnavailable(String),
    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait Effects: Send + Sync {
    async fn send_keys(&self, keys: &str) -> Result<(), DelegateError>;

    async fn send_window_message(&self, target: &WindowTarget, keycode: i32) -> Result<(), DelegateError>;

    async fn send_window_messages(&self, target: &WindowTarget, keycodes: &[i32]) -> Result<(), DelegateError>;

    /// `volume` is 0–100.
    async fn play_sound(&self, resource: &str, volume: u8) -> Result<(), DelegateError>;

    /// `volume` is 0–100, `rate` is -10–10.
    async fn speak(&self, text: &str, volume: u8, rate: i8) -> Result<(), DelegateError>;
}

// ---------------------------------------------------------------------------
// LoggingEffects: writes every effect to the log instead of a device
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEffects;

#[async_trait]
impl Effects for LoggingEffects {
    async fn send_keys(&self, keys: &str) -> Result<(), DelegateError> {
        tracing::info!("[effect] keys {:?} → active window", keys);
        Ok(())
    }

    async fn send_window_message(&self, target: &WindowTarget, keycode: i32) -> Result<(), DelegateError> {
        tracing::info!("[effect] keycode {} → {}", keycode, target);
        Ok(())
    }

    async fn send_window_messages(&self, target: &WindowTarget, keycodes: &[i32]) -> Result<(), DelegateError> {
        tracing::info!("[effect] keycodes {:?} → {}", keycodes, target);
        Ok(())
    }

    async fn play_sound(&self, resource: &str, volume: u8) -> Result<(), DelegateError> {
        tracing::info!("[effect] sound '{}' at {}%", resource, volume);
        Ok(())
    }

    async fn speak(&self, text: &str, volume: u8, rate: i8) -> Result<(), DelegateError> {
        tracing::info!("[effect] speak {:?} (volume {}%, rate {})", text, volume, rate);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingEffects: test double
// ---------------------------------------------------------------------------

#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Records every call as a short string; window targets show up as
    /// `<process filter>:<title>`. Keys listed in `fail_keys`
    /// make `send_keys` fail.
    #[derive(Debug, Default)]
    pub struct RecordingEffects {
        pub calls:     Mutex<Vec<String>>,
        pub fail_keys: Vec<String>,
    }

    impl RecordingEffects {
        pub fn failing_on(keys: &[&str]) -> Self {
            Self { calls: Mutex::default(), fail_keys: keys.iter().map(|k| k.to_string()).collect() }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl Effects for RecordingEffects {
        async fn send_keys(&self, keys: &str) -> Result<(), DelegateError> {
            self.calls.lock().push(format!("keys:{}", keys));
            if self.fail_keys.iter().any(|k| k == keys) {
                return Err(DelegateError::WindowNotFound("the active window".into()));
            }
            Ok(())
        }

        async fn send_window_message(&self, target: &WindowTarget, keycode: i32) -> Result<(), DelegateError> {
            self.calls.lock().push(format!("keycode:{}:{:?}:{}", keycode, target.process, target.title));
            Ok(())
        }

        async fn send_window_messages(&self, target: &WindowTarget, keycodes: &[i32]) -> Result<(), DelegateError> {
            self.calls.lock().push(format!("keycodes:{:?}:{:?}:{}", keycodes, target.process, target.title));
            Ok(())
        }

        async fn play_sound(&self, resource: &str, volume: u8) -> Result<(), DelegateError> {
            self.calls.lock().push(format!("sound:{}:{}", resource, volume));
            Ok(())
        }

        async fn speak(&self, text: &str, volume: u8, rate: i8) -> Result<(), DelegateError> {
            self.calls.lock().push(format!("speak:{}:{}:{}", text, volume, rate));
            Ok(())
        }
    }
}
