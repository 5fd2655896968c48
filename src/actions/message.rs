use super::{ActionInstance, Failure, Param};
use crate::scope::Scope;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// Writes a rendered message to the engine log, tagged with the trigger.
#[derive(Debug, Clone)]
pub struct LogMessage {
    pub level: LogLevel,
    pub text:  Param,
}

impl LogMessage {
    pub fn new(level: LogLevel, text: Param) -> Self {
        Self { level, text }
    }

    pub fn describe(&self, scope: Option<&Scope>) -> String {
        format!("log message ({}) at {:?} level", self.text.describe(scope), self.level)
    }

    pub fn execute(&self, inst: &mut ActionInstance) -> Result<(), Failure> {
        let text = self.text.text(&inst.scope)?;
        let name = &inst.trigger.name;
        match self.level {
            LogLevel::Trace => tracing::trace!("[{}] {}", name, text),
            LogLevel::Debug => tracing::debug!("[{}] {}", name, text),
            LogLevel::Info  => tracing::info!("[{}] {}", name, text),
            LogLevel::Warn  => tracing::warn!("[{}] {}", name, text),
            LogLevel::Error => tracing::error!("[{}] {}", name, text),
        }
        Ok(())
    }
}
