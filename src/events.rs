/// Engine event stream: admission and execution notifications for
/// diagnostics and UI binding.
///
/// Producers never wait on the consumer: events go through a bounded
/// channel with `try_send` and are dropped when the relay falls behind.
/// The relay task logs every event and keeps the most recent ones in a
/// ring buffer that can be polled.
use crate::registry::TriggerId;
use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc::{error::TrySendError, Receiver, Sender};

// ---------------------------------------------------------------------------
// Payload types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Ran off the end of the pipeline.
    Completed,
    /// A stop node ended it early.
    Stopped,
    /// Cancelled from outside (stop-all, disable, remove).
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Fired {
        trigger_id:  TriggerId,
        instance_id: u64,
        /// Line timestamp, ms since the Unix epoch.
        line_ms:     u64,
    },
    Completed {
        trigger_id:  TriggerId,
        instance_id: u64,
        reason:      EndReason,
    },
    Failed {
        trigger_id:  TriggerId,
        instance_id: u64,
        reason:      String,
    },
    ActionFailed {
        trigger_id:  TriggerId,
        instance_id: u64,
        action:      String,
        reason:      String,
    },
}

impl EngineEvent {
    pub fn trigger_id(&self) -> &TriggerId {
        match self {
            EngineEvent::Fired { trigger_id, .. }
            | EngineEvent::Completed { trigger_id, .. }
            | EngineEvent::Failed { trigger_id, .. }
            | EngineEvent::ActionFailed { trigger_id, .. } => trigger_id,
        }
    }

    pub fn instance_id(&self) -> u64 {
        match self {
            EngineEvent::Fired { instance_id, .. }
            | EngineEvent::Completed { instance_id, .. }
            | EngineEvent::Failed { instance_id, .. }
            | EngineEvent::ActionFailed { instance_id, .. } => *instance_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Sink: the producer side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<Sender<EngineEvent>>,
}

impl EventSink {
    pub fn new(tx: Sender<EngineEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: EngineEvent) {
        let Some(tx) = &self.tx else { return };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(ev)) => {
                tracing::trace!("Event channel full: dropping {:?}", ev);
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// EventLog: polled ring buffer
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct EventLog {
    events:   Mutex<VecDeque<EngineEvent>>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self { events: Mutex::new(VecDeque::with_capacity(capacity)), capacity: capacity.max(1) })
    }

    pub fn push(&self, event: EngineEvent) {
        let mut q = self.events.lock();
        q.push_back(event);
        while q.len() > self.capacity {
            q.pop_front();
        }
    }

    /// Copy of the buffered events, oldest first.
    pub fn recent(&self) -> Vec<EngineEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Take every buffered event, oldest first.
    pub fn drain(&self) -> Vec<EngineEvent> {
        self.events.lock().drain(..).collect()
    }
}

// ---------------------------------------------------------------------------
// Relay task
// ---------------------------------------------------------------------------

/// Drains the event channel into the log and the ring buffer. Returns when
/// every sender is gone.
pub async fn run(mut rx: Receiver<EngineEvent>, log: Arc<EventLog>) -> Result<()> {
    while let Some(event) = rx.recv().await {
        match &event {
            EngineEvent::Failed { .. } | EngineEvent::ActionFailed { .. } => {
                tracing::warn!("event: {}", serde_json::to_string(&event)?);
            }
            _ => tracing::debug!("event: {}", serde_json::to_string(&event)?),
        }
        log.push(event);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn completed(id: u64) -> EngineEvent {
        EngineEvent::Completed { trigger_id: "t".into(), instance_id: id, reason: EndReason::Completed }
    }

    #[test]
    fn serializes_with_type_tag() {
        let ev = EngineEvent::ActionFailed {
            trigger_id:  "pull".into(),
            instance_id: 7,
            action:      "keypress".into(),
            reason:      "no window".into(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains(r#""type":"action_failed""#));
        assert!(json.contains(r#""trigger_id":"pull""#));

        let back: EngineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn ring_buffer_keeps_newest() {
        let log = EventLog::new(3);
        for i in 0..5 {
            log.push(completed(i));
        }
        let ids: Vec<u64> = log.recent().iter().map(|e| e.instance_id()).collect();
        assert_eq!(ids, vec![2, 3, 4]);
        assert_eq!(log.drain().len(), 3);
        assert!(log.recent().is_empty());
    }

    #[test]
    fn full_channel_drops_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = EventSink::new(tx);
        sink.emit(completed(1));
        sink.emit(completed(2));
        assert_eq!(rx.try_recv().unwrap().instance_id(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn relay_fills_the_log() {
        let (tx, rx) = mpsc::channel(8);
        let log = EventLog::new(10);
        let relay = tokio::spawn(run(rx, log.clone()));
        let sink = EventSink::new(tx);
        sink.emit(completed(1));
        drop(sink);
        relay.await.unwrap().unwrap();
        assert_eq!(log.recent(), vec![completed(1)]);
    }
}
