/// Execution scheduler: admits matches and runs their instances.
///
/// Per-trigger lifecycle: Idle → Admitting → Running(1..max) → Idle.
/// Admission is a single check-and-record under the trigger's admission
/// lock; everything after it runs in a spawned task. The slot taken at
/// admission is a drop guard, so it is released on every terminal path,
/// including a panic inside the pipeline.
use crate::{
    actions::{ActionInstance, InstanceEnd},
    delegates::Effects,
    events::{EndReason, EngineEvent, EventSink},
    matcher::Match,
    registry::{AdmissionRejected, Registry, TriggerRuntime},
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;

/// An admitted instance's claim on its trigger's concurrency budget.
struct Slot {
    runtime: Arc<TriggerRuntime>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.runtime.release();
    }
}

pub struct Scheduler {
    effects: Arc<dyn Effects>,
    events:  EventSink,
    next_id: AtomicU64,
    tracker: TaskTracker,
}

impl Scheduler {
    pub fn new(effects: Arc<dyn Effects>, events: EventSink) -> Self {
        Self {
            effects,
            events,
            next_id: AtomicU64::new(1),
            tracker: TaskTracker::new(),
        }
    }

    /// Admit `m` and spawn its instance. Never waits for the instance.
    /// Returns the new instance id.
    ///
    /// `m` was matched against a snapshot that may be stale by now. The
    /// token is taken before the trigger is looked up again in the current
    /// snapshot, so a disable that lands after the look-up still cancels
    /// this instance through `cancel_all`.
    pub fn start(&self, m: Match, line_ms: u64, registry: &Registry) -> Result<u64, AdmissionRejected> {
        let Match { trigger, runtime, scope, .. } = m;

        if let Err(rejected) = runtime.try_admit(trigger.max_instances, trigger.suppress, Instant::now()) {
            tracing::trace!("Trigger '{}' not admitted: {:?}", trigger.name, rejected);
            return Err(rejected);
        }
        let slot = Slot { runtime: runtime.clone() };
        let cancel = runtime.token();

        let current = registry.snapshot();
        if !current.is_effectively_enabled(&trigger.id) {
            drop(slot);
            // matching may have re-created the runtime of a removed trigger
            if current.get(&trigger.id).is_none() {
                registry.prune_runtimes(&current);
            }
            tracing::trace!("Trigger '{}' disabled before admission", trigger.name);
            return Err(AdmissionRejected::Disabled);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let instance = ActionInstance::new(
            id,
            trigger.clone(),
            scope,
            cancel,
            self.effects.clone(),
            self.events.clone(),
        );

        tracing::debug!("Trigger '{}' [{}] fired → instance {}", trigger.name, trigger.id, id);
        self.events.emit(EngineEvent::Fired {
            trigger_id:  trigger.id.clone(),
            instance_id: id,
            line_ms,
        });

        let events = self.events.clone();
        self.tracker.spawn(async move {
            let end = instance.run().await;
            // free the slot before anyone can observe the terminal event
            drop(slot);

            tracing::debug!("Trigger '{}' instance {} ended: {:?}", trigger.name, id, end);
            let trigger_id = trigger.id.clone();
            events.emit(match end {
                InstanceEnd::Completed => EngineEvent::Completed {
                    trigger_id, instance_id: id, reason: EndReason::Completed,
                },
                InstanceEnd::Stopped => EngineEvent::Completed {
                    trigger_id, instance_id: id, reason: EndReason::Stopped,
                },
                InstanceEnd::Cancelled => EngineEvent::Completed {
                    trigger_id, instance_id: id, reason: EndReason::Cancelled,
                },
                InstanceEnd::Failed(reason) => EngineEvent::Failed {
                    trigger_id, instance_id: id, reason,
                },
            });
        });

        Ok(id)
    }

    /// Instances spawned and not yet finished.
    pub fn running(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for every spawned instance to finish. Cancel them first, or this
    /// waits for their pipelines to run out.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}
