/// One running instance of a trigger's action list.
///
/// The cursor is an explicit frame stack: the trigger's top-level sequence
/// at the bottom, one frame per entered conditional branch or repeat body
/// above it. Suspension is an `.await` on a tokio timer raced against the
/// instance's cancellation token, so a suspended instance costs a parked
/// future and nothing else.
use super::{control::RepeatState, Action, Failure, FailureKind, Outcome, Repeat};
use crate::{
    delegates::Effects,
    events::{EngineEvent, EventSink},
    registry::Trigger,
    scope::Scope,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Terminal state of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceEnd {
    Completed,
    /// Ended early by a stop node; counts as completed.
    Stopped,
    Cancelled,
    Failed(String),
}

enum FrameKind {
    Sequence,
    Repeat(Arc<Repeat>, RepeatState),
}

struct Frame {
    actions: Arc<[Action]>,
    next:    usize,
    kind:    FrameKind,
}

enum Step {
    Node(Arc<[Action]>, usize),
    Pause(Duration),
    Continue,
    Done,
    Failed(Failure),
}

pub struct ActionInstance {
    pub id:      u64,
    pub trigger: Arc<Trigger>,
    pub scope:   Scope,
    pub started: Instant,
    pub effects: Arc<dyn Effects>,
    cancel:      CancellationToken,
    events:      EventSink,
    frames:      Vec<Frame>,
}

impl ActionInstance {
    pub fn new(
        id:      u64,
        trigger: Arc<Trigger>,
        scope:   Scope,
        cancel:  CancellationToken,
        effects: Arc<dyn Effects>,
        events:  EventSink,
    ) -> Self {
        let top = Frame { actions: trigger.actions.clone(), next: 0, kind: FrameKind::Sequence };
        Self {
            id,
            trigger,
            scope,
            started: Instant::now(),
            effects,
            cancel,
            events,
            frames: vec![top],
        }
    }

    pub(crate) fn push_sequence(&mut self, actions: Arc<[Action]>) {
        self.frames.push(Frame { actions, next: 0, kind: FrameKind::Sequence });
    }

    pub(crate) fn push_repeat(&mut self, node: Arc<Repeat>, state: RepeatState) {
        let actions = node.body.clone();
        self.frames.push(Frame { actions, next: 0, kind: FrameKind::Repeat(node, state) });
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drive the instance to a terminal state.
    pub async fn run(mut self) -> InstanceEnd {
        loop {
            if self.cancel.is_cancelled() {
                return InstanceEnd::Cancelled;
            }

            match self.step() {
                Step::Done => return InstanceEnd::Completed,
                Step::Continue => {}
                Step::Failed(f) => return self.failed(f),
                Step::Pause(d) if d.is_zero() => tokio::task::yield_now().await,
                Step::Pause(d) => {
                    if !self.suspend(d).await {
                        return InstanceEnd::Cancelled;
                    }
                }
                Step::Node(actions, index) => {
                    let action = &actions[index];
                    match action.execute(&mut self).await {
                        Outcome::Completed => {}
                        Outcome::Suspended(d) => {
                            if !self.suspend(d).await {
                                return InstanceEnd::Cancelled;
                            }
                        }
                        Outcome::Failed(f) if f.kind == FailureKind::Delegate => {
                            self.action_failed(action, f);
                        }
                        Outcome::Failed(f) => return self.failed(f),
                        Outcome::Stopped => return InstanceEnd::Stopped,
                    }
                }
            }
        }
    }

    /// Next thing to do at the cursor. Finishing a repeat body either
    /// rewinds it for another iteration or pops it.
    fn step(&mut self) -> Step {
        let Some(frame) = self.frames.last_mut() else {
            return Step::Done;
        };

        if frame.next < frame.actions.len() {
            let index = frame.next;
            frame.next += 1;
            return Step::Node(frame.actions.clone(), index);
        }

        let FrameKind::Repeat(node, state) = &mut frame.kind else {
            self.frames.pop();
            return Step::Continue;
        };
        match node.advance(state, &mut self.scope) {
            Ok(Some(pause)) => {
                frame.next = 0;
                Step::Pause(pause)
            }
            Ok(None) => {
                self.frames.pop();
                Step::Continue
            }
            Err(f) => Step::Failed(f),
        }
    }

    /// False when cancelled before the timer fired.
    async fn suspend(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled()        => false,
            _ = tokio::time::sleep(duration)   => true,
        }
    }

    fn action_failed(&self, action: &Action, failure: Failure) {
        tracing::warn!(
            "Trigger '{}' [{}] instance {}: {} action failed: {}",
            self.trigger.name, self.trigger.id, self.id, action.kind(), failure.reason
        );
        self.events.emit(EngineEvent::ActionFailed {
            trigger_id:  self.trigger.id.clone(),
            instance_id: self.id,
            action:      action.describe(Some(&self.scope)),
            reason:      failure.reason,
        });
    }

    fn failed(&self, failure: Failure) -> InstanceEnd {
        tracing::warn!(
            "Trigger '{}' [{}] instance {} failed: {}",
            self.trigger.name, self.trigger.id, self.id, failure.reason
        );
        InstanceEnd::Failed(failure.reason)
    }
}
