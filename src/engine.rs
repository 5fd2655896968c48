/// The trigger engine: one per process.
///
/// Receives log lines and definition reloads via channels, matches each line
/// against the current registry snapshot, and hands every hit to the
/// scheduler. The line loop never waits on an instance; a trigger whose
/// pipeline is suspended costs the loop nothing.
///
/// Every configuration mutation goes through here so that instances of a
/// trigger that is no longer effectively enabled (disabled, folder disabled,
/// removed) are cancelled as part of the same call.
use crate::{
    delegates::Effects,
    events::EventSink,
    matcher::match_line,
    registry::{Folder, Registry, RegistryError, Snapshot, Trigger, TriggerId},
    scheduler::Scheduler,
    scope::VarTable,
    tailer::LogLine,
};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;

struct Inner {
    registry:  Registry,
    globals:   Arc<VarTable>,
    scheduler: Scheduler,
    shutdown:  CancellationToken,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(
        root:    Folder,
        globals: Arc<VarTable>,
        effects: Arc<dyn Effects>,
        events:  EventSink,
    ) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            inner: Arc::new(Inner {
                registry: Registry::with_shutdown(root, shutdown.clone()),
                globals,
                scheduler: Scheduler::new(effects, events),
                shutdown,
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn globals(&self) -> &Arc<VarTable> {
        &self.inner.globals
    }

    // -----------------------------------------------------------------------
    // Hot path
    // -----------------------------------------------------------------------

    /// Match one line and start an instance for every admitted hit.
    /// Returns how many instances were started.
    pub fn process_line(&self, line: &LogLine) -> usize {
        if self.inner.shutdown.is_cancelled() {
            return 0;
        }
        let snapshot = self.inner.registry.snapshot();
        let line_ms = line.timestamp_ms();

        match_line(&snapshot, &self.inner.registry, &self.inner.globals, &line.text)
            .into_iter()
            .filter_map(|m| self.inner.scheduler.start(m, line_ms, &self.inner.registry).ok())
            .count()
    }

    // -----------------------------------------------------------------------
    // Configuration surface
    // -----------------------------------------------------------------------

    pub fn replace_tree(&self, root: Folder) {
        let (old, new) = self.inner.registry.replace(root);
        tracing::info!(
            "Trigger tree replaced: generation {} → {}, {} trigger(s)",
            old.generation(),
            new.generation(),
            new.entries().len()
        );
        self.reconcile(&new);
    }

    pub fn add_trigger(&self, folder_path: &[&str], trigger: Trigger) -> Result<(), RegistryError> {
        for problem in &trigger.problems {
            tracing::warn!("Trigger '{}' [{}] will not match: {}", trigger.name, trigger.id, problem);
        }
        self.inner.registry.add_trigger(folder_path, trigger)
    }

    pub fn remove_trigger(&self, id: &TriggerId) -> Result<(), RegistryError> {
        self.inner.registry.remove_trigger(id)?;
        self.reconcile(&self.inner.registry.snapshot());
        Ok(())
    }

    pub fn set_trigger_enabled(&self, id: &TriggerId, enabled: bool) -> Result<(), RegistryError> {
        self.inner.registry.set_trigger_enabled(id, enabled)?;
        self.reconcile(&self.inner.registry.snapshot());
        Ok(())
    }

    pub fn set_folder_enabled(&self, path: &[&str], enabled: bool) -> Result<(), RegistryError> {
        self.inner.registry.set_folder_enabled(path, enabled)?;
        self.reconcile(&self.inner.registry.snapshot());
        Ok(())
    }

    pub fn set_priority(&self, id: &TriggerId, priority: i32) -> Result<(), RegistryError> {
        self.inner.registry.set_priority(id, priority)
    }

    /// Cancel in-flight instances of triggers that are no longer effectively
    /// enabled, and drop runtime state of triggers that are gone.
    fn reconcile(&self, snapshot: &Snapshot) {
        for (id, runtime) in self.inner.registry.runtimes() {
            if !snapshot.is_effectively_enabled(&id) {
                if runtime.active() > 0 {
                    tracing::info!("Cancelling {} instance(s) of '{}'", runtime.active(), id);
                }
                runtime.cancel_all();
            }
        }
        for (id, _) in self.inner.registry.prune_runtimes(snapshot) {
            tracing::debug!("Dropped runtime state of removed trigger '{}'", id);
        }
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Cancel every in-flight instance of `id`. Returns false for an id that
    /// has never run.
    pub fn cancel_trigger(&self, id: &TriggerId) -> bool {
        match self.inner.registry.existing_runtime(id) {
            Some(runtime) => {
                runtime.cancel_all();
                true
            }
            None => false,
        }
    }

    /// Stop all trigger activity. New lines keep being processed.
    pub fn stop_all(&self) {
        let runtimes = self.inner.registry.runtimes();
        tracing::info!("Stopping all trigger activity ({} trigger(s))", runtimes.len());
        for (_, runtime) in runtimes {
            runtime.cancel_all();
        }
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn active_instances(&self, id: &TriggerId) -> u32 {
        self.inner.registry.existing_runtime(id).map_or(0, |rt| rt.active())
    }

    pub fn describe_trigger(&self, id: &TriggerId) -> Option<String> {
        let snapshot = self.inner.registry.snapshot();
        let entry = snapshot.get(id)?;
        let mut out = entry.trigger.describe();
        if entry.trigger.enabled && !entry.effective_enabled {
            out.push_str("\n  (inactive: a parent folder is disabled)");
        }
        let active = self.active_instances(id);
        if active > 0 {
            out.push_str(&format!("\n  {} instance(s) running", active));
        }
        Some(out)
    }

    /// Wait for every running instance to reach a terminal state.
    pub async fn wait_idle(&self) {
        self.inner.scheduler.wait_idle().await;
    }

    /// Cancel everything and wait for the instances to wind down.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.scheduler.wait_idle().await;
        tracing::info!("Engine stopped");
    }
}

// ---------------------------------------------------------------------------
// Main engine task
// ---------------------------------------------------------------------------

pub async fn run(
    engine:      Engine,
    mut line_rx: Receiver<LogLine>,
    mut tree_rx: Receiver<Folder>,
) -> Result<()> {
    loop {
        tokio::select! {
            biased;

            // Reloads are rare: apply before the next line
            Some(root) = tree_rx.recv() => engine.replace_tree(root),

            // Log lines: the hot path
            Some(line) = line_rx.recv() => {
                engine.process_line(&line);
            }

            else => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        actions::{Action, Keypress, Param, SetVariable, Wait},
        delegates::testing::RecordingEffects,
        expr::Value,
        scope::Tier,
    };
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn keys(k: &str) -> Action {
        Action::Keypress(Keypress::send_keys(Param::literal(k)))
    }

    fn engine_with(root: Folder) -> (Engine, Arc<RecordingEffects>) {
        let fx = Arc::new(RecordingEffects::default());
        (Engine::new(root, VarTable::new(), fx.clone(), EventSink::disabled()), fx)
    }

    fn line(text: &str) -> LogLine {
        LogLine::new(text)
    }

    #[tokio::test(start_paused = true)]
    async fn boss_hp_scenario() {
        let root = Folder::root().with_trigger(
            Trigger::new("boss-low", "Boss low", r"Boss HP: (?<hp>\d+)%")
                .condition("hp < 20")
                .actions(vec![Action::Keypress(Keypress::send_keys(
                    Param::template("/p boss at ${hp}").unwrap(),
                ))]),
        );
        let (engine, fx) = engine_with(root);

        assert_eq!(engine.process_line(&line("Boss HP: 45%")), 0);
        assert_eq!(engine.process_line(&line("Boss HP: 15%")), 1);
        engine.wait_idle().await;
        assert_eq!(fx.calls(), vec!["keys:/p boss at 15"]);
    }

    #[tokio::test(start_paused = true)]
    async fn global_counter_is_shared_across_triggers() {
        let bump = Action::SetVariable(SetVariable::new(
            "counter",
            Param::expression("counter + 1").unwrap(),
            Tier::Global,
        ));
        let root = Folder::root()
            .with_trigger(Trigger::new("count", "count pulls", "pull").actions(vec![bump]))
            .with_trigger(
                Trigger::new("first", "first pull", "check")
                    .condition("counter == 1")
                    .actions(vec![keys("first")]),
            );
        let (engine, fx) = engine_with(root);

        engine.process_line(&line("pull"));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(engine.globals().get("counter"), Some(Value::Number(1.0)));

        assert_eq!(engine.process_line(&line("check")), 1);
        engine.wait_idle().await;
        assert_eq!(fx.calls(), vec!["keys:first"]);
    }

    #[tokio::test(start_paused = true)]
    async fn disabling_a_trigger_cancels_its_instances() {
        let root = Folder::root().with_folder(
            Folder::new("raid").with_trigger(
                Trigger::new("t", "t", "go").actions(vec![
                    Action::Wait(Wait::new(Param::literal("5000"))),
                    keys("late"),
                ]),
            ),
        );
        let (engine, fx) = engine_with(root);
        let id: TriggerId = "t".into();

        engine.process_line(&line("go"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.active_instances(&id), 1);

        engine.set_folder_enabled(&["raid"], false).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.active_instances(&id), 0);
        assert_eq!(engine.process_line(&line("go")), 0);

        engine.set_folder_enabled(&["raid"], true).unwrap();
        assert_eq!(engine.process_line(&line("go")), 1);
        engine.stop_all();
        engine.shutdown().await;
        assert!(fx.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_trigger_leaves_it_enabled() {
        let root = Folder::root().with_trigger(Trigger::new("t", "t", "go").actions(vec![
            Action::Wait(Wait::new(Param::literal("5000"))),
            keys("late"),
        ]));
        let (engine, fx) = engine_with(root);
        let id: TriggerId = "t".into();

        assert!(!engine.cancel_trigger(&id));
        engine.process_line(&line("go"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(engine.cancel_trigger(&id));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.active_instances(&id), 0);
        assert!(fx.calls().is_empty());

        assert_eq!(engine.process_line(&line("go")), 1);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn removing_a_trigger_drops_its_state() {
        let root = Folder::root().with_trigger(
            Trigger::new("t", "t", "go")
                .actions(vec![Action::Wait(Wait::new(Param::literal("1000")))]),
        );
        let (engine, _) = engine_with(root);
        let id: TriggerId = "t".into();

        engine.process_line(&line("go"));
        engine.remove_trigger(&id).unwrap();
        assert!(engine.registry().existing_runtime(&id).is_none());
        assert!(engine.describe_trigger(&id).is_none());
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_applies_reloads_and_lines() {
        let (engine, fx) = engine_with(Folder::root());
        let (line_tx, line_rx) = mpsc::channel(8);
        let (tree_tx, tree_rx) = mpsc::channel(1);
        let task = tokio::spawn(run(engine.clone(), line_rx, tree_rx));

        tree_tx
            .send(Folder::root().with_trigger(Trigger::new("t", "t", "ping").actions(vec![keys("pong")])))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        line_tx.send(line("ping")).await.unwrap();

        drop(line_tx);
        drop(tree_tx);
        task.await.unwrap().unwrap();
        engine.wait_idle().await;
        assert_eq!(fx.calls(), vec!["keys:pong"]);
    }

    #[test]
    fn describe_notes_disabled_folder() {
        let root = Folder::root().with_folder(
            Folder::new("misc").enabled(false).with_trigger(Trigger::new("t", "Pull timer", "pull")),
        );
        let (engine, _) = engine_with(root);
        let d = engine.describe_trigger(&"t".into()).unwrap();
        assert!(d.contains("Pull timer"));
        assert!(d.contains("parent folder is disabled"));
    }
}
