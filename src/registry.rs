/// Trigger registry: the folder/trigger tree plus per-trigger runtime state.
///
/// The tree is copy-on-write: every mutation builds a new immutable
/// `Snapshot` and swaps it in. Matching that already loaded the previous
/// snapshot finishes against it; the next line sees the new one.
///
/// Runtime state (admission counters, trigger-tier variables, cancellation)
/// lives beside the snapshot in a map keyed by trigger id, so it survives
/// snapshot replacement.
use crate::{
    actions::{describe_pipeline, Action},
    error::CompileError,
    expr::Expression,
    matcher::CompiledPattern,
    scope::VarTable,
};
use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerId(String);

impl TriggerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TriggerId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for TriggerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Trigger {
    pub id:             TriggerId,
    pub name:           String,
    pub pattern_source: String,
    pub pattern:        Option<CompiledPattern>,
    pub condition:      Option<Expression>,
    pub actions:        Arc<[Action]>,
    pub enabled:        bool,
    /// Maximum simultaneously running instances (at least 1).
    pub max_instances:  u32,
    /// Minimum time between two admitted instances.
    pub suppress:       Duration,
    /// Lower runs first within a folder.
    pub priority:       i32,
    /// Edit-time problems; any entry keeps the trigger from matching.
    pub problems:       Vec<CompileError>,
}

impl Trigger {
    /// Compiles `pattern` immediately; a bad pattern is recorded as a problem.
    pub fn new(id: impl Into<TriggerId>, name: impl Into<String>, pattern: &str) -> Self {
        let (compiled, problems) = match CompiledPattern::compile(pattern) {
            Ok(p)  => (Some(p), Vec::new()),
            Err(e) => (None, vec![e]),
        };
        Self {
            id:             id.into(),
            name:           name.into(),
            pattern_source: pattern.to_owned(),
            pattern:        compiled,
            condition:      None,
            actions:        Arc::from(Vec::new()),
            enabled:        true,
            max_instances:  1,
            suppress:       Duration::ZERO,
            priority:       0,
            problems,
        }
    }

    pub fn condition(mut self, source: &str) -> Self {
        match Expression::parse(source) {
            Ok(expr) => self.condition = Some(expr),
            Err(e)   => self.problems.push(CompileError::expression("condition", source, e)),
        }
        self
    }

    pub fn with_condition(mut self, condition: Option<Expression>) -> Self {
        self.condition = condition;
        self
    }

    pub fn actions(mut self, actions: Vec<Action>) -> Self {
        self.actions = Arc::from(actions);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn max_instances(mut self, n: u32) -> Self {
        self.max_instances = n.max(1);
        self
    }

    pub fn suppress(mut self, interval: Duration) -> Self {
        self.suppress = interval;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn problem(mut self, problem: CompileError) -> Self {
        self.problems.push(problem);
        self
    }

    pub fn is_matchable(&self) -> bool {
        self.pattern.is_some() && self.problems.is_empty()
    }

    pub fn capture_names(&self) -> &[String] {
        self.pattern.as_ref().map(|p| p.capture_names()).unwrap_or(&[])
    }

    /// Human-readable rendering for diagnostics.
    pub fn describe(&self) -> String {
        let mut out = format!("trigger '{}' [{}]", self.name, self.id);
        if !self.enabled {
            out.push_str(" (disabled)");
        }
        out.push_str(&format!(": when a line matches /{}/", self.pattern_source));
        if let Some(c) = &self.condition {
            out.push_str(&format!(" and ({}) holds", c));
        }
        out.push_str(&format!(
            ", run {} action(s) (max {} concurrent",
            self.actions.len(),
            self.max_instances
        ));
        if !self.suppress.is_zero() {
            out.push_str(&format!(", suppress {}ms", self.suppress.as_millis()));
        }
        out.push(')');
        describe_pipeline(&self.actions, None, 1, &mut out);
        for p in &self.problems {
            out.push_str(&format!("\n  ! {}", p));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Folder tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Folder {
    pub name:     String,
    pub enabled:  bool,
    pub priority: i32,
    pub triggers: Vec<Arc<Trigger>>,
    pub folders:  Vec<Folder>,
}

impl Folder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name:     name.into(),
            enabled:  true,
            priority: 0,
            triggers: Vec::new(),
            folders:  Vec::new(),
        }
    }

    pub fn root() -> Self {
        Self::new("")
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(Arc::new(trigger));
        self
    }

    pub fn with_folder(mut self, folder: Folder) -> Self {
        self.folders.push(folder);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Path of child folder names below this one; empty = this folder.
    pub fn folder_mut(&mut self, path: &[&str]) -> Option<&mut Folder> {
        match path.split_first() {
            None => Some(self),
            Some((head, rest)) => self
                .folders
                .iter_mut()
                .find(|f| f.name == *head)?
                .folder_mut(rest),
        }
    }

    pub fn trigger_mut(&mut self, id: &TriggerId) -> Option<&mut Arc<Trigger>> {
        if let Some(pos) = self.triggers.iter().position(|t| &t.id == id) {
            return self.triggers.get_mut(pos);
        }
        self.folders.iter_mut().find_map(|f| f.trigger_mut(id))
    }

    pub fn remove_trigger(&mut self, id: &TriggerId) -> Option<Arc<Trigger>> {
        if let Some(pos) = self.triggers.iter().position(|t| &t.id == id) {
            return Some(self.triggers.remove(pos));
        }
        self.folders.iter_mut().find_map(|f| f.remove_trigger(id))
    }

    pub fn contains(&self, id: &TriggerId) -> bool {
        self.triggers.iter().any(|t| &t.id == id) || self.folders.iter().any(|f| f.contains(id))
    }

    /// Depth-first in registry order: this folder's triggers by priority,
    /// then its subfolders by priority. Both sorts are stable.
    fn flatten(&self, parent_enabled: bool, out: &mut Vec<Entry>) {
        let enabled = parent_enabled && self.enabled;

        let mut triggers: Vec<&Arc<Trigger>> = self.triggers.iter().collect();
        triggers.sort_by_key(|t| t.priority);
        for t in triggers {
            out.push(Entry { trigger: t.clone(), effective_enabled: enabled && t.enabled });
        }

        let mut folders: Vec<&Folder> = self.folders.iter().collect();
        folders.sort_by_key(|f| f.priority);
        for f in folders {
            f.flatten(enabled, out);
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Entry {
    pub trigger:           Arc<Trigger>,
    /// Own flag AND every ancestor folder's flag.
    pub effective_enabled: bool,
}

/// Immutable view of the tree. Traversal order and effective enablement are
/// derived once from the tree when the snapshot is built.
#[derive(Debug)]
pub struct Snapshot {
    root:       Folder,
    entries:    Vec<Entry>,
    index:      HashMap<TriggerId, usize>,
    generation: u64,
}

impl Snapshot {
    fn build(root: Folder, generation: u64) -> Self {
        let mut entries = Vec::new();
        root.flatten(true, &mut entries);
        let index = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.trigger.id.clone(), i))
            .collect();
        Self { root, entries, index, generation }
    }

    pub fn root(&self) -> &Folder {
        &self.root
    }

    /// Ordered traversal: the only iteration surface.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn get(&self, id: &TriggerId) -> Option<&Entry> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    pub fn is_effectively_enabled(&self, id: &TriggerId) -> bool {
        self.get(id).is_some_and(|e| e.effective_enabled)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

// ---------------------------------------------------------------------------
// Runtime state (outside the snapshot)
// ---------------------------------------------------------------------------

/// Why a match was not admitted. Expected and silent: not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionRejected {
    Suppressed { remaining: Duration },
    AtCapacity { active: u32 },
    /// Disabled or removed between matching and admission.
    Disabled,
}

#[derive(Debug, Default)]
struct AdmissionState {
    active:    u32,
    last_fire: Option<Instant>,
}

#[derive(Debug)]
pub struct TriggerRuntime {
    admission: Mutex<AdmissionState>,
    vars:      Arc<VarTable>,
    /// Token for the current generation of instances; replaced on cancel.
    cancel:    Mutex<CancellationToken>,
    shutdown:  CancellationToken,
}

impl TriggerRuntime {
    fn new(shutdown: &CancellationToken) -> Self {
        Self {
            admission: Mutex::new(AdmissionState::default()),
            vars:      VarTable::new(),
            cancel:    Mutex::new(shutdown.child_token()),
            shutdown:  shutdown.clone(),
        }
    }

    /// Atomic admission check. The lock covers only the check-and-record.
    pub fn try_admit(
        &self,
        max_instances: u32,
        suppress: Duration,
        now: Instant,
    ) -> Result<(), AdmissionRejected> {
        let mut st = self.admission.lock();
        if let Some(last) = st.last_fire {
            let since = now.saturating_duration_since(last);
            if since < suppress {
                return Err(AdmissionRejected::Suppressed { remaining: suppress - since });
            }
        }
        if st.active >= max_instances {
            return Err(AdmissionRejected::AtCapacity { active: st.active });
        }
        st.active += 1;
        st.last_fire = Some(now);
        Ok(())
    }

    pub fn release(&self) {
        let mut st = self.admission.lock();
        st.active = st.active.saturating_sub(1);
    }

    pub fn active(&self) -> u32 {
        self.admission.lock().active
    }

    pub fn last_fire(&self) -> Option<Instant> {
        self.admission.lock().last_fire
    }

    pub fn vars(&self) -> &Arc<VarTable> {
        &self.vars
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    /// Cancel every in-flight instance; later admissions get a fresh token.
    pub fn cancel_all(&self) {
        let old = std::mem::replace(&mut *self.cancel.lock(), self.shutdown.child_token());
        old.cancel();
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("folder '{0}' not found")]
    FolderNotFound(String),
    #[error("trigger id '{0}' already exists")]
    DuplicateId(TriggerId),
    #[error("trigger '{0}' not found")]
    TriggerNotFound(TriggerId),
}

pub struct Registry {
    current:  ArcSwap<Snapshot>,
    /// Serializes writers; readers never take it.
    write:    Mutex<()>,
    runtimes: RwLock<HashMap<TriggerId, Arc<TriggerRuntime>>>,
    shutdown: CancellationToken,
}

impl Registry {
    pub fn new(root: Folder) -> Self {
        Self::with_shutdown(root, CancellationToken::new())
    }

    /// Every instance token is a child of `shutdown`.
    pub fn with_shutdown(root: Folder, shutdown: CancellationToken) -> Self {
        Self {
            current:  ArcSwap::from_pointee(Snapshot::build(root, 0)),
            write:    Mutex::new(()),
            runtimes: RwLock::new(HashMap::new()),
            shutdown,
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Apply `f` to a copy of the current tree and publish the result.
    /// Returns the snapshot that was replaced and the new one.
    pub fn update<R>(
        &self,
        f: impl FnOnce(&mut Folder) -> Result<R, RegistryError>,
    ) -> Result<(Arc<Snapshot>, Arc<Snapshot>, R), RegistryError> {
        let _guard = self.write.lock();
        let old = self.current.load_full();
        let mut root = old.root.clone();
        let out = f(&mut root)?;
        let new = Arc::new(Snapshot::build(root, old.generation + 1));
        self.current.store(new.clone());
        Ok((old, new, out))
    }

    pub fn replace(&self, root: Folder) -> (Arc<Snapshot>, Arc<Snapshot>) {
        let _guard = self.write.lock();
        let old = self.current.load_full();
        let new = Arc::new(Snapshot::build(root, old.generation + 1));
        self.current.store(new.clone());
        (old, new)
    }

    pub fn add_trigger(&self, folder_path: &[&str], trigger: Trigger) -> Result<(), RegistryError> {
        self.update(|root| {
            if root.contains(&trigger.id) {
                return Err(RegistryError::DuplicateId(trigger.id.clone()));
            }
            let folder = root
                .folder_mut(folder_path)
                .ok_or_else(|| RegistryError::FolderNotFound(folder_path.join("/")))?;
            folder.triggers.push(Arc::new(trigger));
            Ok(())
        })
        .map(|_| ())
    }

    pub fn remove_trigger(&self, id: &TriggerId) -> Result<Arc<Trigger>, RegistryError> {
        let (_, _, removed) = self.update(|root| {
            root.remove_trigger(id)
                .ok_or_else(|| RegistryError::TriggerNotFound(id.clone()))
        })?;
        Ok(removed)
    }

    pub fn set_trigger_enabled(&self, id: &TriggerId, enabled: bool) -> Result<(), RegistryError> {
        self.modify_trigger(id, |t| t.enabled = enabled)
    }

    pub fn set_priority(&self, id: &TriggerId, priority: i32) -> Result<(), RegistryError> {
        self.modify_trigger(id, |t| t.priority = priority)
    }

    pub fn set_folder_enabled(&self, path: &[&str], enabled: bool) -> Result<(), RegistryError> {
        self.update(|root| {
            let folder = root
                .folder_mut(path)
                .ok_or_else(|| RegistryError::FolderNotFound(path.join("/")))?;
            folder.enabled = enabled;
            Ok(())
        })
        .map(|_| ())
    }

    fn modify_trigger(&self, id: &TriggerId, f: impl FnOnce(&mut Trigger)) -> Result<(), RegistryError> {
        self.update(|root| {
            let slot = root
                .trigger_mut(id)
                .ok_or_else(|| RegistryError::TriggerNotFound(id.clone()))?;
            f(Arc::make_mut(slot));
            Ok(())
        })
        .map(|_| ())
    }

    /// Runtime state for `id`, created on first use.
    pub fn runtime(&self, id: &TriggerId) -> Arc<TriggerRuntime> {
        if let Some(rt) = self.runtimes.read().get(id) {
            return rt.clone();
        }
        self.runtimes
            .write()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(TriggerRuntime::new(&self.shutdown)))
            .clone()
    }

    pub fn existing_runtime(&self, id: &TriggerId) -> Option<Arc<TriggerRuntime>> {
        self.runtimes.read().get(id).cloned()
    }

    pub fn runtimes(&self) -> Vec<(TriggerId, Arc<TriggerRuntime>)> {
        self.runtimes
            .read()
            .iter()
            .map(|(id, rt)| (id.clone(), rt.clone()))
            .collect()
    }

    /// Drop runtime state for triggers that no longer exist in `snapshot`.
    /// Returns the removed entries so the caller can cancel their instances.
    pub fn prune_runtimes(&self, snapshot: &Snapshot) -> Vec<(TriggerId, Arc<TriggerRuntime>)> {
        let mut map = self.runtimes.write();
        let gone: Vec<TriggerId> = map
            .keys()
            .filter(|id| snapshot.get(id).is_none())
            .cloned()
            .collect();
        gone.into_iter()
            .filter_map(|id| map.remove(&id).map(|rt| (id, rt)))
            .collect()
    }
}
