/// Variable scopes for trigger evaluation.
///
/// Three tiers, resolved innermost-first:
///   instance: owned by one running pipeline (captures, loop counters)
///   trigger : shared by every instance of one trigger, lives as long as the trigger
///   global  : shared by everything, lives as long as the engine
///
/// Consistency is relaxed. Each shared tier has a single mutex held for one
/// get or set; reads return a copy taken at read time. A pipeline that reads
/// a global twice may observe a write made in between by a concurrently
/// running instance (last write wins, no isolation across a pipeline run).
use crate::expr::{Value, Variables};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Instance,
    Trigger,
    Global,
}

impl Default for Tier {
    fn default() -> Self {
        Tier::Instance
    }
}

// ---------------------------------------------------------------------------
// VarTable: one shared tier
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct VarTable {
    vars: Mutex<HashMap<String, Value>>,
}

impl VarTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_values(values: impl IntoIterator<Item = (String, Value)>) -> Arc<Self> {
        Arc::new(Self { vars: Mutex::new(values.into_iter().collect()) })
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.vars.lock().get(name).cloned()
    }

    pub fn set(&self, name: &str, value: Value) {
        self.vars.lock().insert(name.to_owned(), value);
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        self.vars.lock().remove(name)
    }

    /// Copy of the whole table, for diagnostics.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.vars.lock().clone()
    }
}

// ---------------------------------------------------------------------------
// Scope: the chain seen by one instance
// ---------------------------------------------------------------------------

/// The scope one instance evaluates against. The instance table is owned
/// outright and dropped with the instance; the outer tiers are only
/// referenced for lookup and explicit writes.
#[derive(Debug, Clone)]
pub struct Scope {
    instance: HashMap<String, Value>,
    trigger:  Arc<VarTable>,
    global:   Arc<VarTable>,
}

impl Scope {
    pub fn new(trigger: Arc<VarTable>, global: Arc<VarTable>) -> Self {
        Self { instance: HashMap::new(), trigger, global }
    }

    /// Resolve innermost-first; the empty string when absent everywhere.
    pub fn get(&self, name: &str) -> Value {
        self.lookup(name).unwrap_or_default()
    }

    /// Write to the explicitly requested tier. Never inferred from where the
    /// name currently resolves.
    pub fn set(&mut self, name: &str, value: Value, tier: Tier) {
        match tier {
            Tier::Instance => {
                self.instance.insert(name.to_owned(), value);
            }
            Tier::Trigger => self.trigger.set(name, value),
            Tier::Global  => self.global.set(name, value),
        }
    }

    pub fn clear(&mut self, name: &str, tier: Tier) {
        match tier {
            Tier::Instance => {
                self.instance.remove(name);
            }
            Tier::Trigger => {
                self.trigger.remove(name);
            }
            Tier::Global => {
                self.global.remove(name);
            }
        }
    }
}

impl Variables for Scope {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.instance
            .get(name)
            .cloned()
            .or_else(|| self.trigger.get(name))
            .or_else(|| self.global.get(name))
    }
}
