/// Pattern compilation and per-line matching against the registry.
///
/// For one incoming line every effectively-enabled trigger is tried in
/// registry order. The regex runs first; only on a hit is the trigger's
/// condition evaluated, against a fresh instance scope seeded with the
/// captures. All hits are returned; admission is decided per trigger by the
/// scheduler, so there is no first-match-wins.
use crate::{
    error::CompileError,
    expr::Value,
    registry::{Registry, Snapshot, Trigger, TriggerRuntime},
    scope::{Scope, Tier, VarTable},
};
use regex::{Regex, RegexBuilder};
use std::sync::Arc;

// user patterns are small; cap what one can compile to
const MAX_PATTERN_SIZE: usize = 16 * 1024 * 1024;

/// Ordered `(group name, captured text)` pairs.
pub type Captures = Vec<(String, String)>;

// ---------------------------------------------------------------------------
// CompiledPattern
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CompiledPattern {
    regex: Regex,
    names: Vec<String>,
}

impl CompiledPattern {
    pub fn compile(text: &str) -> Result<Self, CompileError> {
        let regex = RegexBuilder::new(text)
            .size_limit(MAX_PATTERN_SIZE)
            .build()
            .map_err(|source| CompileError::Pattern { pattern: text.to_owned(), source })?;
        let names = regex.capture_names().flatten().map(str::to_owned).collect();
        Ok(Self { regex, names })
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    /// Named groups in the order they appear in the pattern.
    pub fn capture_names(&self) -> &[String] {
        &self.names
    }

    /// Deterministic: the same pattern and line always give the same captures.
    /// Named groups that did not participate bind the empty string.
    pub fn try_match(&self, line: &str) -> Option<Captures> {
        let caps = self.regex.captures(line)?;
        Some(
            self.names
                .iter()
                .map(|name| {
                    let text = caps.name(name).map(|m| m.as_str()).unwrap_or("");
                    (name.clone(), text.to_owned())
                })
                .collect(),
        )
    }
}

// ---------------------------------------------------------------------------
// Line matching
// ---------------------------------------------------------------------------

/// A trigger that matched a line and passed its condition.
#[derive(Debug)]
pub struct Match {
    pub trigger:  Arc<Trigger>,
    pub runtime:  Arc<TriggerRuntime>,
    pub captures: Captures,
    /// Instance scope already seeded with the captures.
    pub scope:    Scope,
}

pub fn match_line(
    snapshot: &Snapshot,
    registry: &Registry,
    globals:  &Arc<VarTable>,
    line:     &str,
) -> Vec<Match> {
    let mut hits = Vec::new();

    for entry in snapshot.entries() {
        if !entry.effective_enabled || !entry.trigger.is_matchable() {
            continue;
        }
        let trigger = &entry.trigger;
        let Some(pattern) = trigger.pattern.as_ref() else {
            continue;
        };
        let Some(captures) = pattern.try_match(line) else {
            continue;
        };

        let runtime = registry.runtime(&trigger.id);
        let mut scope = Scope::new(runtime.vars().clone(), globals.clone());
        for (name, text) in &captures {
            scope.set(name, Value::from(text.as_str()), Tier::Instance);
        }

        if let Some(condition) = &trigger.condition {
            match condition.evaluate(&scope) {
                Ok(v) if v.is_truthy() => {}
                Ok(_) => {
                    tracing::trace!("Trigger '{}' condition false: match dropped", trigger.name);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Trigger '{}' condition failed: {}", trigger.name, e);
                    continue;
                }
            }
        }

        hits.push(Match { trigger: trigger.clone(), runtime, captures, scope });
    }

    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Folder, Trigger};

    fn registry_with(triggers: Vec<Trigger>) -> Registry {
        let mut root = Folder::root();
        root.triggers = triggers.into_iter().map(Arc::new).collect();
        Registry::new(root)
    }

    #[test]
    fn try_match_is_deterministic() {
        let p = CompiledPattern::compile(r"(?<who>\w+) casts (?<spell>[\w ]+)").unwrap();
        let a = p.try_match("Boss casts Shadow Surge");
        let b = p.try_match("Boss casts Shadow Surge");
        assert_eq!(a, b);
        assert_eq!(
            a.unwrap(),
            vec![("who".into(), "Boss".into()), ("spell".into(), "Shadow Surge".into())]
        );
        assert_eq!(p.capture_names(), ["who", "spell"]);
    }

    #[test]
    fn optional_groups_bind_empty() {
        let p = CompiledPattern::compile(r"hit(?: for (?<amount>\d+))?").unwrap();
        assert_eq!(p.try_match("hit").unwrap(), vec![("amount".into(), String::new())]);
        assert!(p.try_match("miss").is_none());
    }

    #[test]
    fn bad_pattern_is_a_compile_error() {
        assert!(matches!(
            CompiledPattern::compile("(oops"),
            Err(CompileError::Pattern { .. })
        ));
    }

    #[test]
    fn boss_hp_condition_scenario() {
        let trigger = Trigger::new("boss-low", "Boss low", r"Boss HP: (?<hp>\d+)%").condition("hp < 20");
        let registry = registry_with(vec![trigger]);
        let globals = VarTable::new();
        let snap = registry.snapshot();

        let hits = match_line(&snap, &registry, &globals, "Boss HP: 15%");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].scope.get("hp"), Value::from("15"));
        assert_eq!(hits[0].captures, vec![("hp".to_owned(), "15".to_owned())]);

        let hits = match_line(&snap, &registry, &globals, "Boss HP: 45%");
        assert!(hits.is_empty(), "falsy condition must cancel the match");
    }

    #[test]
    fn every_matching_trigger_is_returned_in_order() {
        let registry = registry_with(vec![
            Trigger::new("b", "second", "pull").priority(2),
            Trigger::new("a", "first", "pull").priority(1),
            Trigger::new("c", "other", "wipe"),
        ]);
        let snap = registry.snapshot();
        let hits = match_line(&snap, &registry, &VarTable::new(), "pull in 10");
        let ids: Vec<_> = hits.iter().map(|m| m.trigger.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn disabled_and_broken_triggers_are_skipped() {
        let registry = registry_with(vec![
            Trigger::new("off", "off", "x").enabled(false),
            Trigger::new("broken", "broken", "(x"),
            Trigger::new("bad-cond", "bad condition", "x").condition("x <"),
            Trigger::new("on", "on", "x"),
        ]);
        let snap = registry.snapshot();
        let hits = match_line(&snap, &registry, &VarTable::new(), "x");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].trigger.id.as_str(), "on");
    }

    #[test]
    fn condition_sees_trigger_and_global_tiers() {
        let registry = registry_with(vec![Trigger::new("t", "t", "tick").condition("armed == 1 && phase == 2")]);
        let globals = VarTable::new();
        globals.set("phase", Value::Number(2.0));
        let snap = registry.snapshot();

        assert!(match_line(&snap, &registry, &globals, "tick").is_empty());
        registry.runtime(&"t".into()).vars().set("armed", Value::Number(1.0));
        assert_eq!(match_line(&snap, &registry, &globals, "tick").len(), 1);
    }

    #[test]
    fn unicode_group_names_are_usable_in_conditions() {
        let trigger = Trigger::new("hp", "hp", r"血量: (?<血量>\d+)").condition("血量 < 20");
        assert!(trigger.problems.is_empty());
        let registry = registry_with(vec![trigger]);
        let snap = registry.snapshot();
        assert_eq!(match_line(&snap, &registry, &VarTable::new(), "血量: 15").len(), 1);
        assert!(match_line(&snap, &registry, &VarTable::new(), "血量: 50").is_empty());
    }
}
