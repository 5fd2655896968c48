/// Control nodes: wait, repeat, conditional. Stop needs no data and lives
/// directly on `Action`.
use super::{Action, ActionInstance, Failure, Outcome, Param};
use crate::{
    expr::{Expression, Value},
    scope::{Scope, Tier},
};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Wait
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Wait {
    /// Milliseconds.
    pub duration: Param,
}

impl Wait {
    pub fn new(duration: Param) -> Self {
        Self { duration }
    }

    pub fn describe(&self, scope: Option<&Scope>) -> String {
        format!("wait ({}) ms", self.duration.describe(scope))
    }

    pub fn execute(&self, inst: &mut ActionInstance) -> Outcome {
        match self.duration.millis(&inst.scope) {
            Ok(d)  => Outcome::Suspended(d),
            Err(f) => Outcome::Failed(f),
        }
    }
}

// ---------------------------------------------------------------------------
// Repeat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum RepeatMode {
    /// Fixed iteration count, computed once on entry.
    Count(Param),
    /// Checked before every iteration, including the first.
    While(Expression),
}

#[derive(Debug, Clone)]
pub struct Repeat {
    pub mode:    RepeatMode,
    /// Instance-tier variable holding the 0-based iteration index.
    pub counter: String,
    /// Milliseconds between iterations.
    pub pause:   Option<Param>,
    pub body:    Arc<[Action]>,
}

/// Progress through a repeat body; lives on the instance's frame stack.
#[derive(Debug, Clone, Copy)]
pub struct RepeatState {
    index: u64,
    limit: Option<u64>,
}

impl Repeat {
    pub const DEFAULT_COUNTER: &'static str = "_index";

    pub fn count(times: Param, body: Vec<Action>) -> Self {
        Self::new(RepeatMode::Count(times), body)
    }

    pub fn while_holds(condition: Expression, body: Vec<Action>) -> Self {
        Self::new(RepeatMode::While(condition), body)
    }

    fn new(mode: RepeatMode, body: Vec<Action>) -> Self {
        Self {
            mode,
            counter: Self::DEFAULT_COUNTER.to_owned(),
            pause:   None,
            body:    Arc::from(body),
        }
    }

    pub fn counter(mut self, name: impl Into<String>) -> Self {
        self.counter = name.into();
        self
    }

    pub fn pause(mut self, pause: Param) -> Self {
        self.pause = Some(pause);
        self
    }

    pub fn describe(&self, scope: Option<&Scope>) -> String {
        let mut out = match &self.mode {
            RepeatMode::Count(n) => format!("repeat {} times", n.describe(scope)),
            RepeatMode::While(c) => format!("repeat while ({})", c),
        };
        out.push_str(&format!(" as '{}'", self.counter));
        if let Some(p) = &self.pause {
            out.push_str(&format!(", pausing ({}) ms between iterations", p.describe(scope)));
        }
        out
    }

    /// Evaluate the entry check and, if the body should run at least once,
    /// push it onto the instance with the counter at 0.
    pub(crate) fn enter(this: &Arc<Self>, inst: &mut ActionInstance) -> Outcome {
        let limit = match &this.mode {
            RepeatMode::Count(n) => match n.number(&inst.scope) {
                Ok(n) if n.is_finite() && n >= 1.0 => Some(n.floor() as u64),
                Ok(_) => return Outcome::Completed,
                Err(f) => return Outcome::Failed(f),
            },
            RepeatMode::While(_) => None,
        };

        inst.scope.set(&this.counter, Value::Number(0.0), Tier::Instance);
        match this.holds(&inst.scope) {
            Ok(true) => {}
            Ok(false) => return Outcome::Completed,
            Err(f) => return Outcome::Failed(f),
        }
        inst.push_repeat(this.clone(), RepeatState { index: 0, limit });
        Outcome::Completed
    }

    /// Called when the body has run to its end. `Some(pause)` means run it
    /// again after `pause`; `None` means the loop is finished.
    pub(crate) fn advance(
        &self,
        state: &mut RepeatState,
        scope: &mut Scope,
    ) -> Result<Option<Duration>, Failure> {
        state.index += 1;
        if state.limit.is_some_and(|limit| state.index >= limit) {
            return Ok(None);
        }
        scope.set(&self.counter, Value::Number(state.index as f64), Tier::Instance);
        if !self.holds(scope)? {
            return Ok(None);
        }
        match &self.pause {
            Some(p) => p.millis(scope).map(Some),
            None    => Ok(Some(Duration::ZERO)),
        }
    }

    fn holds(&self, scope: &Scope) -> Result<bool, Failure> {
        match &self.mode {
            RepeatMode::Count(_) => Ok(true),
            RepeatMode::While(c) => c
                .evaluate(scope)
                .map(|v| v.is_truthy())
                .map_err(Failure::evaluation),
        }
    }
}

// ---------------------------------------------------------------------------
// Conditional
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Conditional {
    pub condition: Expression,
    pub then:      Arc<[Action]>,
    pub otherwise: Arc<[Action]>,
}

impl Conditional {
    pub fn new(condition: Expression, then: Vec<Action>) -> Self {
        Self { condition, then: Arc::from(then), otherwise: Arc::from(Vec::new()) }
    }

    pub fn otherwise(mut self, actions: Vec<Action>) -> Self {
        self.otherwise = Arc::from(actions);
        self
    }

    pub fn describe(&self) -> String {
        format!("if ({}) holds", self.condition)
    }

    pub fn execute(&self, inst: &mut ActionInstance) -> Outcome {
        let taken = match self.condition.evaluate(&inst.scope) {
            Ok(v)  => v.is_truthy(),
            Err(e) => return Outcome::Failed(Failure::evaluation(e)),
        };
        let branch = if taken { &self.then } else { &self.otherwise };
        if !branch.is_empty() {
            inst.push_sequence(branch.clone());
        }
        Outcome::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::VarTable;

    fn scope() -> Scope {
        Scope::new(VarTable::new(), VarTable::new())
    }

    #[test]
    fn advance_stops_at_count() {
        let r = Repeat::count(Param::literal("2"), vec![]);
        let mut scope = scope();
        let mut state = RepeatState { index: 0, limit: Some(2) };
        assert_eq!(r.advance(&mut state, &mut scope).unwrap(), Some(Duration::ZERO));
        assert_eq!(scope.get("_index"), Value::Number(1.0));
        assert_eq!(r.advance(&mut state, &mut scope).unwrap(), None);
    }

    #[test]
    fn advance_uses_custom_counter_and_pause() {
        let r = Repeat::while_holds(Expression::parse("i < 3").unwrap(), vec![])
            .counter("i")
            .pause(Param::literal("250"));
        let mut scope = scope();
        let mut state = RepeatState { index: 0, limit: None };
        assert_eq!(r.advance(&mut state, &mut scope).unwrap(), Some(Duration::from_millis(250)));
        assert_eq!(r.advance(&mut state, &mut scope).unwrap(), Some(Duration::from_millis(250)));
        assert_eq!(r.advance(&mut state, &mut scope).unwrap(), None);
    }

    #[test]
    fn describes() {
        let r = Repeat::count(Param::literal("3"), vec![]).pause(Param::literal("100"));
        assert_eq!(r.describe(None), "repeat 3 times as '_index', pausing (100) ms between iterations");

        let c = Conditional::new(Expression::parse("hp < 20").unwrap(), vec![]);
        assert_eq!(c.describe(), "if (hp < 20) holds");
        assert_eq!(Wait::new(Param::literal("500")).describe(None), "wait (500) ms");
    }
}
