pub mod control;
pub mod keypress;
pub mod media;
pub mod message;
pub mod pipeline;
pub mod variable;

pub use control::{Conditional, Repeat, RepeatMode, Wait};
pub use keypress::Keypress;
pub use media::{PlaySound, Speak};
pub use message::{LogLevel, LogMessage};
pub use pipeline::{ActionInstance, InstanceEnd};
pub use variable::{ClearVariable, SetVariable};

use crate::{
    expr::{EvalError, Expression, ParseError, Template, Value},
    scope::Scope,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// A declared action parameter. Parsed when the trigger is compiled and
/// resolved against the instance scope right before the action runs.
#[derive(Debug, Clone)]
pub enum Param {
    Literal(String),
    /// Text with `${expr}` segments.
    Template(Template),
    Expression(Expression),
}

impl Param {
    pub fn literal(text: impl Into<String>) -> Self {
        Param::Literal(text.into())
    }

    /// Plain text stays a literal; text with `${}` segments becomes a template.
    pub fn template(source: &str) -> Result<Self, ParseError> {
        let t = Template::parse(source)?;
        Ok(if t.is_literal() { Param::Literal(source.to_owned()) } else { Param::Template(t) })
    }

    pub fn expression(source: &str) -> Result<Self, ParseError> {
        Expression::parse(source).map(Param::Expression)
    }

    pub fn source(&self) -> &str {
        match self {
            Param::Literal(s)    => s,
            Param::Template(t)   => t.source(),
            Param::Expression(e) => e.source(),
        }
    }

    pub fn resolve(&self, scope: &Scope) -> Result<Value, EvalError> {
        match self {
            Param::Literal(s)    => Ok(Value::from(s.as_str())),
            Param::Template(t)   => t.render(scope).map(Value::Str),
            Param::Expression(e) => e.evaluate(scope),
        }
    }

    pub fn text(&self, scope: &Scope) -> Result<String, Failure> {
        self.resolve(scope).map(|v| v.to_string()).map_err(Failure::evaluation)
    }

    pub fn number(&self, scope: &Scope) -> Result<f64, Failure> {
        self.resolve(scope).map(|v| v.to_number()).map_err(Failure::evaluation)
    }

    /// Non-negative, finite millisecond count as a `Duration`.
    pub fn millis(&self, scope: &Scope) -> Result<Duration, Failure> {
        let ms = self.number(scope)?;
        Ok(if ms.is_finite() && ms > 0.0 { Duration::from_millis(ms as u64) } else { Duration::ZERO })
    }

    /// Resolved text when a scope is given, source text otherwise. Falls back
    /// to the source if resolution fails.
    pub fn describe(&self, scope: Option<&Scope>) -> String {
        match scope {
            Some(scope) => self
                .resolve(scope)
                .map(|v| v.to_string())
                .unwrap_or_else(|_| self.source().to_owned()),
            None => self.source().to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// An effect could not be delivered; the instance moves on.
    Delegate,
    /// A parameter could not be computed; the instance ends as failed.
    Evaluation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind:   FailureKind,
    pub reason: String,
}

impl Failure {
    pub fn delegate(reason: impl fmt::Display) -> Self {
        Self { kind: FailureKind::Delegate, reason: reason.to_string() }
    }

    pub fn evaluation(reason: impl fmt::Display) -> Self {
        Self { kind: FailureKind::Evaluation, reason: reason.to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Suspended(Duration),
    Failed(Failure),
    Stopped,
}

impl From<Result<(), Failure>> for Outcome {
    fn from(r: Result<(), Failure>) -> Self {
        match r {
            Ok(())  => Outcome::Completed,
            Err(f)  => Outcome::Failed(f),
        }
    }
}

// ---------------------------------------------------------------------------
// Action: closed set of pipeline nodes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Action {
    // effects
    Keypress(Keypress),
    PlaySound(PlaySound),
    Speak(Speak),
    Log(LogMessage),
    SetVariable(SetVariable),
    ClearVariable(ClearVariable),
    // control
    Wait(Wait),
    Repeat(Arc<Repeat>),
    Conditional(Conditional),
    Stop,
}

impl Action {
    /// Short kind tag used in logs and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Keypress(_)      => "keypress",
            Action::PlaySound(_)     => "play_sound",
            Action::Speak(_)         => "speak",
            Action::Log(_)           => "log",
            Action::SetVariable(_)   => "set_variable",
            Action::ClearVariable(_) => "clear_variable",
            Action::Wait(_)          => "wait",
            Action::Repeat(_)        => "repeat",
            Action::Conditional(_)   => "conditional",
            Action::Stop             => "stop",
        }
    }

    /// Human-readable rendering. Reads the scope but never writes it.
    pub fn describe(&self, scope: Option<&Scope>) -> String {
        match self {
            Action::Keypress(a)      => a.describe(scope),
            Action::PlaySound(a)     => a.describe(scope),
            Action::Speak(a)         => a.describe(scope),
            Action::Log(a)           => a.describe(scope),
            Action::SetVariable(a)   => a.describe(scope),
            Action::ClearVariable(a) => a.describe(),
            Action::Wait(a)          => a.describe(scope),
            Action::Repeat(a)        => a.describe(scope),
            Action::Conditional(a)   => a.describe(),
            Action::Stop             => "stop this instance".to_owned(),
        }
    }

    /// Run one node. Control nodes that own a body push it onto the
    /// instance's frame stack and complete immediately.
    pub async fn execute(&self, inst: &mut ActionInstance) -> Outcome {
        match self {
            Action::Keypress(a)      => a.execute(inst).await.into(),
            Action::PlaySound(a)     => a.execute(inst).await.into(),
            Action::Speak(a)         => a.execute(inst).await.into(),
            Action::Log(a)           => a.execute(inst).into(),
            Action::SetVariable(a)   => a.execute(inst).into(),
            Action::ClearVariable(a) => {
                a.execute(inst);
                Outcome::Completed
            }
            Action::Wait(a)          => a.execute(inst),
            Action::Repeat(a)        => Repeat::enter(a, inst),
            Action::Conditional(a)   => a.execute(inst),
            Action::Stop             => Outcome::Stopped,
        }
    }
}

/// Append an indented, nested listing of `actions` to `out`.
pub fn describe_pipeline(actions: &[Action], scope: Option<&Scope>, depth: usize, out: &mut String) {
    for action in actions {
        out.push('\n');
        out.push_str(&"  ".repeat(depth));
        out.push_str("- ");
        out.push_str(&action.describe(scope));
        match action {
            Action::Repeat(r) => describe_pipeline(&r.body, scope, depth + 1, out),
            Action::Conditional(c) => {
                describe_pipeline(&c.then, scope, depth + 1, out);
                if !c.otherwise.is_empty() {
                    out.push('\n');
                    out.push_str(&"  ".repeat(depth));
                    out.push_str("  otherwise:");
                    describe_pipeline(&c.otherwise, scope, depth + 1, out);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{Tier, VarTable};

    fn scope_with(name: &str, value: Value) -> Scope {
        let mut scope = Scope::new(VarTable::new(), VarTable::new());
        scope.set(name, value, Tier::Instance);
        scope
    }

    #[test]
    fn template_without_segments_is_literal() {
        assert!(matches!(Param::template("{ENTER}").unwrap(), Param::Literal(_)));
        assert!(matches!(Param::template("hp ${hp}").unwrap(), Param::Template(_)));
    }

    #[test]
    fn param_describe_uses_scope_when_given() {
        let p = Param::template("at ${hp}%").unwrap();
        let scope = scope_with("hp", Value::from("15"));
        assert_eq!(p.describe(None), "at ${hp}%");
        assert_eq!(p.describe(Some(&scope)), "at 15%");
    }

    #[test]
    fn millis_clamps_negative_and_nan() {
        let scope = scope_with("x", Value::from("abc"));
        assert_eq!(Param::expression("-50").unwrap().millis(&scope).unwrap(), Duration::ZERO);
        assert_eq!(Param::expression("x").unwrap().millis(&scope).unwrap(), Duration::ZERO);
        assert_eq!(
            Param::expression("1.5 * 1000").unwrap().millis(&scope).unwrap(),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn describe_pipeline_nests_bodies() {
        let repeat = Repeat::count(Param::literal("3"), vec![Action::Stop]);
        let actions = vec![
            Action::Wait(Wait::new(Param::literal("100"))),
            Action::Repeat(Arc::new(repeat)),
        ];
        let mut out = String::new();
        describe_pipeline(&actions, None, 0, &mut out);
        let lines: Vec<&str> = out.lines().skip(1).collect();
        assert_eq!(lines[0], "- wait (100) ms");
        assert!(lines[1].starts_with("- repeat 3 times"));
        assert_eq!(lines[2], "  - stop this instance");
    }
}
