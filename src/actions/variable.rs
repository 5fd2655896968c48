/// Scope writes. The tier is always explicit in the definition; a write
/// never goes to whichever tier a name happens to resolve from.
use super::{ActionInstance, Failure, Param};
use crate::scope::{Scope, Tier};

#[derive(Debug, Clone)]
pub struct SetVariable {
    pub name:  String,
    pub value: Param,
    pub tier:  Tier,
}

impl SetVariable {
    pub fn new(name: impl Into<String>, value: Param, tier: Tier) -> Self {
        Self { name: name.into(), value, tier }
    }

    pub fn describe(&self, scope: Option<&Scope>) -> String {
        format!(
            "set {} variable ({}) to ({})",
            tier_name(self.tier),
            self.name,
            self.value.describe(scope)
        )
    }

    pub fn execute(&self, inst: &mut ActionInstance) -> Result<(), Failure> {
        let value = self.value.resolve(&inst.scope).map_err(Failure::evaluation)?;
        inst.scope.set(&self.name, value, self.tier);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ClearVariable {
    pub name: String,
    pub tier: Tier,
}

impl ClearVariable {
    pub fn new(name: impl Into<String>, tier: Tier) -> Self {
        Self { name: name.into(), tier }
    }

    pub fn describe(&self) -> String {
        format!("clear {} variable ({})", tier_name(self.tier), self.name)
    }

    pub fn execute(&self, inst: &mut ActionInstance) {
        inst.scope.clear(&self.name, self.tier);
    }
}

fn tier_name(tier: Tier) -> &'static str {
    match tier {
        Tier::Instance => "instance",
        Tier::Trigger  => "trigger",
        Tier::Global   => "global",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        delegates::LoggingEffects,
        events::EventSink,
        expr::Value,
        registry::Trigger,
        scope::VarTable,
    };
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn set_and_clear_hit_the_named_tier() {
        let globals = VarTable::new();
        let scope = Scope::new(VarTable::new(), globals.clone());
        let mut inst = ActionInstance::new(
            1,
            Arc::new(Trigger::new("t", "t", "x")),
            scope,
            CancellationToken::new(),
            Arc::new(LoggingEffects),
            EventSink::disabled(),
        );

        SetVariable::new("counter", Param::expression("counter + 1").unwrap(), Tier::Global)
            .execute(&mut inst)
            .unwrap();
        assert_eq!(globals.get("counter"), Some(Value::Number(1.0)));

        ClearVariable::new("counter", Tier::Global).execute(&mut inst);
        assert!(globals.get("counter").is_none());
    }

    #[test]
    fn describe_names_tier() {
        let s = SetVariable::new("phase", Param::literal("2"), Tier::Trigger);
        assert_eq!(s.describe(None), "set trigger variable (phase) to (2)");
        assert_eq!(ClearVariable::new("phase", Tier::Global).describe(), "clear global variable (phase)");
    }
}
