/// Keypress delivery: plain keystrokes to the active window, or window
/// messages carrying one or several virtual keycodes.
use super::{ActionInstance, Failure, Param};
use crate::{
    delegates::{ProcessFilter, WindowTarget},
    scope::Scope,
};

#[derive(Debug, Clone)]
pub enum Keypress {
    /// Keystroke text, e.g. `{ENTER}/p pull{ENTER}`.
    SendKeys { keys: Param },
    WindowMessage {
        process_id: Param,
        title:      Param,
        keycode:    Param,
    },
    /// `keycodes` resolves to a comma-separated list.
    WindowMessageCombo {
        process_id: Param,
        title:      Param,
        keycodes:   Param,
    },
}

impl Keypress {
    pub fn send_keys(keys: Param) -> Self {
        Keypress::SendKeys { keys }
    }

    pub fn describe(&self, scope: Option<&Scope>) -> String {
        match self {
            Keypress::SendKeys { keys } => {
                format!("send keypresses ({}) to the active window", keys.describe(scope))
            }
            Keypress::WindowMessage { process_id, title, keycode } => format!(
                "send keycode ({}) to {}",
                keycode.describe(scope),
                describe_target(process_id, title, scope)
            ),
            Keypress::WindowMessageCombo { process_id, title, keycodes } => format!(
                "send keycodes ({}) to {}",
                keycodes.describe(scope),
                describe_target(process_id, title, scope)
            ),
        }
    }

    pub async fn execute(&self, inst: &mut ActionInstance) -> Result<(), Failure> {
        match self {
            Keypress::SendKeys { keys } => {
                let keys = keys.text(&inst.scope)?;
                inst.effects.send_keys(&keys).await.map_err(Failure::delegate)
            }
            Keypress::WindowMessage { process_id, title, keycode } => {
                let target = resolve_target(process_id, title, &inst.scope)?;
                let code = keycode.number(&inst.scope)?;
                let code = to_keycode(code, keycode.source())?;
                inst.effects
                    .send_window_message(&target, code)
                    .await
                    .map_err(Failure::delegate)
            }
            Keypress::WindowMessageCombo { process_id, title, keycodes } => {
                let target = resolve_target(process_id, title, &inst.scope)?;
                let codes = parse_keycodes(&keycodes.text(&inst.scope)?)?;
                inst.effects
                    .send_window_messages(&target, &codes)
                    .await
                    .map_err(Failure::delegate)
            }
        }
    }
}

fn resolve_target(process_id: &Param, title: &Param, scope: &Scope) -> Result<WindowTarget, Failure> {
    let pid = process_id.number(scope)?;
    let pid = if pid.is_finite() { pid.trunc() as i64 } else { 0 };
    Ok(WindowTarget::new(ProcessFilter::from_id(pid), &title.text(scope)?))
}

/// Description never fails: an unreadable process id is shown as a
/// specific process, using its source text.
fn describe_target(process_id: &Param, title: &Param, scope: Option<&Scope>) -> String {
    let pid_text = process_id.describe(scope);
    let title = title.describe(scope);
    let title = if title.trim().is_empty() { ".*".to_owned() } else { title };
    match pid_text.trim().parse::<f64>().map(|p| p.trunc() as i64) {
        Ok(0) => format!("the first window whose title match ({})", title),
        Ok(p) if p < 0 => format!("all windows whose titles match ({})", title),
        _ => format!(
            "windows in the process with id ({}) whose titles match ({})",
            pid_text.trim(),
            title
        ),
    }
}

fn to_keycode(code: f64, source: &str) -> Result<i32, Failure> {
    if code.is_finite() && code >= i32::MIN as f64 && code <= i32::MAX as f64 {
        Ok(code.trunc() as i32)
    } else {
        Err(Failure::evaluation(format!("invalid keycode '{}'", source)))
    }
}

fn parse_keycodes(list: &str) -> Result<Vec<i32>, Failure> {
    list.split(',')
        .map(|k| {
            k.trim()
                .parse::<i32>()
                .map_err(|_| Failure::evaluation(format!("invalid keycode '{}' in '{}'", k.trim(), list)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        actions::{Action, ActionInstance, InstanceEnd},
        delegates::testing::RecordingEffects,
        events::EventSink,
        expr::Value,
        registry::Trigger,
        scope::{Tier, VarTable},
    };
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    async fn run(actions: Vec<Action>, vars: &[(&str, &str)]) -> (InstanceEnd, Vec<String>) {
        let fx = Arc::new(RecordingEffects::default());
        let mut scope = Scope::new(VarTable::new(), VarTable::new());
        for (name, value) in vars {
            scope.set(name, Value::from(*value), Tier::Instance);
        }
        let trigger = Arc::new(Trigger::new("t", "t", "x").actions(actions));
        let inst = ActionInstance::new(1, trigger, scope, CancellationToken::new(), fx.clone(), EventSink::disabled());
        let end = inst.run().await;
        (end, fx.calls())
    }

    fn message(pid: Param, title: &str, code: Param) -> Action {
        Action::Keypress(Keypress::WindowMessage {
            process_id: pid,
            title:      Param::literal(title),
            keycode:    code,
        })
    }

    fn combo(pid: &str, title: &str, codes: &str) -> Keypress {
        Keypress::WindowMessageCombo {
            process_id: Param::literal(pid),
            title:      Param::literal(title),
            keycodes:   Param::literal(codes),
        }
    }

    #[test]
    fn describes_each_operation() {
        let k = Keypress::send_keys(Param::literal("{ENTER}"));
        assert_eq!(k.describe(None), "send keypresses ({ENTER}) to the active window");

        let k = Keypress::WindowMessage {
            process_id: Param::literal("0"),
            title:      Param::literal(""),
            keycode:    Param::literal("13"),
        };
        assert_eq!(k.describe(None), "send keycode (13) to the first window whose title match (.*)");

        assert_eq!(
            combo("-1", "Game", "17,65").describe(None),
            "send keycodes (17,65) to all windows whose titles match (Game)"
        );
        assert_eq!(
            combo("4242", "Game", "17").describe(None),
            "send keycodes (17) to windows in the process with id (4242) whose titles match (Game)"
        );
    }

    #[test]
    fn keycode_lists_are_trimmed() {
        assert_eq!(parse_keycodes(" 17, 65 ,13").unwrap(), vec![17, 65, 13]);
        assert!(parse_keycodes("17,x").is_err());
    }

    #[test]
    fn keycode_range_is_checked() {
        assert_eq!(to_keycode(13.7, "13.7").unwrap(), 13);
        assert!(to_keycode(f64::NAN, "x").is_err());
        assert!(to_keycode(1e12, "1e12").is_err());
    }

    #[tokio::test]
    async fn window_message_resolves_the_target() {
        let (end, calls) = run(
            vec![
                message(Param::literal("0"), "", Param::literal("13")),
                message(Param::literal("-1"), "Game", Param::expression("code + 1").unwrap()),
                message(Param::expression("pid").unwrap(), "Game.*", Param::literal("65")),
            ],
            &[("code", "16"), ("pid", "4242")],
        )
        .await;
        assert_eq!(end, InstanceEnd::Completed);
        assert_eq!(
            calls,
            vec!["keycode:13:FirstMatch:.*", "keycode:17:All:Game", "keycode:65:Process(4242):Game.*"]
        );
    }

    #[tokio::test]
    async fn window_message_combo_sends_the_keycode_list() {
        let combo_from = |codes: Param| {
            Action::Keypress(Keypress::WindowMessageCombo {
                process_id: Param::literal("-1"),
                title:      Param::literal("Game"),
                keycodes:   codes,
            })
        };
        let (end, calls) = run(
            vec![
                combo_from(Param::literal("17, 65")),
                combo_from(Param::template("${mod},${key}").unwrap()),
            ],
            &[("mod", "18"), ("key", "70")],
        )
        .await;
        assert_eq!(end, InstanceEnd::Completed);
        assert_eq!(calls, vec!["keycodes:[17, 65]:All:Game", "keycodes:[18, 70]:All:Game"]);
    }

    #[tokio::test]
    async fn bad_keycode_list_fails_the_instance() {
        let (end, calls) = run(
            vec![Action::Keypress(combo("0", "", "17,x")), Action::Keypress(Keypress::send_keys(Param::literal("after")))],
            &[],
        )
        .await;
        assert!(matches!(end, InstanceEnd::Failed(_)));
        assert!(calls.is_empty());
    }
}
