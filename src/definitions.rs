/// Trigger definitions: a TOML file compiled into a registry tree.
///
/// The file looks like:
///
/// ```toml
/// [variables]
/// phase = 1
///
/// [[trigger]]
/// name      = "Boss low"
/// pattern   = 'Boss HP: (?<hp>\d+)%'
/// condition = "hp < 20"
///
///   [[trigger.action]]
///   type = "speak"
///   text = "Boss at ${hp} percent"
///
/// [[folder]]
/// name = "Raid"
///
///   [[folder.trigger]]
///   ...
/// ```
///
/// String parameters are templates (`${expr}` segments); `{ expr = "..." }`
/// makes a parameter a bare expression. Everything is compiled here, once:
/// a trigger with a bad pattern or expression is still loaded, carrying its
/// problems, and never matches until the file is fixed.
use crate::{
    actions::{
        Action, ClearVariable, Conditional, Keypress, LogLevel, LogMessage, Param, PlaySound,
        Repeat, SetVariable, Speak, Wait,
    },
    error::CompileError,
    expr::{value::format_number, ExpressionCache, Value},
    registry::{Folder, Trigger, TriggerId},
    scope::Tier,
};
use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Sender;

// ---------------------------------------------------------------------------
// TOML deserialization structs (private)
// ---------------------------------------------------------------------------

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TomlFile {
    #[serde(default)]
    variables: BTreeMap<String, Value>,
    #[serde(default)]
    trigger:   Vec<TomlTrigger>,
    #[serde(default)]
    folder:    Vec<TomlFolder>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlFolder {
    name:     String,
    #[serde(default = "default_true")]
    enabled:  bool,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    trigger:  Vec<TomlTrigger>,
    #[serde(default)]
    folder:   Vec<TomlFolder>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlTrigger {
    /// Defaults to the folder path plus the name.
    id:            Option<String>,
    name:          String,
    pattern:       String,
    condition:     Option<String>,
    #[serde(default = "default_true")]
    enabled:       bool,
    #[serde(default = "default_max_instances")]
    max_instances: u32,
    #[serde(default)]
    suppress_ms:   u64,
    #[serde(default)]
    priority:      i32,
    #[serde(default)]
    action:        Vec<TomlAction>,
}

#[derive(Deserialize, Clone, Copy, Default)]
#[serde(rename_all = "snake_case")]
enum TomlKeyOperation {
    #[default]
    SendKeys,
    WindowMessage,
    WindowMessageCombo,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
enum TomlAction {
    Keypress {
        #[serde(default)]
        operation:    TomlKeyOperation,
        #[serde(default)]
        keys:         Option<TomlParam>,
        #[serde(default)]
        keycode:      Option<TomlParam>,
        #[serde(default)]
        window_title: Option<TomlParam>,
        #[serde(default)]
        process_id:   Option<TomlParam>,
    },
    PlaySound {
        resource: TomlParam,
        volume:   Option<TomlParam>,
    },
    Speak {
        text:   TomlParam,
        volume: Option<TomlParam>,
        rate:   Option<TomlParam>,
    },
    Log {
        #[serde(default)]
        level: LogLevel,
        text:  TomlParam,
    },
    SetVariable {
        name:  String,
        value: TomlParam,
        #[serde(default)]
        scope: Tier,
    },
    ClearVariable {
        name:  String,
        #[serde(default)]
        scope: Tier,
    },
    Wait {
        ms: TomlParam,
    },
    Repeat {
        count:    Option<TomlParam>,
        #[serde(rename = "while")]
        while_:   Option<String>,
        counter:  Option<String>,
        pause_ms: Option<TomlParam>,
        #[serde(default)]
        action:   Vec<TomlAction>,
    },
    Conditional {
        condition: String,
        #[serde(default)]
        then:      Vec<TomlAction>,
        #[serde(default, rename = "else")]
        otherwise: Vec<TomlAction>,
    },
    Stop {},
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TomlParam {
    Text(String),
    Number(f64),
    Bool(bool),
    Expr { expr: String },
}

fn default_true() -> bool { true }
fn default_max_instances() -> u32 { 1 }

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A compiled definitions file.
#[derive(Debug, Clone)]
pub struct Definitions {
    pub root:      Folder,
    /// Initial global variables.
    pub variables: Vec<(String, Value)>,
    /// Number of triggers that carry compile problems.
    pub problems:  usize,
}

pub fn load(path: &Path) -> Result<Definitions> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading trigger definitions {:?}", path))?;
    parse(&raw).with_context(|| format!("in trigger definitions {:?}", path))
}

/// Parse and compile. Only a malformed file is an error; bad patterns and
/// expressions become per-trigger problems.
pub fn parse(raw: &str) -> Result<Definitions> {
    let file: TomlFile = toml::from_str(raw)?;
    let mut compiler = Compiler::default();

    let mut root = Folder::root();
    root.triggers = compiler.triggers(file.trigger, &[]);
    root.folders = compiler.folders(file.folder, &[]);

    Ok(Definitions {
        root,
        variables: file.variables.into_iter().collect(),
        problems:  compiler.problems,
    })
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Compiler {
    cache:    ExpressionCache,
    seen:     HashSet<TriggerId>,
    problems: usize,
}

impl Compiler {
    fn folders(&mut self, defs: Vec<TomlFolder>, parent: &[String]) -> Vec<Folder> {
        defs.into_iter()
            .map(|def| {
                let mut path = parent.to_vec();
                path.push(def.name.clone());
                Folder {
                    name:     def.name,
                    enabled:  def.enabled,
                    priority: def.priority,
                    triggers: self.triggers(def.trigger, &path),
                    folders:  self.folders(def.folder, &path),
                }
            })
            .collect()
    }

    fn triggers(&mut self, defs: Vec<TomlTrigger>, path: &[String]) -> Vec<Arc<Trigger>> {
        defs.into_iter().map(|def| Arc::new(self.trigger(def, path))).collect()
    }

    fn trigger(&mut self, def: TomlTrigger, path: &[String]) -> Trigger {
        let mut id = def.id.clone().unwrap_or_else(|| {
            let mut parts = path.to_vec();
            parts.push(def.name.clone());
            parts.join("/")
        });
        let mut duplicate = None;
        if self.seen.contains(&TriggerId::from(id.as_str())) {
            duplicate = Some(id.clone());
            let mut n = 2;
            while self.seen.contains(&TriggerId::from(format!("{}#{}", id, n))) {
                n += 1;
            }
            id = format!("{}#{}", id, n);
        }
        self.seen.insert(TriggerId::from(id.as_str()));

        let mut problems = Vec::new();
        let condition = def.condition.as_deref().and_then(|c| match self.cache.parse(c) {
            Ok(e) => Some(e),
            Err(e) => {
                problems.push(CompileError::expression("condition", c, e));
                None
            }
        });
        let actions = self.actions(def.action, &mut problems);

        let mut trigger = Trigger::new(id.as_str(), def.name, &def.pattern)
            .with_condition(condition)
            .actions(actions)
            .enabled(def.enabled)
            .max_instances(def.max_instances)
            .suppress(Duration::from_millis(def.suppress_ms))
            .priority(def.priority);
        if let Some(dup) = duplicate {
            trigger = trigger.problem(CompileError::Definition(format!("duplicate trigger id '{}'", dup)));
        }
        for p in problems {
            trigger = trigger.problem(p);
        }

        if !trigger.problems.is_empty() {
            self.problems += 1;
            for p in &trigger.problems {
                tracing::warn!("Trigger '{}' [{}] will not match: {}", trigger.name, trigger.id, p);
            }
        }
        trigger
    }

    fn actions(&mut self, defs: Vec<TomlAction>, problems: &mut Vec<CompileError>) -> Vec<Action> {
        defs.into_iter()
            .filter_map(|def| match self.action(def) {
                Ok(a) => Some(a),
                Err(e) => {
                    problems.push(e);
                    None
                }
            })
            .collect()
    }

    fn action(&mut self, def: TomlAction) -> Result<Action, CompileError> {
        Ok(match def {
            TomlAction::Keypress { operation, keys, keycode, window_title, process_id } => {
                let mut field = |p: Option<TomlParam>, name: &str, default: &str| match p {
                    Some(p) => self.param(p, name),
                    None => Ok(Param::literal(default)),
                };
                let keypress = match operation {
                    TomlKeyOperation::SendKeys => Keypress::SendKeys {
                        keys: field(keys, "keys", "")?,
                    },
                    TomlKeyOperation::WindowMessage => Keypress::WindowMessage {
                        process_id: field(process_id, "process_id", "0")?,
                        title:      field(window_title, "window_title", "")?,
                        keycode:    field(keycode, "keycode", "0")?,
                    },
                    TomlKeyOperation::WindowMessageCombo => Keypress::WindowMessageCombo {
                        process_id: field(process_id, "process_id", "0")?,
                        title:      field(window_title, "window_title", "")?,
                        keycodes:   field(keycode, "keycode", "")?,
                    },
                };
                Action::Keypress(keypress)
            }
            TomlAction::PlaySound { resource, volume } => {
                let mut a = PlaySound::new(self.param(resource, "resource")?);
                if let Some(v) = volume {
                    a = a.volume(self.param(v, "volume")?);
                }
                Action::PlaySound(a)
            }
            TomlAction::Speak { text, volume, rate } => {
                let mut a = Speak::new(self.param(text, "text")?);
                if let Some(v) = volume {
                    a = a.volume(self.param(v, "volume")?);
                }
                if let Some(r) = rate {
                    a = a.rate(self.param(r, "rate")?);
                }
                Action::Speak(a)
            }
            TomlAction::Log { level, text } => {
                Action::Log(LogMessage::new(level, self.param(text, "text")?))
            }
            TomlAction::SetVariable { name, value, scope } => {
                Action::SetVariable(SetVariable::new(name, self.param(value, "value")?, scope))
            }
            TomlAction::ClearVariable { name, scope } => {
                Action::ClearVariable(ClearVariable::new(name, scope))
            }
            TomlAction::Wait { ms } => Action::Wait(Wait::new(self.param(ms, "ms")?)),
            TomlAction::Repeat { count, while_, counter, pause_ms, action } => {
                let mut body_problems = Vec::new();
                let body = self.actions(action, &mut body_problems);
                if let Some(p) = body_problems.into_iter().next() {
                    return Err(p);
                }
                let mut r = match (count, while_) {
                    (Some(n), None) => Repeat::count(self.param(n, "count")?, body),
                    (None, Some(w)) => {
                        let cond = self
                            .cache
                            .parse(&w)
                            .map_err(|e| CompileError::expression("while", &w, e))?;
                        Repeat::while_holds(cond, body)
                    }
                    _ => {
                        return Err(CompileError::Definition(
                            "repeat needs exactly one of 'count' or 'while'".into(),
                        ))
                    }
                };
                if let Some(c) = counter {
                    r = r.counter(c);
                }
                if let Some(p) = pause_ms {
                    r = r.pause(self.param(p, "pause_ms")?);
                }
                Action::Repeat(Arc::new(r))
            }
            TomlAction::Conditional { condition, then, otherwise } => {
                let cond = self
                    .cache
                    .parse(&condition)
                    .map_err(|e| CompileError::expression("condition", &condition, e))?;
                let mut branch_problems = Vec::new();
                let then = self.actions(then, &mut branch_problems);
                let otherwise = self.actions(otherwise, &mut branch_problems);
                if let Some(p) = branch_problems.into_iter().next() {
                    return Err(p);
                }
                Action::Conditional(Conditional::new(cond, then).otherwise(otherwise))
            }
            TomlAction::Stop {} => Action::Stop,
        })
    }

    fn param(&mut self, def: TomlParam, field: &str) -> Result<Param, CompileError> {
        match def {
            TomlParam::Text(s) => {
                Param::template(&s).map_err(|e| CompileError::expression(field, &s, e))
            }
            TomlParam::Number(n) => Ok(Param::literal(format_number(n))),
            TomlParam::Bool(b) => Ok(Param::literal(b.to_string())),
            TomlParam::Expr { expr } => self
                .cache
                .parse(&expr)
                .map(Param::Expression)
                .map_err(|e| CompileError::expression(field, &expr, e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

/// Blocking; run it on a dedicated thread. Sends a freshly compiled tree
/// every time the file changes. A file that fails to parse is reported and
/// the previous tree stays in place. Returns when `tx` is closed.
pub fn watch(path: PathBuf, tx: Sender<Folder>) -> Result<()> {
    tracing::info!("Definitions watcher starting: {:?}", path);

    // Watch the directory (editors often replace the file rather than write it)
    let watch_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();
    let (fs_tx, fs_rx) = std_mpsc::channel::<notify::Result<Event>>();
    let mut watcher = RecommendedWatcher::new(fs_tx, notify::Config::default())?;
    watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;

    loop {
        match fs_rx.recv_timeout(Duration::from_millis(500)) {
            Ok(Ok(Event { kind: EventKind::Create(_) | EventKind::Modify(_), paths, .. })) => {
                if !paths.iter().any(|p| p.file_name() == path.file_name()) {
                    continue;
                }
                // let a burst of write events settle
                std::thread::sleep(Duration::from_millis(100));
                while fs_rx.try_recv().is_ok() {}

                match load(&path) {
                    Ok(defs) => {
                        tracing::info!(
                            "Trigger definitions reloaded ({} problem trigger(s))",
                            defs.problems
                        );
                        if tx.blocking_send(defs.root).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("Keeping previous triggers: {:#}", e),
                }
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::error!("Definitions watcher error: {}", e),
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                if tx.is_closed() {
                    break;
                }
            }
            Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(())
}
