/// Tree-walking evaluator and the built-in function table.
///
/// Evaluation is total over parser-produced trees: unresolved variables read
/// as the empty string and division by zero yields a signed infinity.
use super::{BinaryOp, EvalError, Expr, UnaryOp, Value, Variables};
use once_cell::sync::Lazy;
use std::cmp::Ordering;
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Built-in functions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Len,
    Upper,
    Lower,
    Trim,
    Substr,
    IndexOf,
    Contains,
    Replace,
    Abs,
    Floor,
    Ceil,
    Round,
    Sqrt,
    Pow,
    Min,
    Max,
    If,
    Num,
    Str,
}

#[derive(Debug, Clone, Copy)]
pub struct Builtin {
    func:     Func,
    min_args: usize,
    /// `None` = variadic
    max_args: Option<usize>,
}

impl Builtin {
    pub fn accepts(&self, n: usize) -> bool {
        n >= self.min_args && self.max_args.map_or(true, |max| n <= max)
    }

    pub fn arity_text(&self) -> String {
        match self.max_args {
            Some(max) if max == self.min_args => format!("{} argument(s)", max),
            Some(max) => format!("{}-{} arguments", self.min_args, max),
            None      => format!("at least {} arguments", self.min_args),
        }
    }
}

static BUILTINS: Lazy<HashMap<&'static str, Builtin>> = Lazy::new(|| {
    let table: [(&str, Func, usize, Option<usize>); 19] = [
        ("len",      Func::Len,      1, Some(1)),
        ("upper",    Func::Upper,    1, Some(1)),
        ("lower",    Func::Lower,    1, Some(1)),
        ("trim",     Func::Trim,     1, Some(1)),
        ("substr",   Func::Substr,   2, Some(3)),
        ("indexof",  Func::IndexOf,  2, Some(2)),
        ("contains", Func::Contains, 2, Some(2)),
        ("replace",  Func::Replace,  3, Some(3)),
        ("abs",      Func::Abs,      1, Some(1)),
        ("floor",    Func::Floor,    1, Some(1)),
        ("ceil",     Func::Ceil,     1, Some(1)),
        ("round",    Func::Round,    1, Some(2)),
        ("sqrt",     Func::Sqrt,     1, Some(1)),
        ("pow",      Func::Pow,      2, Some(2)),
        ("min",      Func::Min,      1, None),
        ("max",      Func::Max,      1, None),
        ("if",       Func::If,       3, Some(3)),
        ("num",      Func::Num,      1, Some(1)),
        ("str",      Func::Str,      1, Some(1)),
    ];
    table
        .into_iter()
        .map(|(name, func, min_args, max_args)| (name, Builtin { func, min_args, max_args }))
        .collect()
});

/// Look up a built-in by lower-case name.
pub fn builtin(name: &str) -> Option<&'static Builtin> {
    BUILTINS.get(name)
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

pub fn evaluate(expr: &Expr, vars: &dyn Variables) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Var(name)  => Ok(vars.lookup(name).unwrap_or_default()),
        Expr::Unary(op, operand) => {
            let v = evaluate(operand, vars)?;
            Ok(match op {
                UnaryOp::Neg => Value::Number(-v.to_number()),
                UnaryOp::Not => Value::Bool(!v.is_truthy()),
            })
        }
        Expr::Binary(BinaryOp::And, lhs, rhs) => {
            if !evaluate(lhs, vars)?.is_truthy() {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(evaluate(rhs, vars)?.is_truthy()))
        }
        Expr::Binary(BinaryOp::Or, lhs, rhs) => {
            if evaluate(lhs, vars)?.is_truthy() {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(evaluate(rhs, vars)?.is_truthy()))
        }
        Expr::Binary(op, lhs, rhs) => {
            let a = evaluate(lhs, vars)?;
            let b = evaluate(rhs, vars)?;
            Ok(binary(*op, &a, &b))
        }
        Expr::Call(name, args) => call(name, args, vars),
    }
}

fn binary(op: BinaryOp, a: &Value, b: &Value) -> Value {
    match op {
        BinaryOp::Add => match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => Value::Number(x + y),
            // an unset variable counts as 0 next to a number
            (None, Some(y)) if a.is_blank() => Value::Number(y),
            (Some(x), None) if b.is_blank() => Value::Number(x),
            _ => Value::Str(format!("{}{}", a, b)),
        },
        BinaryOp::Sub => Value::Number(a.to_number() - b.to_number()),
        BinaryOp::Mul => Value::Number(a.to_number() * b.to_number()),
        BinaryOp::Div => Value::Number(divide(a.to_number(), b.to_number(), |x, y| x / y)),
        BinaryOp::Rem => Value::Number(divide(a.to_number(), b.to_number(), |x, y| x % y)),
        BinaryOp::Eq  => Value::Bool(a.loose_eq(b)),
        BinaryOp::Ne  => Value::Bool(!a.loose_eq(b)),
        BinaryOp::Lt  => Value::Bool(a.loose_cmp(b) == Some(Ordering::Less)),
        BinaryOp::Le  => Value::Bool(matches!(a.loose_cmp(b), Some(Ordering::Less | Ordering::Equal))),
        BinaryOp::Gt  => Value::Bool(a.loose_cmp(b) == Some(Ordering::Greater)),
        BinaryOp::Ge  => Value::Bool(matches!(a.loose_cmp(b), Some(Ordering::Greater | Ordering::Equal))),
        // short-circuit forms are handled in evaluate()
        BinaryOp::And => Value::Bool(a.is_truthy() && b.is_truthy()),
        BinaryOp::Or  => Value::Bool(a.is_truthy() || b.is_truthy()),
    }
}

/// Zero divisor → infinity carrying the numerator's sign (NaN and 0 count as positive).
fn divide(x: f64, y: f64, f: impl Fn(f64, f64) -> f64) -> f64 {
    if y == 0.0 {
        if x < 0.0 { f64::NEG_INFINITY } else { f64::INFINITY }
    } else {
        f(x, y)
    }
}

fn call(name: &str, args: &[Expr], vars: &dyn Variables) -> Result<Value, EvalError> {
    let sig = builtin(name).ok_or_else(|| EvalError::UnknownFunction(name.to_owned()))?;
    if !sig.accepts(args.len()) {
        return Err(EvalError::Arity {
            name:     name.to_owned(),
            expected: sig.arity_text(),
            got:      args.len(),
        });
    }

    // if() is lazy in its branches
    if sig.func == Func::If {
        let branch = if evaluate(&args[0], vars)?.is_truthy() { &args[1] } else { &args[2] };
        return evaluate(branch, vars);
    }

    let values = args
        .iter()
        .map(|a| evaluate(a, vars))
        .collect::<Result<Vec<_>, _>>()?;
    let text = |i: usize| values[i].to_string();
    let num  = |i: usize| values[i].to_number();

    Ok(match sig.func {
        Func::Len      => Value::Number(text(0).chars().count() as f64),
        Func::Upper    => Value::Str(text(0).to_uppercase()),
        Func::Lower    => Value::Str(text(0).to_lowercase()),
        Func::Trim     => Value::Str(text(0).trim().to_owned()),
        Func::Substr   => {
            let s = text(0);
            let start = clamp_index(num(1));
            let len = if values.len() > 2 { clamp_index(num(2)) } else { usize::MAX };
            Value::Str(s.chars().skip(start).take(len).collect())
        }
        Func::IndexOf  => {
            let s = text(0);
            let needle = text(1);
            let idx = s.find(&needle).map(|b| s[..b].chars().count() as f64).unwrap_or(-1.0);
            Value::Number(idx)
        }
        Func::Contains => Value::Bool(text(0).contains(&text(1))),
        Func::Replace  => {
            let from = text(1);
            if from.is_empty() {
                Value::Str(text(0))
            } else {
                Value::Str(text(0).replace(&from, &text(2)))
            }
        }
        Func::Abs      => Value::Number(num(0).abs()),
        Func::Floor    => Value::Number(num(0).floor()),
        Func::Ceil     => Value::Number(num(0).ceil()),
        Func::Round    => {
            let digits = if values.len() > 1 { num(1).clamp(0.0, 15.0).trunc() as i32 } else { 0 };
            let scale = 10f64.powi(digits);
            Value::Number((num(0) * scale).round() / scale)
        }
        Func::Sqrt     => Value::Number(num(0).sqrt()),
        Func::Pow      => Value::Number(num(0).powf(num(1))),
        Func::Min      => Value::Number(values.iter().map(Value::to_number).fold(f64::INFINITY, f64::min)),
        Func::Max      => Value::Number(values.iter().map(Value::to_number).fold(f64::NEG_INFINITY, f64::max)),
        Func::Num      => Value::Number(num(0)),
        Func::Str      => Value::Str(text(0)),
        Func::If       => unreachable!("handled above"),
    })
}

fn clamp_index(n: f64) -> usize {
    if n.is_nan() || n <= 0.0 {
        0
    } else if n >= usize::MAX as f64 {
        usize::MAX
    } else {
        n as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expression;

    fn eval(src: &str, vars: &[(&str, &str)]) -> Value {
        let map: HashMap<String, Value> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), Value::from(*v)))
            .collect();
        Expression::parse(src).unwrap().evaluate(&map).unwrap()
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(eval("1 + 2 * 3", &[]), Value::Number(7.0));
        assert_eq!(eval("(1 + 2) * 3", &[]), Value::Number(9.0));
        assert_eq!(eval("10 - 4 - 3", &[]), Value::Number(3.0));
        assert_eq!(eval("7 % 4", &[]), Value::Number(3.0));
        assert_eq!(eval("-2 * -3", &[]), Value::Number(6.0));
    }

    #[test]
    fn plus_concatenates_non_numeric_strings() {
        assert_eq!(eval("'hp: ' + hp", &[("hp", "15")]).to_string(), "hp: 15");
        assert_eq!(eval("counter + 1", &[("counter", "0")]), Value::Number(1.0));
        assert_eq!(eval("0.5 + 'x'", &[]).to_string(), "0.5x");
    }

    #[test]
    fn comparisons() {
        assert_eq!(eval("hp < 20", &[("hp", "15")]), Value::Bool(true));
        assert_eq!(eval("hp < 20", &[("hp", "150")]), Value::Bool(false));
        assert_eq!(eval("name == 'Boss'", &[("name", "Boss")]), Value::Bool(true));
        assert_eq!(eval("'abc' < 'abd'", &[]), Value::Bool(true));
        assert_eq!(eval("'10' == 10", &[]), Value::Bool(true));
    }

    #[test]
    fn logical_operators_short_circuit() {
        assert_eq!(eval("false && missing", &[]), Value::Bool(false));
        assert_eq!(eval("1 || missing", &[]), Value::Bool(true));
        assert_eq!(eval("!''", &[]), Value::Bool(true));
    }

    #[test]
    fn evaluation_is_total() {
        assert_eq!(eval("missing", &[]), Value::from(""));
        assert_eq!(eval("missing + 'x'", &[]).to_string(), "x");
        assert_eq!(eval("missing + 1", &[]), Value::Number(1.0));
        assert_eq!(eval("5 / 0", &[]), Value::Number(f64::INFINITY));
        assert_eq!(eval("-5 / 0", &[]), Value::Number(f64::NEG_INFINITY));
        assert_eq!(eval("0 / 0", &[]), Value::Number(f64::INFINITY));
        assert_eq!(eval("5 % 0", &[]), Value::Number(f64::INFINITY));
        assert!(eval("'abc' * 2", &[]).to_number().is_nan());
    }

    #[test]
    fn builtins() {
        assert_eq!(eval("len('héllo')", &[]), Value::Number(5.0));
        assert_eq!(eval("upper(n)", &[("n", "boss")]), Value::from("BOSS"));
        assert_eq!(eval("substr('abcdef', 2, 3)", &[]), Value::from("cde"));
        assert_eq!(eval("substr('abc', 5)", &[]), Value::from(""));
        assert_eq!(eval("indexof('abc', 'c')", &[]), Value::Number(2.0));
        assert_eq!(eval("indexof('abc', 'z')", &[]), Value::Number(-1.0));
        assert_eq!(eval("replace('a-b-c', '-', '+')", &[]), Value::from("a+b+c"));
        assert_eq!(eval("round(2.456, 2)", &[]), Value::Number(2.46));
        assert_eq!(eval("max(3, x, 9)", &[("x", "12")]), Value::Number(12.0));
        assert_eq!(eval("if(hp < 20, 'low', 'ok')", &[("hp", "15")]), Value::from("low"));
        assert_eq!(eval("str(1.50)", &[]), Value::from("1.5"));
    }

    #[test]
    fn hand_built_tree_with_bad_call_is_an_error() {
        let bad = Expr::Call("nope".into(), vec![]);
        let vars: HashMap<String, Value> = HashMap::new();
        assert!(matches!(evaluate(&bad, &vars), Err(EvalError::UnknownFunction(_))));

        let bad = Expr::Call("len".into(), vec![]);
        assert!(matches!(evaluate(&bad, &vars), Err(EvalError::Arity { .. })));
    }
}
