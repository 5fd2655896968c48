/// Text with embedded `${expression}` segments, e.g. `"Boss at ${hp}%"`.
///
/// Parsed once when a trigger is compiled and rendered against the instance
/// scope every time the action runs.
use super::{EvalError, Expression, ParseError, Variables};

#[derive(Debug, Clone)]
enum Segment {
    Text(String),
    Expr(Expression),
}

#[derive(Debug, Clone)]
pub struct Template {
    source:   String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, ParseError> {
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut rest = source;
        let mut offset = 0;

        while let Some(start) = rest.find("${") {
            text.push_str(&rest[..start]);
            let body_start = start + 2;
            let len = closing_brace(&rest[body_start..])
                .ok_or_else(|| ParseError::new("unterminated '${'", offset + start))?;
            let body = &rest[body_start..body_start + len];

            let expr = Expression::parse(body)
                .map_err(|e| ParseError::new(e.message, offset + body_start + e.position))?;
            if !text.is_empty() {
                segments.push(Segment::Text(std::mem::take(&mut text)));
            }
            segments.push(Segment::Expr(expr));

            let consumed = body_start + len + 1;
            offset += consumed;
            rest = &rest[consumed..];
        }
        text.push_str(rest);
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }

        Ok(Self { source: source.to_owned(), segments })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when the template has no `${}` segments.
    pub fn is_literal(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Text(_)))
    }

    pub fn render(&self, vars: &dyn Variables) -> Result<String, EvalError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(t) => out.push_str(t),
                Segment::Expr(e) => out.push_str(&e.evaluate(vars)?.to_string()),
            }
        }
        Ok(out)
    }
}

/// Byte length up to the `}` closing a `${`, skipping braces inside quotes.
fn closing_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (i, c) in s.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '{' => depth += 1,
            '}' if depth == 0 => return Some(i),
            '}' => depth -= 1,
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Value;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| ((*k).to_owned(), Value::from(*v))).collect()
    }

    #[test]
    fn renders_embedded_expressions() {
        let t = Template::parse("Boss at ${hp}%, next ${hp - 5}").unwrap();
        assert!(!t.is_literal());
        assert_eq!(t.render(&vars(&[("hp", "15")])).unwrap(), "Boss at 15%, next 10");
    }

    #[test]
    fn literal_text_passes_through() {
        let t = Template::parse("{ENTER}/p pull{ENTER}").unwrap();
        assert!(t.is_literal());
        assert_eq!(t.render(&vars(&[])).unwrap(), "{ENTER}/p pull{ENTER}");
    }

    #[test]
    fn braces_inside_strings_do_not_close() {
        let t = Template::parse("${'}' + x}!").unwrap();
        assert_eq!(t.render(&vars(&[("x", "a")])).unwrap(), "}a!");
    }

    #[test]
    fn error_positions_point_into_the_template() {
        let err = Template::parse("abc ${1 +}").unwrap_err();
        assert_eq!(err.position, 9);

        let err = Template::parse("x ${unclosed").unwrap_err();
        assert_eq!(err.position, 2);
    }
}
