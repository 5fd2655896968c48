/// Tokenizer for the expression grammar. Positions are byte offsets into
/// the source text and end up in `ParseError`.
use super::ParseError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,

    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,

    LParen,
    RParen,
    Comma,

    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub pos:  usize,
}

pub fn tokenize(src: &str) -> Result<Vec<Token>, ParseError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;

        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == b'.' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit)) {
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i < bytes.len() && bytes[i] == b'.' {
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let n: f64 = src[start..i]
                .parse()
                .map_err(|_| ParseError::new(format!("invalid number '{}'", &src[start..i]), start))?;
            tokens.push(Token { kind: TokenKind::Number(n), pos: start });
            continue;
        }

        // identifiers follow regex group names, so any Unicode letter works
        let ch = src[i..].chars().next().unwrap_or('\0');
        if ch.is_alphabetic() || ch == '_' {
            i += src[i..]
                .find(|ch: char| !(ch.is_alphanumeric() || ch == '_'))
                .unwrap_or(src.len() - i);
            let kind = match &src[start..i] {
                "true"  => TokenKind::True,
                "false" => TokenKind::False,
                word    => TokenKind::Ident(word.to_owned()),
            };
            tokens.push(Token { kind, pos: start });
            continue;
        }

        if c == b'"' || c == b'\'' {
            let (text, next) = lex_string(src, start)?;
            tokens.push(Token { kind: TokenKind::Str(text), pos: start });
            i = next;
            continue;
        }

        let two = bytes.get(i + 1).copied();
        let (kind, width) = match (c, two) {
            (b'=', Some(b'=')) => (TokenKind::EqEq, 2),
            (b'!', Some(b'=')) => (TokenKind::NotEq, 2),
            (b'<', Some(b'=')) => (TokenKind::Le, 2),
            (b'>', Some(b'=')) => (TokenKind::Ge, 2),
            (b'&', Some(b'&')) => (TokenKind::AndAnd, 2),
            (b'|', Some(b'|')) => (TokenKind::OrOr, 2),
            (b'<', _) => (TokenKind::Lt, 1),
            (b'>', _) => (TokenKind::Gt, 1),
            (b'!', _) => (TokenKind::Bang, 1),
            (b'+', _) => (TokenKind::Plus, 1),
            (b'-', _) => (TokenKind::Minus, 1),
            (b'*', _) => (TokenKind::Star, 1),
            (b'/', _) => (TokenKind::Slash, 1),
            (b'%', _) => (TokenKind::Percent, 1),
            (b'(', _) => (TokenKind::LParen, 1),
            (b')', _) => (TokenKind::RParen, 1),
            (b',', _) => (TokenKind::Comma, 1),
            (b'=', _) => return Err(ParseError::new("unexpected '=' (use '==' to compare)", start)),
            _ => {
                let ch = src[start..].chars().next().unwrap_or('?');
                return Err(ParseError::new(format!("unexpected character '{}'", ch), start));
            }
        };
        tokens.push(Token { kind, pos: start });
        i += width;
    }

    tokens.push(Token { kind: TokenKind::Eof, pos: src.len() });
    Ok(tokens)
}

/// Lex a quoted string starting at `start` (the opening quote).
/// Returns the unescaped text and the byte offset just past the closing quote.
fn lex_string(src: &str, start: usize) -> Result<(String, usize), ParseError> {
    let mut chars = src[start..].char_indices();
    let (_, quote) = chars.next().ok_or_else(|| ParseError::new("expected string", start))?;
    let mut out = String::new();

    while let Some((off, ch)) = chars.next() {
        match ch {
            c if c == quote => return Ok((out, start + off + c.len_utf8())),
            '\\' => match chars.next() {
                Some((_, 'n'))  => out.push('\n'),
                Some((_, 't'))  => out.push('\t'),
                Some((_, other)) => out.push(other),
                None => break,
            },
            c => out.push(c),
        }
    }
    Err(ParseError::new("unterminated string literal", start))
}
