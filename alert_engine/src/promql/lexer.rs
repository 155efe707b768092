// PromQL tokenizer
//
// Produces a flat token list. String literals are decoded here so the
// parser and printer only ever see their values.

use super::ParseError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Ident(String),
    Number(String),
    Duration(String),
    Str(String),
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Colon,
    At,
    Op(&'static str),
}

const OPERATORS: &[&str] = &[
    "==", "!=", "=~", "!~", ">=", "<=", "=", ">", "<", "+", "-", "*", "/", "%", "^",
];

const DURATION_UNITS: &[&str] = &["ms", "s", "m", "h", "d", "w", "y"];

pub(crate) fn tokenize(src: &str) -> Result<Vec<Token>, ParseError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c == '#' {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).map_or(false, |n| n.is_ascii_digit())) {
            let (token, next) = lex_number(&chars, i)?;
            tokens.push(token);
            i = next;
            continue;
        }

        let starts_ident = c.is_ascii_alphabetic()
            || c == '_'
            || (c == ':' && chars.get(i + 1).map_or(false, |n| n.is_ascii_alphabetic() || *n == '_'));
        if starts_ident {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == ':') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }

        match c {
            '"' | '\'' => {
                let (value, next) = lex_quoted(&chars, i)?;
                tokens.push(Token::Str(value));
                i = next;
                continue;
            }
            '`' => {
                let start = i + 1;
                let end = (start..chars.len())
                    .find(|&j| chars[j] == '`')
                    .ok_or_else(|| ParseError::new("unterminated raw string"))?;
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
                continue;
            }
            '(' => tokens.push(Token::LParen),
            ')' => tokens.push(Token::RParen),
            '{' => tokens.push(Token::LBrace),
            '}' => tokens.push(Token::RBrace),
            '[' => tokens.push(Token::LBracket),
            ']' => tokens.push(Token::RBracket),
            ',' => tokens.push(Token::Comma),
            ':' => tokens.push(Token::Colon),
            '@' => tokens.push(Token::At),
            _ => {
                let op = OPERATORS
                    .iter()
                    .copied()
                    .find(|op| {
                        op.chars()
                            .enumerate()
                            .all(|(k, oc)| chars.get(i + k) == Some(&oc))
                    })
                    .ok_or_else(|| ParseError::new(format!("unexpected character {:?}", c)))?;
                tokens.push(Token::Op(op));
                i += op.len();
                continue;
            }
        }
        i += 1;
    }

    Ok(tokens)
}

fn lex_number(chars: &[char], start: usize) -> Result<(Token, usize), ParseError> {
    let mut i = start;

    if chars[i] == '0' && matches!(chars.get(i + 1), Some('x') | Some('X')) {
        i += 2;
        while i < chars.len() && chars[i].is_ascii_hexdigit() {
            i += 1;
        }
        return Ok((Token::Number(chars[start..i].iter().collect()), i));
    }

    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
        i += 1;
    }

    if matches!(chars.get(i), Some('e') | Some('E')) {
        let mut j = i + 1;
        if matches!(chars.get(j), Some('+') | Some('-')) {
            j += 1;
        }
        if chars.get(j).map_or(false, |c| c.is_ascii_digit()) {
            i = j;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            return Ok((Token::Number(chars[start..i].iter().collect()), i));
        }
    }

    if chars.get(i).map_or(false, |c| c.is_ascii_alphabetic()) {
        while i < chars.len() && chars[i].is_ascii_alphanumeric() {
            i += 1;
        }
        let text: String = chars[start..i].iter().collect();
        if !is_duration(&text) {
            return Err(ParseError::new(format!("invalid duration {:?}", text)));
        }
        return Ok((Token::Duration(text), i));
    }

    Ok((Token::Number(chars[start..i].iter().collect()), i))
}

/// Checks the `(<digits><unit>)+` duration grammar.
pub(crate) fn is_duration(text: &str) -> bool {
    let mut rest = text;
    if rest.is_empty() {
        return false;
    }
    while !rest.is_empty() {
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return false;
        }
        rest = &rest[digits..];
        // "ms" must be tried before "m"
        let Some(unit) = DURATION_UNITS.iter().find(|u| rest.starts_with(*u)) else {
            return false;
        };
        rest = &rest[unit.len()..];
    }
    true
}

fn lex_quoted(chars: &[char], start: usize) -> Result<(String, usize), ParseError> {
    let quote = chars[start];
    let mut value = String::new();
    let mut i = start + 1;

    while i < chars.len() {
        let c = chars[i];
        if c == quote {
            return Ok((value, i + 1));
        }
        if c != '\\' {
            value.push(c);
            i += 1;
            continue;
        }

        let escaped = chars
            .get(i + 1)
            .ok_or_else(|| ParseError::new("unterminated escape sequence"))?;
        i += 2;
        match escaped {
            'n' => value.push('\n'),
            't' => value.push('\t'),
            'r' => value.push('\r'),
            'a' => value.push('\u{07}'),
            'b' => value.push('\u{08}'),
            'f' => value.push('\u{0c}'),
            'v' => value.push('\u{0b}'),
            'x' | 'u' | 'U' => {
                let width = match escaped {
                    'x' => 2,
                    'u' => 4,
                    _ => 8,
                };
                let hex: String = chars.iter().skip(i).take(width).collect();
                let decoded = u32::from_str_radix(&hex, 16)
                    .ok()
                    .filter(|_| hex.len() == width)
                    .and_then(char::from_u32)
                    .ok_or_else(|| ParseError::new(format!("invalid escape \\{}{}", escaped, hex)))?;
                value.push(decoded);
                i += width;
            }
            other => value.push(*other),
        }
    }

    Err(ParseError::new("unterminated string literal"))
}
