//! Structural canonicalization of PromQL expressions.
//!
//! Two rule expressions that differ only in whitespace, matcher order or
//! grouping-label order must compare equal. Queries are parsed into a small
//! expression tree, every order-insensitive list in the tree is sorted, and
//! the tree is printed back in one fixed layout. Text that does not parse
//! falls back to whitespace normalization that leaves string literals alone.
//!
//! This is not an evaluator: the tree keeps only what printing needs.

mod lexer;
mod parser;

use std::fmt;

pub use parser::parse;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    message: String,
}

impl ParseError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PromQL parse error: {}", self.message)
    }
}

impl std::error::Error for ParseError {}

// ============================================================================
// Expression tree
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMatcher {
    pub name: String,
    pub op: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grouping {
    pub without: bool,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSide {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorMatching {
    /// `on(...)` when true, `ignoring(...)` otherwise. `None` for neither.
    pub on: Option<bool>,
    pub labels: Vec<String>,
    pub group: Option<(GroupSide, Vec<String>)>,
}

/// Offset and `@` modifiers shared by selectors and subqueries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Modifiers {
    pub offset: Option<String>,
    pub at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Number(String),
    Str(String),
    Selector {
        name: Option<String>,
        matchers: Vec<LabelMatcher>,
        range: Option<String>,
        modifiers: Modifiers,
    },
    Call {
        func: String,
        args: Vec<Expr>,
    },
    Aggregate {
        op: String,
        param: Option<Box<Expr>>,
        expr: Box<Expr>,
        grouping: Option<Grouping>,
    },
    Binary {
        op: String,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        return_bool: bool,
        matching: Option<VectorMatching>,
    },
    Unary {
        op: &'static str,
        expr: Box<Expr>,
    },
    Paren(Box<Expr>),
    Subquery {
        expr: Box<Expr>,
        range: String,
        step: Option<String>,
        modifiers: Modifiers,
    },
}

impl Expr {
    /// Sorts every list whose order carries no meaning, recursively.
    pub fn sort_labels(&mut self) {
        match self {
            Expr::Number(_) | Expr::Str(_) => {}
            Expr::Selector { matchers, .. } => {
                matchers.sort_by(|a, b| {
                    (a.name.as_str(), a.op, a.value.as_str()).cmp(&(b.name.as_str(), b.op, b.value.as_str()))
                });
            }
            Expr::Call { args, .. } => args.iter_mut().for_each(Expr::sort_labels),
            Expr::Aggregate {
                param,
                expr,
                grouping,
                ..
            } => {
                if let Some(param) = param {
                    param.sort_labels();
                }
                expr.sort_labels();
                if let Some(grouping) = grouping {
                    grouping.labels.sort();
                    grouping.labels.dedup();
                }
            }
            Expr::Binary {
                lhs, rhs, matching, ..
            } => {
                lhs.sort_labels();
                rhs.sort_labels();
                if let Some(matching) = matching {
                    matching.labels.sort();
                    matching.labels.dedup();
                    if let Some((_, include)) = &mut matching.group {
                        include.sort();
                        include.dedup();
                    }
                }
            }
            Expr::Unary { expr, .. } | Expr::Paren(expr) | Expr::Subquery { expr, .. } => {
                expr.sort_labels()
            }
        }
    }
}

// ============================================================================
// Printing
// ============================================================================

fn write_string(f: &mut fmt::Formatter<'_>, value: &str) -> fmt::Result {
    f.write_str("\"")?;
    for c in value.chars() {
        match c {
            '\\' => f.write_str("\\\\")?,
            '"' => f.write_str("\\\"")?,
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            '\r' => f.write_str("\\r")?,
            other => write!(f, "{}", other)?,
        }
    }
    f.write_str("\"")
}

fn write_number(f: &mut fmt::Formatter<'_>, text: &str) -> fmt::Result {
    let lower = text.to_ascii_lowercase();
    if let Some(hex) = lower.strip_prefix("0x") {
        if let Ok(n) = u64::from_str_radix(hex, 16) {
            return write!(f, "{}", n);
        }
    }
    match lower.as_str() {
        "inf" | "+inf" => return f.write_str("+Inf"),
        "nan" => return f.write_str("NaN"),
        _ => {}
    }
    match text.parse::<f64>() {
        Ok(n) if n.is_finite() => write!(f, "{}", n),
        _ => f.write_str(text),
    }
}

fn write_labels(f: &mut fmt::Formatter<'_>, labels: &[String]) -> fmt::Result {
    write!(f, "({})", labels.join(", "))
}

fn write_modifiers(f: &mut fmt::Formatter<'_>, modifiers: &Modifiers) -> fmt::Result {
    if let Some(offset) = &modifiers.offset {
        write!(f, " offset {}", offset)?;
    }
    if let Some(at) = &modifiers.at {
        write!(f, " @ {}", at)?;
    }
    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(text) => write_number(f, text),
            Expr::Str(value) => write_string(f, value),
            Expr::Selector {
                name,
                matchers,
                range,
                modifiers,
            } => {
                if let Some(name) = name {
                    f.write_str(name)?;
                }
                if !matchers.is_empty() || name.is_none() {
                    f.write_str("{")?;
                    for (i, m) in matchers.iter().enumerate() {
                        if i > 0 {
                            f.write_str(", ")?;
                        }
                        write!(f, "{}{}", m.name, m.op)?;
                        write_string(f, &m.value)?;
                    }
                    f.write_str("}")?;
                }
                if let Some(range) = range {
                    write!(f, "[{}]", range)?;
                }
                write_modifiers(f, modifiers)
            }
            Expr::Call { func, args } => {
                write!(f, "{}(", func)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                f.write_str(")")
            }
            Expr::Aggregate {
                op,
                param,
                expr,
                grouping,
            } => {
                f.write_str(op)?;
                if let Some(grouping) = grouping {
                    f.write_str(if grouping.without { " without " } else { " by " })?;
                    write_labels(f, &grouping.labels)?;
                    f.write_str(" ")?;
                }
                f.write_str("(")?;
                if let Some(param) = param {
                    write!(f, "{}, ", param)?;
                }
                write!(f, "{})", expr)
            }
            Expr::Binary {
                op,
                lhs,
                rhs,
                return_bool,
                matching,
            } => {
                write!(f, "{} {}", lhs, op)?;
                if *return_bool {
                    f.write_str(" bool")?;
                }
                if let Some(matching) = matching {
                    if let Some(on) = matching.on {
                        f.write_str(if on { " on" } else { " ignoring" })?;
                        write_labels(f, &matching.labels)?;
                    }
                    if let Some((side, include)) = &matching.group {
                        f.write_str(match side {
                            GroupSide::Left => " group_left",
                            GroupSide::Right => " group_right",
                        })?;
                        write_labels(f, include)?;
                    }
                }
                write!(f, " {}", rhs)
            }
            Expr::Unary { op, expr } => write!(f, "{}{}", op, expr),
            Expr::Paren(expr) => write!(f, "({})", expr),
            Expr::Subquery {
                expr,
                range,
                step,
                modifiers,
            } => {
                write!(f, "{}[{}:{}]", expr, range, step.as_deref().unwrap_or(""))?;
                write_modifiers(f, modifiers)
            }
        }
    }
}

// ============================================================================
// Canonicalization
// ============================================================================

/// Canonical text of a query, suitable for equality comparison.
pub fn canonicalize(query: &str) -> String {
    match parse(query) {
        Ok(mut expr) => {
            expr.sort_labels();
            expr.to_string()
        }
        Err(e) => {
            log::debug!("Falling back to whitespace normalization: {}", e);
            normalize_whitespace(query)
        }
    }
}

/// Collapses whitespace runs outside string literals to a single space.
///
/// Quoted text (`"`, `'`, and raw backtick strings) is copied verbatim,
/// including escaped quote characters.
pub fn normalize_whitespace(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut pending_space = false;

    for c in query.trim().chars() {
        if let Some(q) = quote {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' && q != '`' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }

        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        if matches!(c, '"' | '\'' | '`') {
            quote = Some(c);
        }
        out.push(c);
    }

    out
}
