// Precedence-climbing PromQL parser
//
// Binary precedence, lowest first:
//   or < and, unless < comparisons < +, - < *, /, %, atan2 < ^
// `^` is right associative. Unary signs bind looser than `^`, so `-a ^ b`
// parses as `-(a ^ b)`.

use super::lexer::{tokenize, Token};
use super::{Expr, GroupSide, Grouping, LabelMatcher, Modifiers, ParseError, VectorMatching};

const POW_PRECEDENCE: u8 = 6;

// Bounds on what gets parsed at all. Every tree node consumes at least one
// token, so the token bound also bounds tree height for the recursive
// sorting, printing and dropping that follow a successful parse.
const MAX_TOKENS: usize = 4096;
const MAX_NESTING: usize = 256;

const AGGREGATIONS: &[&str] = &[
    "sum",
    "avg",
    "count",
    "min",
    "max",
    "group",
    "stddev",
    "stdvar",
    "topk",
    "bottomk",
    "quantile",
    "count_values",
    "limitk",
    "limit_ratio",
];

/// Parses a query into an expression tree.
pub fn parse(query: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(query)?;
    if tokens.is_empty() {
        return Err(ParseError::new("empty expression"));
    }
    if tokens.len() > MAX_TOKENS {
        return Err(ParseError::new(format!(
            "expression has {} tokens, more than the {} allowed",
            tokens.len(),
            MAX_TOKENS
        )));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.parse_expr(0)?;
    if let Some(token) = parser.peek() {
        return Err(ParseError::new(format!("unexpected trailing token {:?}", token)));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Active `parse_expr` calls.
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Result<Token, ParseError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| ParseError::new("unexpected end of expression"))?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: Token) -> Result<(), ParseError> {
        let token = self.next()?;
        if token == expected {
            Ok(())
        } else {
            Err(ParseError::new(format!("expected {:?}, found {:?}", expected, token)))
        }
    }

    fn peek_keyword(&self) -> Option<String> {
        match self.peek() {
            Some(Token::Ident(name)) => Some(name.to_ascii_lowercase()),
            _ => None,
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword().as_deref() == Some(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_duration(&mut self) -> Result<String, ParseError> {
        match self.next()? {
            Token::Duration(d) => Ok(d),
            other => Err(ParseError::new(format!("expected duration, found {:?}", other))),
        }
    }

    // ------------------------------------------------------------------------
    // Binary expressions
    // ------------------------------------------------------------------------

    fn peek_binary_op(&self) -> Option<(String, u8, bool)> {
        let op = match self.peek()? {
            Token::Op(op) if *op != "=" && *op != "=~" && *op != "!~" => op.to_string(),
            Token::Ident(name) => {
                let lower = name.to_ascii_lowercase();
                match lower.as_str() {
                    "and" | "or" | "unless" | "atan2" => lower,
                    _ => return None,
                }
            }
            _ => return None,
        };
        let precedence = match op.as_str() {
            "or" => 1,
            "and" | "unless" => 2,
            "==" | "!=" | ">" | "<" | ">=" | "<=" => 3,
            "+" | "-" => 4,
            "*" | "/" | "%" | "atan2" => 5,
            "^" => POW_PRECEDENCE,
            _ => return None,
        };
        Some((op, precedence, precedence == POW_PRECEDENCE))
    }

    fn parse_expr(&mut self, min_precedence: u8) -> Result<Expr, ParseError> {
        if self.depth >= MAX_NESTING {
            return Err(ParseError::new(format!(
                "expression nested deeper than {} levels",
                MAX_NESTING
            )));
        }
        self.depth += 1;
        let expr = self.parse_binary(min_precedence);
        self.depth -= 1;
        expr
    }

    fn parse_binary(&mut self, min_precedence: u8) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;

        while let Some((op, precedence, right_assoc)) = self.peek_binary_op() {
            if precedence < min_precedence {
                break;
            }
            self.pos += 1;

            let return_bool = self.eat_keyword("bool");
            let matching = self.parse_vector_matching()?;
            let next_min = if right_assoc { precedence } else { precedence + 1 };
            let rhs = self.parse_expr(next_min)?;

            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                return_bool,
                matching,
            };
        }

        Ok(lhs)
    }

    fn parse_vector_matching(&mut self) -> Result<Option<VectorMatching>, ParseError> {
        let on = if self.eat_keyword("on") {
            Some(true)
        } else if self.eat_keyword("ignoring") {
            Some(false)
        } else {
            None
        };
        let labels = match on {
            Some(_) => self.parse_label_list()?,
            None => Vec::new(),
        };

        let side = if self.eat_keyword("group_left") {
            Some(GroupSide::Left)
        } else if self.eat_keyword("group_right") {
            Some(GroupSide::Right)
        } else {
            None
        };
        let group = match side {
            Some(side) => {
                let include = if self.peek() == Some(&Token::LParen) {
                    self.parse_label_list()?
                } else {
                    Vec::new()
                };
                Some((side, include))
            }
            None => None,
        };

        if on.is_none() && group.is_none() {
            return Ok(None);
        }
        Ok(Some(VectorMatching { on, labels, group }))
    }

    fn parse_label_list(&mut self) -> Result<Vec<String>, ParseError> {
        self.expect(Token::LParen)?;
        let mut labels = Vec::new();
        loop {
            match self.next()? {
                Token::RParen => break,
                Token::Ident(name) => {
                    labels.push(name);
                    match self.next()? {
                        Token::Comma => continue,
                        Token::RParen => break,
                        other => {
                            return Err(ParseError::new(format!(
                                "expected ',' or ')' in label list, found {:?}",
                                other
                            )))
                        }
                    }
                }
                other => {
                    return Err(ParseError::new(format!(
                        "expected label name, found {:?}",
                        other
                    )))
                }
            }
        }
        Ok(labels)
    }

    // ------------------------------------------------------------------------
    // Unary, postfix and primary expressions
    // ------------------------------------------------------------------------

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            Some(&Token::Op(op @ ("-" | "+"))) => {
                self.pos += 1;
                let expr = self.parse_expr(POW_PRECEDENCE)?;
                Ok(Expr::Unary {
                    op,
                    expr: Box::new(expr),
                })
            }
            _ => {
                let primary = self.parse_primary()?;
                self.parse_postfix(primary)
            }
        }
    }

    fn parse_postfix(&mut self, mut expr: Expr) -> Result<Expr, ParseError> {
        loop {
            match self.peek() {
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let range = self.expect_duration()?;
                    if self.peek() == Some(&Token::Colon) {
                        self.pos += 1;
                        let step = match self.peek() {
                            Some(Token::Duration(_)) => Some(self.expect_duration()?),
                            _ => None,
                        };
                        self.expect(Token::RBracket)?;
                        expr = Expr::Subquery {
                            expr: Box::new(expr),
                            range,
                            step,
                            modifiers: Modifiers::default(),
                        };
                    } else {
                        self.expect(Token::RBracket)?;
                        expr = match expr {
                            Expr::Selector {
                                name,
                                matchers,
                                range: None,
                                modifiers,
                            } if modifiers == Modifiers::default() => Expr::Selector {
                                name,
                                matchers,
                                range: Some(range),
                                modifiers,
                            },
                            _ => {
                                return Err(ParseError::new(
                                    "range selection is only allowed on instant vector selectors",
                                ))
                            }
                        };
                    }
                }
                Some(Token::Ident(name)) if name.eq_ignore_ascii_case("offset") => {
                    self.pos += 1;
                    let negative = self.peek() == Some(&Token::Op("-"));
                    if negative {
                        self.pos += 1;
                    }
                    let duration = self.expect_duration()?;
                    let offset = if negative { format!("-{}", duration) } else { duration };
                    modifiers_of(&mut expr)?.offset = Some(offset);
                }
                Some(Token::At) => {
                    self.pos += 1;
                    let at = match self.next()? {
                        Token::Number(n) => n,
                        Token::Ident(name)
                            if matches!(name.as_str(), "start" | "end")
                                && self.peek() == Some(&Token::LParen) =>
                        {
                            self.expect(Token::LParen)?;
                            self.expect(Token::RParen)?;
                            format!("{}()", name)
                        }
                        other => {
                            return Err(ParseError::new(format!(
                                "invalid @ modifier {:?}",
                                other
                            )))
                        }
                    };
                    modifiers_of(&mut expr)?.at = Some(at);
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.next()? {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::Duration(d) => Ok(Expr::Number(d)),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::LParen => {
                let inner = self.parse_expr(0)?;
                self.expect(Token::RParen)?;
                Ok(Expr::Paren(Box::new(inner)))
            }
            Token::LBrace => {
                let matchers = self.parse_matchers()?;
                if matchers.is_empty() {
                    return Err(ParseError::new("vector selector must contain a matcher"));
                }
                Ok(Expr::Selector {
                    name: None,
                    matchers,
                    range: None,
                    modifiers: Modifiers::default(),
                })
            }
            Token::Ident(name) => self.parse_identifier(name),
            other => Err(ParseError::new(format!("unexpected token {:?}", other))),
        }
    }

    fn parse_identifier(&mut self, name: String) -> Result<Expr, ParseError> {
        let lower = name.to_ascii_lowercase();

        if AGGREGATIONS.contains(&lower.as_str()) {
            let grouping_follows = matches!(
                self.peek_keyword().as_deref(),
                Some("by") | Some("without")
            );
            if grouping_follows || self.peek() == Some(&Token::LParen) {
                return self.parse_aggregate(lower);
            }
        }

        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let mut args = Vec::new();
            if self.peek() == Some(&Token::RParen) {
                self.pos += 1;
            } else {
                loop {
                    args.push(self.parse_expr(0)?);
                    match self.next()? {
                        Token::Comma => continue,
                        Token::RParen => break,
                        other => {
                            return Err(ParseError::new(format!(
                                "expected ',' or ')' in call to {}, found {:?}",
                                name, other
                            )))
                        }
                    }
                }
            }
            return Ok(Expr::Call { func: name, args });
        }

        if lower == "inf" || lower == "nan" {
            return Ok(Expr::Number(name));
        }

        let matchers = if self.peek() == Some(&Token::LBrace) {
            self.pos += 1;
            self.parse_matchers()?
        } else {
            Vec::new()
        };
        Ok(Expr::Selector {
            name: Some(name),
            matchers,
            range: None,
            modifiers: Modifiers::default(),
        })
    }

    fn parse_grouping(&mut self) -> Result<Option<Grouping>, ParseError> {
        let without = match self.peek_keyword().as_deref() {
            Some("by") => false,
            Some("without") => true,
            _ => return Ok(None),
        };
        self.pos += 1;
        let labels = self.parse_label_list()?;
        Ok(Some(Grouping { without, labels }))
    }

    fn parse_aggregate(&mut self, op: String) -> Result<Expr, ParseError> {
        let mut grouping = self.parse_grouping()?;

        self.expect(Token::LParen)?;
        let first = self.parse_expr(0)?;
        let (param, expr) = if self.peek() == Some(&Token::Comma) {
            self.pos += 1;
            let second = self.parse_expr(0)?;
            (Some(Box::new(first)), second)
        } else {
            (None, first)
        };
        self.expect(Token::RParen)?;

        if grouping.is_none() {
            grouping = self.parse_grouping()?;
        }

        Ok(Expr::Aggregate {
            op,
            param,
            expr: Box::new(expr),
            grouping,
        })
    }

    /// Parses matchers after an opening brace, through the closing brace.
    fn parse_matchers(&mut self) -> Result<Vec<LabelMatcher>, ParseError> {
        let mut matchers = Vec::new();
        loop {
            let name = match self.next()? {
                Token::RBrace => break,
                Token::Ident(name) => name,
                Token::Str(name) => name,
                other => {
                    return Err(ParseError::new(format!(
                        "expected label name, found {:?}",
                        other
                    )))
                }
            };
            let op = match self.next()? {
                Token::Op(op @ ("=" | "!=" | "=~" | "!~")) => op,
                other => {
                    return Err(ParseError::new(format!(
                        "expected label matching operator, found {:?}",
                        other
                    )))
                }
            };
            let value = match self.next()? {
                Token::Str(value) => value,
                other => {
                    return Err(ParseError::new(format!(
                        "expected label value string, found {:?}",
                        other
                    )))
                }
            };
            matchers.push(LabelMatcher { name, op, value });

            match self.next()? {
                Token::Comma => continue,
                Token::RBrace => break,
                other => {
                    return Err(ParseError::new(format!(
                        "expected ',' or '}}' in selector, found {:?}",
                        other
                    )))
                }
            }
        }
        Ok(matchers)
    }
}

fn modifiers_of(expr: &mut Expr) -> Result<&mut Modifiers, ParseError> {
    match expr {
        Expr::Selector { modifiers, .. } | Expr::Subquery { modifiers, .. } => Ok(modifiers),
        _ => Err(ParseError::new(
            "offset and @ modifiers are only allowed on selectors and subqueries",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_of_multiplication_over_addition() {
        let expr = parse("a + b * c").unwrap();
        match expr {
            Expr::Binary { op, rhs, .. } => {
                assert_eq!(op, "+");
                assert!(matches!(*rhs, Expr::Binary { ref op, .. } if op == "*"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn power_is_right_associative() {
        assert_eq!(parse("2 ^ 3 ^ 2").unwrap().to_string(), "2 ^ 3 ^ 2");
        match parse("2 ^ 3 ^ 2").unwrap() {
            Expr::Binary { lhs, .. } => assert!(matches!(*lhs, Expr::Number(_))),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unary_minus_binds_looser_than_power() {
        match parse("-a ^ 2").unwrap() {
            Expr::Unary { op, expr } => {
                assert_eq!(op, "-");
                assert!(matches!(*expr, Expr::Binary { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn set_operators_are_case_insensitive() {
        assert_eq!(parse("a AND b").unwrap().to_string(), "a and b");
    }

    #[test]
    fn bool_modifier_and_ignoring() {
        assert_eq!(
            parse("a > bool ignoring(instance) b").unwrap().to_string(),
            "a > bool ignoring(instance) b"
        );
    }

    #[test]
    fn selector_without_name() {
        assert_eq!(
            parse(r#"{__name__=~"job:.*"}"#).unwrap().to_string(),
            r#"{__name__=~"job:.*"}"#
        );
        assert!(parse("{}").is_err());
    }

    #[test]
    fn trailing_comma_in_matchers() {
        assert_eq!(
            parse(r#"up{job="a",}"#).unwrap().to_string(),
            r#"up{job="a"}"#
        );
    }

    #[test]
    fn at_and_negative_offset() {
        assert_eq!(
            parse("up @ start() offset -5m").unwrap().to_string(),
            "up offset -5m @ start()"
        );
    }

    #[test]
    fn range_on_non_selector_is_rejected() {
        assert!(parse("rate(x[5m])[5m]").is_err());
        assert!(parse("(up)[5m]").is_err());
    }

    #[test]
    fn aggregate_named_metric_is_still_a_selector() {
        assert_eq!(parse("count").unwrap().to_string(), "count");
    }

    #[test]
    fn string_escapes_survive_printing() {
        assert_eq!(
            parse(r#"label_replace(up, "dst", "$1", "src", "a\"(.*)")"#)
                .unwrap()
                .to_string(),
            r#"label_replace(up, "dst", "$1", "src", "a\"(.*)")"#
        );
    }

    #[test]
    fn nesting_is_bounded() {
        let nested = |n: usize| format!("{}up{}", "(".repeat(n), ")".repeat(n));
        assert!(parse(&nested(100)).is_ok());
        assert!(parse(&nested(1_000)).is_err());
        assert!(parse(&nested(10_000)).is_err());

        let negated = format!("{}up", "-".repeat(1_000));
        assert!(parse(&negated).is_err());
    }

    #[test]
    fn oversized_expressions_are_rejected() {
        let chain = vec!["up"; 3_000].join(" + ");
        assert!(parse(&chain).is_err());
        let short = vec!["up"; 100].join(" + ");
        assert!(parse(&short).is_ok());
    }

    #[test]
    fn incomplete_input_is_an_error() {
        assert!(parse("sum(").is_err());
        assert!(parse("a +").is_err());
        assert!(parse("a b").is_err());
        assert!(parse("").is_err());
    }
}
