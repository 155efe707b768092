// Runtime rule matching
//
// Prometheus reports loaded rules with its own rendering of the query, its
// own duration format and labels that may have been rewritten by
// relabeling. Matching a reported rule back to the canonical definition
// goes through three tiers, most specific first:
//
//   1. strict       - name, canonical query, duration and business labels
//   2. relaxed      - name, canonical query and duration; must be unique
//   3. sole         - the only candidate carrying that name
//
// An ambiguous relaxed match is refused instead of guessed. Callers treat
// it like no match and leave the reported labels alone.

use std::collections::BTreeMap;

use crate::alert_rule::{business_labels, AlertRule, Labels};
use crate::promql::canonicalize;

const DURATION_EPSILON: f64 = 1e-6;

/// A rule as reported by the running Prometheus.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeRule {
    pub name: String,
    pub query: String,
    /// Pending duration in seconds.
    pub duration: f64,
    pub labels: Labels,
}

#[derive(Debug, PartialEq)]
pub enum MatchOutcome<'a, C> {
    Strict(&'a C),
    Relaxed(&'a C),
    SoleCandidate(&'a C),
    Ambiguous,
    NoMatch,
}

impl<'a, C> MatchOutcome<'a, C> {
    /// The matched candidate, if the outcome is a match.
    pub fn matched(&self) -> Option<&'a C> {
        match self {
            MatchOutcome::Strict(c) | MatchOutcome::Relaxed(c) | MatchOutcome::SoleCandidate(c) => {
                Some(*c)
            }
            MatchOutcome::Ambiguous | MatchOutcome::NoMatch => None,
        }
    }
}

/// Finds the canonical candidate describing the same definition as `runtime`.
pub fn match_rule<'a, C: AsRef<AlertRule>>(
    runtime: &RuntimeRule,
    candidates: &'a [C],
) -> MatchOutcome<'a, C> {
    let named: Vec<&'a C> = candidates
        .iter()
        .filter(|c| c.as_ref().name() == Some(runtime.name.as_str()))
        .collect();
    if named.is_empty() {
        return MatchOutcome::NoMatch;
    }

    let query = canonicalize(&runtime.query);
    let runtime_labels = business_labels(&runtime.labels);

    let relaxed: Vec<&'a C> = named
        .iter()
        .copied()
        .filter(|c| {
            let rule = c.as_ref();
            canonicalize(&rule.expr) == query && same_duration(rule, runtime.duration)
        })
        .collect();

    let strict: Vec<&'a C> = relaxed
        .iter()
        .copied()
        .filter(|c| business_labels(&c.as_ref().labels) == runtime_labels)
        .collect();

    if strict.len() == 1 {
        return MatchOutcome::Strict(strict[0]);
    }
    match relaxed.len() {
        1 => return MatchOutcome::Relaxed(relaxed[0]),
        0 => {}
        _ => return MatchOutcome::Ambiguous,
    }
    if named.len() == 1 {
        return MatchOutcome::SoleCandidate(named[0]);
    }
    MatchOutcome::NoMatch
}

fn same_duration(rule: &AlertRule, seconds: f64) -> bool {
    let defined = rule
        .for_duration
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map_or(Some(0.0), parse_duration);
    match defined {
        Some(defined) => (defined - seconds).abs() < DURATION_EPSILON,
        None => false,
    }
}

/// Parses a Prometheus duration string (`1h30m`, `250ms`, `2d`) into seconds.
pub fn parse_duration(text: &str) -> Option<f64> {
    let units: BTreeMap<&str, f64> = [
        ("ms", 0.001),
        ("s", 1.0),
        ("m", 60.0),
        ("h", 3600.0),
        ("d", 86_400.0),
        ("w", 604_800.0),
        ("y", 31_536_000.0),
    ]
    .into_iter()
    .collect();

    let mut rest = text.trim();
    if rest.is_empty() {
        return None;
    }
    if rest == "0" {
        return Some(0.0);
    }

    let mut total = 0.0;
    while !rest.is_empty() {
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return None;
        }
        let value: f64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let unit_len = if rest.starts_with("ms") {
            2
        } else {
            rest.chars().next().map_or(0, char::len_utf8)
        };
        let factor = units.get(rest.get(..unit_len)?)?;
        total += value * factor;
        rest = &rest[unit_len..];
    }
    Some(total)
}
