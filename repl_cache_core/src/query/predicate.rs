//! Query predicates evaluated against local entries
//!
//! Predicates are plain data so they can be shipped to remote nodes. The
//! text form used by the client protocol is a whitespace separated list of
//! terms that must all hold:
//!
//! - `*` matches everything
//! - `key=abc` exact key, `key^ab` key prefix
//! - `value^ab` value prefix, `value~b` value substring
//! - a leading `!` negates a term

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Predicate {
    All,
    KeyEquals(String),
    KeyPrefix(String),
    ValuePrefix(String),
    ValueContains(String),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn matches(&self, key: &str, value: &str) -> bool {
        match self {
            Predicate::All => true,
            Predicate::KeyEquals(k) => key == k,
            Predicate::KeyPrefix(p) => key.starts_with(p.as_str()),
            Predicate::ValuePrefix(p) => value.starts_with(p.as_str()),
            Predicate::ValueContains(s) => value.contains(s.as_str()),
            Predicate::And(terms) => terms.iter().all(|t| t.matches(key, value)),
            Predicate::Or(terms) => terms.iter().any(|t| t.matches(key, value)),
            Predicate::Not(inner) => !inner.matches(key, value),
        }
    }

    /// The single key this predicate can match, if it pins one. Used to
    /// narrow a query to that key's owners.
    pub fn exact_key(&self) -> Option<&str> {
        match self {
            Predicate::KeyEquals(k) => Some(k),
            Predicate::And(terms) => terms.iter().find_map(|t| t.exact_key()),
            _ => None,
        }
    }

    pub fn and(self, other: Predicate) -> Predicate {
        match self {
            Predicate::And(mut terms) => {
                terms.push(other);
                Predicate::And(terms)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    fn parse_term(term: &str) -> Result<Predicate, String> {
        if let Some(rest) = term.strip_prefix('!') {
            return Ok(Predicate::Not(Box::new(Self::parse_term(rest)?)));
        }
        if term == "*" {
            return Ok(Predicate::All);
        }
        let split = term
            .find(|c| c == '=' || c == '^' || c == '~')
            .ok_or_else(|| format!("invalid predicate term '{}'", term))?;
        let (field, rest) = term.split_at(split);
        let (op, arg) = rest.split_at(1);
        let arg = arg.to_string();

        match (field, op) {
            ("key", "=") => Ok(Predicate::KeyEquals(arg)),
            ("key", "^") => Ok(Predicate::KeyPrefix(arg)),
            ("value", "^") => Ok(Predicate::ValuePrefix(arg)),
            ("value", "~") => Ok(Predicate::ValueContains(arg)),
            _ => Err(format!("unsupported predicate term '{}'", term)),
        }
    }
}

impl FromStr for Predicate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut terms = s
            .split_whitespace()
            .map(Predicate::parse_term)
            .collect::<Result<Vec<_>, _>>()?;
        match terms.len() {
            0 => Err("empty predicate".to_string()),
            1 => Ok(terms.remove(0)),
            _ => Ok(Predicate::And(terms)),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::All => write!(f, "*"),
            Predicate::KeyEquals(k) => write!(f, "key={}", k),
            Predicate::KeyPrefix(p) => write!(f, "key^{}", p),
            Predicate::ValuePrefix(p) => write!(f, "value^{}", p),
            Predicate::ValueContains(s) => write!(f, "value~{}", s),
            Predicate::Not(inner) => write!(f, "!{}", inner),
            Predicate::And(terms) | Predicate::Or(terms) => {
                let joiner = if matches!(self, Predicate::And(_)) { " AND " } else { " OR " };
                let parts: Vec<String> = terms.iter().map(|t| t.to_string()).collect();
                write!(f, "({})", parts.join(joiner))
            }
        }
    }
}
