//! Recurrence rules as values.
//!
//! The provider sends a series' recurrence as a list of iCalendar lines
//! (`RRULE:`, `EXDATE:`, ...). Only `RRULE` lines are interpreted; every
//! other line is carried through untouched.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

const RULE_PREFIX: &str = "RRULE:";
const UNTIL_FORMAT: &str = "%Y%m%dT%H%M%SZ";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecurrenceError {
    #[error("recurrence rule has no parts")]
    Empty,

    #[error("malformed recurrence rule part `{0}`")]
    MalformedPart(String),
}

/// One `RRULE`, kept as ordered `KEY=VALUE` parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurrenceRule {
    parts: Vec<(String, String)>,
}

impl RecurrenceRule {
    fn get(&self, key: &str) -> Option<&str> {
        self.parts
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn frequency(&self) -> Option<&str> {
        self.get("FREQ")
    }

    pub fn count(&self) -> Option<u32> {
        self.get("COUNT")?.parse().ok()
    }

    pub fn until(&self) -> Option<&str> {
        self.get("UNTIL")
    }

    /// Has a COUNT or UNTIL limit
    pub fn is_bounded(&self) -> bool {
        self.get("COUNT").is_some() || self.get("UNTIL").is_some()
    }

    /// Same rule with COUNT and UNTIL removed
    pub fn unbounded(&self) -> Self {
        Self {
            parts: self
                .parts
                .iter()
                .filter(|(k, _)| k != "COUNT" && k != "UNTIL")
                .cloned()
                .collect(),
        }
    }

    /// Same rule ending at `last` (inclusive), replacing any previous limit
    pub fn ending_at(&self, last: DateTime<Utc>) -> Self {
        let mut rule = self.unbounded();
        rule.parts
            .push(("UNTIL".to_string(), last.format(UNTIL_FORMAT).to_string()));
        rule
    }
}

impl FromStr for RecurrenceRule {
    type Err = RecurrenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s.trim();
        let body = match body.get(..RULE_PREFIX.len()) {
            Some(head) if head.eq_ignore_ascii_case(RULE_PREFIX) => &body[RULE_PREFIX.len()..],
            _ => body,
        };

        let parts = body
            .split(';')
            .filter(|part| !part.trim().is_empty())
            .map(|part| {
                let (key, value) = part
                    .split_once('=')
                    .ok_or_else(|| RecurrenceError::MalformedPart(part.to_string()))?;
                let key = key.trim();
                if key.is_empty() {
                    return Err(RecurrenceError::MalformedPart(part.to_string()));
                }
                Ok((key.to_ascii_uppercase(), value.trim().to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if parts.is_empty() {
            return Err(RecurrenceError::Empty);
        }
        Ok(Self { parts })
    }
}

impl fmt::Display for RecurrenceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(RULE_PREFIX)?;
        for (i, (key, value)) in self.parts.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RecurrenceLine {
    Rule(RecurrenceRule),
    Other(String),
}

/// A series' full recurrence list
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Recurrence {
    lines: Vec<RecurrenceLine>,
}

impl Recurrence {
    pub fn parse<S: AsRef<str>>(lines: &[S]) -> Result<Self, RecurrenceError> {
        let lines = lines
            .iter()
            .map(|line| AsRef::<str>::as_ref(line))
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                let is_rule = line
                    .trim_start()
                    .get(..RULE_PREFIX.len())
                    .is_some_and(|head| head.eq_ignore_ascii_case(RULE_PREFIX));
                if is_rule {
                    line.parse().map(RecurrenceLine::Rule)
                } else {
                    Ok(RecurrenceLine::Other(line.to_string()))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { lines })
    }

    pub fn rules(&self) -> impl Iterator<Item = &RecurrenceRule> {
        self.lines.iter().filter_map(|line| match line {
            RecurrenceLine::Rule(rule) => Some(rule),
            RecurrenceLine::Other(_) => None,
        })
    }

    pub fn has_rules(&self) -> bool {
        self.rules().next().is_some()
    }

    /// Any rule already carries COUNT or UNTIL
    pub fn is_bounded(&self) -> bool {
        self.rules().any(RecurrenceRule::is_bounded)
    }

    fn map_rules(&self, f: impl Fn(&RecurrenceRule) -> RecurrenceRule) -> Self {
        Self {
            lines: self
                .lines
                .iter()
                .map(|line| match line {
                    RecurrenceLine::Rule(rule) => RecurrenceLine::Rule(f(rule)),
                    other => other.clone(),
                })
                .collect(),
        }
    }

    /// Series stopping one second before `occurrence_start`
    pub fn truncated_before(&self, occurrence_start: DateTime<Utc>) -> Self {
        let last = occurrence_start - Duration::seconds(1);
        self.map_rules(|rule| rule.ending_at(last))
    }

    /// Series with every COUNT/UNTIL limit removed
    pub fn unbounded(&self) -> Self {
        self.map_rules(RecurrenceRule::unbounded)
    }

    /// Lines in the provider's wire format
    pub fn to_wire(&self) -> Vec<String> {
        self.lines
            .iter()
            .map(|line| match line {
                RecurrenceLine::Rule(rule) => rule.to_string(),
                RecurrenceLine::Other(raw) => raw.clone(),
            })
            .collect()
    }
}
