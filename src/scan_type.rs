//! Scan-type predicates.
//!
//! A [`ScanType`] is a pure function of (previous value, current value).
//! [`ScanType::validate`] rejects combinations that are undefined for a
//! value type before any memory is read.

use std::cmp::Ordering;
use std::fmt;

use crate::error::{Error, Result};
use crate::value::{Value, ValueType};

/// Predicate family used to select or filter candidates.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanType {
    /// Current value equals the given value.
    Exact(Value),
    Increased,
    /// Current value is exactly `previous + delta`.
    IncreasedBy(Value),
    Decreased,
    /// Current value is exactly `previous - delta`.
    DecreasedBy(Value),
    /// Current value is below the given value.
    Less(Value),
    /// Current value is above the given value.
    More(Value),
    /// Current value lies in `[lo, hi]`.
    Between(Value, Value),
    Changed,
    Unchanged,
    /// Matches everything; seeds a session when the value is not known yet.
    Unknown,
}

impl ScanType {
    pub fn name(&self) -> &'static str {
        match self {
            ScanType::Exact(_) => "exact",
            ScanType::Increased => "increased",
            ScanType::IncreasedBy(_) => "increased-by",
            ScanType::Decreased => "decreased",
            ScanType::DecreasedBy(_) => "decreased-by",
            ScanType::Less(_) => "less",
            ScanType::More(_) => "more",
            ScanType::Between(_, _) => "between",
            ScanType::Changed => "changed",
            ScanType::Unchanged => "unchanged",
            ScanType::Unknown => "unknown",
        }
    }

    /// Whether the predicate compares against the previously observed value.
    pub fn needs_previous(&self) -> bool {
        matches!(
            self,
            ScanType::Increased
                | ScanType::IncreasedBy(_)
                | ScanType::Decreased
                | ScanType::DecreasedBy(_)
                | ScanType::Changed
                | ScanType::Unchanged
        )
    }

    fn params(&self) -> Vec<&Value> {
        match self {
            ScanType::Exact(v)
            | ScanType::IncreasedBy(v)
            | ScanType::DecreasedBy(v)
            | ScanType::Less(v)
            | ScanType::More(v) => vec![v],
            ScanType::Between(lo, hi) => vec![lo, hi],
            _ => Vec::new(),
        }
    }

    /// Check that this predicate is defined for `value_type` and that its
    /// parameters have the right shape. `first_scan` rejects predicates
    /// that need a previous value.
    pub fn validate(&self, value_type: ValueType, first_scan: bool) -> Result<()> {
        if !value_type.is_numeric()
            && !matches!(
                self,
                ScanType::Exact(_) | ScanType::Changed | ScanType::Unchanged
            )
        {
            return Err(Error::UnsupportedScanType {
                scan: self.name(),
                value_type: value_type.to_string(),
            });
        }
        if value_type.size() == 0 {
            return Err(Error::InvalidInput(format!(
                "{} has zero length",
                value_type
            )));
        }
        if first_scan && self.needs_previous() {
            return Err(Error::InvalidInput(format!(
                "{} scan needs a previous value and cannot start a session",
                self.name()
            )));
        }

        for param in self.params() {
            let ok = match (param, value_type) {
                (Value::Float(_), t) => t.is_float(),
                (Value::Int(_), t) => t.is_numeric(),
                (Value::Bytes(b), t) => !t.is_numeric() && b.len() == t.size(),
            };
            if !ok {
                return Err(Error::InvalidInput(format!(
                    "{} parameter {} does not fit {}",
                    self.name(),
                    param,
                    value_type
                )));
            }
        }

        if let ScanType::Between(lo, hi) = self {
            if as_float_if(value_type, lo).compare(&as_float_if(value_type, hi))
                == Some(Ordering::Greater)
            {
                return Err(Error::InvalidInput(format!(
                    "between bounds reversed: {} > {}",
                    lo, hi
                )));
            }
        }
        Ok(())
    }

    /// Evaluate the predicate. `prev` is ignored by Exact, Less, More,
    /// Between and Unknown; predicates that need it fail when it is absent.
    pub fn matches(&self, prev: Option<&Value>, curr: &Value) -> bool {
        match self {
            ScanType::Unknown => true,
            ScanType::Exact(v) => curr == &coerce(curr, v),
            ScanType::Less(v) => curr.compare(&coerce(curr, v)) == Some(Ordering::Less),
            ScanType::More(v) => curr.compare(&coerce(curr, v)) == Some(Ordering::Greater),
            ScanType::Between(lo, hi) => {
                let lo_ok = matches!(
                    curr.compare(&coerce(curr, lo)),
                    Some(Ordering::Greater | Ordering::Equal)
                );
                let hi_ok = matches!(
                    curr.compare(&coerce(curr, hi)),
                    Some(Ordering::Less | Ordering::Equal)
                );
                lo_ok && hi_ok
            }
            ScanType::Changed => prev.is_some_and(|p| !curr.same_as(p)),
            ScanType::Unchanged => prev.is_some_and(|p| curr.same_as(p)),
            ScanType::Increased => {
                prev.is_some_and(|p| curr.compare(p) == Some(Ordering::Greater))
            }
            ScanType::Decreased => prev.is_some_and(|p| curr.compare(p) == Some(Ordering::Less)),
            ScanType::IncreasedBy(delta) => prev
                .and_then(|p| curr.delta_from(p))
                .is_some_and(|d| d == coerce(&d, delta)),
            ScanType::DecreasedBy(delta) => prev
                .and_then(|p| p.delta_from(curr))
                .is_some_and(|d| d == coerce(&d, delta)),
        }
    }
}

impl ScanType {
    /// The same predicate with its parameters rounded to the precision of
    /// `value_type`.
    pub fn narrowed_to(&self, value_type: ValueType) -> ScanType {
        let n = |v: &Value| value_type.narrow(v);
        match self {
            ScanType::Exact(v) => ScanType::Exact(n(v)),
            ScanType::IncreasedBy(v) => ScanType::IncreasedBy(n(v)),
            ScanType::DecreasedBy(v) => ScanType::DecreasedBy(n(v)),
            ScanType::Less(v) => ScanType::Less(n(v)),
            ScanType::More(v) => ScanType::More(n(v)),
            ScanType::Between(lo, hi) => ScanType::Between(n(lo), n(hi)),
            other => other.clone(),
        }
    }

    /// Evaluate against values stored as `value_type`. Computed deltas are
    /// rounded to its precision; parameters are taken as given, so pass a
    /// predicate from [`ScanType::narrowed_to`].
    pub fn matches_as(&self, value_type: ValueType, prev: Option<&Value>, curr: &Value) -> bool {
        match self {
            ScanType::IncreasedBy(delta) => prev
                .and_then(|p| curr.delta_from(p))
                .is_some_and(|d| value_type.narrow(&d) == coerce(&d, delta)),
            ScanType::DecreasedBy(delta) => prev
                .and_then(|p| p.delta_from(curr))
                .is_some_and(|d| value_type.narrow(&d) == coerce(&d, delta)),
            _ => self.matches(prev, curr),
        }
    }
}

impl fmt::Display for ScanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = self.params();
        if params.is_empty() {
            return write!(f, "{}", self.name());
        }
        let rendered: Vec<String> = params.iter().map(|p| p.to_string()).collect();
        write!(f, "{}({})", self.name(), rendered.join(", "))
    }
}

/// Integer parameters are accepted for float types; compare them as floats.
fn coerce(reference: &Value, param: &Value) -> Value {
    match (reference, param) {
        (Value::Float(_), Value::Int(i)) => Value::Float(*i as f64),
        _ => param.clone(),
    }
}

fn as_float_if(value_type: ValueType, v: &Value) -> Value {
    match v {
        Value::Int(i) if value_type.is_float() => Value::Float(*i as f64),
        _ => v.clone(),
    }
}
