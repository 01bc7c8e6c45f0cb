//! Filter predicates over table columns.
//!
//! Quals are held in conjunctive normal form: a list of OR-groups that must
//! all hold. Evaluation against an object's column range is conservative;
//! a qual only reports "cannot match" when the range proves it.

use crate::object::ColumnRange;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Comparison operator of a qual.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "<>")]
    NotEq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    LtEq,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    GtEq,
}

impl QualOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "<>",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
        }
    }
}

impl FromStr for QualOp {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "=" => Ok(Self::Eq),
            "<>" | "!=" => Ok(Self::NotEq),
            "<" => Ok(Self::Lt),
            "<=" => Ok(Self::LtEq),
            ">" => Ok(Self::Gt),
            ">=" => Ok(Self::GtEq),
            other => Err(crate::Error::InvalidQual(format!(
                "unsupported operator: {other}"
            ))),
        }
    }
}

impl fmt::Display for QualOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single `column op value` predicate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Qual {
    pub column: String,
    pub op: QualOp,
    pub value: serde_json::Value,
}

impl Qual {
    pub fn new(column: impl Into<String>, op: QualOp, value: impl Into<serde_json::Value>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    /// Whether rows within `range` could satisfy this qual.
    ///
    /// Returns `true` whenever the answer is unknown: missing range, nulls,
    /// or values of incomparable JSON types.
    pub fn may_match(&self, range: Option<&ColumnRange>) -> bool {
        let Some(range) = range else {
            return true;
        };
        let (Some(vs_min), Some(vs_max)) = (
            compare(&self.value, &range.min),
            compare(&self.value, &range.max),
        ) else {
            return true;
        };

        match self.op {
            QualOp::Eq => vs_min != Ordering::Less && vs_max != Ordering::Greater,
            QualOp::NotEq => !(vs_min == Ordering::Equal && vs_max == Ordering::Equal),
            // some row has column < value iff min < value
            QualOp::Lt => vs_min == Ordering::Greater,
            QualOp::LtEq => vs_min != Ordering::Less,
            QualOp::Gt => vs_max == Ordering::Less,
            QualOp::GtEq => vs_max != Ordering::Greater,
        }
    }
}

impl fmt::Display for Qual {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.column, self.op, self.value)
    }
}

/// Quals in conjunctive normal form.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quals(pub Vec<Vec<Qual>>);

impl Quals {
    /// A conjunction of single-qual groups.
    pub fn all(quals: impl IntoIterator<Item = Qual>) -> Self {
        Self(quals.into_iter().map(|q| vec![q]).collect())
    }

    /// Add an OR-group.
    pub fn and_any(mut self, group: Vec<Qual>) -> Self {
        self.0.push(group);
        self
    }

    pub fn groups(&self) -> &[Vec<Qual>] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|g| g.is_empty())
    }

    /// Parse from JSON, e.g. `[[{"column":"id","op":">","value":5}]]`.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

fn compare(a: &serde_json::Value, b: &serde_json::Value) -> Option<Ordering> {
    use serde_json::Value;
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
