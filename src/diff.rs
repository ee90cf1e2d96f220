use std::fmt;

use chrono::NaiveDateTime;
use serde::Serialize;

/// Numeric fields differing by no more than this are considered unchanged.
pub const NUMERIC_TOLERANCE: f64 = 0.01;

/// How a field participates in change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compare {
    /// |old - new| > 0.01 counts as a change.
    NumericTolerant,
    /// Literal inequality counts as a change.
    Exact,
}

/// A snapshot field's value, normalized for comparison and display.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Number(f64),
    Count(i64),
    Date(Option<NaiveDateTime>),
}

impl FieldValue {
    /// Baseline used in place of a missing old snapshot, so that a first
    /// computation with non-default values always yields a diff.
    fn default_for(&self) -> FieldValue {
        match self {
            FieldValue::Number(_) => FieldValue::Number(0.0),
            FieldValue::Count(_) => FieldValue::Count(0),
            FieldValue::Date(_) => FieldValue::Date(None),
        }
    }

    fn changed_from(&self, old: &FieldValue, mode: Compare) -> bool {
        match (old, self) {
            (FieldValue::Number(a), FieldValue::Number(b)) => match mode {
                Compare::NumericTolerant => (a - b).abs() > NUMERIC_TOLERANCE,
                Compare::Exact => a != b,
            },
            (FieldValue::Count(a), FieldValue::Count(b)) => a != b,
            (FieldValue::Date(a), FieldValue::Date(b)) => a != b,
            // Mismatched kinds only happen on a field-table bug; treat as
            // changed so the snapshot gets rewritten.
            _ => true,
        }
    }

    fn render(&self, unit: &str) -> String {
        match self {
            FieldValue::Number(v) => format!("{:.2}{}", v, unit),
            FieldValue::Count(v) => format!("{}{}", v, unit),
            FieldValue::Date(Some(d)) => d.format("%Y-%m-%dT%H:%M:%S").to_string(),
            FieldValue::Date(None) => "never".to_string(),
        }
    }
}

/// One row of a statistic family's field table: a human-readable label, a
/// comparison mode, and an accessor into the snapshot type.
pub struct FieldSpec<T> {
    pub label: &'static str,
    pub unit: &'static str,
    pub mode: Compare,
    pub get: fn(&T) -> FieldValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffEntry {
    pub field: &'static str,
    pub old_value: String,
    pub new_value: String,
}

impl fmt::Display for DiffEntry {
    /// The exact report format consumed verbatim downstream:
    /// `<field label>: <old> → <new>`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} → {}", self.field, self.old_value, self.new_value)
    }
}

/// Compare a freshly computed snapshot against the persisted one, field by
/// field. Diffs come back in field-table order. A missing old snapshot is
/// compared against zeroed defaults (`0` for numbers and counts, "never"
/// for dates).
pub fn diff_snapshots<T>(old: Option<&T>, new: &T, table: &[FieldSpec<T>]) -> Vec<DiffEntry> {
    let mut diffs = Vec::new();

    for spec in table {
        let new_value = (spec.get)(new);
        let old_value = match old {
            Some(snapshot) => (spec.get)(snapshot),
            None => new_value.default_for(),
        };

        if new_value.changed_from(&old_value, spec.mode) {
            diffs.push(DiffEntry {
                field: spec.label,
                old_value: old_value.render(spec.unit),
                new_value: new_value.render(spec.unit),
            });
        }
    }

    diffs
}
