use std::time::Duration;

use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::calc::{
    compute_attendance, compute_behavior, compute_grade, compute_teacher_roster, round_2_decimals,
};
use crate::diff::{diff_snapshots, Compare, FieldSpec, FieldValue};
use crate::model::{
    EntityRef, GenderCounts, GradeAverages, StatFamily, StudentSnapshot, Subject, TeacherSnapshot,
};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::RecordStore;

/// Why an entity was passed over without an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No raw records of any kind exist for the entity.
    NoData,
    /// Fresh computation matched the persisted snapshot on every field.
    Unchanged,
    /// The persisted snapshot is younger than the cooldown window.
    Fresh,
}

/// Record of one applied update, as it appears in the run report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsChange {
    pub entity_id: String,
    pub entity_name: String,
    pub old_stats: Value,
    pub new_stats: Value,
    /// One `"label: old → new"` line per changed field, in field-table
    /// order.
    pub differences: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Updated(Box<StatsChange>),
    Skipped(SkipReason),
    Failed(String),
}

/// Field table for the student snapshot. Order here is report order.
pub const STUDENT_FIELDS: &[FieldSpec<StudentSnapshot>] = &[
    FieldSpec {
        label: "absence rate",
        unit: "%",
        mode: Compare::NumericTolerant,
        get: |s| FieldValue::Number(s.absences_rate),
    },
    FieldSpec {
        label: "total absences",
        unit: "",
        mode: Compare::Exact,
        get: |s| FieldValue::Count(s.absences_count),
    },
    FieldSpec {
        label: "behavior average",
        unit: "",
        mode: Compare::NumericTolerant,
        get: |s| FieldValue::Number(s.behavior_average),
    },
    FieldSpec {
        label: "Arabic average",
        unit: "",
        mode: Compare::NumericTolerant,
        get: |s| FieldValue::Number(s.grades.arabic),
    },
    FieldSpec {
        label: "cultural education average",
        unit: "",
        mode: Compare::NumericTolerant,
        get: |s| FieldValue::Number(s.grades.cultural_education),
    },
    FieldSpec {
        label: "overall average",
        unit: "",
        mode: Compare::NumericTolerant,
        get: |s| FieldValue::Number(s.grades.overall),
    },
    FieldSpec {
        label: "last activity",
        unit: "",
        mode: Compare::Exact,
        get: |s| FieldValue::Date(s.last_activity),
    },
];

/// Field table for the teacher roster snapshot.
pub const TEACHER_FIELDS: &[FieldSpec<TeacherSnapshot>] = &[
    FieldSpec {
        label: "student count",
        unit: "",
        mode: Compare::Exact,
        get: |s| FieldValue::Count(s.total_students),
    },
    FieldSpec {
        label: "male percentage",
        unit: "%",
        mode: Compare::NumericTolerant,
        get: |s| FieldValue::Number(s.male_percentage),
    },
    FieldSpec {
        label: "female percentage",
        unit: "%",
        mode: Compare::NumericTolerant,
        get: |s| FieldValue::Number(s.female_percentage),
    },
    FieldSpec {
        label: "minimum age",
        unit: "",
        mode: Compare::Exact,
        get: |s| FieldValue::Count(s.min_age),
    },
    FieldSpec {
        label: "maximum age",
        unit: "",
        mode: Compare::Exact,
        get: |s| FieldValue::Count(s.max_age),
    },
    FieldSpec {
        label: "average age",
        unit: "",
        mode: Compare::NumericTolerant,
        get: |s| FieldValue::Number(s.average_age),
    },
];

/// Per-entity reconciliation: fetch raw records, recompute the snapshot,
/// diff it against the persisted one, and upsert only when something
/// actually changed.
pub struct Reconciler {
    pub policy: RetryPolicy,
    /// Snapshots younger than this are skipped unless `force` is set.
    pub cooldown: Duration,
    pub force: bool,
}

impl Reconciler {
    pub fn new(policy: RetryPolicy, cooldown: Duration, force: bool) -> Reconciler {
        Reconciler {
            policy,
            cooldown,
            force,
        }
    }

    pub fn reconcile<S: RecordStore + ?Sized>(
        &self,
        family: StatFamily,
        entity: &EntityRef,
        store: &mut S,
        now: NaiveDateTime,
    ) -> Outcome {
        match family {
            StatFamily::Student => self.reconcile_student(entity, store, now),
            StatFamily::Teacher => self.reconcile_teacher(entity, store, now),
        }
    }

    fn is_fresh(&self, last_update: NaiveDateTime, now: NaiveDateTime) -> bool {
        if self.force {
            return false;
        }
        let age = (now - last_update).num_seconds().max(0) as u64;
        age < self.cooldown.as_secs()
    }

    fn reconcile_student<S: RecordStore + ?Sized>(
        &self,
        entity: &EntityRef,
        store: &mut S,
        now: NaiveDateTime,
    ) -> Outcome {
        let id = entity.id.as_str();

        let old = match with_retry(store, &self.policy, "load student snapshot", |s| {
            s.student_snapshot(id)
        }) {
            Ok(old) => old,
            Err(e) => return Outcome::Failed(e.to_string()),
        };

        if let Some(snapshot) = &old {
            if self.is_fresh(snapshot.last_update, now) {
                debug!(student = id, "snapshot within cooldown, skipping");
                return Outcome::Skipped(SkipReason::Fresh);
            }
        }

        let attendance = match with_retry(store, &self.policy, "fetch attendance", |s| {
            s.attendance_records(id)
        }) {
            Ok(records) => records,
            Err(e) => return Outcome::Failed(e.to_string()),
        };
        let behavior = match with_retry(store, &self.policy, "fetch behavior", |s| {
            s.behavior_records(id)
        }) {
            Ok(records) => records,
            Err(e) => return Outcome::Failed(e.to_string()),
        };
        let grades = match with_retry(store, &self.policy, "fetch grades", |s| {
            s.grade_records(id)
        }) {
            Ok(records) => records,
            Err(e) => return Outcome::Failed(e.to_string()),
        };

        if attendance.is_empty() && behavior.is_empty() && grades.is_empty() {
            return Outcome::Skipped(SkipReason::NoData);
        }

        let attendance_stats = compute_attendance(&attendance);
        let behavior_stats = compute_behavior(&behavior);
        let grade_stats = compute_grade(&grades);

        let last_activity = match (attendance_stats.last_activity, behavior_stats.last_activity) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        let new = StudentSnapshot {
            user_id: id.to_string(),
            absences_rate: round_2_decimals(attendance_stats.absences_rate),
            absences_count: attendance_stats.absences_count,
            behavior_average: behavior_stats.average,
            grades: GradeAverages {
                arabic: round_2_decimals(grade_stats.subject_average(Subject::Arabic)),
                cultural_education: round_2_decimals(
                    grade_stats.subject_average(Subject::CulturalEducation),
                ),
                overall: round_2_decimals(grade_stats.overall_average.unwrap_or(0.0)),
            },
            absences: attendance_stats.absences,
            last_activity,
            last_update: now,
        };

        let diffs = diff_snapshots(old.as_ref(), &new, STUDENT_FIELDS);
        if diffs.is_empty() {
            return Outcome::Skipped(SkipReason::Unchanged);
        }

        let outcome = match with_retry(store, &self.policy, "upsert student snapshot", |s| {
            s.upsert_student_snapshot(&new)
        }) {
            Ok(outcome) => outcome,
            Err(e) => return Outcome::Failed(e.to_string()),
        };

        if outcome.created {
            self.link_back(store, id, &outcome.snapshot_id);
        }

        let baseline = old.unwrap_or_else(|| StudentSnapshot::zeroed(id, now));
        Outcome::Updated(Box::new(StatsChange {
            entity_id: id.to_string(),
            entity_name: entity.display_name(),
            old_stats: serde_json::to_value(&baseline).unwrap_or(Value::Null),
            new_stats: serde_json::to_value(&new).unwrap_or(Value::Null),
            differences: diffs.iter().map(|d| d.to_string()).collect(),
        }))
    }

    fn reconcile_teacher<S: RecordStore + ?Sized>(
        &self,
        entity: &EntityRef,
        store: &mut S,
        now: NaiveDateTime,
    ) -> Outcome {
        let id = entity.id.as_str();

        let old = match with_retry(store, &self.policy, "load teacher snapshot", |s| {
            s.teacher_snapshot(id)
        }) {
            Ok(old) => old,
            Err(e) => return Outcome::Failed(e.to_string()),
        };

        if let Some(snapshot) = &old {
            if self.is_fresh(snapshot.last_update, now) {
                debug!(teacher = id, "snapshot within cooldown, skipping");
                return Outcome::Skipped(SkipReason::Fresh);
            }
        }

        let roster = match with_retry(store, &self.policy, "fetch roster", |s| {
            s.student_roster(id)
        }) {
            Ok(roster) => roster,
            Err(e) => return Outcome::Failed(e.to_string()),
        };

        if roster.is_empty() {
            return Outcome::Skipped(SkipReason::NoData);
        }

        let roster_stats = compute_teacher_roster(&roster, now.date());
        let new = TeacherSnapshot {
            user_id: id.to_string(),
            total_students: roster_stats.total_students,
            gender_counts: GenderCounts {
                male: roster_stats.count_male,
                female: roster_stats.count_female,
                unspecified: roster_stats.count_unspecified,
            },
            male_percentage: roster_stats.male_percentage,
            female_percentage: roster_stats.female_percentage,
            min_age: roster_stats.min_age,
            max_age: roster_stats.max_age,
            average_age: roster_stats.average_age,
            last_update: now,
        };

        let diffs = diff_snapshots(old.as_ref(), &new, TEACHER_FIELDS);
        if diffs.is_empty() {
            return Outcome::Skipped(SkipReason::Unchanged);
        }

        let outcome = match with_retry(store, &self.policy, "upsert teacher snapshot", |s| {
            s.upsert_teacher_snapshot(&new)
        }) {
            Ok(outcome) => outcome,
            Err(e) => return Outcome::Failed(e.to_string()),
        };

        if outcome.created {
            self.link_back(store, id, &outcome.snapshot_id);
        }

        let baseline = old.unwrap_or_else(|| TeacherSnapshot::zeroed(id, now));
        Outcome::Updated(Box::new(StatsChange {
            entity_id: id.to_string(),
            entity_name: entity.display_name(),
            old_stats: serde_json::to_value(&baseline).unwrap_or(Value::Null),
            new_stats: serde_json::to_value(&new).unwrap_or(Value::Null),
            differences: diffs.iter().map(|d| d.to_string()).collect(),
        }))
    }

    /// Back-reference from the user row to a newly created snapshot. The
    /// snapshot itself is already persisted, so a failure here is logged and
    /// swallowed rather than failing the entity.
    fn link_back<S: RecordStore + ?Sized>(&self, store: &mut S, user_id: &str, snapshot_id: &str) {
        if let Err(e) = with_retry(store, &self.policy, "link snapshot", |s| {
            s.link_snapshot(user_id, snapshot_id)
        }) {
            warn!(user = user_id, error = %e, "failed to link snapshot to user");
        }
    }
}
