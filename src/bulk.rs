use std::path::PathBuf;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::model::{EntityRef, StatFamily};
use crate::reconcile::{Outcome, Reconciler, SkipReason, StatsChange};
use crate::report::ReportSink;
use crate::retry::{with_retry, RetryPolicy};
use crate::store::RecordStore;

/// Which entities a bulk run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Population {
    ActiveStudents,
    ActiveTeachers,
    /// Active students enrolled with one teacher.
    TeacherStudents { teacher_id: String },
}

impl Population {
    pub fn family(&self) -> StatFamily {
        match self {
            Population::ActiveStudents | Population::TeacherStudents { .. } => StatFamily::Student,
            Population::ActiveTeachers => StatFamily::Teacher,
        }
    }

    fn select<S: RecordStore + ?Sized>(
        &self,
        store: &mut S,
        policy: &RetryPolicy,
    ) -> Result<Vec<EntityRef>, crate::retry::RetryError> {
        match self {
            Population::ActiveStudents => {
                with_retry(store, policy, "list active students", |s| s.active_students())
            }
            Population::ActiveTeachers => {
                with_retry(store, policy, "list active teachers", |s| s.active_teachers())
            }
            Population::TeacherStudents { teacher_id } => {
                with_retry(store, policy, "list teacher students", |s| {
                    s.students_of_teacher(teacher_id)
                })
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BulkOptions {
    pub force_update: bool,
    /// Entities whose snapshot is younger than this are skipped unless
    /// `force_update` is set.
    pub cooldown: Duration,
    pub policy: RetryPolicy,
}

impl Default for BulkOptions {
    fn default() -> Self {
        BulkOptions {
            force_update: false,
            cooldown: Duration::from_secs(3600),
            policy: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkFailure {
    pub entity_id: String,
    pub entity_name: String,
    pub error: String,
}

/// Outcome of one bulk run. `skipped` includes the entities counted in
/// `without_data` and the failed ones; a failed entity never blocks the
/// rest of the run.
#[derive(Debug)]
pub struct BulkReport {
    pub generated_at: NaiveDateTime,
    pub entity_label: &'static str,
    pub total: usize,
    pub updated: usize,
    pub skipped: usize,
    pub without_data: usize,
    pub changes: Vec<StatsChange>,
    pub failures: Vec<BulkFailure>,
    /// Where the report artifact landed, when the sink produced one.
    pub artifact: Option<PathBuf>,
}

impl BulkReport {
    /// JSON artifact shape. Count keys are parameterized on the entity
    /// label, e.g. `totalStudents` / `totalTeachers`.
    pub fn to_json(&self) -> Value {
        let label = self.entity_label;
        let lower = label.to_lowercase();
        let mut stats = serde_json::Map::new();
        stats.insert(format!("total{}s", label), json!(self.total));
        stats.insert(format!("updated{}s", label), json!(self.updated));
        stats.insert(format!("skipped{}s", label), json!(self.skipped));
        stats.insert(format!("{}sWithoutData", lower), json!(self.without_data));
        stats.insert("statsChanges".to_string(), json!(self.changes));
        if !self.failures.is_empty() {
            stats.insert("failures".to_string(), json!(self.failures));
        }
        json!({
            "date": self.generated_at.format("%Y-%m-%dT%H:%M:%S").to_string(),
            "stats": Value::Object(stats),
        })
    }
}

/// Recompute statistics for every entity in the population, strictly in
/// sequence. Listing failures abort the run; per-entity failures are
/// recorded and the run continues.
pub fn recompute<S: RecordStore + ?Sized>(
    store: &mut S,
    population: &Population,
    options: &BulkOptions,
    sink: &dyn ReportSink,
) -> anyhow::Result<BulkReport> {
    recompute_at(store, population, options, sink, Local::now().naive_local())
}

pub fn recompute_at<S: RecordStore + ?Sized>(
    store: &mut S,
    population: &Population,
    options: &BulkOptions,
    sink: &dyn ReportSink,
    now: NaiveDateTime,
) -> anyhow::Result<BulkReport> {
    let family = population.family();
    let entities = population
        .select(store, &options.policy)
        .map_err(|e| anyhow::anyhow!("failed to list entities: {}", e))?;

    info!(
        entity = family.entity_label(),
        count = entities.len(),
        "starting bulk recomputation"
    );

    let reconciler = Reconciler::new(options.policy, options.cooldown, options.force_update);
    let mut report = BulkReport {
        generated_at: now,
        entity_label: family.entity_label(),
        total: entities.len(),
        updated: 0,
        skipped: 0,
        without_data: 0,
        changes: Vec::new(),
        failures: Vec::new(),
        artifact: None,
    };

    for entity in &entities {
        match reconciler.reconcile(family, entity, store, now) {
            Outcome::Updated(change) => {
                info!(
                    entity = entity.id.as_str(),
                    fields = change.differences.len(),
                    "snapshot updated"
                );
                report.updated += 1;
                report.changes.push(*change);
            }
            Outcome::Skipped(reason) => {
                report.skipped += 1;
                if reason == SkipReason::NoData {
                    report.without_data += 1;
                }
            }
            Outcome::Failed(error) => {
                warn!(entity = entity.id.as_str(), error = %error, "entity failed, continuing");
                report.skipped += 1;
                report.failures.push(BulkFailure {
                    entity_id: entity.id.clone(),
                    entity_name: entity.display_name(),
                    error,
                });
            }
        }
    }

    info!(
        updated = report.updated,
        skipped = report.skipped,
        without_data = report.without_data,
        failures = report.failures.len(),
        "bulk recomputation finished"
    );

    // The artifact is a convenience; the run already succeeded.
    match sink.write(&report) {
        Ok(path) => report.artifact = path,
        Err(e) => warn!(error = %e, "failed to write run report"),
    }

    Ok(report)
}
