use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::model::{
    AbsenceEntry, AttendanceRecord, BehaviorRecord, Gender, GradeRecord, StudentProfile, Subject,
};

/// Two-decimal rounding used for persisted averages:
/// `round(100*x) / 100`.
pub fn round_2_decimals(x: f64) -> f64 {
    (100.0 * x).round() / 100.0
}

/// One-decimal rounding used for roster age averages.
pub fn round_1_decimal(x: f64) -> f64 {
    (10.0 * x).round() / 10.0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceStats {
    pub total_sessions: usize,
    pub absences_count: i64,
    /// `(absences / total sessions) * 100`, `0` when there are no sessions.
    pub absences_rate: f64,
    pub last_activity: Option<NaiveDateTime>,
    /// Most recent absence first; downstream "last absence" views rely on
    /// this ordering.
    pub absences: Vec<AbsenceEntry>,
}

pub fn compute_attendance(records: &[AttendanceRecord]) -> AttendanceStats {
    let mut sorted: Vec<&AttendanceRecord> = records.iter().collect();
    sorted.sort_by(|a, b| b.date.cmp(&a.date));

    let total_sessions = sorted.len();
    let mut absences_count = 0_i64;
    let mut absences: Vec<AbsenceEntry> = Vec::new();

    for record in &sorted {
        if !record.present {
            absences_count += 1;
            absences.push(AbsenceEntry {
                date: record.date,
                course_id: record.course_id.clone(),
            });
        }
    }

    let absences_rate = if total_sessions > 0 {
        (absences_count as f64 / total_sessions as f64) * 100.0
    } else {
        0.0
    };

    AttendanceStats {
        total_sessions,
        absences_count,
        absences_rate,
        last_activity: sorted.first().map(|r| r.date),
        absences,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BehaviorStats {
    /// Mean rating over unique session dates, rounded to two decimals.
    pub average: f64,
    pub unique_session_count: usize,
    pub last_activity: Option<NaiveDateTime>,
}

/// Multiple behavior records on the same calendar date are the same session.
/// The first record seen for a date (input order) is the one kept; its
/// rating is what gets summed.
pub fn compute_behavior(records: &[BehaviorRecord]) -> BehaviorStats {
    let mut seen_dates: BTreeMap<NaiveDate, &BehaviorRecord> = BTreeMap::new();

    for record in records {
        seen_dates.entry(record.date.date()).or_insert(record);
    }

    let unique_session_count = seen_dates.len();
    let rating_sum: i64 = seen_dates.values().map(|r| r.rating).sum();
    let last_activity = seen_dates.values().map(|r| r.date).max();

    let average = if unique_session_count > 0 {
        round_2_decimals(rating_sum as f64 / unique_session_count as f64)
    } else {
        0.0
    };

    BehaviorStats {
        average,
        unique_session_count,
        last_activity,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectGrades {
    pub grades: Vec<f64>,
    pub average: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeDetail {
    pub subject: Subject,
    pub grade: f64,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeStats {
    /// Subjects with no contributing grades are absent from the map.
    pub by_subject: BTreeMap<Subject, SubjectGrades>,
    /// Mean over every contributing record across subjects — not the mean
    /// of per-subject averages, so a subject with many entries keeps its
    /// full weight.
    pub overall_average: Option<f64>,
    pub details: Vec<GradeDetail>,
}

impl GradeStats {
    pub fn subject_average(&self, subject: Subject) -> f64 {
        self.by_subject
            .get(&subject)
            .map(|s| s.average)
            .unwrap_or(0.0)
    }
}

/// Only records with a value, not marked absent, and not part of a draft
/// grade event contribute.
pub fn compute_grade(records: &[GradeRecord]) -> GradeStats {
    let mut by_subject: BTreeMap<Subject, SubjectGrades> = BTreeMap::new();
    let mut details: Vec<GradeDetail> = Vec::new();

    for record in records {
        let Some(value) = record.value else {
            continue;
        };
        if record.absent || record.draft {
            continue;
        }

        details.push(GradeDetail {
            subject: record.subject,
            grade: value,
            session_id: record.session_id.clone(),
        });
        by_subject
            .entry(record.subject)
            .or_insert_with(|| SubjectGrades {
                grades: Vec::new(),
                average: 0.0,
            })
            .grades
            .push(value);
    }

    for subject_grades in by_subject.values_mut() {
        let sum: f64 = subject_grades.grades.iter().sum();
        subject_grades.average = sum / subject_grades.grades.len() as f64;
    }

    let overall_average = if details.is_empty() {
        None
    } else {
        let sum: f64 = details.iter().map(|d| d.grade).sum();
        Some(sum / details.len() as f64)
    };

    GradeStats {
        by_subject,
        overall_average,
        details,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeacherRosterStats {
    pub total_students: i64,
    pub count_male: i64,
    pub count_female: i64,
    pub count_unspecified: i64,
    pub male_percentage: f64,
    pub female_percentage: f64,
    pub min_age: i64,
    pub max_age: i64,
    pub average_age: f64,
}

/// Roster statistics over the distinct students a teacher teaches. Ages are
/// whole years at `today`; students without a birth date are excluded from
/// the age figures but still counted in the roster.
pub fn compute_teacher_roster(profiles: &[StudentProfile], today: NaiveDate) -> TeacherRosterStats {
    let total_students = profiles.len() as i64;
    let mut count_male = 0_i64;
    let mut count_female = 0_i64;
    let mut count_unspecified = 0_i64;

    for profile in profiles {
        match profile.gender {
            Gender::Male => count_male += 1,
            Gender::Female => count_female += 1,
            Gender::Unspecified => count_unspecified += 1,
        }
    }

    let (male_percentage, female_percentage) = if total_students > 0 {
        (
            round_2_decimals(count_male as f64 / total_students as f64 * 100.0),
            round_2_decimals(count_female as f64 / total_students as f64 * 100.0),
        )
    } else {
        (0.0, 0.0)
    };

    let ages: Vec<i64> = profiles
        .iter()
        .filter_map(|p| p.birth_date)
        .map(|birth| age_in_years(birth, today))
        .collect();

    let (min_age, max_age, average_age) = if ages.is_empty() {
        (0, 0, 0.0)
    } else {
        let sum: i64 = ages.iter().sum();
        (
            ages.iter().copied().min().unwrap_or(0),
            ages.iter().copied().max().unwrap_or(0),
            round_1_decimal(sum as f64 / ages.len() as f64),
        )
    };

    TeacherRosterStats {
        total_students,
        count_male,
        count_female,
        count_unspecified,
        male_percentage,
        female_percentage,
        min_age,
        max_age,
        average_age,
    }
}

fn age_in_years(birth: NaiveDate, today: NaiveDate) -> i64 {
    let mut age = today.year() as i64 - birth.year() as i64;
    if (today.month(), today.day()) < (birth.month(), birth.day()) {
        age -= 1;
    }
    age.max(0)
}
