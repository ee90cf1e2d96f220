use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// One of the two persisted statistic families. Students get a single
/// combined snapshot (attendance + behavior + grades); teachers get a
/// roster snapshot of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatFamily {
    Student,
    Teacher,
}

impl StatFamily {
    pub fn entity_label(self) -> &'static str {
        match self {
            StatFamily::Student => "Student",
            StatFamily::Teacher => "Teacher",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Subject {
    Arabic,
    CulturalEducation,
}

impl Subject {
    pub const ALL: [Subject; 2] = [Subject::Arabic, Subject::CulturalEducation];

    pub fn label(self) -> &'static str {
        match self {
            Subject::Arabic => "Arabic",
            Subject::CulturalEducation => "CulturalEducation",
        }
    }

    pub fn parse(s: &str) -> Option<Subject> {
        match s {
            "Arabic" => Some(Subject::Arabic),
            "CulturalEducation" => Some(Subject::CulturalEducation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    Male,
    Female,
    Unspecified,
}

/// Identity of an entity (student or teacher) as yielded by a population
/// selector. Carries the display name so reports do not need a second lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRef {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
}

impl EntityRef {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Student profile fields needed by the teacher-roster calculator.
#[derive(Debug, Clone)]
pub struct StudentProfile {
    pub id: String,
    pub gender: Gender,
    pub birth_date: Option<NaiveDate>,
}

// ---------------------------------------------------------------------------
// Raw records. Each kind is an explicit struct; the engine only ever reads
// them — the surrounding CRUD layer owns creation and mutation.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceRecord {
    pub student_id: String,
    pub course_id: String,
    pub date: NaiveDateTime,
    pub present: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BehaviorRecord {
    pub student_id: String,
    pub session_id: String,
    pub date: NaiveDateTime,
    pub rating: i64,
}

/// A grade entry with its parent grade-event's draft flag already carried
/// down. Draft batches never contribute to statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct GradeRecord {
    pub student_id: String,
    pub session_id: String,
    pub subject: Subject,
    pub value: Option<f64>,
    pub absent: bool,
    pub draft: bool,
    pub comment: Option<String>,
}

/// Tagged union over the three raw-record kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    Attendance(AttendanceRecord),
    Behavior(BehaviorRecord),
    Grade(GradeRecord),
}

// ---------------------------------------------------------------------------
// Snapshots. One per (entity, family); overwritten in full on recomputation.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbsenceEntry {
    pub date: NaiveDateTime,
    pub course_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeAverages {
    pub arabic: f64,
    pub cultural_education: f64,
    pub overall: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentSnapshot {
    pub user_id: String,
    pub absences_rate: f64,
    pub absences_count: i64,
    pub behavior_average: f64,
    pub grades: GradeAverages,
    /// Most recent absence first.
    pub absences: Vec<AbsenceEntry>,
    pub last_activity: Option<NaiveDateTime>,
    pub last_update: NaiveDateTime,
}

impl StudentSnapshot {
    /// Zeroed defaults used as the comparison baseline when no snapshot has
    /// been persisted yet.
    pub fn zeroed(user_id: &str, now: NaiveDateTime) -> Self {
        StudentSnapshot {
            user_id: user_id.to_string(),
            absences_rate: 0.0,
            absences_count: 0,
            behavior_average: 0.0,
            grades: GradeAverages::default(),
            absences: Vec::new(),
            last_activity: None,
            last_update: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenderCounts {
    pub male: i64,
    pub female: i64,
    pub unspecified: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeacherSnapshot {
    pub user_id: String,
    pub total_students: i64,
    pub gender_counts: GenderCounts,
    /// Percentages over the roster, two decimals.
    pub male_percentage: f64,
    pub female_percentage: f64,
    pub min_age: i64,
    pub max_age: i64,
    pub average_age: f64,
    pub last_update: NaiveDateTime,
}

impl TeacherSnapshot {
    pub fn zeroed(user_id: &str, now: NaiveDateTime) -> Self {
        TeacherSnapshot {
            user_id: user_id.to_string(),
            total_students: 0,
            gender_counts: GenderCounts::default(),
            male_percentage: 0.0,
            female_percentage: 0.0,
            min_age: 0,
            max_age: 0,
            average_age: 0.0,
            last_update: now,
        }
    }
}
