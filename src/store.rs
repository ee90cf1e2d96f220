use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{Connection, ErrorCode, OptionalExtension};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{
    AbsenceEntry, AttendanceRecord, BehaviorRecord, EntityRef, Gender, GenderCounts, GradeAverages,
    GradeRecord, StudentProfile, StudentSnapshot, Subject, TeacherSnapshot,
};

/// Typed storage failures. The retry executor switches on the variant, never
/// on message text.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to connect: {0}")]
    ConnectionFailed(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("storage timeout: {0}")]
    Timeout(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Other(String),
}

impl StoreError {
    /// Connection-class failures are worth retrying; everything else is
    /// permanent and propagates on first occurrence.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::ConnectionFailed(_) | StoreError::ConnectionClosed | StoreError::Timeout(_)
        )
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(err.to_string()),
            rusqlite::Error::SqliteFailure(code, _) => match code.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    StoreError::Timeout(err.to_string())
                }
                ErrorCode::CannotOpen => StoreError::ConnectionFailed(err.to_string()),
                ErrorCode::ConstraintViolation => StoreError::Conflict(err.to_string()),
                _ => StoreError::Other(err.to_string()),
            },
            _ => StoreError::Other(err.to_string()),
        }
    }
}

/// Result of a snapshot upsert: the snapshot row id and whether the row was
/// created rather than overwritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub snapshot_id: String,
    pub created: bool,
}

/// Everything the reconciliation engine needs from the record store. The
/// engine never touches storage except through this trait, so tests can
/// substitute in-memory or failure-injecting implementations.
pub trait RecordStore {
    /// Idempotent "make sure we can talk to storage" call, invoked before
    /// every retried attempt; connections are not assumed durable.
    fn ensure_connected(&mut self) -> Result<(), StoreError>;

    fn active_students(&mut self) -> Result<Vec<EntityRef>, StoreError>;
    fn active_teachers(&mut self) -> Result<Vec<EntityRef>, StoreError>;
    /// Distinct active students enrolled in any session of the teacher's
    /// active courses.
    fn students_of_teacher(&mut self, teacher_id: &str) -> Result<Vec<EntityRef>, StoreError>;
    fn student_roster(&mut self, teacher_id: &str) -> Result<Vec<StudentProfile>, StoreError>;

    fn attendance_records(&mut self, student_id: &str)
        -> Result<Vec<AttendanceRecord>, StoreError>;
    fn behavior_records(&mut self, student_id: &str) -> Result<Vec<BehaviorRecord>, StoreError>;
    fn grade_records(&mut self, student_id: &str) -> Result<Vec<GradeRecord>, StoreError>;

    fn student_snapshot(&mut self, student_id: &str)
        -> Result<Option<StudentSnapshot>, StoreError>;
    fn upsert_student_snapshot(
        &mut self,
        snapshot: &StudentSnapshot,
    ) -> Result<UpsertOutcome, StoreError>;
    fn teacher_snapshot(&mut self, teacher_id: &str)
        -> Result<Option<TeacherSnapshot>, StoreError>;
    fn upsert_teacher_snapshot(
        &mut self,
        snapshot: &TeacherSnapshot,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Best-effort back-reference from the owning user row to its snapshot.
    fn link_snapshot(&mut self, user_id: &str, snapshot_id: &str) -> Result<(), StoreError>;
}

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const DATE_FORMAT: &str = "%Y-%m-%d";

fn format_ts(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_ts(raw: &str) -> Result<NaiveDateTime, StoreError> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map_err(|e| StoreError::Validation(format!("bad timestamp {:?}: {}", raw, e)))
}

fn parse_date(raw: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .map_err(|e| StoreError::Validation(format!("bad date {:?}: {}", raw, e)))
}

fn parse_gender(raw: Option<&str>) -> Gender {
    match raw {
        Some("male") => Gender::Male,
        Some("female") => Gender::Female,
        _ => Gender::Unspecified,
    }
}

fn parse_subject(raw: &str) -> Result<Subject, StoreError> {
    Subject::parse(raw)
        .ok_or_else(|| StoreError::Validation(format!("unknown subject {:?}", raw)))
}

/// SQLite-backed record store. The database lives in a workspace directory;
/// the schema is created idempotently when the connection is (re)established.
pub struct SqliteStore {
    workspace: PathBuf,
    conn: Option<Connection>,
}

impl SqliteStore {
    pub fn open(workspace: &Path) -> SqliteStore {
        SqliteStore {
            workspace: workspace.to_path_buf(),
            conn: None,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.workspace.join("edustats.sqlite3")
    }

    /// Direct access to the underlying connection, for seeding and
    /// inspection. Connects on demand.
    pub fn connection(&mut self) -> Result<&Connection, StoreError> {
        self.ensure_connected()?;
        self.conn.as_ref().ok_or(StoreError::ConnectionClosed)
    }

    fn conn(&self) -> Result<&Connection, StoreError> {
        self.conn.as_ref().ok_or(StoreError::ConnectionClosed)
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.pragma_update(None, "foreign_keys", true)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS users(
                id TEXT PRIMARY KEY,
                first_name TEXT NOT NULL,
                last_name TEXT NOT NULL,
                role TEXT NOT NULL,
                gender TEXT,
                birth_date TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                stats_id TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_users_role_active ON users(role, active)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS courses(
                id TEXT PRIMARY KEY,
                teacher_id TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                FOREIGN KEY(teacher_id) REFERENCES users(id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS course_sessions(
                id TEXT PRIMARY KEY,
                course_id TEXT NOT NULL,
                subject TEXT NOT NULL,
                FOREIGN KEY(course_id) REFERENCES courses(id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS session_students(
                session_id TEXT NOT NULL,
                student_id TEXT NOT NULL,
                PRIMARY KEY(session_id, student_id),
                FOREIGN KEY(session_id) REFERENCES course_sessions(id),
                FOREIGN KEY(student_id) REFERENCES users(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS attendances(
                id TEXT PRIMARY KEY,
                course_id TEXT NOT NULL,
                date TEXT NOT NULL,
                FOREIGN KEY(course_id) REFERENCES courses(id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS attendance_records(
                id TEXT PRIMARY KEY,
                attendance_id TEXT NOT NULL,
                student_id TEXT NOT NULL,
                is_present INTEGER NOT NULL,
                FOREIGN KEY(attendance_id) REFERENCES attendances(id),
                FOREIGN KEY(student_id) REFERENCES users(id),
                UNIQUE(attendance_id, student_id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_attendance_records_student
             ON attendance_records(student_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS behaviors(
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                date TEXT NOT NULL,
                FOREIGN KEY(session_id) REFERENCES course_sessions(id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS behavior_records(
                id TEXT PRIMARY KEY,
                behavior_id TEXT NOT NULL,
                student_id TEXT NOT NULL,
                rating INTEGER NOT NULL,
                FOREIGN KEY(behavior_id) REFERENCES behaviors(id),
                FOREIGN KEY(student_id) REFERENCES users(id),
                UNIQUE(behavior_id, student_id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_behavior_records_student
             ON behavior_records(student_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS grades(
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                date TEXT NOT NULL,
                is_draft INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY(session_id) REFERENCES course_sessions(id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS grade_records(
                id TEXT PRIMARY KEY,
                grade_id TEXT NOT NULL,
                student_id TEXT NOT NULL,
                value REAL,
                is_absent INTEGER NOT NULL DEFAULT 0,
                comment TEXT,
                FOREIGN KEY(grade_id) REFERENCES grades(id),
                FOREIGN KEY(student_id) REFERENCES users(id),
                UNIQUE(grade_id, student_id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_grade_records_student
             ON grade_records(student_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS student_stats(
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL UNIQUE,
                absences_rate REAL NOT NULL,
                absences_count INTEGER NOT NULL,
                behavior_average REAL NOT NULL,
                arabic_average REAL NOT NULL,
                cultural_education_average REAL NOT NULL,
                overall_average REAL NOT NULL,
                last_activity TEXT,
                last_update TEXT NOT NULL,
                FOREIGN KEY(user_id) REFERENCES users(id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS student_stats_absences(
                student_stats_id TEXT NOT NULL,
                date TEXT NOT NULL,
                course_id TEXT NOT NULL,
                sort_order INTEGER NOT NULL,
                FOREIGN KEY(student_stats_id) REFERENCES student_stats(id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_student_stats_absences_stats
             ON student_stats_absences(student_stats_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS teacher_stats(
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL UNIQUE,
                total_students INTEGER NOT NULL,
                count_male INTEGER NOT NULL,
                count_female INTEGER NOT NULL,
                count_unspecified INTEGER NOT NULL,
                male_percentage REAL NOT NULL,
                female_percentage REAL NOT NULL,
                min_age INTEGER NOT NULL,
                max_age INTEGER NOT NULL,
                average_age REAL NOT NULL,
                last_update TEXT NOT NULL,
                FOREIGN KEY(user_id) REFERENCES users(id)
            )",
            [],
        )?;

        Ok(())
    }

    fn entities_by_role(&self, role: &str) -> Result<Vec<EntityRef>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, first_name, last_name
             FROM users
             WHERE role = ? AND active = 1
             ORDER BY last_name, first_name, id",
        )?;
        let entities = stmt
            .query_map([role], |row| {
                Ok(EntityRef {
                    id: row.get(0)?,
                    first_name: row.get(1)?,
                    last_name: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entities)
    }
}

impl RecordStore for SqliteStore {
    fn ensure_connected(&mut self) -> Result<(), StoreError> {
        if self.conn.is_some() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.workspace)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
        let conn = Connection::open(self.db_path())
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
        Self::init_schema(&conn)?;
        self.conn = Some(conn);
        Ok(())
    }

    fn active_students(&mut self) -> Result<Vec<EntityRef>, StoreError> {
        self.entities_by_role("student")
    }

    fn active_teachers(&mut self) -> Result<Vec<EntityRef>, StoreError> {
        self.entities_by_role("teacher")
    }

    fn students_of_teacher(&mut self, teacher_id: &str) -> Result<Vec<EntityRef>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT u.id, u.first_name, u.last_name
             FROM users u
             JOIN session_students ss ON ss.student_id = u.id
             JOIN course_sessions cs ON cs.id = ss.session_id
             JOIN courses c ON c.id = cs.course_id
             WHERE c.teacher_id = ? AND c.active = 1 AND u.active = 1
             ORDER BY u.last_name, u.first_name, u.id",
        )?;
        let entities = stmt
            .query_map([teacher_id], |row| {
                Ok(EntityRef {
                    id: row.get(0)?,
                    first_name: row.get(1)?,
                    last_name: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entities)
    }

    fn student_roster(&mut self, teacher_id: &str) -> Result<Vec<StudentProfile>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT u.id, u.gender, u.birth_date
             FROM users u
             JOIN session_students ss ON ss.student_id = u.id
             JOIN course_sessions cs ON cs.id = ss.session_id
             JOIN courses c ON c.id = cs.course_id
             WHERE c.teacher_id = ? AND c.active = 1 AND u.active = 1
             ORDER BY u.id",
        )?;
        let rows = stmt
            .query_map([teacher_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut profiles = Vec::with_capacity(rows.len());
        for (id, gender, birth_date) in rows {
            let birth_date = match birth_date {
                Some(raw) => Some(parse_date(&raw)?),
                None => None,
            };
            profiles.push(StudentProfile {
                id,
                gender: parse_gender(gender.as_deref()),
                birth_date,
            });
        }
        Ok(profiles)
    }

    fn attendance_records(
        &mut self,
        student_id: &str,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT ar.student_id, a.course_id, a.date, ar.is_present
             FROM attendance_records ar
             JOIN attendances a ON a.id = ar.attendance_id
             WHERE ar.student_id = ?",
        )?;
        let rows = stmt
            .query_map([student_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for (student_id, course_id, date, is_present) in rows {
            records.push(AttendanceRecord {
                student_id,
                course_id,
                date: parse_ts(&date)?,
                present: is_present != 0,
            });
        }
        Ok(records)
    }

    fn behavior_records(&mut self, student_id: &str) -> Result<Vec<BehaviorRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT br.student_id, b.session_id, b.date, br.rating
             FROM behavior_records br
             JOIN behaviors b ON b.id = br.behavior_id
             WHERE br.student_id = ?
             ORDER BY b.date, br.id",
        )?;
        let rows = stmt
            .query_map([student_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for (student_id, session_id, date, rating) in rows {
            records.push(BehaviorRecord {
                student_id,
                session_id,
                date: parse_ts(&date)?,
                rating,
            });
        }
        Ok(records)
    }

    fn grade_records(&mut self, student_id: &str) -> Result<Vec<GradeRecord>, StoreError> {
        let conn = self.conn()?;
        // The draft flag lives on the parent grade event and is carried down
        // onto every record here.
        let mut stmt = conn.prepare(
            "SELECT gr.student_id, g.session_id, cs.subject, gr.value, gr.is_absent,
                    g.is_draft, gr.comment
             FROM grade_records gr
             JOIN grades g ON g.id = gr.grade_id
             JOIN course_sessions cs ON cs.id = g.session_id
             WHERE gr.student_id = ?",
        )?;
        let rows = stmt
            .query_map([student_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for (student_id, session_id, subject, value, is_absent, is_draft, comment) in rows {
            records.push(GradeRecord {
                student_id,
                session_id,
                subject: parse_subject(&subject)?,
                value,
                absent: is_absent != 0,
                draft: is_draft != 0,
                comment,
            });
        }
        Ok(records)
    }

    fn student_snapshot(
        &mut self,
        student_id: &str,
    ) -> Result<Option<StudentSnapshot>, StoreError> {
        let conn = self.conn()?;
        let row: Option<(
            String,
            f64,
            i64,
            f64,
            f64,
            f64,
            f64,
            Option<String>,
            String,
        )> = conn
            .query_row(
                "SELECT id, absences_rate, absences_count, behavior_average,
                        arabic_average, cultural_education_average, overall_average,
                        last_activity, last_update
                 FROM student_stats
                 WHERE user_id = ?",
                [student_id],
                |r| {
                    Ok((
                        r.get(0)?,
                        r.get(1)?,
                        r.get(2)?,
                        r.get(3)?,
                        r.get(4)?,
                        r.get(5)?,
                        r.get(6)?,
                        r.get(7)?,
                        r.get(8)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            stats_id,
            absences_rate,
            absences_count,
            behavior_average,
            arabic,
            cultural_education,
            overall,
            last_activity,
            last_update,
        )) = row
        else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT date, course_id
             FROM student_stats_absences
             WHERE student_stats_id = ?
             ORDER BY sort_order",
        )?;
        let absence_rows = stmt
            .query_map([&stats_id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut absences = Vec::with_capacity(absence_rows.len());
        for (date, course_id) in absence_rows {
            absences.push(AbsenceEntry {
                date: parse_ts(&date)?,
                course_id,
            });
        }

        let last_activity = match last_activity {
            Some(raw) => Some(parse_ts(&raw)?),
            None => None,
        };

        Ok(Some(StudentSnapshot {
            user_id: student_id.to_string(),
            absences_rate,
            absences_count,
            behavior_average,
            grades: GradeAverages {
                arabic,
                cultural_education,
                overall,
            },
            absences,
            last_activity,
            last_update: parse_ts(&last_update)?,
        }))
    }

    fn upsert_student_snapshot(
        &mut self,
        snapshot: &StudentSnapshot,
    ) -> Result<UpsertOutcome, StoreError> {
        let conn = self.conn()?;
        let existing_id: Option<String> = conn
            .query_row(
                "SELECT id FROM student_stats WHERE user_id = ?",
                [&snapshot.user_id],
                |r| r.get(0),
            )
            .optional()?;

        let created = existing_id.is_none();
        let stats_id = existing_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        conn.execute(
            "INSERT INTO student_stats(
                id, user_id, absences_rate, absences_count, behavior_average,
                arabic_average, cultural_education_average, overall_average,
                last_activity, last_update
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                absences_rate = excluded.absences_rate,
                absences_count = excluded.absences_count,
                behavior_average = excluded.behavior_average,
                arabic_average = excluded.arabic_average,
                cultural_education_average = excluded.cultural_education_average,
                overall_average = excluded.overall_average,
                last_activity = excluded.last_activity,
                last_update = excluded.last_update",
            (
                &stats_id,
                &snapshot.user_id,
                snapshot.absences_rate,
                snapshot.absences_count,
                snapshot.behavior_average,
                snapshot.grades.arabic,
                snapshot.grades.cultural_education,
                snapshot.grades.overall,
                snapshot.last_activity.map(format_ts),
                format_ts(snapshot.last_update),
            ),
        )?;

        // Absence details are rewritten wholesale on every upsert.
        conn.execute(
            "DELETE FROM student_stats_absences WHERE student_stats_id = ?",
            [&stats_id],
        )?;
        for (i, absence) in snapshot.absences.iter().enumerate() {
            conn.execute(
                "INSERT INTO student_stats_absences(student_stats_id, date, course_id, sort_order)
                 VALUES (?, ?, ?, ?)",
                (&stats_id, format_ts(absence.date), &absence.course_id, i as i64),
            )?;
        }

        Ok(UpsertOutcome {
            snapshot_id: stats_id,
            created,
        })
    }

    fn teacher_snapshot(
        &mut self,
        teacher_id: &str,
    ) -> Result<Option<TeacherSnapshot>, StoreError> {
        let conn = self.conn()?;
        let row: Option<(i64, i64, i64, i64, f64, f64, i64, i64, f64, String)> = conn
            .query_row(
                "SELECT total_students, count_male, count_female, count_unspecified,
                        male_percentage, female_percentage, min_age, max_age,
                        average_age, last_update
                 FROM teacher_stats
                 WHERE user_id = ?",
                [teacher_id],
                |r| {
                    Ok((
                        r.get(0)?,
                        r.get(1)?,
                        r.get(2)?,
                        r.get(3)?,
                        r.get(4)?,
                        r.get(5)?,
                        r.get(6)?,
                        r.get(7)?,
                        r.get(8)?,
                        r.get(9)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            total_students,
            male,
            female,
            unspecified,
            male_percentage,
            female_percentage,
            min_age,
            max_age,
            average_age,
            last_update,
        )) = row
        else {
            return Ok(None);
        };

        Ok(Some(TeacherSnapshot {
            user_id: teacher_id.to_string(),
            total_students,
            gender_counts: GenderCounts {
                male,
                female,
                unspecified,
            },
            male_percentage,
            female_percentage,
            min_age,
            max_age,
            average_age,
            last_update: parse_ts(&last_update)?,
        }))
    }

    fn upsert_teacher_snapshot(
        &mut self,
        snapshot: &TeacherSnapshot,
    ) -> Result<UpsertOutcome, StoreError> {
        let conn = self.conn()?;
        let existing_id: Option<String> = conn
            .query_row(
                "SELECT id FROM teacher_stats WHERE user_id = ?",
                [&snapshot.user_id],
                |r| r.get(0),
            )
            .optional()?;

        let created = existing_id.is_none();
        let stats_id = existing_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        conn.execute(
            "INSERT INTO teacher_stats(
                id, user_id, total_students, count_male, count_female,
                count_unspecified, male_percentage, female_percentage,
                min_age, max_age, average_age, last_update
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                total_students = excluded.total_students,
                count_male = excluded.count_male,
                count_female = excluded.count_female,
                count_unspecified = excluded.count_unspecified,
                male_percentage = excluded.male_percentage,
                female_percentage = excluded.female_percentage,
                min_age = excluded.min_age,
                max_age = excluded.max_age,
                average_age = excluded.average_age,
                last_update = excluded.last_update",
            (
                &stats_id,
                &snapshot.user_id,
                snapshot.total_students,
                snapshot.gender_counts.male,
                snapshot.gender_counts.female,
                snapshot.gender_counts.unspecified,
                snapshot.male_percentage,
                snapshot.female_percentage,
                snapshot.min_age,
                snapshot.max_age,
                snapshot.average_age,
                format_ts(snapshot.last_update),
            ),
        )?;

        Ok(UpsertOutcome {
            snapshot_id: stats_id,
            created,
        })
    }

    fn link_snapshot(&mut self, user_id: &str, snapshot_id: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE users SET stats_id = ? WHERE id = ?",
            (snapshot_id, user_id),
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("user {}", user_id)));
        }
        Ok(())
    }
}
