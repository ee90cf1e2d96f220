#![allow(dead_code)]

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::Connection;

pub fn ts(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .expect("valid date")
        .and_hms_opt(h, 0, 0)
        .expect("valid time")
}

pub fn iso(t: NaiveDateTime) -> String {
    t.format("%Y-%m-%dT%H:%M:%S").to_string()
}

pub fn insert_user(conn: &Connection, id: &str, first: &str, last: &str, role: &str) {
    conn.execute(
        "INSERT INTO users(id, first_name, last_name, role, active) VALUES (?, ?, ?, ?, 1)",
        (id, first, last, role),
    )
    .expect("insert user");
}

pub fn insert_student(
    conn: &Connection,
    id: &str,
    first: &str,
    last: &str,
    gender: Option<&str>,
    birth_date: Option<&str>,
) {
    conn.execute(
        "INSERT INTO users(id, first_name, last_name, role, gender, birth_date, active)
         VALUES (?, ?, ?, 'student', ?, ?, 1)",
        (id, first, last, gender, birth_date),
    )
    .expect("insert student");
}

pub fn insert_course(conn: &Connection, id: &str, teacher_id: &str) {
    conn.execute(
        "INSERT INTO courses(id, teacher_id, active) VALUES (?, ?, 1)",
        (id, teacher_id),
    )
    .expect("insert course");
}

pub fn insert_session(conn: &Connection, id: &str, course_id: &str, subject: &str) {
    conn.execute(
        "INSERT INTO course_sessions(id, course_id, subject) VALUES (?, ?, ?)",
        (id, course_id, subject),
    )
    .expect("insert session");
}

pub fn enroll(conn: &Connection, session_id: &str, student_id: &str) {
    conn.execute(
        "INSERT INTO session_students(session_id, student_id) VALUES (?, ?)",
        (session_id, student_id),
    )
    .expect("enroll student");
}

pub fn insert_attendance(
    conn: &Connection,
    id: &str,
    course_id: &str,
    date: NaiveDateTime,
    student_id: &str,
    present: bool,
) {
    conn.execute(
        "INSERT INTO attendances(id, course_id, date) VALUES (?, ?, ?)",
        (id, course_id, iso(date)),
    )
    .expect("insert attendance");
    conn.execute(
        "INSERT INTO attendance_records(id, attendance_id, student_id, is_present)
         VALUES (?, ?, ?, ?)",
        (format!("{}-r", id), id, student_id, present as i64),
    )
    .expect("insert attendance record");
}

pub fn insert_behavior(
    conn: &Connection,
    id: &str,
    session_id: &str,
    date: NaiveDateTime,
    student_id: &str,
    rating: i64,
) {
    conn.execute(
        "INSERT INTO behaviors(id, session_id, date) VALUES (?, ?, ?)",
        (id, session_id, iso(date)),
    )
    .expect("insert behavior");
    conn.execute(
        "INSERT INTO behavior_records(id, behavior_id, student_id, rating) VALUES (?, ?, ?, ?)",
        (format!("{}-r", id), id, student_id, rating),
    )
    .expect("insert behavior record");
}

pub fn insert_grade(
    conn: &Connection,
    id: &str,
    session_id: &str,
    date: NaiveDateTime,
    draft: bool,
    student_id: &str,
    value: Option<f64>,
    absent: bool,
) {
    conn.execute(
        "INSERT INTO grades(id, session_id, date, is_draft) VALUES (?, ?, ?, ?)",
        (id, session_id, iso(date), draft as i64),
    )
    .expect("insert grade");
    conn.execute(
        "INSERT INTO grade_records(id, grade_id, student_id, value, is_absent)
         VALUES (?, ?, ?, ?, ?)",
        (format!("{}-r", id), id, student_id, value, absent as i64),
    )
    .expect("insert grade record");
}

pub fn stats_id_of(conn: &Connection, user_id: &str) -> Option<String> {
    conn.query_row("SELECT stats_id FROM users WHERE id = ?", [user_id], |r| {
        r.get(0)
    })
    .expect("query stats_id")
}
