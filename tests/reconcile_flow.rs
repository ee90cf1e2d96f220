mod test_support;

use std::time::Duration;

use edustats::bulk::recompute_at;
use edustats::store::RecordStore;
use edustats::{BulkOptions, NoopReportSink, Population, RetryPolicy, SqliteStore};

use test_support::*;

fn fast_options(force: bool) -> BulkOptions {
    BulkOptions {
        force_update: force,
        cooldown: Duration::from_secs(3600),
        policy: RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        },
    }
}

/// One student with records, one without. The first gets a snapshot and a
/// back-link; the second counts as "without data".
#[test]
fn student_recomputation_end_to_end() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = SqliteStore::open(dir.path());
    {
        let conn = store.connection().expect("connect");
        insert_user(conn, "t1", "Nadia", "Haddad", "teacher");
        insert_student(conn, "alice", "Alice", "Mansour", Some("female"), None);
        insert_student(conn, "bob", "Bob", "Karim", Some("male"), None);
        insert_course(conn, "c1", "t1");
        insert_session(conn, "cs1", "c1", "Arabic");
        for day in 1..=5 {
            insert_attendance(
                conn,
                &format!("a{}", day),
                "c1",
                ts(2026, 3, day, 9),
                "alice",
                day != 2,
            );
        }
        insert_behavior(conn, "b1", "cs1", ts(2026, 3, 4, 10), "alice", 4);
        insert_grade(conn, "g1", "cs1", ts(2026, 3, 5, 11), false, "alice", Some(15.0), false);
    }

    let report = recompute_at(
        &mut store,
        &Population::ActiveStudents,
        &fast_options(false),
        &NoopReportSink,
        ts(2026, 3, 10, 12),
    )
    .expect("bulk run");

    assert_eq!(report.total, 2);
    assert_eq!(report.updated, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.without_data, 1);
    assert!(report.failures.is_empty());

    let snapshot = store
        .student_snapshot("alice")
        .expect("load snapshot")
        .expect("snapshot exists");
    // 1 absence out of 5 sessions.
    assert!((snapshot.absences_rate - 20.0).abs() < 1e-9);
    assert_eq!(snapshot.absences_count, 1);
    assert_eq!(snapshot.absences.len(), 1);
    assert_eq!(snapshot.absences[0].date, ts(2026, 3, 2, 9));
    assert!((snapshot.behavior_average - 4.0).abs() < 1e-9);
    assert!((snapshot.grades.arabic - 15.0).abs() < 1e-9);
    assert!((snapshot.grades.overall - 15.0).abs() < 1e-9);
    // Attendance on the 5th is later than the behavior on the 4th.
    assert_eq!(snapshot.last_activity, Some(ts(2026, 3, 5, 9)));

    let change = &report.changes[0];
    assert_eq!(change.entity_id, "alice");
    assert_eq!(change.entity_name, "Alice Mansour");
    assert!(change
        .differences
        .iter()
        .any(|d| d == "absence rate: 0.00% → 20.00%"));

    // Newly created snapshot is linked back onto the user row.
    let conn = store.connection().expect("connect");
    assert!(stats_id_of(conn, "alice").is_some());
    assert!(stats_id_of(conn, "bob").is_none());
}

#[test]
fn unchanged_student_is_skipped_on_rerun() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = SqliteStore::open(dir.path());
    {
        let conn = store.connection().expect("connect");
        insert_user(conn, "t1", "Nadia", "Haddad", "teacher");
        insert_student(conn, "alice", "Alice", "Mansour", None, None);
        insert_course(conn, "c1", "t1");
        insert_attendance(conn, "a1", "c1", ts(2026, 3, 1, 9), "alice", false);
    }

    let first = recompute_at(
        &mut store,
        &Population::ActiveStudents,
        &fast_options(false),
        &NoopReportSink,
        ts(2026, 3, 10, 12),
    )
    .expect("first run");
    assert_eq!(first.updated, 1);

    // Force bypasses the cooldown; the figures still match, so nothing is
    // rewritten.
    let second = recompute_at(
        &mut store,
        &Population::ActiveStudents,
        &fast_options(true),
        &NoopReportSink,
        ts(2026, 3, 11, 12),
    )
    .expect("second run");
    assert_eq!(second.updated, 0);
    assert_eq!(second.skipped, 1);
    assert_eq!(second.without_data, 0);

    let snapshot = store
        .student_snapshot("alice")
        .expect("load")
        .expect("exists");
    assert_eq!(snapshot.last_update, ts(2026, 3, 10, 12));
}

#[test]
fn cooldown_skips_fresh_snapshots_without_fetching() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = SqliteStore::open(dir.path());
    {
        let conn = store.connection().expect("connect");
        insert_user(conn, "t1", "Nadia", "Haddad", "teacher");
        insert_student(conn, "alice", "Alice", "Mansour", None, None);
        insert_course(conn, "c1", "t1");
        insert_attendance(conn, "a1", "c1", ts(2026, 3, 1, 9), "alice", false);
    }

    let run_at = ts(2026, 3, 10, 12);
    recompute_at(
        &mut store,
        &Population::ActiveStudents,
        &fast_options(false),
        &NoopReportSink,
        run_at,
    )
    .expect("first run");

    // New absence arrives, but the snapshot is 10 minutes old.
    {
        let conn = store.connection().expect("connect");
        insert_attendance(conn, "a2", "c1", ts(2026, 3, 10, 11), "alice", false);
    }
    let fresh = recompute_at(
        &mut store,
        &Population::ActiveStudents,
        &fast_options(false),
        &NoopReportSink,
        ts(2026, 3, 10, 12) + chrono::Duration::minutes(10),
    )
    .expect("fresh run");
    assert_eq!(fresh.updated, 0);
    assert_eq!(fresh.skipped, 1);

    // Past the cooldown the new absence is picked up.
    let later = recompute_at(
        &mut store,
        &Population::ActiveStudents,
        &fast_options(false),
        &NoopReportSink,
        run_at + chrono::Duration::hours(2),
    )
    .expect("later run");
    assert_eq!(later.updated, 1);
    let snapshot = store
        .student_snapshot("alice")
        .expect("load")
        .expect("exists");
    assert_eq!(snapshot.absences_count, 2);
}

#[test]
fn teacher_roster_recomputation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = SqliteStore::open(dir.path());
    {
        let conn = store.connection().expect("connect");
        insert_user(conn, "t1", "Nadia", "Haddad", "teacher");
        insert_student(conn, "s1", "Omar", "Aziz", Some("male"), Some("2014-01-10"));
        insert_student(conn, "s2", "Lina", "Aziz", Some("female"), Some("2016-09-01"));
        insert_student(conn, "s3", "Sami", "Noor", None, None);
        insert_course(conn, "c1", "t1");
        insert_session(conn, "cs1", "c1", "Arabic");
        enroll(conn, "cs1", "s1");
        enroll(conn, "cs1", "s2");
        enroll(conn, "cs1", "s3");
    }

    let report = recompute_at(
        &mut store,
        &Population::ActiveTeachers,
        &fast_options(false),
        &NoopReportSink,
        ts(2026, 8, 27, 12),
    )
    .expect("teacher run");

    assert_eq!(report.total, 1);
    assert_eq!(report.updated, 1);

    let snapshot = store
        .teacher_snapshot("t1")
        .expect("load")
        .expect("exists");
    assert_eq!(snapshot.total_students, 3);
    assert_eq!(snapshot.gender_counts.male, 1);
    assert_eq!(snapshot.gender_counts.female, 1);
    assert_eq!(snapshot.gender_counts.unspecified, 1);
    assert!((snapshot.male_percentage - 33.33).abs() < 1e-9);
    assert_eq!(snapshot.min_age, 9);
    assert_eq!(snapshot.max_age, 12);
    assert!((snapshot.average_age - 10.5).abs() < 1e-9);

    let conn = store.connection().expect("connect");
    assert!(stats_id_of(conn, "t1").is_some());
}

/// Draft grade events and absent grade entries never reach the averages.
#[test]
fn draft_and_absent_grades_are_ignored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = SqliteStore::open(dir.path());
    {
        let conn = store.connection().expect("connect");
        insert_user(conn, "t1", "Nadia", "Haddad", "teacher");
        insert_student(conn, "alice", "Alice", "Mansour", None, None);
        insert_course(conn, "c1", "t1");
        insert_session(conn, "cs1", "c1", "Arabic");
        insert_session(conn, "cs2", "c1", "CulturalEducation");
        insert_grade(conn, "g1", "cs1", ts(2026, 3, 1, 9), false, "alice", Some(12.0), false);
        insert_grade(conn, "g2", "cs1", ts(2026, 3, 2, 9), true, "alice", Some(18.0), false);
        insert_grade(conn, "g3", "cs2", ts(2026, 3, 3, 9), false, "alice", Some(5.0), true);
    }

    recompute_at(
        &mut store,
        &Population::ActiveStudents,
        &fast_options(false),
        &NoopReportSink,
        ts(2026, 3, 10, 12),
    )
    .expect("run");

    let snapshot = store
        .student_snapshot("alice")
        .expect("load")
        .expect("exists");
    assert!((snapshot.grades.arabic - 12.0).abs() < 1e-9);
    assert_eq!(snapshot.grades.cultural_education, 0.0);
    assert!((snapshot.grades.overall - 12.0).abs() < 1e-9);
}

#[test]
fn teacher_scoped_student_run_only_touches_enrolled_students() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = SqliteStore::open(dir.path());
    {
        let conn = store.connection().expect("connect");
        insert_user(conn, "t1", "Nadia", "Haddad", "teacher");
        insert_user(conn, "t2", "Yusuf", "Rahim", "teacher");
        insert_student(conn, "mine", "Mina", "Aziz", None, None);
        insert_student(conn, "other", "Omar", "Noor", None, None);
        insert_course(conn, "c1", "t1");
        insert_course(conn, "c2", "t2");
        insert_session(conn, "cs1", "c1", "Arabic");
        insert_session(conn, "cs2", "c2", "Arabic");
        enroll(conn, "cs1", "mine");
        enroll(conn, "cs2", "other");
        insert_attendance(conn, "a1", "c1", ts(2026, 3, 1, 9), "mine", false);
        insert_attendance(conn, "a2", "c2", ts(2026, 3, 1, 9), "other", false);
    }

    let report = recompute_at(
        &mut store,
        &Population::TeacherStudents {
            teacher_id: "t1".to_string(),
        },
        &fast_options(false),
        &NoopReportSink,
        ts(2026, 3, 10, 12),
    )
    .expect("scoped run");

    assert_eq!(report.total, 1);
    assert_eq!(report.updated, 1);
    assert!(store
        .student_snapshot("mine")
        .expect("load")
        .is_some());
    assert!(store
        .student_snapshot("other")
        .expect("load")
        .is_none());
}
