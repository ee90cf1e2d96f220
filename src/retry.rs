use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::store::{RecordStore, StoreError};

/// Exponential backoff policy for storage operations. `max_retries` is the
/// total number of attempts, not the number of retries after the first.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(3000),
        }
    }
}

impl RetryPolicy {
    /// Delay slept before attempt `attempt` (1-based; attempt 1 has no
    /// delay). Doubles per attempt, capped at `max_delay`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("gave up after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error("permanent storage failure: {0}")]
    Permanent(#[source] StoreError),
}

/// Run `op` against the store, retrying transient failures with exponential
/// backoff. The connection is re-established before every attempt; permanent
/// failures propagate immediately without consuming the retry budget.
pub fn with_retry<S, T, F>(
    store: &mut S,
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, RetryError>
where
    S: RecordStore + ?Sized,
    F: FnMut(&mut S) -> Result<T, StoreError>,
{
    let attempts = policy.max_retries.max(1);
    let mut attempt = 1;
    loop {
        let delay = policy.backoff_delay(attempt);
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let result = match store.ensure_connected() {
            Ok(()) => op(store),
            Err(e) => Err(e),
        };
        match result {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(RetryError::Permanent(e)),
            Err(e) => {
                if attempt >= attempts {
                    return Err(RetryError::Exhausted {
                        attempts,
                        source: e,
                    });
                }
                warn!(
                    operation = label,
                    attempt,
                    error = %e,
                    "transient storage failure, retrying"
                );
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AttendanceRecord, BehaviorRecord, EntityRef, GradeRecord, StudentProfile, StudentSnapshot,
        TeacherSnapshot,
    };
    use crate::store::UpsertOutcome;

    /// Store whose `active_students` fails a configurable number of times
    /// before succeeding.
    struct FlakyStore {
        failures_left: u32,
        error: fn() -> StoreError,
        calls: u32,
    }

    impl FlakyStore {
        fn transient(failures: u32) -> FlakyStore {
            FlakyStore {
                failures_left: failures,
                error: || StoreError::Timeout("database is locked".into()),
                calls: 0,
            }
        }

        fn permanent() -> FlakyStore {
            FlakyStore {
                failures_left: u32::MAX,
                error: || StoreError::Validation("bad row".into()),
                calls: 0,
            }
        }
    }

    impl RecordStore for FlakyStore {
        fn ensure_connected(&mut self) -> Result<(), StoreError> {
            Ok(())
        }

        fn active_students(&mut self) -> Result<Vec<EntityRef>, StoreError> {
            self.calls += 1;
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err((self.error)());
            }
            Ok(Vec::new())
        }

        fn active_teachers(&mut self) -> Result<Vec<EntityRef>, StoreError> {
            Ok(Vec::new())
        }
        fn students_of_teacher(&mut self, _: &str) -> Result<Vec<EntityRef>, StoreError> {
            Ok(Vec::new())
        }
        fn student_roster(&mut self, _: &str) -> Result<Vec<StudentProfile>, StoreError> {
            Ok(Vec::new())
        }
        fn attendance_records(&mut self, _: &str) -> Result<Vec<AttendanceRecord>, StoreError> {
            Ok(Vec::new())
        }
        fn behavior_records(&mut self, _: &str) -> Result<Vec<BehaviorRecord>, StoreError> {
            Ok(Vec::new())
        }
        fn grade_records(&mut self, _: &str) -> Result<Vec<GradeRecord>, StoreError> {
            Ok(Vec::new())
        }
        fn student_snapshot(&mut self, _: &str) -> Result<Option<StudentSnapshot>, StoreError> {
            Ok(None)
        }
        fn upsert_student_snapshot(
            &mut self,
            _: &StudentSnapshot,
        ) -> Result<UpsertOutcome, StoreError> {
            Err(StoreError::Other("unused".into()))
        }
        fn teacher_snapshot(&mut self, _: &str) -> Result<Option<TeacherSnapshot>, StoreError> {
            Ok(None)
        }
        fn upsert_teacher_snapshot(
            &mut self,
            _: &TeacherSnapshot,
        ) -> Result<UpsertOutcome, StoreError> {
            Err(StoreError::Other("unused".into()))
        }
        fn link_snapshot(&mut self, _: &str, _: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(1), Duration::ZERO);
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(4), Duration::from_millis(800));
        assert_eq!(policy.backoff_delay(10), Duration::from_millis(3000));
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let mut store = FlakyStore::transient(2);
        let result = with_retry(&mut store, &fast_policy(), "students", |s| {
            s.active_students()
        });
        assert!(result.is_ok());
        assert_eq!(store.calls, 3);
    }

    #[test]
    fn exhausts_after_max_attempts() {
        let mut store = FlakyStore::transient(10);
        let result = with_retry(&mut store, &fast_policy(), "students", |s| {
            s.active_students()
        });
        match result {
            Err(RetryError::Exhausted { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert!(source.is_transient());
            }
            other => panic!("expected exhaustion, got {:?}", other.map(|_| ())),
        }
        assert_eq!(store.calls, 3);
    }

    #[test]
    fn permanent_failure_does_not_retry() {
        let mut store = FlakyStore::permanent();
        let result = with_retry(&mut store, &fast_policy(), "students", |s| {
            s.active_students()
        });
        assert!(matches!(result, Err(RetryError::Permanent(_))));
        assert_eq!(store.calls, 1);
    }
}
