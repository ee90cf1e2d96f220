//! Statistics aggregation and reconciliation for school records.
//!
//! Raw attendance, behavior and grade records are folded into per-student
//! snapshots, and class rosters into per-teacher snapshots. Recomputation
//! diffs the fresh figures against what is persisted and upserts only when
//! something actually changed, retrying transient storage failures along
//! the way. Bulk runs cover a whole population sequentially and leave a
//! JSON report behind.

pub mod bulk;
pub mod calc;
pub mod diff;
pub mod model;
pub mod reconcile;
pub mod report;
pub mod retry;
pub mod store;

pub use bulk::{recompute, BulkOptions, BulkReport, Population};
pub use model::StatFamily;
pub use reconcile::{Outcome, Reconciler, SkipReason};
pub use report::{FileReportSink, NoopReportSink, ReportSink};
pub use retry::{with_retry, RetryError, RetryPolicy};
pub use store::{RecordStore, SqliteStore, StoreError};
