//! Shared primitive types used across the engine.

/// Stable identifier of a data subject (a platform user).
pub type SubjectId = String;

/// Identifier of a raw source record.
pub type RecordId = String;

/// Identifier of a stored insights report.
pub type ReportId = String;

/// Minimum number of distinct subjects a released group must represent.
pub const K_THRESHOLD: usize = 5;

/// Sensitivity of every catalog query. All six are subject counts.
pub const COUNT_SENSITIVITY: f64 = 1.0;
