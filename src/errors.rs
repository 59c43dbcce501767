//! Unified error type for the enrollment service.
//!
//! Variants fall into two groups. Business outcomes (duplicate enrollment, full
//! course, wrong state, ...) are expected results of a guard and are reported to the
//! caller as-is. Infrastructure faults (storage, gateway transport, configuration)
//! are reported generically and logged for an operator.

use crate::entities::enrollment::EnrollmentState;
use sea_orm::{DbErr, SqlErr};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Student {student_id} already holds an active enrollment in course {course_id}")]
    DuplicateActiveEnrollment { student_id: String, course_id: i64 },

    #[error("Course {course_id} is not open for enrollment: {reason}")]
    CourseUnavailable { course_id: i64, reason: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Enrollment {enrollment_id} is '{state}', expected {expected}")]
    InvalidState {
        enrollment_id: i64,
        state: EnrollmentState,
        expected: &'static str,
    },

    #[error("Course {course_id} is full ({confirmed}/{capacity} seats confirmed)")]
    CapacityExceeded {
        course_id: i64,
        capacity: i32,
        confirmed: u64,
    },

    #[error("Payment {transaction_ref} does not match enrollment {enrollment_id}: {detail}")]
    PaymentMismatch {
        transaction_ref: String,
        enrollment_id: i64,
        detail: String,
    },

    #[error("Enrollment {enrollment_id} is already '{state}'")]
    AlreadyTerminal {
        enrollment_id: i64,
        state: EnrollmentState,
    },

    #[error("Payment gateway did not answer within {timeout_ms} ms")]
    UpstreamTimeout { timeout_ms: u64 },

    #[error("Payment was declined by the gateway (transaction {transaction_ref})")]
    PaymentDeclined { transaction_ref: String },

    #[error("Operation '{operation}' is not permitted for role '{role}'")]
    Forbidden {
        operation: &'static str,
        role: String,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    #[error("Payment gateway error: {message}")]
    Gateway { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Environment variable error: {0}")]
    EnvVar(#[from] std::env::VarError),
}

impl Error {
    /// Returns true for expected business outcomes that the caller can act on.
    #[must_use]
    pub const fn is_business(&self) -> bool {
        matches!(
            self,
            Self::DuplicateActiveEnrollment { .. }
                | Self::CourseUnavailable { .. }
                | Self::NotFound { .. }
                | Self::InvalidState { .. }
                | Self::CapacityExceeded { .. }
                | Self::PaymentMismatch { .. }
                | Self::AlreadyTerminal { .. }
                | Self::UpstreamTimeout { .. }
                | Self::PaymentDeclined { .. }
                | Self::Forbidden { .. }
                | Self::InvalidInput { .. }
        )
    }

    /// Returns true for storage faults that are safe to retry with a fresh transaction.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(DbErr::ConnectionAcquire(_) | DbErr::Conn(_)) => true,
            Self::Database(err) => {
                let text = err.to_string().to_lowercase();
                ["database is locked", "busy", "deadlock", "could not serialize"]
                    .iter()
                    .any(|needle| text.contains(needle))
            }
            _ => false,
        }
    }

    /// Returns true when a write lost a race on a unique key and the winning row can
    /// be re-read.
    #[must_use]
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            Self::Database(err) if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
        )
    }

    /// Text suitable for showing to the end user.
    ///
    /// Business errors carry actionable detail; infrastructure faults are collapsed
    /// into a generic message.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::DuplicateActiveEnrollment { .. } => {
                "You are already enrolled in this course or have an enrollment in progress."
                    .to_string()
            }
            Self::CapacityExceeded { .. } => {
                "The course has reached its maximum capacity. Try again once a seat frees up."
                    .to_string()
            }
            Self::UpstreamTimeout { .. } => {
                "The payment provider did not respond. Your enrollment is still awaiting payment; please retry."
                    .to_string()
            }
            err if err.is_business() => err.to_string(),
            _ => "An internal error occurred. Please try again later.".to_string(),
        }
    }
}

// Convenience `Result` type
pub type Result<T> = std::result::Result<T, Error>;
