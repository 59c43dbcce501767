//! Capacity ledger - answers "is there room for one more confirmed enrollment?"
//!
//! No seat counter is persisted. The occupied count is recomputed from live
//! enrollment rows every time, and only `confirmed` enrollments occupy a seat.
//!
//! Race freedom comes from the course row lock taken by [`lock_course`]: the lock is
//! the first write of the transaction (`UPDATE courses SET updated_at = ...`), so on
//! row-locking backends it holds the course row exclusively and on `SQLite` it takes
//! the database write lock. Any other confirmation for the same course waits until
//! the holder commits or rolls back, so the count check and the state write in
//! [`try_confirm`] cannot interleave with another confirmation.

use crate::{
    core::course::course_not_found,
    entities::{Course, Enrollment, EnrollmentState, course, enrollment},
    errors::{Error, Result},
};
use sea_orm::{
    DatabaseTransaction, PaginatorTrait, QuerySelect, prelude::*, sea_query::Expr,
};

/// Seat usage of one course at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacitySnapshot {
    pub course_id: i64,
    pub capacity: i32,
    pub confirmed: u64,
    pub seats_left: u64,
}

impl CapacitySnapshot {
    #[must_use]
    pub fn new(course: &course::Model, confirmed: u64) -> Self {
        let capacity = u64::try_from(course.capacity).unwrap_or(0);
        Self {
            course_id: course.id,
            capacity: course.capacity,
            confirmed,
            seats_left: capacity.saturating_sub(confirmed),
        }
    }

    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.seats_left == 0
    }
}

/// Counts the confirmed enrollments of a course.
pub async fn confirmed_count<C>(conn: &C, course_id: i64) -> Result<u64>
where
    C: ConnectionTrait,
{
    Enrollment::find()
        .filter(enrollment::Column::CourseId.eq(course_id))
        .filter(enrollment::Column::State.eq(EnrollmentState::Confirmed))
        .count(conn)
        .await
        .map_err(Into::into)
}

/// Reads the current seat usage of a course without locking.
///
/// The answer is informational only; it may be stale by the time the caller acts.
pub async fn snapshot<C>(conn: &C, course: &course::Model) -> Result<CapacitySnapshot>
where
    C: ConnectionTrait,
{
    let confirmed = confirmed_count(conn, course.id).await?;
    Ok(CapacitySnapshot::new(course, confirmed))
}

/// Locks the course row until `txn` ends and returns the locked row.
///
/// # Errors
/// Returns [`Error::NotFound`] if the course does not exist.
pub async fn lock_course(txn: &DatabaseTransaction, course_id: i64) -> Result<course::Model> {
    let touched = Course::update_many()
        .col_expr(course::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
        .filter(course::Column::Id.eq(course_id))
        .exec(txn)
        .await?;

    if touched.rows_affected == 0 {
        return Err(course_not_found(course_id));
    }

    Course::find_by_id(course_id)
        .lock_exclusive()
        .one(txn)
        .await?
        .ok_or_else(|| course_not_found(course_id))
}

/// Confirms an enrollment if its course still has a free seat.
///
/// Must be called inside the transaction that will commit the confirmation. The
/// course row is locked, the confirmed count is read, and the enrollment is moved to
/// `confirmed` only from `pending` or `pending_validation_admin`. On any error the
/// enrollment is left untouched once the caller drops the transaction.
///
/// # Errors
/// - [`Error::NotFound`] if the course or enrollment does not exist
/// - [`Error::CapacityExceeded`] if every seat is already confirmed
/// - [`Error::AlreadyTerminal`] / [`Error::InvalidState`] if the enrollment is not
///   awaiting validation
pub async fn try_confirm(
    txn: &DatabaseTransaction,
    course_id: i64,
    enrollment_id: i64,
) -> Result<enrollment::Model> {
    let course = lock_course(txn, course_id).await?;
    let usage = snapshot(txn, &course).await?;

    if usage.is_full() {
        tracing::info!(
            course_id,
            enrollment_id,
            capacity = usage.capacity,
            confirmed = usage.confirmed,
            "Confirmation refused, course is full"
        );
        return Err(Error::CapacityExceeded {
            course_id,
            capacity: usage.capacity,
            confirmed: usage.confirmed,
        });
    }

    let updated = Enrollment::update_many()
        .col_expr(
            enrollment::Column::State,
            Expr::value(EnrollmentState::Confirmed),
        )
        .col_expr(enrollment::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
        .filter(enrollment::Column::Id.eq(enrollment_id))
        .filter(enrollment::Column::CourseId.eq(course_id))
        .filter(enrollment::Column::State.is_in([
            EnrollmentState::Pending,
            EnrollmentState::PendingValidationAdmin,
        ]))
        .exec(txn)
        .await?;

    let current = Enrollment::find_by_id(enrollment_id)
        .one(txn)
        .await?
        .filter(|e| e.course_id == course_id)
        .ok_or_else(|| Error::NotFound {
            entity: "enrollment",
            id: enrollment_id.to_string(),
        })?;

    if updated.rows_affected == 0 {
        return Err(if current.state.is_terminal() {
            Error::AlreadyTerminal {
                enrollment_id,
                state: current.state,
            }
        } else {
            Error::InvalidState {
                enrollment_id,
                state: current.state,
                expected: "pending or pending_validation_admin",
            }
        });
    }

    tracing::debug!(
        course_id,
        enrollment_id,
        seats_left = usage.seats_left - 1,
        "Seat confirmed"
    );
    Ok(current)
}

/// Returns the number of seats still free in a course.
pub async fn seats_left(db: &DatabaseConnection, course_id: i64) -> Result<u64> {
    let course = Course::find_by_id(course_id)
        .one(db)
        .await?
        .ok_or_else(|| course_not_found(course_id))?;
    Ok(snapshot(db, &course).await?.seats_left)
}
