//! Administrative validation gate.
//!
//! `validate` turns a paid (or flat-fee) enrollment into a confirmed, seat-consuming
//! one through the capacity ledger. A full course is reported back to the
//! administrator and the enrollment keeps its state, so the validation can be
//! retried once a seat frees up. `reject` cancels anything not already cancelled.

use crate::{
    core::{
        capacity,
        enrollment::{enrollment_not_found, get_required, transition},
        identity::{Actor, Role},
        notification::{self, NewNotification, NotificationSink},
        retry::{RetryPolicy, retry_transient},
    },
    entities::{Course, Enrollment, EnrollmentState, NotificationKind, enrollment},
    errors::{Error, Result},
};
use sea_orm::{TransactionTrait, prelude::*};

/// Confirms an enrollment awaiting validation.
///
/// # Errors
/// - [`Error::Forbidden`] if the actor is not an administrator
/// - [`Error::NotFound`] if the enrollment does not exist
/// - [`Error::AlreadyTerminal`] if it is already `confirmed` or `cancelled`
/// - [`Error::InvalidState`] if it is still awaiting payment
/// - [`Error::CapacityExceeded`] if the course is full; the enrollment is unchanged
pub async fn validate(
    db: &DatabaseConnection,
    notifier: &dyn NotificationSink,
    actor: &Actor,
    enrollment_id: i64,
    policy: RetryPolicy,
) -> Result<enrollment::Model> {
    actor.require(Role::Admin, "validate")?;

    let confirmed = retry_transient(policy, "validate", || confirm(db, enrollment_id))
        .await
        .inspect_err(|err| {
            tracing::info!(enrollment_id, error = %err, "Validation refused");
        })?;

    tracing::info!(
        enrollment_id,
        course_id = confirmed.course_id,
        validated_by = %actor.user_id,
        "Enrollment confirmed"
    );

    let course_name = course_name(db, confirmed.course_id).await;
    notification::deliver(
        notifier,
        NewNotification::for_enrollment(
            &confirmed.student_id,
            NotificationKind::EnrollmentConfirmed,
            format!("Your enrollment in {course_name} has been confirmed."),
            enrollment_id,
        ),
    )
    .await;

    Ok(confirmed)
}

async fn confirm(db: &DatabaseConnection, enrollment_id: i64) -> Result<enrollment::Model> {
    let txn = db.begin().await?;

    let current = Enrollment::find_by_id(enrollment_id)
        .one(&txn)
        .await?
        .ok_or_else(|| enrollment_not_found(enrollment_id))?;

    if current.state.is_terminal() {
        return Err(Error::AlreadyTerminal {
            enrollment_id,
            state: current.state,
        });
    }
    if !current.state.awaits_validation() {
        return Err(Error::InvalidState {
            enrollment_id,
            state: current.state,
            expected: "pending or pending_validation_admin",
        });
    }

    let confirmed = capacity::try_confirm(&txn, current.course_id, enrollment_id).await?;
    txn.commit().await?;
    Ok(confirmed)
}

/// Cancels an enrollment that is not already cancelled.
///
/// Returns `Ok(false)` when there was nothing to do because the enrollment does not
/// exist or is already cancelled.
///
/// # Errors
/// Returns [`Error::Forbidden`] if the actor is not an administrator.
pub async fn reject(
    db: &DatabaseConnection,
    notifier: &dyn NotificationSink,
    actor: &Actor,
    enrollment_id: i64,
) -> Result<bool> {
    actor.require(Role::Admin, "reject")?;

    let txn = db.begin().await?;
    let cancelled = transition(
        &txn,
        enrollment_id,
        &[
            EnrollmentState::Pending,
            EnrollmentState::PendingPayment,
            EnrollmentState::PendingValidationAdmin,
            EnrollmentState::Confirmed,
        ],
        EnrollmentState::Cancelled,
        None,
    )
    .await?;
    if !cancelled {
        tracing::debug!(enrollment_id, "Reject ignored, enrollment not found or already cancelled");
        return Ok(false);
    }
    let rejected = get_required(&txn, enrollment_id).await?;
    txn.commit().await?;

    tracing::info!(enrollment_id, rejected_by = %actor.user_id, "Enrollment rejected");

    if rejected.payment_ref.is_some() {
        tracing::warn!(
            enrollment_id,
            payment_ref = ?rejected.payment_ref,
            "Rejected enrollment was paid, refund must be handled by the payment provider"
        );
    }

    let course_name = course_name(db, rejected.course_id).await;
    notification::deliver(
        notifier,
        NewNotification::for_enrollment(
            &rejected.student_id,
            NotificationKind::EnrollmentRejected,
            format!("Your enrollment in {course_name} was rejected by administration."),
            enrollment_id,
        ),
    )
    .await;

    Ok(true)
}

async fn course_name(db: &DatabaseConnection, course_id: i64) -> String {
    match Course::find_by_id(course_id).one(db).await {
        Ok(Some(course)) => course.name,
        _ => format!("course {course_id}"),
    }
}
