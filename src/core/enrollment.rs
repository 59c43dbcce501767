//! Enrollment state machine - Handles enrollment requests, withdrawals and lookups.
//!
//! ```text
//!   request ──> pending ─────────────────────────┐
//!          └──> pending_payment ──(settled)──> pending_validation_admin
//!                                                 │ validate        │ reject
//!                                                 v                 v
//!                                             confirmed          cancelled
//! ```
//!
//! A free course (`price_cents == 0`) starts in `pending`, a priced one in
//! `pending_payment`. Only `pending` enrollments may be withdrawn by the student.
//! Payment and validation transitions live in `reconciliation` and `validation`.

use crate::{
    core::{
        capacity,
        identity::{Actor, Role},
        notification::{self, NewNotification, NotificationSink},
    },
    entities::{Enrollment, EnrollmentState, NotificationKind, course, enrollment},
    errors::{Error, Result},
};
use chrono::NaiveDate;
use sea_orm::{DatabaseTransaction, QueryOrder, Set, TransactionTrait, prelude::*, sea_query::Expr};
use std::collections::HashSet;

/// Requests an enrollment for the calling student, using today's date for the
/// validity-window check.
pub async fn request_enrollment(
    db: &DatabaseConnection,
    notifier: &dyn NotificationSink,
    actor: &Actor,
    course_id: i64,
) -> Result<enrollment::Model> {
    request_enrollment_on(db, notifier, actor, course_id, chrono::Utc::now().date_naive()).await
}

/// Requests an enrollment for the calling student as of `today`.
///
/// The course row is locked for the duration of the duplicate check and insert, so
/// two concurrent requests by the same student cannot both pass the check. Seat
/// availability is only logged here; capacity is enforced at validation time.
///
/// # Errors
/// - [`Error::Forbidden`] if the actor is not a student
/// - [`Error::NotFound`] if the course does not exist
/// - [`Error::CourseUnavailable`] if the course is inactive or outside its validity window
/// - [`Error::DuplicateActiveEnrollment`] if the student already holds an active enrollment
pub async fn request_enrollment_on(
    db: &DatabaseConnection,
    notifier: &dyn NotificationSink,
    actor: &Actor,
    course_id: i64,
    today: NaiveDate,
) -> Result<enrollment::Model> {
    actor.require(Role::Student, "request_enrollment")?;

    let txn = db.begin().await?;
    let (created, course) = create_enrollment(&txn, &actor.user_id, course_id, today, false).await?;
    txn.commit().await?;

    tracing::info!(
        enrollment_id = created.id,
        student_id = %created.student_id,
        course_id,
        state = %created.state,
        "Enrollment registered"
    );

    let message = if created.state == EnrollmentState::PendingPayment {
        format!(
            "Your enrollment in {} has been registered and is awaiting payment.",
            course.name
        )
    } else {
        format!(
            "Your enrollment in {} has been registered and is awaiting validation.",
            course.name
        )
    };
    notification::deliver(
        notifier,
        NewNotification::for_enrollment(
            &created.student_id,
            NotificationKind::Registered,
            message,
            created.id,
        ),
    )
    .await;

    Ok(created)
}

/// Creates one `pending_payment` enrollment per course in a single transaction,
/// for a checkout that will pay them together.
///
/// Any guard failure aborts the whole checkout. All courses must be priced and
/// share one currency.
///
/// # Errors
/// Same as [`request_enrollment_on`], plus [`Error::InvalidInput`] for an empty or
/// repeated course list, a free course, or mixed currencies.
pub async fn open_checkout(
    db: &DatabaseConnection,
    notifier: &dyn NotificationSink,
    actor: &Actor,
    course_ids: &[i64],
    today: NaiveDate,
) -> Result<Vec<enrollment::Model>> {
    actor.require(Role::Student, "checkout")?;

    if course_ids.is_empty() {
        return Err(Error::InvalidInput {
            message: "Checkout needs at least one course".to_string(),
        });
    }
    let mut seen = HashSet::new();
    if let Some(repeated) = course_ids.iter().find(|id| !seen.insert(**id)) {
        return Err(Error::InvalidInput {
            message: format!("Course {repeated} appears twice in the checkout"),
        });
    }

    let txn = db.begin().await?;
    let mut created = Vec::with_capacity(course_ids.len());
    for &course_id in course_ids {
        created.push(create_enrollment(&txn, &actor.user_id, course_id, today, true).await?);
    }

    let currency = &created[0].0.currency;
    if created.iter().any(|(e, _)| &e.currency != currency) {
        return Err(Error::InvalidInput {
            message: "All courses in a checkout must share one currency".to_string(),
        });
    }
    txn.commit().await?;

    tracing::info!(
        student_id = %actor.user_id,
        count = created.len(),
        "Checkout enrollments registered"
    );

    let mut enrollments = Vec::with_capacity(created.len());
    for (enrollment, course) in created {
        notification::deliver(
            notifier,
            NewNotification::for_enrollment(
                &enrollment.student_id,
                NotificationKind::Registered,
                format!(
                    "Your enrollment in {} has been registered and is awaiting payment.",
                    course.name
                ),
                enrollment.id,
            ),
        )
        .await;
        enrollments.push(enrollment);
    }
    Ok(enrollments)
}

async fn create_enrollment(
    txn: &DatabaseTransaction,
    student_id: &str,
    course_id: i64,
    today: NaiveDate,
    checkout: bool,
) -> Result<(enrollment::Model, course::Model)> {
    let course = capacity::lock_course(txn, course_id).await?;
    ensure_open(&course, today)?;

    if checkout && course.price_cents == 0 {
        return Err(Error::InvalidInput {
            message: format!("Course {course_id} is free and needs no checkout"),
        });
    }

    if let Some(existing) = find_active(txn, student_id, course_id).await? {
        tracing::debug!(
            enrollment_id = existing.id,
            state = %existing.state,
            "Duplicate enrollment request"
        );
        return Err(Error::DuplicateActiveEnrollment {
            student_id: student_id.to_string(),
            course_id,
        });
    }

    let usage = capacity::snapshot(txn, &course).await?;
    if usage.is_full() {
        tracing::info!(
            course_id,
            capacity = usage.capacity,
            "Course currently full, request will wait for a free seat at validation"
        );
    }

    let state = if course.price_cents > 0 {
        EnrollmentState::PendingPayment
    } else {
        EnrollmentState::Pending
    };
    let now = chrono::Utc::now();
    let model = enrollment::ActiveModel {
        student_id: Set(student_id.to_string()),
        course_id: Set(course_id),
        state: Set(state),
        amount_cents: Set(course.price_cents),
        currency: Set(course.currency.clone()),
        payment_ref: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };
    let created = model.insert(txn).await?;
    Ok((created, course))
}

fn ensure_open(course: &course::Model, today: NaiveDate) -> Result<()> {
    let reason = if !course.is_active {
        "the course is inactive".to_string()
    } else if today < course.start_date {
        format!("enrollment opens on {}", course.start_date)
    } else if today > course.end_date {
        format!("the course ended on {}", course.end_date)
    } else {
        return Ok(());
    };
    Err(Error::CourseUnavailable {
        course_id: course.id,
        reason,
    })
}

/// Withdraws the calling student's enrollment.
///
/// # Errors
/// - [`Error::NotFound`] if the enrollment does not exist or belongs to another student
/// - [`Error::InvalidState`] if the enrollment is no longer `pending`
pub async fn withdraw(
    db: &DatabaseConnection,
    notifier: &dyn NotificationSink,
    actor: &Actor,
    enrollment_id: i64,
) -> Result<enrollment::Model> {
    actor.require(Role::Student, "withdraw")?;

    let txn = db.begin().await?;
    let current = Enrollment::find_by_id(enrollment_id)
        .filter(enrollment::Column::StudentId.eq(actor.user_id.as_str()))
        .one(&txn)
        .await?
        .ok_or_else(|| enrollment_not_found(enrollment_id))?;

    if current.state != EnrollmentState::Pending
        || !transition(
            &txn,
            enrollment_id,
            &[EnrollmentState::Pending],
            EnrollmentState::Cancelled,
            None,
        )
        .await?
    {
        return Err(Error::InvalidState {
            enrollment_id,
            state: current.state,
            expected: "pending",
        });
    }
    let withdrawn = get_required(&txn, enrollment_id).await?;
    txn.commit().await?;

    tracing::info!(enrollment_id, student_id = %actor.user_id, "Enrollment withdrawn");
    notification::deliver(
        notifier,
        NewNotification::for_enrollment(
            &withdrawn.student_id,
            NotificationKind::EnrollmentWithdrawn,
            "You have withdrawn from the course.",
            enrollment_id,
        ),
    )
    .await;

    Ok(withdrawn)
}

/// Moves an enrollment to `to` if it is currently in one of `from`.
///
/// The state guard is part of the `UPDATE` itself, so a concurrent transition that
/// got there first makes this a no-op. Returns whether a row changed.
pub(crate) async fn transition<C>(
    conn: &C,
    enrollment_id: i64,
    from: &[EnrollmentState],
    to: EnrollmentState,
    payment_ref: Option<&str>,
) -> Result<bool>
where
    C: ConnectionTrait,
{
    let mut update = Enrollment::update_many()
        .col_expr(enrollment::Column::State, Expr::value(to))
        .col_expr(enrollment::Column::UpdatedAt, Expr::value(chrono::Utc::now()));
    if let Some(reference) = payment_ref {
        update = update.col_expr(enrollment::Column::PaymentRef, Expr::value(reference));
    }
    let result = update
        .filter(enrollment::Column::Id.eq(enrollment_id))
        .filter(enrollment::Column::State.is_in(from.iter().copied()))
        .exec(conn)
        .await?;
    Ok(result.rows_affected > 0)
}

/// Finds the student's active (non-cancelled) enrollment in a course, if any.
pub async fn find_active<C>(
    conn: &C,
    student_id: &str,
    course_id: i64,
) -> Result<Option<enrollment::Model>>
where
    C: ConnectionTrait,
{
    Enrollment::find()
        .filter(enrollment::Column::StudentId.eq(student_id))
        .filter(enrollment::Column::CourseId.eq(course_id))
        .filter(enrollment::Column::State.is_in(EnrollmentState::ACTIVE))
        .one(conn)
        .await
        .map_err(Into::into)
}

/// Retrieves an enrollment by ID.
pub async fn get_enrollment(
    db: &DatabaseConnection,
    enrollment_id: i64,
) -> Result<Option<enrollment::Model>> {
    Enrollment::find_by_id(enrollment_id)
        .one(db)
        .await
        .map_err(Into::into)
}

pub(crate) async fn get_required<C>(conn: &C, enrollment_id: i64) -> Result<enrollment::Model>
where
    C: ConnectionTrait,
{
    Enrollment::find_by_id(enrollment_id)
        .one(conn)
        .await?
        .ok_or_else(|| enrollment_not_found(enrollment_id))
}

/// Retrieves all enrollments of a student, newest first.
pub async fn enrollments_for_student(
    db: &DatabaseConnection,
    student_id: &str,
) -> Result<Vec<enrollment::Model>> {
    Enrollment::find()
        .filter(enrollment::Column::StudentId.eq(student_id))
        .order_by_desc(enrollment::Column::CreatedAt)
        .order_by_desc(enrollment::Column::Id)
        .all(db)
        .await
        .map_err(Into::into)
}

pub(crate) fn enrollment_not_found(enrollment_id: i64) -> Error {
    Error::NotFound {
        entity: "enrollment",
        id: enrollment_id.to_string(),
    }
}
