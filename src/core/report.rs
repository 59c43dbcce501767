//! Report generation business logic.
//!
//! Read-only views over enrollments and payments: the administrator's review queue,
//! per-course seat usage, a student's weekly schedule and payment history. All
//! functions return structured data; rendering is left to the caller.

use crate::{
    core::{capacity, course::course_not_found},
    entities::{
        Course, CourseSchedule, Enrollment, EnrollmentState, Payment, PaymentEnrollment, course,
        course_schedule, enrollment, payment, payment_enrollment,
    },
    errors::Result,
};
use sea_orm::{QueryOrder, prelude::*};
use std::collections::{BTreeMap, HashMap, HashSet};

/// One enrollment waiting for an administrator's decision.
#[derive(Debug, Clone)]
pub struct ReviewItem {
    pub enrollment: enrollment::Model,
    pub course_name: String,
    pub capacity: i32,
    /// Confirmed enrollments in the course when the queue was read
    pub confirmed: u64,
}

impl ReviewItem {
    /// Whether validating this enrollment now would fail for lack of seats.
    #[must_use]
    pub fn would_exceed_capacity(&self) -> bool {
        self.confirmed >= u64::try_from(self.capacity).unwrap_or(0)
    }
}

/// Enrollment counts of one course.
#[derive(Debug, Clone)]
pub struct CourseSummary {
    pub course: course::Model,
    pub by_state: BTreeMap<String, u64>,
    pub seats_left: u64,
}

impl CourseSummary {
    #[must_use]
    pub fn count(&self, state: EnrollmentState) -> u64 {
        self.by_state.get(state.as_str()).copied().unwrap_or(0)
    }
}

/// One weekly session of a confirmed course.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub course_id: i64,
    pub course_name: String,
    pub slot: course_schedule::Model,
}

/// A payment together with the student's enrollments it funded.
#[derive(Debug, Clone)]
pub struct PaymentRecord {
    pub payment: payment::Model,
    pub enrollment_ids: Vec<i64>,
}

/// Lists enrollments awaiting validation, oldest first.
///
/// The confirmed counts are informational; [`crate::core::validation::validate`]
/// re-checks capacity under the course lock.
pub async fn review_queue(db: &DatabaseConnection) -> Result<Vec<ReviewItem>> {
    let waiting = Enrollment::find()
        .filter(enrollment::Column::State.is_in([
            EnrollmentState::Pending,
            EnrollmentState::PendingValidationAdmin,
        ]))
        .order_by_asc(enrollment::Column::CreatedAt)
        .order_by_asc(enrollment::Column::Id)
        .all(db)
        .await?;

    let course_ids: HashSet<i64> = waiting.iter().map(|e| e.course_id).collect();
    let mut courses = HashMap::new();
    for course in Course::find()
        .filter(course::Column::Id.is_in(course_ids))
        .all(db)
        .await?
    {
        let confirmed = capacity::confirmed_count(db, course.id).await?;
        courses.insert(course.id, (course, confirmed));
    }

    Ok(waiting
        .into_iter()
        .filter_map(|enrollment| {
            let (course, confirmed) = courses.get(&enrollment.course_id)?;
            Some(ReviewItem {
                course_name: course.name.clone(),
                capacity: course.capacity,
                confirmed: *confirmed,
                enrollment,
            })
        })
        .collect())
}

/// Counts a course's enrollments per state.
///
/// # Errors
/// Returns [`crate::errors::Error::NotFound`] if the course does not exist.
pub async fn course_summary(db: &DatabaseConnection, course_id: i64) -> Result<CourseSummary> {
    let course = Course::find_by_id(course_id)
        .one(db)
        .await?
        .ok_or_else(|| course_not_found(course_id))?;

    let mut by_state = BTreeMap::new();
    for enrollment in Enrollment::find()
        .filter(enrollment::Column::CourseId.eq(course_id))
        .all(db)
        .await?
    {
        *by_state
            .entry(enrollment.state.as_str().to_string())
            .or_insert(0) += 1;
    }

    let confirmed = by_state
        .get(EnrollmentState::Confirmed.as_str())
        .copied()
        .unwrap_or(0);
    let seats_left = capacity::CapacitySnapshot::new(&course, confirmed).seats_left;

    Ok(CourseSummary {
        course,
        by_state,
        seats_left,
    })
}

/// Weekly sessions of the student's confirmed courses, by weekday then start time.
pub async fn student_schedule(
    db: &DatabaseConnection,
    student_id: &str,
) -> Result<Vec<ScheduleEntry>> {
    let course_ids: Vec<i64> = Enrollment::find()
        .filter(enrollment::Column::StudentId.eq(student_id))
        .filter(enrollment::Column::State.eq(EnrollmentState::Confirmed))
        .all(db)
        .await?
        .into_iter()
        .map(|e| e.course_id)
        .collect();

    let names: HashMap<i64, String> = Course::find()
        .filter(course::Column::Id.is_in(course_ids.iter().copied()))
        .all(db)
        .await?
        .into_iter()
        .map(|c| (c.id, c.name))
        .collect();

    let slots = CourseSchedule::find()
        .filter(course_schedule::Column::CourseId.is_in(course_ids))
        .order_by_asc(course_schedule::Column::Weekday)
        .order_by_asc(course_schedule::Column::StartTime)
        .all(db)
        .await?;

    Ok(slots
        .into_iter()
        .map(|slot| ScheduleEntry {
            course_id: slot.course_id,
            course_name: names.get(&slot.course_id).cloned().unwrap_or_default(),
            slot,
        })
        .collect())
}

/// Payments that funded the student's enrollments, newest first.
pub async fn payment_history(
    db: &DatabaseConnection,
    student_id: &str,
) -> Result<Vec<PaymentRecord>> {
    let enrollment_ids: Vec<i64> = Enrollment::find()
        .filter(enrollment::Column::StudentId.eq(student_id))
        .all(db)
        .await?
        .into_iter()
        .map(|e| e.id)
        .collect();

    let mut funded: HashMap<i64, Vec<i64>> = HashMap::new();
    for link in PaymentEnrollment::find()
        .filter(payment_enrollment::Column::EnrollmentId.is_in(enrollment_ids))
        .all(db)
        .await?
    {
        funded.entry(link.payment_id).or_default().push(link.enrollment_id);
    }

    let payments = Payment::find()
        .filter(payment::Column::Id.is_in(funded.keys().copied()))
        .order_by_desc(payment::Column::SettledAt)
        .order_by_desc(payment::Column::Id)
        .all(db)
        .await?;

    Ok(payments
        .into_iter()
        .map(|payment| {
            let mut enrollment_ids = funded.remove(&payment.id).unwrap_or_default();
            enrollment_ids.sort_unstable();
            PaymentRecord {
                payment,
                enrollment_ids,
            }
        })
        .collect())
}

/// Formats an amount in minor units, e.g. `PEN 150.00`.
#[must_use]
pub fn format_amount(amount_cents: i64, currency: &str) -> String {
    let sign = if amount_cents < 0 { "-" } else { "" };
    let cents = amount_cents.unsigned_abs();
    format!("{currency} {sign}{}.{:02}", cents / 100, cents % 100)
}

/// One-line description of a review queue entry.
#[must_use]
pub fn format_review_item(item: &ReviewItem) -> String {
    format!(
        "#{} | {} | {} | {} | {}/{} confirmed",
        item.enrollment.id,
        item.enrollment.student_id,
        item.course_name,
        item.enrollment.state,
        item.confirmed,
        item.capacity
    )
}
