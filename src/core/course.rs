//! Course catalog - Creates, looks up, activates and removes courses.
//!
//! Only what the enrollment workflow needs: a course with its weekly schedule, a
//! price and a validity window. Catalog mutation requires an administrator.

use crate::{
    config::settings::Config,
    core::{
        capacity,
        identity::{Actor, Role},
    },
    entities::{
        Course, CourseSchedule, Enrollment, EnrollmentState, PaymentEnrollment, course,
        course_schedule::{self, Weekday},
        enrollment, payment_enrollment,
    },
    errors::{Error, Result},
};
use chrono::{NaiveDate, NaiveTime};
use sea_orm::{DatabaseTransaction, QueryOrder, Set, TransactionTrait, prelude::*};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};

/// One weekly day/time window.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScheduleSlot {
    pub weekday: Weekday,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

/// Input for [`create_course`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCourse {
    pub name: String,
    pub description: String,
    pub capacity: i32,
    pub price_cents: i64,
    pub currency: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub is_active: bool,
    pub schedule: Vec<ScheduleSlot>,
}

/// A course a student may request, with its schedule and free seats.
#[derive(Debug, Clone)]
pub struct AvailableCourse {
    pub course: course::Model,
    pub schedule: Vec<course_schedule::Model>,
    pub seats_left: u64,
}

/// Creates a course and its schedule in one transaction.
///
/// # Errors
/// - [`Error::Forbidden`] unless the actor is an administrator
/// - [`Error::InvalidInput`] if the course definition is inconsistent
pub async fn create_course(
    db: &DatabaseConnection,
    actor: &Actor,
    new_course: NewCourse,
) -> Result<course::Model> {
    actor.require(Role::Admin, "create_course")?;
    validate_new_course(&new_course)?;

    let txn = db.begin().await?;
    let created = insert_course(&txn, new_course).await?;
    txn.commit().await?;

    tracing::info!(course_id = created.id, name = %created.name, capacity = created.capacity, "Course created");
    Ok(created)
}

fn validate_new_course(new_course: &NewCourse) -> Result<()> {
    let problem = if new_course.name.trim().is_empty() {
        Some("Course name cannot be empty".to_string())
    } else if new_course.capacity < 1 {
        Some(format!(
            "Capacity must be at least 1, got {}",
            new_course.capacity
        ))
    } else if new_course.price_cents < 0 {
        Some(format!(
            "Price cannot be negative, got {}",
            new_course.price_cents
        ))
    } else if new_course.currency.len() != 3
        || !new_course.currency.chars().all(|c| c.is_ascii_uppercase())
    {
        Some(format!(
            "Currency must be a three-letter ISO code, got {:?}",
            new_course.currency
        ))
    } else if new_course.start_date > new_course.end_date {
        Some(format!(
            "Course starts on {} but ends on {}",
            new_course.start_date, new_course.end_date
        ))
    } else {
        new_course
            .schedule
            .iter()
            .find(|slot| slot.start_time >= slot.end_time)
            .map(|slot| {
                format!(
                    "Schedule window on {:?} starts at {} but ends at {}",
                    slot.weekday, slot.start_time, slot.end_time
                )
            })
    };

    match problem {
        Some(message) => Err(Error::InvalidInput { message }),
        None => Ok(()),
    }
}

async fn insert_course(txn: &DatabaseTransaction, new_course: NewCourse) -> Result<course::Model> {
    let now = chrono::Utc::now();
    let created = course::ActiveModel {
        name: Set(new_course.name.trim().to_string()),
        description: Set(new_course.description),
        capacity: Set(new_course.capacity),
        is_active: Set(new_course.is_active),
        price_cents: Set(new_course.price_cents),
        currency: Set(new_course.currency),
        start_date: Set(new_course.start_date),
        end_date: Set(new_course.end_date),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(txn)
    .await?;

    for slot in new_course.schedule {
        course_schedule::ActiveModel {
            course_id: Set(created.id),
            weekday: Set(slot.weekday),
            start_time: Set(slot.start_time),
            end_time: Set(slot.end_time),
            ..Default::default()
        }
        .insert(txn)
        .await?;
    }
    Ok(created)
}

/// Retrieves a course by ID.
pub async fn get_course(db: &DatabaseConnection, course_id: i64) -> Result<Option<course::Model>> {
    Course::find_by_id(course_id)
        .one(db)
        .await
        .map_err(Into::into)
}

/// Retrieves a course's schedule in calendar order.
pub async fn course_schedule(
    db: &DatabaseConnection,
    course_id: i64,
) -> Result<Vec<course_schedule::Model>> {
    CourseSchedule::find()
        .filter(course_schedule::Column::CourseId.eq(course_id))
        .order_by_asc(course_schedule::Column::Weekday)
        .order_by_asc(course_schedule::Column::StartTime)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Opens or closes a course for new enrollment requests.
///
/// Existing enrollments are not affected.
pub async fn set_course_active(
    db: &DatabaseConnection,
    actor: &Actor,
    course_id: i64,
    active: bool,
) -> Result<course::Model> {
    actor.require(Role::Admin, "set_course_active")?;

    let current = get_course(db, course_id)
        .await?
        .ok_or_else(|| course_not_found(course_id))?;
    let mut model: course::ActiveModel = current.into();
    model.is_active = Set(active);
    model.updated_at = Set(chrono::Utc::now());
    let updated = model.update(db).await?;

    tracing::info!(course_id, active, "Course activation changed");
    Ok(updated)
}

/// Deletes a course together with its schedule, enrollments and payment links.
///
/// Payment rows are kept; they record money that actually moved.
///
/// # Errors
/// - [`Error::Forbidden`] unless the actor is an administrator
/// - [`Error::NotFound`] if the course does not exist
pub async fn delete_course(db: &DatabaseConnection, actor: &Actor, course_id: i64) -> Result<()> {
    actor.require(Role::Admin, "delete_course")?;

    let txn = db.begin().await?;
    capacity::lock_course(&txn, course_id).await?;

    let enrollment_ids: Vec<i64> = Enrollment::find()
        .filter(enrollment::Column::CourseId.eq(course_id))
        .all(&txn)
        .await?
        .into_iter()
        .map(|e| e.id)
        .collect();

    let links = PaymentEnrollment::delete_many()
        .filter(payment_enrollment::Column::EnrollmentId.is_in(enrollment_ids.iter().copied()))
        .exec(&txn)
        .await?;
    let enrollments = Enrollment::delete_many()
        .filter(enrollment::Column::CourseId.eq(course_id))
        .exec(&txn)
        .await?;
    CourseSchedule::delete_many()
        .filter(course_schedule::Column::CourseId.eq(course_id))
        .exec(&txn)
        .await?;
    Course::delete_by_id(course_id).exec(&txn).await?;
    txn.commit().await?;

    tracing::info!(
        course_id,
        enrollments = enrollments.rows_affected,
        payment_links = links.rows_affected,
        "Course deleted"
    );
    Ok(())
}

/// Lists the courses `student_id` may request as of `today`.
///
/// A course is listed when it is active, `today` falls inside its validity window,
/// and the student holds no active enrollment in it. Full courses are still listed
/// with `seats_left == 0` because capacity is only enforced at validation.
pub async fn available_courses(
    db: &DatabaseConnection,
    student_id: &str,
    today: NaiveDate,
) -> Result<Vec<AvailableCourse>> {
    let taken: HashSet<i64> = Enrollment::find()
        .filter(enrollment::Column::StudentId.eq(student_id))
        .filter(enrollment::Column::State.is_in(EnrollmentState::ACTIVE))
        .all(db)
        .await?
        .into_iter()
        .map(|e| e.course_id)
        .collect();

    let courses: Vec<course::Model> = Course::find()
        .filter(course::Column::IsActive.eq(true))
        .filter(course::Column::StartDate.lte(today))
        .filter(course::Column::EndDate.gte(today))
        .order_by_asc(course::Column::Name)
        .all(db)
        .await?
        .into_iter()
        .filter(|c| !taken.contains(&c.id))
        .collect();

    let mut schedules: HashMap<i64, Vec<course_schedule::Model>> = HashMap::new();
    for slot in CourseSchedule::find()
        .filter(course_schedule::Column::CourseId.is_in(courses.iter().map(|c| c.id)))
        .order_by_asc(course_schedule::Column::Weekday)
        .order_by_asc(course_schedule::Column::StartTime)
        .all(db)
        .await?
    {
        schedules.entry(slot.course_id).or_default().push(slot);
    }

    let mut available = Vec::with_capacity(courses.len());
    for course in courses {
        let usage = capacity::snapshot(db, &course).await?;
        available.push(AvailableCourse {
            schedule: schedules.remove(&course.id).unwrap_or_default(),
            seats_left: usage.seats_left,
            course,
        });
    }
    Ok(available)
}

/// Inserts the configured courses whose names are not in the catalog yet.
///
/// Returns the number of courses created. Invalid entries abort seeding.
pub async fn seed_courses(db: &DatabaseConnection, config: &Config) -> Result<usize> {
    let existing: HashSet<String> = Course::find()
        .all(db)
        .await?
        .into_iter()
        .map(|c| c.name)
        .collect();

    let pending: Vec<_> = config
        .courses
        .iter()
        .filter(|c| !existing.contains(c.name.trim()))
        .map(|c| c.to_new_course(&config.settings))
        .collect();
    for new_course in &pending {
        validate_new_course(new_course)?;
    }
    if pending.is_empty() {
        return Ok(0);
    }

    let txn = db.begin().await?;
    for new_course in pending.iter().cloned() {
        let created = insert_course(&txn, new_course).await?;
        tracing::debug!(course_id = created.id, name = %created.name, "Seeded course");
    }
    txn.commit().await?;

    tracing::info!(count = pending.len(), "Course catalog seeded");
    Ok(pending.len())
}

pub(crate) fn course_not_found(course_id: i64) -> Error {
    Error::NotFound {
        entity: "course",
        id: course_id.to_string(),
    }
}
