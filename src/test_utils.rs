//! Shared test utilities for `academy-enrollment`.
//!
//! This module provides common helper functions for setting up test databases
//! and creating test entities with sensible defaults.

use crate::{
    core::{
        course::{self, NewCourse, ScheduleSlot},
        gateway::{ChargeReceipt, ChargeRequest, GatewayError, GatewayResult, PaymentGateway},
        identity::Actor,
        notification::{NewNotification, NotificationSink},
    },
    entities::{self, EnrollmentState, course_schedule::Weekday, enrollment},
    errors::{Error, Result},
};
use chrono::{Days, NaiveDate, NaiveTime};
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Creates an in-memory `SQLite` database with all tables initialized.
/// This is the standard setup for all integration tests.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = sea_orm::Database::connect("sqlite::memory:").await?;
    crate::config::database::create_tables(&db).await?;
    Ok(db)
}

/// Today's date in UTC, as the enrollment operations see it.
pub fn today() -> NaiveDate {
    chrono::Utc::now().date_naive()
}

pub fn student(user_id: &str) -> Actor {
    Actor::student(user_id)
}

pub fn admin() -> Actor {
    Actor::admin("admin-1")
}

/// A valid course definition open today.
///
/// # Defaults
/// * price: 15000 PEN cents
/// * validity window: 30 days before today to 90 days after
/// * active, no schedule
pub fn new_course_input(name: &str, capacity: i32) -> NewCourse {
    let today = today();
    NewCourse {
        name: name.to_string(),
        description: format!("{name} test course"),
        capacity,
        price_cents: 15_000,
        currency: "PEN".to_string(),
        start_date: today.checked_sub_days(Days::new(30)).unwrap_or(today),
        end_date: today.checked_add_days(Days::new(90)).unwrap_or(today),
        is_active: true,
        schedule: Vec::new(),
    }
}

/// Creates a priced, active course open today.
pub async fn create_test_course(
    db: &DatabaseConnection,
    name: &str,
    capacity: i32,
) -> Result<entities::course::Model> {
    course::create_course(db, &admin(), new_course_input(name, capacity)).await
}

/// Creates a free (flat-fee) course open today.
pub async fn create_free_course(
    db: &DatabaseConnection,
    name: &str,
    capacity: i32,
) -> Result<entities::course::Model> {
    let mut input = new_course_input(name, capacity);
    input.price_cents = 0;
    course::create_course(db, &admin(), input).await
}

/// Creates a priced course meeting once a week, 09:00 to 11:00.
pub async fn create_scheduled_course(
    db: &DatabaseConnection,
    name: &str,
    weekday: Weekday,
) -> Result<entities::course::Model> {
    let mut input = new_course_input(name, 20);
    input.schedule = vec![ScheduleSlot {
        weekday,
        start_time: time(9, 0)?,
        end_time: time(11, 0)?,
    }];
    course::create_course(db, &admin(), input).await
}

fn time(hour: u32, minute: u32) -> Result<NaiveTime> {
    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| Error::InvalidInput {
        message: format!("bad time {hour}:{minute}"),
    })
}

/// Sets up a database with one priced course.
pub async fn setup_with_course(
    capacity: i32,
) -> Result<(DatabaseConnection, entities::course::Model)> {
    let db = setup_test_db().await?;
    let course = create_test_course(&db, "Algebra I", capacity).await?;
    Ok((db, course))
}

/// Inserts an enrollment directly in `state`, bypassing the workflow guards.
///
/// The amount and currency are copied from the course.
pub async fn insert_enrollment(
    db: &DatabaseConnection,
    student_id: &str,
    course_id: i64,
    state: EnrollmentState,
) -> Result<enrollment::Model> {
    let course = entities::Course::find_by_id(course_id)
        .one(db)
        .await?
        .ok_or_else(|| Error::NotFound {
            entity: "course",
            id: course_id.to_string(),
        })?;
    let now = chrono::Utc::now();
    enrollment::ActiveModel {
        student_id: Set(student_id.to_string()),
        course_id: Set(course_id),
        state: Set(state),
        amount_cents: Set(course.price_cents),
        currency: Set(course.currency),
        payment_ref: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await
    .map_err(Into::into)
}

/// An in-memory course row for tests that never touch the database.
pub fn course_model(id: i64, capacity: i32) -> entities::course::Model {
    let input = new_course_input("Detached", capacity);
    let now = chrono::Utc::now();
    entities::course::Model {
        id,
        name: input.name,
        description: input.description,
        capacity,
        is_active: true,
        price_cents: input.price_cents,
        currency: input.currency,
        start_date: input.start_date,
        end_date: input.end_date,
        created_at: now,
        updated_at: now,
    }
}

/// Notification sink that keeps everything it receives.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<NewNotification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<NewNotification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl NotificationSink for RecordingNotifier {
    fn notify(
        &self,
        notification: NewNotification,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if let Ok(mut sent) = self.sent.lock() {
                sent.push(notification);
            }
            Ok(())
        })
    }
}

/// Notification sink whose every delivery fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingNotifier;

impl NotificationSink for FailingNotifier {
    fn notify(
        &self,
        _notification: NewNotification,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async {
            Err(Error::Config {
                message: "notification backend unavailable".to_string(),
            })
        })
    }
}

#[derive(Debug, Clone)]
enum Script {
    Approve(String),
    Decline(String),
    Fail(String),
}

/// Payment gateway that answers every charge the same way and counts the calls.
#[derive(Debug)]
pub struct ScriptedGateway {
    script: Script,
    charges: AtomicUsize,
    last_amount: Mutex<Option<i64>>,
}

impl ScriptedGateway {
    fn new(script: Script) -> Self {
        Self {
            script,
            charges: AtomicUsize::new(0),
            last_amount: Mutex::new(None),
        }
    }

    /// Approves every charge with the given transaction ID.
    pub fn approving(transaction_id: &str) -> Self {
        Self::new(Script::Approve(transaction_id.to_string()))
    }

    /// Answers `success = false` with the given transaction ID.
    pub fn declining(transaction_id: &str) -> Self {
        Self::new(Script::Decline(transaction_id.to_string()))
    }

    /// Fails at the transport level.
    pub fn failing(message: &str) -> Self {
        Self::new(Script::Fail(message.to_string()))
    }

    pub fn charges(&self) -> usize {
        self.charges.load(Ordering::SeqCst)
    }

    pub fn last_amount(&self) -> Option<i64> {
        self.last_amount.lock().ok().and_then(|a| *a)
    }
}

impl PaymentGateway for ScriptedGateway {
    fn charge(
        &self,
        request: ChargeRequest,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<ChargeReceipt>> + Send + '_>> {
        Box::pin(async move {
            self.charges.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut last) = self.last_amount.lock() {
                *last = Some(request.amount_cents);
            }
            match &self.script {
                Script::Approve(id) => Ok(ChargeReceipt {
                    transaction_id: id.clone(),
                    success: true,
                }),
                Script::Decline(id) => Ok(ChargeReceipt {
                    transaction_id: id.clone(),
                    success: false,
                }),
                Script::Fail(message) => Err(GatewayError {
                    message: message.clone(),
                }),
            }
        })
    }
}
