//! Enrollment entity - One student's claim on a seat in one course.
//!
//! Enrollments are never deleted by the workflow; they move through
//! [`EnrollmentState`] until they reach `confirmed` or `cancelled`.
//! `payment_ref` is a weak reference to the funding payment's transaction reference.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of an enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentState {
    /// Flat-fee path: no payment required, awaiting validation
    #[sea_orm(string_value = "pending")]
    Pending,
    /// Awaiting settlement of the enrollment price
    #[sea_orm(string_value = "pending_payment")]
    PendingPayment,
    /// Paid, awaiting administrative validation
    #[sea_orm(string_value = "pending_validation_admin")]
    PendingValidationAdmin,
    /// Holds a seat
    #[sea_orm(string_value = "confirmed")]
    Confirmed,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl EnrollmentState {
    /// States that block a second enrollment for the same (student, course) pair.
    pub const ACTIVE: [Self; 4] = [
        Self::Pending,
        Self::PendingPayment,
        Self::PendingValidationAdmin,
        Self::Confirmed,
    ];

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Cancelled)
    }

    #[must_use]
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Cancelled)
    }

    /// Whether an administrator may run the validation gate on this state.
    #[must_use]
    pub const fn awaits_validation(self) -> bool {
        matches!(self, Self::Pending | Self::PendingValidationAdmin)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::PendingPayment => "pending_payment",
            Self::PendingValidationAdmin => "pending_validation_admin",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for EnrollmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enrollment database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "enrollments")]
pub struct Model {
    /// Unique identifier for the enrollment
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Student identifier supplied by the authentication layer
    pub student_id: String,
    /// Course being enrolled in
    pub course_id: i64,
    /// Current lifecycle state
    pub state: EnrollmentState,
    /// Price recorded when the enrollment was requested, in minor units
    pub amount_cents: i64,
    /// Currency of `amount_cents`
    pub currency: String,
    /// Transaction reference of the payment that funded this enrollment
    pub payment_ref: Option<String>,
    /// When the enrollment was requested
    pub created_at: DateTimeUtc,
    /// Last state change
    pub updated_at: DateTimeUtc,
}

/// Defines relationships between Enrollment and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each enrollment belongs to one course
    #[sea_orm(
        belongs_to = "super::course::Entity",
        from = "Column::CourseId",
        to = "super::course::Column::Id"
    )]
    Course,
    /// At most one payment link per enrollment
    #[sea_orm(has_one = "super::payment_enrollment::Entity")]
    PaymentLink,
}

impl Related<super::course::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Course.def()
    }
}

impl Related<super::payment_enrollment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PaymentLink.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
