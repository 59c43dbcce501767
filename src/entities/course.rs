//! Course entity - A scheduled offering with a hard seat limit.
//!
//! The number of occupied seats is never stored here. It is always derived by
//! counting confirmed enrollments, see `core::capacity`.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Course database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "courses")]
pub struct Model {
    /// Unique identifier for the course
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Display name (e.g., "Algebra I")
    pub name: String,
    /// Free-form description
    pub description: String,
    /// Maximum number of confirmed enrollments
    pub capacity: i32,
    /// Inactive courses accept no new enrollments
    pub is_active: bool,
    /// Enrollment price in minor currency units; zero means the flat-fee path
    pub price_cents: i64,
    /// ISO currency code of the price (e.g., `"PEN"`)
    pub currency: String,
    /// First day of the validity window
    pub start_date: Date,
    /// Last day of the validity window (inclusive)
    pub end_date: Date,
    /// When the course was created
    pub created_at: DateTimeUtc,
    /// Last modification; also bumped whenever the row is locked for a confirmation
    pub updated_at: DateTimeUtc,
}

/// Defines relationships between Course and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// One course has many enrollments
    #[sea_orm(has_many = "super::enrollment::Entity")]
    Enrollments,
    /// One course has many schedule entries
    #[sea_orm(has_many = "super::course_schedule::Entity")]
    Schedules,
}

impl Related<super::enrollment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Enrollments.def()
    }
}

impl Related<super::course_schedule::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Schedules.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Whether `day` falls inside the course's validity window.
    #[must_use]
    pub fn is_open_on(&self, day: Date) -> bool {
        self.start_date <= day && day <= self.end_date
    }
}
