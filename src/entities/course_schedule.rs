//! Course schedule entity - One weekly day/time window of a course.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Day of the week, stored as its ISO number so that ordering by the column
/// yields calendar order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "i32", db_type = "Integer")]
#[serde(rename_all = "lowercase")]
pub enum Weekday {
    #[sea_orm(num_value = 1)]
    Monday,
    #[sea_orm(num_value = 2)]
    Tuesday,
    #[sea_orm(num_value = 3)]
    Wednesday,
    #[sea_orm(num_value = 4)]
    Thursday,
    #[sea_orm(num_value = 5)]
    Friday,
    #[sea_orm(num_value = 6)]
    Saturday,
    #[sea_orm(num_value = 7)]
    Sunday,
}

/// Course schedule database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "course_schedules")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Course this window belongs to
    pub course_id: i64,
    pub weekday: Weekday,
    pub start_time: Time,
    pub end_time: Time,
}

/// Defines relationships between `CourseSchedule` and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each schedule entry belongs to one course
    #[sea_orm(
        belongs_to = "super::course::Entity",
        from = "Column::CourseId",
        to = "super::course::Column::Id"
    )]
    Course,
}

impl Related<super::course::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Course.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
