//! Notification entity - Messages delivered to a user's inbox.
//!
//! Notifications are written after the state change they describe has committed,
//! so a failed insert never undoes that change.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    #[sea_orm(string_value = "registered")]
    Registered,
    #[sea_orm(string_value = "payment_received")]
    PaymentReceived,
    #[sea_orm(string_value = "enrollment_confirmed")]
    EnrollmentConfirmed,
    #[sea_orm(string_value = "enrollment_rejected")]
    EnrollmentRejected,
    #[sea_orm(string_value = "enrollment_withdrawn")]
    EnrollmentWithdrawn,
}

/// Notification database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "notifications")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Recipient
    pub user_id: String,
    pub kind: NotificationKind,
    pub message: String,
    /// ID of the entity the message is about (e.g., an enrollment)
    pub related_entity_id: Option<i64>,
    /// Type of the related entity (e.g., `"enrollment"`)
    pub related_entity_type: Option<String>,
    pub is_read: bool,
    pub created_at: DateTimeUtc,
}

/// Notifications have no relationships with other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
