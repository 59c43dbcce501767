//! Payment entity - A settled monetary transaction reported by the gateway.
//!
//! Payments are written once upon settlement. The only later mutation is a status
//! correction when a reconciliation is replayed with corrected figures.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Settlement matched the funded enrollments
    #[sea_orm(string_value = "settled")]
    Settled,
    /// Settled amount disagreed with the enrollments it names
    #[sea_orm(string_value = "disputed")]
    Disputed,
}

/// Payment database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payments")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// External transaction reference from the payment gateway
    #[sea_orm(unique)]
    pub transaction_ref: String,
    /// Settled amount in minor units
    pub amount_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
    /// When the settlement was first recorded
    pub settled_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

/// Defines relationships between Payment and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// One payment may fund several enrollments
    #[sea_orm(has_many = "super::payment_enrollment::Entity")]
    EnrollmentLinks,
}

impl Related<super::payment_enrollment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::EnrollmentLinks.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
