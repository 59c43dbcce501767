//! Application context - the operation set exposed to the transport layer.
//!
//! An HTTP or messaging front end builds one [`AppContext`] at startup, resolves the
//! caller into an [`Actor`], and calls the methods below. Each method is a thin
//! wrapper over the matching `core` function with the shared collaborators filled in.

use crate::{
    config::settings::Settings,
    core::{
        course::{self, AvailableCourse},
        enrollment,
        gateway::PaymentGateway,
        identity::{Actor, Role},
        notification::{self, DatabaseNotifier, NotificationSink},
        reconciliation::{self, PaymentConfirmation, ReconcileOutcome, ReconciliationReport, Settlement},
        report,
        retry::RetryPolicy,
        validation,
    },
    entities::{enrollment as enrollment_entity, notification as notification_entity},
    errors::Result,
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;

/// Shared state handed to every request.
#[derive(Clone)]
pub struct AppContext {
    pub db: DatabaseConnection,
    pub notifier: Arc<dyn NotificationSink>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub settings: Settings,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl AppContext {
    #[must_use]
    pub fn new(
        db: DatabaseConnection,
        notifier: Arc<dyn NotificationSink>,
        gateway: Arc<dyn PaymentGateway>,
        settings: Settings,
    ) -> Self {
        Self {
            db,
            notifier,
            gateway,
            settings,
        }
    }

    /// Context with notifications stored in the database.
    #[must_use]
    pub fn with_database_notifier(
        db: DatabaseConnection,
        gateway: Arc<dyn PaymentGateway>,
        settings: Settings,
    ) -> Self {
        let notifier = DatabaseNotifier::shared(db.clone());
        Self::new(db, notifier, gateway, settings)
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_settings(&self.settings)
    }

    pub async fn request_enrollment(
        &self,
        actor: &Actor,
        course_id: i64,
    ) -> Result<enrollment_entity::Model> {
        enrollment::request_enrollment(&self.db, self.notifier.as_ref(), actor, course_id).await
    }

    pub async fn withdraw(
        &self,
        actor: &Actor,
        enrollment_id: i64,
    ) -> Result<enrollment_entity::Model> {
        enrollment::withdraw(&self.db, self.notifier.as_ref(), actor, enrollment_id).await
    }

    /// Synchronous confirmation of one enrollment with an already obtained settlement.
    pub async fn confirm_payment(
        &self,
        enrollment_id: i64,
        settlement: &Settlement,
    ) -> Result<ReconcileOutcome> {
        reconciliation::confirm_payment(
            &self.db,
            self.notifier.as_ref(),
            self.retry_policy(),
            enrollment_id,
            settlement,
        )
        .await
    }

    /// Applies a settlement to a batch of enrollments.
    pub async fn reconcile_batch(
        &self,
        settlement: &Settlement,
        enrollment_ids: &[i64],
    ) -> Result<ReconciliationReport> {
        reconciliation::reconcile(
            &self.db,
            self.notifier.as_ref(),
            self.retry_policy(),
            settlement,
            enrollment_ids,
        )
        .await
    }

    /// Entry point for the processor's (already verified) settlement webhook.
    pub async fn settlement_webhook(&self, payload: &[u8]) -> Result<ReconciliationReport> {
        reconciliation::handle_settlement_webhook(
            &self.db,
            self.notifier.as_ref(),
            &self.settings,
            payload,
        )
        .await
    }

    pub async fn pay_enrollment(
        &self,
        actor: &Actor,
        enrollment_id: i64,
    ) -> Result<PaymentConfirmation> {
        reconciliation::pay_enrollment(
            &self.db,
            self.gateway.as_ref(),
            self.notifier.as_ref(),
            &self.settings,
            actor,
            enrollment_id,
        )
        .await
    }

    pub async fn start_checkout(
        &self,
        actor: &Actor,
        course_ids: &[i64],
    ) -> Result<ReconciliationReport> {
        reconciliation::start_checkout(
            &self.db,
            self.gateway.as_ref(),
            self.notifier.as_ref(),
            &self.settings,
            actor,
            course_ids,
        )
        .await
    }

    pub async fn validate(
        &self,
        actor: &Actor,
        enrollment_id: i64,
    ) -> Result<enrollment_entity::Model> {
        validation::validate(
            &self.db,
            self.notifier.as_ref(),
            actor,
            enrollment_id,
            self.retry_policy(),
        )
        .await
    }

    pub async fn reject(&self, actor: &Actor, enrollment_id: i64) -> Result<bool> {
        validation::reject(&self.db, self.notifier.as_ref(), actor, enrollment_id).await
    }

    pub async fn available_courses(&self, actor: &Actor) -> Result<Vec<AvailableCourse>> {
        actor.require(Role::Student, "available_courses")?;
        course::available_courses(&self.db, &actor.user_id, chrono::Utc::now().date_naive()).await
    }

    pub async fn my_enrollments(&self, actor: &Actor) -> Result<Vec<enrollment_entity::Model>> {
        enrollment::enrollments_for_student(&self.db, &actor.user_id).await
    }

    pub async fn my_notifications(
        &self,
        actor: &Actor,
        include_read: bool,
    ) -> Result<Vec<notification_entity::Model>> {
        notification::notifications_for(&self.db, &actor.user_id, include_read).await
    }

    pub async fn review_queue(&self, actor: &Actor) -> Result<Vec<report::ReviewItem>> {
        actor.require(Role::Admin, "review_queue")?;
        report::review_queue(&self.db).await
    }
}
