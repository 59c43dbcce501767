//! Notification sink and inbox queries.
//!
//! Workflow operations hand a [`NewNotification`] to a [`NotificationSink`] after
//! their transaction has committed. Delivery is fire-and-forget: [`deliver`] logs
//! a failure and carries on, so the triggering transition is never undone.

use crate::{
    entities::{Notification, NotificationKind, notification},
    errors::{Error, Result},
};
use sea_orm::{QueryOrder, Set, prelude::*, sea_query::Expr};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// A message to be delivered to one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotification {
    pub user_id: String,
    pub kind: NotificationKind,
    pub message: String,
    pub related_entity_id: Option<i64>,
    pub related_entity_type: Option<String>,
}

impl NewNotification {
    /// A notification about an enrollment record.
    #[must_use]
    pub fn for_enrollment(
        user_id: impl Into<String>,
        kind: NotificationKind,
        message: impl Into<String>,
        enrollment_id: i64,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            kind,
            message: message.into(),
            related_entity_id: Some(enrollment_id),
            related_entity_type: Some("enrollment".to_string()),
        }
    }
}

/// Destination for user notifications.
pub trait NotificationSink: Send + Sync {
    /// Delivers one notification.
    ///
    /// # Errors
    ///
    /// Returns error if the notification could not be stored or sent
    fn notify(
        &self,
        notification: NewNotification,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Sink that stores notifications in the `notifications` table.
#[derive(Clone, Debug)]
pub struct DatabaseNotifier {
    db: DatabaseConnection,
}

impl DatabaseNotifier {
    #[must_use]
    pub const fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Creates an Arc-wrapped instance for sharing
    #[must_use]
    pub fn shared(db: DatabaseConnection) -> Arc<dyn NotificationSink> {
        Arc::new(Self::new(db))
    }
}

impl NotificationSink for DatabaseNotifier {
    fn notify(
        &self,
        notification: NewNotification,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            create_notification(&self.db, notification).await?;
            Ok(())
        })
    }
}

/// Hands `notification` to `sink`, logging instead of failing.
pub async fn deliver(sink: &dyn NotificationSink, notification: NewNotification) {
    let user_id = notification.user_id.clone();
    let kind = notification.kind;
    if let Err(err) = sink.notify(notification).await {
        tracing::warn!(user_id = %user_id, kind = ?kind, error = %err, "Failed to deliver notification");
    }
}

/// Inserts a notification row.
pub async fn create_notification<C>(db: &C, notification: NewNotification) -> Result<notification::Model>
where
    C: ConnectionTrait,
{
    let model = notification::ActiveModel {
        user_id: Set(notification.user_id),
        kind: Set(notification.kind),
        message: Set(notification.message),
        related_entity_id: Set(notification.related_entity_id),
        related_entity_type: Set(notification.related_entity_type),
        is_read: Set(false),
        created_at: Set(chrono::Utc::now()),
        ..Default::default()
    };
    model.insert(db).await.map_err(Into::into)
}

/// Retrieves a user's notifications, newest first.
pub async fn notifications_for(
    db: &DatabaseConnection,
    user_id: &str,
    include_read: bool,
) -> Result<Vec<notification::Model>> {
    let mut query = Notification::find().filter(notification::Column::UserId.eq(user_id));
    if !include_read {
        query = query.filter(notification::Column::IsRead.eq(false));
    }
    query
        .order_by_desc(notification::Column::CreatedAt)
        .order_by_desc(notification::Column::Id)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Marks a notification as read.
pub async fn mark_read(db: &DatabaseConnection, notification_id: i64) -> Result<()> {
    let result = Notification::update_many()
        .col_expr(notification::Column::IsRead, Expr::value(true))
        .filter(notification::Column::Id.eq(notification_id))
        .exec(db)
        .await?;
    if result.rows_affected == 0 {
        return Err(Error::NotFound {
            entity: "notification",
            id: notification_id.to_string(),
        });
    }
    Ok(())
}
