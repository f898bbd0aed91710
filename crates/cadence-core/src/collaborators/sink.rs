use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use super::{DeliveryAck, Notification, NotificationSink};
use crate::error::CollaboratorError;

/// Surfaces suggestions through the log. Used when no UI is attached.
#[derive(Debug, Default)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn deliver(&self, notification: &Notification) -> Result<DeliveryAck, CollaboratorError> {
        info!(
            id = %notification.suggestion_id,
            break_type = %notification.break_type,
            "NOTIFICATION: {}: {}",
            notification.title,
            notification.message
        );
        Ok(DeliveryAck {
            channel: "log".into(),
            delivered_at: Utc::now(),
        })
    }
}
