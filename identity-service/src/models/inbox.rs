use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// Proof that `(message_id, consumer_id)` has been seen until `expires_at`.
#[derive(Debug, Clone, FromRow)]
pub struct InboxMessage {
    pub message_id: Uuid,
    pub consumer_id: String,
    pub event_type: String,
    pub first_seen_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
