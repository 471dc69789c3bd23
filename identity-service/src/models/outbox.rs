//! Outbox rows: domain events written in the same transaction as the
//! change that produced them, drained later by the outbox processor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    /// Claimed by a worker; `claimed_by` names it.
    Inflight,
    Processed,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Inflight => "inflight",
            OutboxStatus::Processed => "processed",
            OutboxStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown outbox status: {0}")]
pub struct UnknownOutboxStatus(String);

impl TryFrom<String> for OutboxStatus {
    type Error = UnknownOutboxStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "pending" => Ok(OutboxStatus::Pending),
            "inflight" => Ok(OutboxStatus::Inflight),
            "processed" => Ok(OutboxStatus::Processed),
            "failed" => Ok(OutboxStatus::Failed),
            _ => Err(UnknownOutboxStatus(value)),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub message_id: Uuid,
    pub event_type: String,
    pub aggregate_id: String,
    pub payload: Vec<u8>,
    #[sqlx(try_from = "String")]
    pub status: OutboxStatus,
    pub retries: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    /// True when row `id` is inflight under `worker_id`'s claim.
    pub fn is_claimed_by(&self, id: Uuid, worker_id: &str) -> bool {
        self.id == id
            && self.status == OutboxStatus::Inflight
            && self.claimed_by.as_deref() == Some(worker_id)
    }
}

/// JSON body stored in `payload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    pub event_type: String,
    pub aggregate_id: String,
    pub occurred_at: DateTime<Utc>,
    pub data: T,
}

/// An event waiting to be enqueued.
#[derive(Debug, Clone)]
pub struct NewOutboxMessage {
    pub message_id: Uuid,
    pub event_type: String,
    pub aggregate_id: String,
    pub payload: Vec<u8>,
    pub max_retries: i32,
}

impl NewOutboxMessage {
    pub fn new(
        event_type: impl Into<String>,
        aggregate_id: impl ToString,
        payload: Vec<u8>,
        max_retries: i32,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            event_type: event_type.into(),
            aggregate_id: aggregate_id.to_string(),
            payload,
            max_retries,
        }
    }

    /// Wraps `data` in an [`EventEnvelope`] and serializes it as the payload.
    pub fn json<T: Serialize>(
        event_type: &str,
        aggregate_id: impl ToString,
        data: &T,
        max_retries: i32,
    ) -> Result<Self, serde_json::Error> {
        let aggregate_id = aggregate_id.to_string();
        let payload = serde_json::to_vec(&EventEnvelope {
            event_type: event_type.to_string(),
            aggregate_id: aggregate_id.clone(),
            occurred_at: Utc::now(),
            data,
        })?;
        Ok(Self::new(event_type, aggregate_id, payload, max_retries))
    }

    /// Materializes the row as it looks right after insert.
    pub fn into_pending(self, now: DateTime<Utc>) -> OutboxMessage {
        OutboxMessage {
            id: Uuid::new_v4(),
            message_id: self.message_id,
            event_type: self.event_type,
            aggregate_id: self.aggregate_id,
            payload: self.payload,
            status: OutboxStatus::Pending,
            retries: 0,
            max_retries: self.max_retries,
            created_at: now,
            processed_at: None,
            last_error: None,
            claimed_by: None,
            claimed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_payload_carries_envelope() {
        let id = Uuid::new_v4();
        let msg = NewOutboxMessage::json("user.created", id, &serde_json::json!({"a": 1}), 3)
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(body["event_type"], "user.created");
        assert_eq!(body["aggregate_id"], id.to_string());
        assert_eq!(body["data"]["a"], 1);
        assert_eq!(msg.max_retries, 3);
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(
            OutboxStatus::try_from("inflight".to_string()).unwrap(),
            OutboxStatus::Inflight
        );
        assert!(OutboxStatus::try_from("done".to_string()).is_err());
    }
}
