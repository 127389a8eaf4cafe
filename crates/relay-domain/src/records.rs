//! Outbox and inbox record types
//!
//! These rows are owned by the repositories; the engines only drive status
//! transitions. Outbox rows move PENDING -> PUBLISHING -> SENT (or FAILED,
//! or back to PENDING via a stale reset). Inbox rows move PROCESSING ->
//! PROCESSED (terminal) or FAILED.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outbox row status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Publishing,
    Sent,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Publishing => "PUBLISHING",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "PUBLISHING" => Some(Self::Publishing),
            "SENT" => Some(Self::Sent),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A stored outbound event awaiting (or past) publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub event_id: Uuid,
    pub subject: String,
    /// Serialized envelope bytes, published verbatim
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Inbox row status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InboxStatus {
    Processing,
    Processed,
    Failed,
}

impl InboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "PROCESSING",
            Self::Processed => "PROCESSED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PROCESSING" => Some(Self::Processing),
            "PROCESSED" => Some(Self::Processed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A received event tracked for dedupe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxRecord {
    pub event_id: Uuid,
    pub subject: String,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    /// Secondary dedupe key when the delivery carried stream coordinates
    pub stream: Option<String>,
    pub stream_seq: Option<u64>,
    pub deliveries: u32,
    pub status: InboxStatus,
    pub last_error: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InboxRecord {
    /// PROCESSED rows are terminal: the handler must never run again.
    pub fn is_terminal(&self) -> bool {
        self.status == InboxStatus::Processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Publishing,
            OutboxStatus::Sent,
            OutboxStatus::Failed,
        ] {
            assert_eq!(OutboxStatus::parse(status.as_str()), Some(status));
        }
        for status in [
            InboxStatus::Processing,
            InboxStatus::Processed,
            InboxStatus::Failed,
        ] {
            assert_eq!(InboxStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OutboxStatus::parse("NOPE"), None);
    }
}
