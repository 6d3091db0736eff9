//! Audit Event
//!
//! The immutable record emitted by the event bus, its canonical
//! encoding and the event hash committed into a batch.

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use uuid::Uuid;

use crate::audit::hash::Digest;
use crate::error::AnchorError;

/// Audit event as delivered by the event bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub actor_type: String,
    pub actor_id: String,
    /// `scope.domain.action`
    pub action: String,
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
    pub payload_hash: Digest,
}

impl AuditEvent {
    /// Create a new event, hashing the payload
    pub fn new(
        actor_type: impl Into<String>,
        actor_id: impl Into<String>,
        action: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        let payload_hash = Digest::hash(&payload);
        Self {
            id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            actor_type: actor_type.into(),
            actor_id: actor_id.into(),
            action: action.into(),
            payload,
            payload_hash,
        }
    }

    /// Canonical string representation for hashing
    pub fn canonical_string(&self) -> String {
        format!(
            "id:{}|occurred_at:{}|actor_type:{}|actor_id:{}|action:{}|payload_hash:{}",
            self.id,
            self.occurred_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
            self.actor_type,
            self.actor_id,
            self.action,
            self.payload_hash
        )
    }

    /// Hash committed into the batch for this event
    pub fn event_hash(&self) -> Digest {
        Digest::hash(self.canonical_string().as_bytes())
    }

    pub fn verify_payload_hash(&self) -> bool {
        self.payload_hash == Digest::hash(&self.payload)
    }

    /// Reject events that cannot be committed faithfully
    pub fn validate(&self) -> Result<(), AnchorError> {
        if !self.verify_payload_hash() {
            return Err(AnchorError::ValidationError(format!(
                "Payload hash mismatch for event {}",
                self.id
            )));
        }

        if self.actor_type.is_empty() || self.actor_id.is_empty() {
            return Err(AnchorError::ValidationError(format!(
                "Event {} has no actor",
                self.id
            )));
        }

        // Separators in free-text fields would make the canonical string ambiguous
        if self.actor_type.contains('|') || self.actor_id.contains('|') {
            return Err(AnchorError::ValidationError(format!(
                "Event {} actor fields must not contain '|'",
                self.id
            )));
        }

        if !action_pattern().is_match(&self.action) {
            return Err(AnchorError::ValidationError(format!(
                "Invalid action '{}': expected scope.domain.action",
                self.action
            )));
        }

        Ok(())
    }

    pub fn summary(&self) -> String {
        format!(
            "{} by {}:{} ({})",
            self.action, self.actor_type, self.actor_id, self.id
        )
    }
}

fn action_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z0-9_]+\.[a-z0-9_]+\.[a-z0-9_]+$").expect("static action pattern")
    })
}

mod payload_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
