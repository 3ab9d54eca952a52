//! Audit log records
//!
//! One append-only record per command outcome, carrying a SHA-256 content
//! hash computed at write time. Records are immutable once written; the
//! integrity check in [`integrity`] recomputes hashes and reports id gaps
//! without blocking live operations.

pub mod integrity;
pub mod writer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::persistence::rows::AuditLogRow;

pub use integrity::{verify_audit_chain, IntegrityReport};
pub use writer::AuditWriter;

/// What a command did to an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// Entity created
    Create,
    /// Entity renamed or otherwise updated
    Update,
    /// Entity deleted
    Delete,
    /// Membership edge added
    Add,
    /// Membership edge removed
    Remove,
    /// Permission granted or denied
    Grant,
    /// Permission revoked
    Revoke,
    /// Permission check performed
    Check,
    /// Command failed
    Error,
}

impl ChangeType {
    /// Tag stored in the `change_type` column
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Create => "create",
            ChangeType::Update => "update",
            ChangeType::Delete => "delete",
            ChangeType::Add => "add",
            ChangeType::Remove => "remove",
            ChangeType::Grant => "grant",
            ChangeType::Revoke => "revoke",
            ChangeType::Check => "check",
            ChangeType::Error => "error",
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An audit record as the engine sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Monotonic id
    pub id: i64,
    /// Entity type the change touched
    pub entity_type: String,
    /// Entity id the change touched
    pub entity_id: i64,
    /// Change type
    pub change_type: ChangeType,
    /// Actor who submitted the command
    pub actor: String,
    /// UTC timestamp
    pub changed_at: DateTime<Utc>,
    /// Structured details, before/after included where meaningful
    pub details: serde_json::Value,
    /// Hex-encoded SHA-256 content hash
    pub hash: String,
}

/// Content hash over the immutable record fields
///
/// `H(id || entity_type || entity_id || change_type || actor || ts_rfc3339
/// || details)`, fields joined with `|`, SHA-256, hex-encoded.
pub fn content_hash(
    id: i64,
    entity_type: &str,
    entity_id: i64,
    change_type: &str,
    actor: &str,
    ts_rfc3339: &str,
    details: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.to_string());
    hasher.update(b"|");
    hasher.update(entity_type);
    hasher.update(b"|");
    hasher.update(entity_id.to_string());
    hasher.update(b"|");
    hasher.update(change_type);
    hasher.update(b"|");
    hasher.update(actor);
    hasher.update(b"|");
    hasher.update(ts_rfc3339);
    hasher.update(b"|");
    hasher.update(details);
    hex::encode(hasher.finalize())
}

/// Recompute the content hash of a stored row
pub fn row_hash(row: &AuditLogRow) -> String {
    content_hash(
        row.id,
        &row.entity_type,
        row.entity_id,
        &row.change_type,
        &row.changed_by,
        &row.change_date.to_rfc3339(),
        &row.change_details,
    )
}

impl AuditRecord {
    /// Build the record, computing the hash from its fields
    pub fn new(
        id: i64,
        entity_type: impl Into<String>,
        entity_id: i64,
        change_type: ChangeType,
        actor: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        let entity_type = entity_type.into();
        let actor = actor.into();
        let changed_at = Utc::now();
        let details_text = details.to_string();
        let hash = content_hash(
            id,
            &entity_type,
            entity_id,
            change_type.as_str(),
            &actor,
            &changed_at.to_rfc3339(),
            &details_text,
        );
        Self {
            id,
            entity_type,
            entity_id,
            change_type,
            actor,
            changed_at,
            details,
            hash,
        }
    }

    /// Row representation for the store
    pub fn to_row(&self) -> AuditLogRow {
        AuditLogRow {
            id: self.id,
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id,
            change_type: self.change_type.as_str().to_string(),
            changed_by: self.actor.clone(),
            change_date: self.changed_at,
            change_details: self.details.to_string(),
            content_hash: self.hash.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable_and_field_sensitive() {
        let record = AuditRecord::new(
            1,
            "user",
            7,
            ChangeType::Create,
            "system",
            serde_json::json!({"name": "alice"}),
        );
        assert_eq!(row_hash(&record.to_row()), record.hash);

        let mut tampered = record.to_row();
        tampered.change_details = "{}".to_string();
        assert_ne!(row_hash(&tampered), record.hash);
    }

    #[test]
    fn test_distinct_ids_produce_distinct_hashes() {
        let a = AuditRecord::new(1, "user", 7, ChangeType::Create, "s", serde_json::json!({}));
        let b = AuditRecord::new(2, "user", 7, ChangeType::Create, "s", serde_json::json!({}));
        assert_ne!(a.hash, b.hash);
    }
}
