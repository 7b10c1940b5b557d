//! Activity logging for flushed changes.
//!
//! When an item type enables auditing, the repository hands an
//! [`AuditRecord`] to the configured [`AuditSink`] before committing each
//! created or changed entry. Whether a sink failure aborts the flush is
//! controlled by [`AuditPolicy`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use chrono::Utc;

use crate::error::OdmResult;
use crate::value::AttrMap;

/// One before/after snapshot of a flushed change.
#[derive(Clone, Debug)]
pub struct AuditRecord {
    /// Unique, time-ordered record id.
    pub id: i64,
    /// Name of the table the change was written to.
    pub logged_table: String,
    /// Identity that made the change.
    pub changed_by: String,
    /// Epoch seconds of the change, offset-adjusted.
    pub changed_at: i64,
    /// Attribute snapshot before the change. Empty for created items.
    pub previous: AttrMap,
    /// Attribute snapshot being written.
    pub changed_to: AttrMap,
}

impl AuditRecord {
    /// Builds a record for a change about to be committed.
    pub fn new(
        logged_table: &str,
        context: &AuditContext,
        previous: AttrMap,
        changed_to: AttrMap,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: now.timestamp_micros() / 100,
            logged_table: logged_table.to_string(),
            changed_by: context.changed_by.clone(),
            changed_at: now.timestamp() + context.utc_offset,
            previous,
            changed_to,
        }
    }

    /// Renders the record as the flat attribute map of an activity-log row.
    pub fn into_attributes(self) -> AttrMap {
        AttrMap::from([
            ("id".to_string(), AttributeValue::N(self.id.to_string())),
            (
                "loggedTable".to_string(),
                AttributeValue::S(self.logged_table),
            ),
            ("changedBy".to_string(), AttributeValue::S(self.changed_by)),
            (
                "changedDateTime".to_string(),
                AttributeValue::N(self.changed_at.to_string()),
            ),
            (
                "previousValues".to_string(),
                AttributeValue::M(self.previous),
            ),
            (
                "changedToValues".to_string(),
                AttributeValue::M(self.changed_to),
            ),
        ])
    }
}

/// Destination for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persists one audit record.
    async fn insert_audit_record(&self, record: AuditRecord) -> OdmResult<()>;
}

/// How audit sink failures affect the flush that produced them.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AuditPolicy {
    /// Log a warning and continue the flush.
    #[default]
    BestEffort,
    /// Abort the flush with the sink's error.
    Strict,
}

/// Ambient details attached to every audit record.
#[derive(Clone, Debug)]
pub struct AuditContext {
    /// Identity recorded as the change author.
    pub changed_by: String,
    /// Seconds added to recorded timestamps.
    pub utc_offset: i64,
}

impl Default for AuditContext {
    fn default() -> Self {
        Self {
            changed_by: "unknown".to_string(),
            utc_offset: 0,
        }
    }
}

/// A repository's complete audit configuration.
#[derive(Clone)]
pub struct AuditConfig {
    /// Where records are written. Defaults to [`NullAuditSink`].
    pub sink: Arc<dyn AuditSink>,
    /// How sink failures are handled.
    pub policy: AuditPolicy,
    /// Ambient details stamped onto every record.
    pub context: AuditContext,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            sink: Arc::new(NullAuditSink),
            policy: AuditPolicy::default(),
            context: AuditContext::default(),
        }
    }
}

impl fmt::Debug for AuditConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AuditConfig")
            .field("policy", &self.policy)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// A sink that drops every record. The default when auditing is not
/// configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullAuditSink;

#[async_trait]
impl AuditSink for NullAuditSink {
    async fn insert_audit_record(&self, _record: AuditRecord) -> OdmResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_attributes_carry_both_snapshots() {
        let previous = AttrMap::from([(
            "score".to_string(),
            AttributeValue::N("1".to_string()),
        )]);
        let changed_to = AttrMap::from([(
            "score".to_string(),
            AttributeValue::N("2".to_string()),
        )]);
        let context = AuditContext {
            changed_by: "importer".to_string(),
            utc_offset: 0,
        };
        let record = AuditRecord::new("game-scores", &context, previous.clone(), changed_to.clone());
        let attributes = record.into_attributes();
        assert_eq!(
            attributes.get("loggedTable"),
            Some(&AttributeValue::S("game-scores".to_string()))
        );
        assert_eq!(
            attributes.get("changedBy"),
            Some(&AttributeValue::S("importer".to_string()))
        );
        assert_eq!(
            attributes.get("previousValues"),
            Some(&AttributeValue::M(previous))
        );
        assert_eq!(
            attributes.get("changedToValues"),
            Some(&AttributeValue::M(changed_to))
        );
    }

    #[test]
    fn record_timestamps_honor_the_context_offset() {
        let context = AuditContext {
            changed_by: "importer".to_string(),
            utc_offset: 7200,
        };
        let record = AuditRecord::new("notes", &context, AttrMap::new(), AttrMap::new());
        let now = Utc::now().timestamp();
        assert!(record.changed_at >= now + 7199 && record.changed_at <= now + 7201);
    }
}
