//! Append-only audit log of administrative and state-changing actions.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::db::Store;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub actor: String,
    pub ip_address: Option<String>,
    /// JSON detail map.
    pub details: Option<String>,
}

impl Store {
    /// Append an audit entry. Failures are logged, never propagated:
    /// audit must not break the action it records.
    pub async fn log_audit(
        &self,
        action: &str,
        entity_type: &str,
        entity_id: impl ToString,
        details: Option<serde_json::Value>,
        source_ip: Option<&str>,
    ) {
        let result = sqlx::query(
            r#"
            INSERT INTO audit_logs (timestamp, action, entity_type, entity_id, actor, ip_address, details)
            VALUES (?, ?, ?, ?, 'system', ?, ?)
            "#,
        )
        .bind(Utc::now())
        .bind(action)
        .bind(entity_type)
        .bind(entity_id.to_string())
        .bind(source_ip)
        .bind(details.map(|d| d.to_string()))
        .execute(self.pool())
        .await;
        if let Err(e) = result {
            tracing::warn!(action, "audit write failed: {e}");
        }
    }

    pub async fn recent_audit(&self, limit: i64) -> Result<Vec<AuditEntry>, sqlx::Error> {
        sqlx::query_as::<_, AuditEntry>(
            "SELECT * FROM audit_logs ORDER BY id DESC LIMIT ?",
        )
        .bind(limit.clamp(1, 1000))
        .fetch_all(self.pool())
        .await
    }

    /// Retention sweep; returns rows removed.
    pub async fn prune_audit(&self, retention_days: i64) -> Result<u64, sqlx::Error> {
        let cutoff = Utc::now() - Duration::days(retention_days.max(1));
        let result = sqlx::query("DELETE FROM audit_logs WHERE timestamp < ?")
            .bind(cutoff)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_store;

    #[tokio::test]
    async fn entries_append_and_list_newest_first() {
        let store = test_store().await;
        store
            .log_audit("printer.create", "printer", 1, None, Some("10.0.0.5"))
            .await;
        store
            .log_audit(
                "job.dispatch",
                "job",
                9,
                Some(serde_json::json!({"printer_id": 1, "file": "clip.3mf"})),
                None,
            )
            .await;

        let entries = store.recent_audit(10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "job.dispatch");
        assert!(entries[0].details.as_deref().unwrap().contains("clip.3mf"));
        assert_eq!(entries[1].ip_address.as_deref(), Some("10.0.0.5"));
    }

    #[tokio::test]
    async fn prune_removes_expired_rows_only() {
        let store = test_store().await;
        store.log_audit("keep", "job", 1, None, None).await;
        sqlx::query(
            "INSERT INTO audit_logs (timestamp, action, entity_type, entity_id) VALUES (?, 'old', 'job', '2')",
        )
        .bind(Utc::now() - Duration::days(400))
        .execute(store.pool())
        .await
        .unwrap();

        let removed = store.prune_audit(365).await.unwrap();
        assert_eq!(removed, 1);
        let entries = store.recent_audit(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "keep");
    }
}
