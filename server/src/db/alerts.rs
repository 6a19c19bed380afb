use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::crypto::SecretCipher;
use crate::db::Store;
use crate::events::Severity;

/// An in-app alert row targeted at one user.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Alert {
    pub id: i64,
    pub kind: String,
    pub severity: String,
    pub user_id: i64,
    pub title: String,
    pub message: String,
    pub is_read: bool,
    pub is_dismissed: bool,
    pub printer_id: Option<i64>,
    pub job_id: Option<i64>,
    pub spool_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Per-user delivery switches and quiet hours (HH:MM local).
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AlertPreference {
    pub id: i64,
    pub user_id: i64,
    pub in_app: bool,
    pub email: bool,
    pub push: bool,
    pub webhook: bool,
    pub min_severity: String,
    pub quiet_start: Option<String>,
    pub quiet_end: Option<String>,
    pub email_address: Option<String>,
}

impl AlertPreference {
    pub fn min_severity(&self) -> Severity {
        Severity::parse(&self.min_severity).unwrap_or(Severity::Info)
    }
}

/// Configured webhook fan-out target. `url` is ciphertext at rest.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WebhookEndpoint {
    pub id: i64,
    pub name: String,
    pub kind: String,
    #[serde(skip_serializing)]
    pub url: String,
    pub enabled: bool,
    /// `*` or comma-separated topic list.
    pub events: String,
    pub created_at: DateTime<Utc>,
}

impl WebhookEndpoint {
    pub fn wants_topic(&self, topic: &str) -> bool {
        self.events.trim() == "*"
            || self
                .events
                .split(',')
                .map(str::trim)
                .any(|subscribed| subscribed == topic)
    }

    pub fn decrypt_url(&self, cipher: &SecretCipher) -> Option<String> {
        cipher.decrypt(&self.url).ok()
    }
}

/// Optional refs an alert can carry.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlertRefs {
    pub printer_id: Option<i64>,
    pub job_id: Option<i64>,
    pub spool_id: Option<i64>,
}

impl Store {
    pub async fn create_alert(
        &self,
        kind: &str,
        severity: Severity,
        user_id: i64,
        title: &str,
        message: &str,
        refs: AlertRefs,
    ) -> Result<Alert, sqlx::Error> {
        sqlx::query_as::<_, Alert>(
            r#"
            INSERT INTO alerts (kind, severity, user_id, title, message,
                                printer_id, job_id, spool_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(kind)
        .bind(severity.as_str())
        .bind(user_id)
        .bind(title)
        .bind(message)
        .bind(refs.printer_id)
        .bind(refs.job_id)
        .bind(refs.spool_id)
        .bind(Utc::now())
        .fetch_one(self.pool())
        .await
    }

    pub async fn unread_alerts(&self, user_id: i64) -> Result<Vec<Alert>, sqlx::Error> {
        sqlx::query_as::<_, Alert>(
            "SELECT * FROM alerts WHERE user_id = ? AND is_read = 0 AND is_dismissed = 0 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await
    }

    pub async fn mark_alert_read(&self, alert_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE alerts SET is_read = 1 WHERE id = ?")
            .bind(alert_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn dismiss_alert(&self, alert_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE alerts SET is_dismissed = 1 WHERE id = ?")
            .bind(alert_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// All users with alert preferences: the routing target set.
    pub async fn alert_preferences(&self) -> Result<Vec<AlertPreference>, sqlx::Error> {
        sqlx::query_as::<_, AlertPreference>("SELECT * FROM alert_preferences ORDER BY user_id")
            .fetch_all(self.pool())
            .await
    }

    pub async fn upsert_alert_preference(
        &self,
        user_id: i64,
        in_app: bool,
        email: bool,
        push: bool,
        webhook: bool,
        min_severity: Severity,
        quiet_start: Option<&str>,
        quiet_end: Option<&str>,
        email_address: Option<&str>,
    ) -> Result<AlertPreference, sqlx::Error> {
        sqlx::query_as::<_, AlertPreference>(
            r#"
            INSERT INTO alert_preferences (user_id, in_app, email, push, webhook,
                                           min_severity, quiet_start, quiet_end, email_address)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id) DO UPDATE SET
                in_app = excluded.in_app,
                email = excluded.email,
                push = excluded.push,
                webhook = excluded.webhook,
                min_severity = excluded.min_severity,
                quiet_start = excluded.quiet_start,
                quiet_end = excluded.quiet_end,
                email_address = excluded.email_address
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(in_app)
        .bind(email)
        .bind(push)
        .bind(webhook)
        .bind(min_severity.as_str())
        .bind(quiet_start)
        .bind(quiet_end)
        .bind(email_address)
        .fetch_one(self.pool())
        .await
    }

    pub async fn create_webhook_endpoint(
        &self,
        name: &str,
        kind: &str,
        url: &str,
        events: &str,
    ) -> Result<WebhookEndpoint, sqlx::Error> {
        let encrypted = self.cipher().encrypt(url);
        sqlx::query_as::<_, WebhookEndpoint>(
            r#"
            INSERT INTO webhook_endpoints (name, kind, url, events, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(kind)
        .bind(&encrypted)
        .bind(events)
        .bind(Utc::now())
        .fetch_one(self.pool())
        .await
    }

    pub async fn enabled_webhooks(&self) -> Result<Vec<WebhookEndpoint>, sqlx::Error> {
        sqlx::query_as::<_, WebhookEndpoint>(
            "SELECT * FROM webhook_endpoints WHERE enabled = 1 ORDER BY id",
        )
        .fetch_all(self.pool())
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_store;

    #[tokio::test]
    async fn alert_rows_round_trip() {
        let store = test_store().await;
        let alert = store
            .create_alert(
                "inventory.spool_low",
                Severity::Warning,
                1,
                "Spool low",
                "Red PLA is at 88g",
                AlertRefs { spool_id: Some(3), ..AlertRefs::default() },
            )
            .await
            .unwrap();
        assert_eq!(alert.severity, "warning");
        assert_eq!(alert.spool_id, Some(3));

        let unread = store.unread_alerts(1).await.unwrap();
        assert_eq!(unread.len(), 1);

        store.mark_alert_read(alert.id).await.unwrap();
        assert!(store.unread_alerts(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn preference_upsert_replaces() {
        let store = test_store().await;
        store
            .upsert_alert_preference(1, true, false, false, true, Severity::Info, None, None, None)
            .await
            .unwrap();
        let updated = store
            .upsert_alert_preference(
                1,
                true,
                true,
                false,
                true,
                Severity::Warning,
                Some("22:00"),
                Some("07:00"),
                Some("op@example.com"),
            )
            .await
            .unwrap();
        assert!(updated.email);
        assert_eq!(updated.min_severity(), Severity::Warning);
        assert_eq!(store.alert_preferences().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn webhook_urls_are_encrypted_and_topic_filtered() {
        let store = test_store().await;
        let endpoint = store
            .create_webhook_endpoint(
                "ops-discord",
                "discord",
                "https://discord.com/api/webhooks/x/y",
                "job.failed, printer.error",
            )
            .await
            .unwrap();

        assert_ne!(endpoint.url, "https://discord.com/api/webhooks/x/y");
        assert_eq!(
            endpoint.decrypt_url(store.cipher()).as_deref(),
            Some("https://discord.com/api/webhooks/x/y")
        );
        assert!(endpoint.wants_topic("job.failed"));
        assert!(!endpoint.wants_topic("job.completed"));

        let all = store
            .create_webhook_endpoint("everything", "generic", "https://example.com/hook", "*")
            .await
            .unwrap();
        assert!(all.wants_topic("anything.at_all"));
    }
}
