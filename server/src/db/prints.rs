use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::db::Store;
use crate::events::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PrintStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// An observed print on hardware, independent of any Job. Foreign
/// prints started at the panel get a record too; linking to a job is a
/// later operator action.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PrintRecord {
    pub id: i64,
    pub printer_id: i64,
    pub job_id: Option<i64>,
    pub file_name: String,
    pub progress: Option<f64>,
    pub remaining_minutes: Option<i64>,
    pub layer: Option<i64>,
    pub total_layers: Option<i64>,
    pub status: PrintStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Periodic temperature/fan sample for the telemetry timeline.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TelemetryPoint {
    pub id: i64,
    pub printer_id: i64,
    pub bed_temp: Option<f64>,
    pub nozzle_temp: Option<f64>,
    pub bed_target: Option<f64>,
    pub nozzle_target: Option<f64>,
    pub fan_speed: Option<i64>,
    pub recorded_at: DateTime<Utc>,
}

/// Decoded device error history.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct HmsEvent {
    pub id: i64,
    pub printer_id: i64,
    pub code: String,
    pub message: String,
    pub severity: String,
    pub occurred_at: DateTime<Utc>,
}

impl Store {
    /// The open (running) record on a printer, if any.
    pub async fn open_print_record(
        &self,
        printer_id: i64,
    ) -> Result<Option<PrintRecord>, sqlx::Error> {
        sqlx::query_as::<_, PrintRecord>(
            "SELECT * FROM print_records WHERE printer_id = ? AND status = 'running' ORDER BY id DESC LIMIT 1",
        )
        .bind(printer_id)
        .fetch_optional(self.pool())
        .await
    }

    pub async fn start_print_record(
        &self,
        printer_id: i64,
        job_id: Option<i64>,
        file_name: &str,
    ) -> Result<PrintRecord, sqlx::Error> {
        sqlx::query_as::<_, PrintRecord>(
            r#"
            INSERT INTO print_records (printer_id, job_id, file_name, status, started_at)
            VALUES (?, ?, ?, 'running', ?)
            RETURNING *
            "#,
        )
        .bind(printer_id)
        .bind(job_id)
        .bind(file_name)
        .bind(Utc::now())
        .fetch_one(self.pool())
        .await
    }

    pub async fn update_print_progress(
        &self,
        record_id: i64,
        progress: Option<f64>,
        remaining_minutes: Option<i64>,
        layer: Option<i64>,
        total_layers: Option<i64>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE print_records
            SET progress = COALESCE(?, progress),
                remaining_minutes = COALESCE(?, remaining_minutes),
                layer = COALESCE(?, layer),
                total_layers = COALESCE(?, total_layers)
            WHERE id = ?
            "#,
        )
        .bind(progress)
        .bind(remaining_minutes)
        .bind(layer)
        .bind(total_layers)
        .bind(record_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn close_print_record(
        &self,
        record_id: i64,
        status: PrintStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE print_records SET status = ?, ended_at = ? WHERE id = ? AND status = 'running'")
            .bind(status)
            .bind(Utc::now())
            .bind(record_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Attach an unlinked record to a job after the fact.
    pub async fn link_print_record(&self, record_id: i64, job_id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE print_records SET job_id = ? WHERE id = ? AND job_id IS NULL",
        )
        .bind(job_id)
        .bind(record_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn unlinked_print_records(
        &self,
        printer_id: Option<i64>,
    ) -> Result<Vec<PrintRecord>, sqlx::Error> {
        match printer_id {
            Some(printer_id) => {
                sqlx::query_as::<_, PrintRecord>(
                    "SELECT * FROM print_records WHERE job_id IS NULL AND printer_id = ? ORDER BY started_at DESC",
                )
                .bind(printer_id)
                .fetch_all(self.pool())
                .await
            }
            None => {
                sqlx::query_as::<_, PrintRecord>(
                    "SELECT * FROM print_records WHERE job_id IS NULL ORDER BY started_at DESC",
                )
                .fetch_all(self.pool())
                .await
            }
        }
    }

    /// Record a telemetry sample, rate-limited to one row per printer
    /// per minute.
    pub async fn record_telemetry(
        &self,
        printer_id: i64,
        bed_temp: Option<f64>,
        nozzle_temp: Option<f64>,
        bed_target: Option<f64>,
        nozzle_target: Option<f64>,
        fan_speed: Option<i64>,
    ) -> Result<bool, sqlx::Error> {
        let cutoff = Utc::now() - Duration::seconds(60);
        let recent: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM telemetry WHERE printer_id = ? AND recorded_at > ?",
        )
        .bind(printer_id)
        .bind(cutoff)
        .fetch_one(self.pool())
        .await?;
        if recent > 0 {
            return Ok(false);
        }
        sqlx::query(
            r#"
            INSERT INTO telemetry (printer_id, bed_temp, nozzle_temp, bed_target,
                                   nozzle_target, fan_speed, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(printer_id)
        .bind(bed_temp)
        .bind(nozzle_temp)
        .bind(bed_target)
        .bind(nozzle_target)
        .bind(fan_speed)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(true)
    }

    pub async fn record_hms_event(
        &self,
        printer_id: i64,
        code: &str,
        message: &str,
        severity: Severity,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO hms_events (printer_id, code, message, severity, occurred_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(printer_id)
        .bind(code)
        .bind(message)
        .bind(severity.as_str())
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Most recent HMS code per printer, for dedupe on repeat reports.
    pub async fn last_hms_code(&self, printer_id: i64) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT code FROM hms_events WHERE printer_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(printer_id)
        .fetch_optional(self.pool())
        .await
    }

    pub async fn prune_telemetry(&self, retention_days: i64) -> Result<u64, sqlx::Error> {
        let cutoff = Utc::now() - Duration::days(retention_days.max(1));
        let result = sqlx::query("DELETE FROM telemetry WHERE recorded_at < ?")
            .bind(cutoff)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ApiType;
    use crate::db::printers::NewPrinter;
    use crate::db::test_store;

    async fn printer(store: &Store) -> i64 {
        store
            .create_printer(NewPrinter {
                name: "Apollo".into(),
                model: "X1C".into(),
                api_type: ApiType::Bambu,
                api_host: "h".into(),
                credentials: "s|c".into(),
                slot_count: 4,
                bed_width_mm: None,
                bed_depth_mm: None,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn open_close_and_link_records() {
        let store = test_store().await;
        let printer_id = printer(&store).await;

        let record = store
            .start_print_record(printer_id, None, "mystery.3mf")
            .await
            .unwrap();
        assert_eq!(record.status, PrintStatus::Running);

        let open = store.open_print_record(printer_id).await.unwrap().unwrap();
        assert_eq!(open.id, record.id);

        store.close_print_record(record.id, PrintStatus::Completed).await.unwrap();
        assert!(store.open_print_record(printer_id).await.unwrap().is_none());

        // Foreign print shows up unlinked until an operator attaches it.
        let unlinked = store.unlinked_print_records(Some(printer_id)).await.unwrap();
        assert_eq!(unlinked.len(), 1);
        assert!(store.link_print_record(record.id, 42).await.unwrap());
        assert!(!store.link_print_record(record.id, 43).await.unwrap());
        assert!(store.unlinked_print_records(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn telemetry_rate_limited_per_minute() {
        let store = test_store().await;
        let printer_id = printer(&store).await;

        assert!(store
            .record_telemetry(printer_id, Some(60.0), Some(215.0), None, None, Some(80))
            .await
            .unwrap());
        assert!(!store
            .record_telemetry(printer_id, Some(60.2), Some(215.1), None, None, Some(80))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn hms_history_tracks_last_code() {
        let store = test_store().await;
        let printer_id = printer(&store).await;

        assert_eq!(store.last_hms_code(printer_id).await.unwrap(), None);
        store
            .record_hms_event(printer_id, "0300_0100_0001_0001", "runout", Severity::Critical)
            .await
            .unwrap();
        assert_eq!(
            store.last_hms_code(printer_id).await.unwrap().as_deref(),
            Some("0300_0100_0001_0001")
        );
    }
}
