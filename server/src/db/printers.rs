use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::adapter::{ApiType, Coordinates};
use crate::db::Store;
use crate::error::CryptoError;

/// A fleet printer. `credentials` stays ciphertext; use
/// [`Store::printer_coordinates`] to obtain plaintext for adapter calls.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Printer {
    pub id: i64,
    pub name: String,
    pub model: String,
    pub api_type: String,
    pub api_host: String,
    #[serde(skip_serializing)]
    pub credentials: String,
    pub slot_count: i64,
    pub bed_width_mm: Option<f64>,
    pub bed_depth_mm: Option<f64>,
    pub is_active: bool,
    pub last_error: Option<String>,
    pub total_print_hours: f64,
    pub total_print_count: i64,
    pub hours_since_service: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Printer {
    pub fn api_type(&self) -> Option<ApiType> {
        ApiType::parse(&self.api_type)
    }
}

/// One filament channel on a printer, indexed 1..slot_count.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct FilamentSlot {
    pub id: i64,
    pub printer_id: i64,
    pub slot_number: i64,
    pub filament_type: Option<String>,
    pub color: Option<String>,
    pub color_hex: Option<String>,
    pub assigned_spool_id: Option<i64>,
    pub spool_confirmed: bool,
    pub loaded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewPrinter {
    pub name: String,
    pub model: String,
    pub api_type: ApiType,
    pub api_host: String,
    /// Plaintext credentials; encrypted before hitting disk.
    pub credentials: String,
    pub slot_count: i64,
    pub bed_width_mm: Option<f64>,
    pub bed_depth_mm: Option<f64>,
}

impl Store {
    pub async fn create_printer(&self, input: NewPrinter) -> Result<Printer, sqlx::Error> {
        let slot_count = input.slot_count.clamp(1, 16);
        let now = Utc::now();
        let encrypted = self.cipher().encrypt(&input.credentials);

        let mut tx = self.pool().begin().await?;
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO printers (name, model, api_type, api_host, credentials,
                                  slot_count, bed_width_mm, bed_depth_mm, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&input.name)
        .bind(&input.model)
        .bind(input.api_type.as_str())
        .bind(&input.api_host)
        .bind(&encrypted)
        .bind(slot_count)
        .bind(input.bed_width_mm)
        .bind(input.bed_depth_mm)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        for slot_number in 1..=slot_count {
            sqlx::query("INSERT INTO filament_slots (printer_id, slot_number) VALUES (?, ?)")
                .bind(id)
                .bind(slot_number)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        self.get_printer(id).await
    }

    pub async fn get_printer(&self, id: i64) -> Result<Printer, sqlx::Error> {
        sqlx::query_as::<_, Printer>("SELECT * FROM printers WHERE id = ?")
            .bind(id)
            .fetch_one(self.pool())
            .await
    }

    pub async fn find_printer(&self, id: i64) -> Result<Option<Printer>, sqlx::Error> {
        sqlx::query_as::<_, Printer>("SELECT * FROM printers WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
    }

    pub async fn list_printers(&self, active_only: bool) -> Result<Vec<Printer>, sqlx::Error> {
        let sql = if active_only {
            "SELECT * FROM printers WHERE is_active = 1 ORDER BY name"
        } else {
            "SELECT * FROM printers ORDER BY name"
        };
        sqlx::query_as::<_, Printer>(sql).fetch_all(self.pool()).await
    }

    /// Decrypt a printer's transport coordinates for adapter use.
    pub fn printer_coordinates(&self, printer: &Printer) -> Result<Coordinates, CryptoError> {
        let credentials = if printer.credentials.is_empty() {
            String::new()
        } else {
            self.cipher().decrypt(&printer.credentials)?
        };
        Ok(Coordinates {
            host: printer.api_host.clone(),
            credentials,
        })
    }

    pub async fn set_printer_active(&self, id: i64, active: bool) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE printers SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(active)
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Replace transport coordinates. The supervisor re-spawns the
    /// session after this.
    pub async fn update_printer_transport(
        &self,
        id: i64,
        api_host: &str,
        credentials: &str,
    ) -> Result<(), sqlx::Error> {
        let encrypted = self.cipher().encrypt(credentials);
        sqlx::query(
            "UPDATE printers SET api_host = ?, credentials = ?, updated_at = ? WHERE id = ?",
        )
        .bind(api_host)
        .bind(&encrypted)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Persist the most recent transport failure for admin display.
    pub async fn record_printer_error(
        &self,
        id: i64,
        error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE printers SET last_error = ? WHERE id = ?")
            .bind(error)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Roll lifetime and since-service counters after a finished print.
    pub async fn add_printer_usage(&self, id: i64, hours: f64) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE printers SET
                total_print_hours = total_print_hours + ?,
                total_print_count = total_print_count + 1,
                hours_since_service = hours_since_service + ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(hours)
        .bind(hours)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Delete a printer and (by cascade) its slots. Refused while any
    /// non-terminal job still references it.
    pub async fn delete_printer(&self, id: i64) -> Result<bool, sqlx::Error> {
        let open_jobs: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE printer_id = ?
              AND status IN ('submitted', 'pending', 'scheduled', 'printing')
            "#,
        )
        .bind(id)
        .fetch_one(self.pool())
        .await?;
        if open_jobs > 0 {
            return Ok(false);
        }
        sqlx::query("DELETE FROM printers WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(true)
    }

    pub async fn printer_slots(&self, printer_id: i64) -> Result<Vec<FilamentSlot>, sqlx::Error> {
        sqlx::query_as::<_, FilamentSlot>(
            "SELECT * FROM filament_slots WHERE printer_id = ? ORDER BY slot_number",
        )
        .bind(printer_id)
        .fetch_all(self.pool())
        .await
    }

    pub async fn find_slot(
        &self,
        printer_id: i64,
        slot_number: i64,
    ) -> Result<Option<FilamentSlot>, sqlx::Error> {
        sqlx::query_as::<_, FilamentSlot>(
            "SELECT * FROM filament_slots WHERE printer_id = ? AND slot_number = ?",
        )
        .bind(printer_id)
        .bind(slot_number)
        .fetch_optional(self.pool())
        .await
    }

    /// Update a slot's displayed material/color from reconciliation.
    pub async fn update_slot_display(
        &self,
        slot_id: i64,
        filament_type: Option<&str>,
        color: Option<&str>,
        color_hex: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE filament_slots
            SET filament_type = ?, color = ?, color_hex = ?, loaded_at = ?
            WHERE id = ?
            "#,
        )
        .bind(filament_type)
        .bind(color)
        .bind(color_hex)
        .bind(Utc::now())
        .bind(slot_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn bind_slot_spool(
        &self,
        slot_id: i64,
        spool_id: Option<i64>,
        confirmed: bool,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE filament_slots SET assigned_spool_id = ?, spool_confirmed = ? WHERE id = ?",
        )
        .bind(spool_id)
        .bind(confirmed)
        .bind(slot_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn clear_slot_confirmation(&self, slot_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE filament_slots SET spool_confirmed = 0 WHERE id = ?")
            .bind(slot_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_store;

    fn sample(name: &str, slots: i64) -> NewPrinter {
        NewPrinter {
            name: name.to_string(),
            model: "X1 Carbon".to_string(),
            api_type: ApiType::Bambu,
            api_host: "192.168.1.10".to_string(),
            credentials: "01S00C123456789|12345678".to_string(),
            slot_count: slots,
            bed_width_mm: Some(256.0),
            bed_depth_mm: Some(256.0),
        }
    }

    #[tokio::test]
    async fn create_seeds_slots_and_encrypts_credentials() {
        let store = test_store().await;
        let printer = store.create_printer(sample("Apollo", 4)).await.unwrap();

        assert_eq!(printer.slot_count, 4);
        assert_ne!(printer.credentials, "01S00C123456789|12345678");

        let slots = store.printer_slots(printer.id).await.unwrap();
        assert_eq!(slots.len(), 4);
        assert_eq!(slots[0].slot_number, 1);
        assert_eq!(slots[3].slot_number, 4);

        let coords = store.printer_coordinates(&printer).unwrap();
        assert_eq!(coords.credentials, "01S00C123456789|12345678");
        assert_eq!(coords.host, "192.168.1.10");
    }

    #[tokio::test]
    async fn slot_count_clamped_to_sixteen() {
        let store = test_store().await;
        let printer = store.create_printer(sample("Hydra", 40)).await.unwrap();
        assert_eq!(printer.slot_count, 16);
    }

    #[tokio::test]
    async fn delete_refused_with_open_jobs() {
        let store = test_store().await;
        let printer = store.create_printer(sample("Zeus", 1)).await.unwrap();

        sqlx::query(
            "INSERT INTO jobs (item_name, status, printer_id, created_at, updated_at)
             VALUES ('clip', 'printing', ?, ?, ?)",
        )
        .bind(printer.id)
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(store.pool())
        .await
        .unwrap();

        assert!(!store.delete_printer(printer.id).await.unwrap());

        sqlx::query("UPDATE jobs SET status = 'completed'")
            .execute(store.pool())
            .await
            .unwrap();
        assert!(store.delete_printer(printer.id).await.unwrap());

        // Cascade removed the slots.
        let slots = store.printer_slots(printer.id).await.unwrap();
        assert!(slots.is_empty());
    }

    #[tokio::test]
    async fn usage_counters_accumulate() {
        let store = test_store().await;
        let printer = store.create_printer(sample("Hermes", 1)).await.unwrap();
        store.add_printer_usage(printer.id, 2.5).await.unwrap();
        store.add_printer_usage(printer.id, 1.0).await.unwrap();

        let printer = store.get_printer(printer.id).await.unwrap();
        assert_eq!(printer.total_print_count, 2);
        assert!((printer.total_print_hours - 3.5).abs() < f64::EPSILON);
        assert!((printer.hours_since_service - 3.5).abs() < f64::EPSILON);
    }
}
