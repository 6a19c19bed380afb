use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SpoolStatus {
    Active,
    Empty,
    Archived,
}

/// A tracked physical spool. Location is exactly one of printer+slot,
/// storage, or unassigned; the nullable columns encode which.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Spool {
    pub id: i64,
    pub library_id: Option<i64>,
    pub qr_code: Option<String>,
    pub rfid_tag: Option<String>,
    pub material: String,
    pub color_hex: String,
    pub initial_grams: f64,
    pub remaining_grams: f64,
    pub empty_spool_grams: f64,
    pub low_threshold_grams: f64,
    pub status: SpoolStatus,
    pub location_printer_id: Option<i64>,
    pub location_slot: Option<i64>,
    pub storage_location: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Filament catalog entry referenced by spools.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LibraryEntry {
    pub id: i64,
    pub brand: String,
    pub name: String,
    pub material: String,
    pub color_hex: String,
    pub cost_per_gram: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SpoolUsage {
    pub id: i64,
    pub spool_id: i64,
    pub job_id: Option<i64>,
    pub grams: f64,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewSpool {
    pub library_id: Option<i64>,
    pub rfid_tag: Option<String>,
    pub material: String,
    pub color_hex: String,
    pub initial_grams: f64,
    pub remaining_grams: f64,
}

/// Outcome of a deduction, carrying the threshold crossings the caller
/// must publish.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Deduction {
    pub deducted: f64,
    pub remaining: f64,
    pub crossed_low: bool,
    pub now_empty: bool,
}

impl Store {
    pub async fn create_library_entry(
        &self,
        brand: &str,
        name: &str,
        material: &str,
        color_hex: &str,
        cost_per_gram: f64,
    ) -> Result<LibraryEntry, sqlx::Error> {
        sqlx::query_as::<_, LibraryEntry>(
            r#"
            INSERT INTO filament_library (brand, name, material, color_hex, cost_per_gram, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(brand)
        .bind(name)
        .bind(material)
        .bind(color_hex.to_uppercase())
        .bind(cost_per_gram)
        .bind(Utc::now())
        .fetch_one(self.pool())
        .await
    }

    /// Library match for reconciliation: exact hex + material first,
    /// then exact hex alone.
    pub async fn find_library_match(
        &self,
        material: Option<&str>,
        color_hex: &str,
    ) -> Result<Option<LibraryEntry>, sqlx::Error> {
        let hex = color_hex.to_uppercase();
        if let Some(material) = material {
            let exact = sqlx::query_as::<_, LibraryEntry>(
                "SELECT * FROM filament_library WHERE color_hex = ? AND material = ? LIMIT 1",
            )
            .bind(&hex)
            .bind(material)
            .fetch_optional(self.pool())
            .await?;
            if exact.is_some() {
                return Ok(exact);
            }
        }
        sqlx::query_as::<_, LibraryEntry>(
            "SELECT * FROM filament_library WHERE color_hex = ? LIMIT 1",
        )
        .bind(&hex)
        .fetch_optional(self.pool())
        .await
    }

    pub async fn library_entry(&self, id: i64) -> Result<Option<LibraryEntry>, sqlx::Error> {
        sqlx::query_as::<_, LibraryEntry>("SELECT * FROM filament_library WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
    }

    pub async fn create_spool(&self, input: NewSpool) -> Result<Spool, sqlx::Error> {
        let now = Utc::now();
        let qr_code = format!("SPL-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        sqlx::query_as::<_, Spool>(
            r#"
            INSERT INTO spools (library_id, qr_code, rfid_tag, material, color_hex,
                                initial_grams, remaining_grams, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(input.library_id)
        .bind(&qr_code)
        .bind(&input.rfid_tag)
        .bind(&input.material)
        .bind(input.color_hex.to_uppercase())
        .bind(input.initial_grams)
        .bind(input.remaining_grams.clamp(0.0, input.initial_grams))
        .bind(now)
        .bind(now)
        .fetch_one(self.pool())
        .await
    }

    pub async fn find_spool(&self, id: i64) -> Result<Option<Spool>, sqlx::Error> {
        sqlx::query_as::<_, Spool>("SELECT * FROM spools WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
    }

    pub async fn find_spool_by_rfid(&self, rfid: &str) -> Result<Option<Spool>, sqlx::Error> {
        sqlx::query_as::<_, Spool>("SELECT * FROM spools WHERE rfid_tag = ?")
            .bind(rfid)
            .fetch_optional(self.pool())
            .await
    }

    /// The active spool loaded at a printer slot, if any.
    pub async fn active_spool_at(
        &self,
        printer_id: i64,
        slot_number: i64,
    ) -> Result<Option<Spool>, sqlx::Error> {
        sqlx::query_as::<_, Spool>(
            r#"
            SELECT * FROM spools
            WHERE location_printer_id = ? AND location_slot = ? AND status = 'active'
            "#,
        )
        .bind(printer_id)
        .bind(slot_number)
        .fetch_optional(self.pool())
        .await
    }

    /// Move a spool onto a printer slot, displacing nothing: the caller
    /// must have unloaded any previous occupant first (the partial
    /// unique index enforces it).
    pub async fn place_spool_on_printer(
        &self,
        spool_id: i64,
        printer_id: i64,
        slot_number: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE spools
            SET location_printer_id = ?, location_slot = ?, storage_location = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(printer_id)
        .bind(slot_number)
        .bind(Utc::now())
        .bind(spool_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn move_spool_to_storage(
        &self,
        spool_id: i64,
        storage_location: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE spools
            SET location_printer_id = NULL, location_slot = NULL, storage_location = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(storage_location)
        .bind(Utc::now())
        .bind(spool_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Overwrite remaining grams from a hardware-reported remaining
    /// percentage.
    pub async fn set_spool_remaining_pct(
        &self,
        spool_id: i64,
        remaining_pct: f64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE spools
            SET remaining_grams = MIN(initial_grams, MAX(0, initial_grams * ? / 100.0)),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(remaining_pct.clamp(0.0, 100.0))
        .bind(Utc::now())
        .bind(spool_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Deduct consumed grams, floored at zero, appending a usage record
    /// and flipping status to empty at zero. Returns the threshold
    /// crossings for event publication.
    pub async fn deduct_spool(
        &self,
        spool_id: i64,
        grams: f64,
        job_id: Option<i64>,
        notes: Option<&str>,
    ) -> Result<Option<Deduction>, sqlx::Error> {
        let mut tx = self.pool().begin().await?;
        let Some(spool) = sqlx::query_as::<_, Spool>("SELECT * FROM spools WHERE id = ?")
            .bind(spool_id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(None);
        };

        let before = spool.remaining_grams;
        let after = (before - grams).max(0.0);
        let now_empty = after <= 0.0 && before > 0.0;
        let crossed_low =
            before > spool.low_threshold_grams && after <= spool.low_threshold_grams && !now_empty;

        sqlx::query("UPDATE spools SET remaining_grams = ?, status = ?, updated_at = ? WHERE id = ?")
            .bind(after)
            .bind(if after <= 0.0 { SpoolStatus::Empty } else { spool.status })
            .bind(Utc::now())
            .bind(spool_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO spool_usage (spool_id, job_id, grams, notes, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(spool_id)
        .bind(job_id)
        .bind(grams)
        .bind(notes)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(Deduction {
            deducted: grams,
            remaining: after,
            crossed_low,
            now_empty,
        }))
    }

    pub async fn spool_usage(&self, spool_id: i64) -> Result<Vec<SpoolUsage>, sqlx::Error> {
        sqlx::query_as::<_, SpoolUsage>(
            "SELECT * FROM spool_usage WHERE spool_id = ? ORDER BY created_at DESC",
        )
        .bind(spool_id)
        .fetch_all(self.pool())
        .await
    }

    pub async fn list_low_spools(&self) -> Result<Vec<Spool>, sqlx::Error> {
        sqlx::query_as::<_, Spool>(
            r#"
            SELECT * FROM spools
            WHERE status = 'active' AND remaining_grams <= low_threshold_grams
            ORDER BY remaining_grams
            "#,
        )
        .fetch_all(self.pool())
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_store;

    async fn spool_with(store: &Store, remaining: f64) -> Spool {
        store
            .create_spool(NewSpool {
                material: "PLA".into(),
                color_hex: "#DC2626".into(),
                initial_grams: 1000.0,
                remaining_grams: remaining,
                ..NewSpool::default()
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn qr_codes_have_spool_prefix() {
        let store = test_store().await;
        let spool = spool_with(&store, 1000.0).await;
        let qr = spool.qr_code.unwrap();
        assert!(qr.starts_with("SPL-"));
        assert_eq!(qr.len(), 12);
    }

    #[tokio::test]
    async fn deduction_floors_at_zero_and_marks_empty() {
        let store = test_store().await;
        let spool = spool_with(&store, 30.0).await;

        let outcome = store
            .deduct_spool(spool.id, 42.5, Some(7), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.remaining, 0.0);
        assert!(outcome.now_empty);
        assert!(!outcome.crossed_low);

        let spool = store.find_spool(spool.id).await.unwrap().unwrap();
        assert_eq!(spool.status, SpoolStatus::Empty);

        let usage = store.spool_usage(spool.id).await.unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].job_id, Some(7));
        assert!((usage[0].grams - 42.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn low_threshold_crossing_fires_once() {
        let store = test_store().await;
        let spool = spool_with(&store, 120.0).await;

        // 120 -> 100 lands exactly on the threshold: a crossing.
        let first = store
            .deduct_spool(spool.id, 20.0, None, None)
            .await
            .unwrap()
            .unwrap();
        assert!(first.crossed_low);

        // Already at/below threshold: no second crossing.
        let second = store
            .deduct_spool(spool.id, 10.0, None, None)
            .await
            .unwrap()
            .unwrap();
        assert!(!second.crossed_low);
    }

    #[tokio::test]
    async fn one_active_spool_per_slot() {
        let store = test_store().await;
        let printer = store
            .create_printer(crate::db::printers::NewPrinter {
                name: "Apollo".into(),
                model: "X1C".into(),
                api_type: crate::adapter::ApiType::Bambu,
                api_host: "h".into(),
                credentials: "s|c".into(),
                slot_count: 4,
                bed_width_mm: None,
                bed_depth_mm: None,
            })
            .await
            .unwrap();
        let first = spool_with(&store, 500.0).await;
        let second = spool_with(&store, 500.0).await;

        store.place_spool_on_printer(first.id, printer.id, 1).await.unwrap();
        let conflict = store.place_spool_on_printer(second.id, printer.id, 1).await;
        assert!(conflict.is_err());

        store.move_spool_to_storage(first.id, Some("Shelf A")).await.unwrap();
        store.place_spool_on_printer(second.id, printer.id, 1).await.unwrap();
    }

    #[tokio::test]
    async fn library_match_prefers_material() {
        let store = test_store().await;
        store
            .create_library_entry("Bambu Lab", "Matte Red", "PLA", "#DC2626", 0.025)
            .await
            .unwrap();
        store
            .create_library_entry("Polymaker", "Red PETG", "PETG", "#DC2626", 0.03)
            .await
            .unwrap();

        let matched = store
            .find_library_match(Some("PETG"), "#dc2626")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(matched.material, "PETG");

        // Unknown material still matches on hex alone.
        let fallback = store
            .find_library_match(Some("ABS"), "#DC2626")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fallback.color_hex, "#DC2626");
    }

    #[tokio::test]
    async fn remaining_pct_clamps() {
        let store = test_store().await;
        let spool = spool_with(&store, 900.0).await;
        store.set_spool_remaining_pct(spool.id, 80.0).await.unwrap();
        let spool = store.find_spool(spool.id).await.unwrap().unwrap();
        assert!((spool.remaining_grams - 800.0).abs() < f64::EPSILON);
    }
}
