//! Filament accounting: keeps the loaded-material model aligned with
//! hardware observations and deducts consumption when jobs complete.

pub mod colors;

use std::sync::Arc;

use crate::adapter::SlotReading;
use crate::bus::EventBus;
use crate::db::jobs::Job;
use crate::db::spools::NewSpool;
use crate::db::Store;
use crate::events::Event;
use crate::locks::LockMap;

/// RGB distance beyond which a slot's reported color no longer matches
/// its assigned spool.
const DRIFT_DISTANCE: f64 = 60.0;

/// Assumed label weight when adopting an unknown spool from an RFID
/// report that only carries a remaining percentage.
const ADOPTED_SPOOL_GRAMS: f64 = 1000.0;

pub struct FilamentAccounting {
    store: Store,
    bus: EventBus,
    catalog: Option<CatalogClient>,
    spool_locks: Arc<LockMap>,
}

impl FilamentAccounting {
    pub fn new(store: Store, bus: EventBus, catalog_url: Option<String>) -> Self {
        Self {
            store,
            bus,
            catalog: catalog_url.map(CatalogClient::new),
            spool_locks: Arc::new(LockMap::new()),
        }
    }

    /// Bus subscriber loop: reconcile whenever a status frame carries
    /// slot details.
    pub async fn run(self: Arc<Self>, mut subscription: crate::bus::Subscription) {
        while let Some(event) = subscription.recv().await {
            let Event::PrinterStateChanged { printer_id, ref frame } = event else {
                continue;
            };
            if frame.slots.is_empty() {
                continue;
            }
            if let Err(e) = self.reconcile_slots(printer_id, &frame.slots).await {
                tracing::warn!(printer_id, "slot reconciliation failed: {e}");
            }
        }
    }

    /// Reconcile one printer's hardware slot readings against slots and
    /// spools. Idempotent: re-applying the same readings is a no-op.
    pub async fn reconcile_slots(
        &self,
        printer_id: i64,
        readings: &[SlotReading],
    ) -> Result<(), sqlx::Error> {
        for reading in readings {
            let Some(slot) = self.store.find_slot(printer_id, reading.slot as i64).await? else {
                // Hardware reports more trays than the printer is
                // configured with; ignore the extras.
                continue;
            };

            if let Some(rfid) = &reading.rfid {
                self.reconcile_rfid_slot(printer_id, slot.id, reading, rfid).await?;
                continue;
            }

            self.detect_drift(printer_id, &slot, reading).await?;
            self.reconcile_anonymous_slot(slot.id, reading).await?;
        }
        Ok(())
    }

    /// An RFID tag binds (or adopts) a spool, confirmed.
    async fn reconcile_rfid_slot(
        &self,
        printer_id: i64,
        slot_id: i64,
        reading: &SlotReading,
        rfid: &str,
    ) -> Result<(), sqlx::Error> {
        let spool = match self.store.find_spool_by_rfid(rfid).await? {
            Some(spool) => spool,
            None => {
                let material = reading.material.clone().unwrap_or_else(|| "PLA".to_string());
                let color_hex = reading.color_hex.clone().unwrap_or_default();
                let library_id = self
                    .store
                    .find_library_match(Some(&material), &color_hex)
                    .await?
                    .map(|entry| entry.id);
                let remaining = reading.remaining_pct.unwrap_or(100.0) / 100.0 * ADOPTED_SPOOL_GRAMS;
                let spool = self
                    .store
                    .create_spool(NewSpool {
                        library_id,
                        rfid_tag: Some(rfid.to_string()),
                        material,
                        color_hex,
                        initial_grams: ADOPTED_SPOOL_GRAMS,
                        remaining_grams: remaining,
                    })
                    .await?;
                tracing::info!(spool_id = spool.id, rfid, "adopted unknown spool from RFID report");
                self.store
                    .log_audit(
                        "spool.auto_adopt",
                        "spool",
                        spool.id,
                        Some(serde_json::json!({"rfid": rfid, "printer_id": printer_id})),
                        None,
                    )
                    .await;
                spool
            }
        };

        let _guard = self.spool_locks.acquire(spool.id).await;

        if spool.location_printer_id != Some(printer_id)
            || spool.location_slot != Some(reading.slot as i64)
        {
            // Unload whatever sat in the slot before this spool.
            if let Some(previous) = self
                .store
                .active_spool_at(printer_id, reading.slot as i64)
                .await?
                .filter(|previous| previous.id != spool.id)
            {
                self.store.move_spool_to_storage(previous.id, None).await?;
            }
            self.store
                .place_spool_on_printer(spool.id, printer_id, reading.slot as i64)
                .await?;
        }
        if let Some(pct) = reading.remaining_pct {
            self.store.set_spool_remaining_pct(spool.id, pct).await?;
        }
        self.store.bind_slot_spool(slot_id, Some(spool.id), true).await?;

        let color_hex = reading.color_hex.as_deref().unwrap_or(&spool.color_hex);
        self.store
            .update_slot_display(
                slot_id,
                reading.material.as_deref().or(Some(&spool.material)),
                Some(&colors::name_for_hex(color_hex)),
                Some(color_hex),
            )
            .await?;
        Ok(())
    }

    /// No RFID: resolve display attributes from the library, then the
    /// external catalog, then the hex decoder, leaving any spool
    /// binding unconfirmed.
    async fn reconcile_anonymous_slot(
        &self,
        slot_id: i64,
        reading: &SlotReading,
    ) -> Result<(), sqlx::Error> {
        let Some(color_hex) = reading.color_hex.as_deref() else {
            if let Some(material) = reading.material.as_deref() {
                self.store
                    .update_slot_display(slot_id, Some(material), None, None)
                    .await?;
            }
            return Ok(());
        };
        let material = reading.material.as_deref();

        if let Some(entry) = self.store.find_library_match(material, color_hex).await? {
            self.store
                .update_slot_display(
                    slot_id,
                    material.or(Some(&entry.material)),
                    Some(&entry.name),
                    Some(&entry.color_hex),
                )
                .await?;
            return Ok(());
        }

        if let Some(catalog) = &self.catalog {
            if let Some(name) = catalog.match_color(color_hex, material).await {
                self.store
                    .update_slot_display(slot_id, material, Some(&name), Some(color_hex))
                    .await?;
                return Ok(());
            }
        }

        self.store
            .update_slot_display(
                slot_id,
                material,
                Some(&colors::name_for_hex(color_hex)),
                Some(color_hex),
            )
            .await?;
        Ok(())
    }

    /// A bound spool without RFID whose reported color drifted away
    /// from its recorded color loses its confirmation.
    async fn detect_drift(
        &self,
        printer_id: i64,
        slot: &crate::db::printers::FilamentSlot,
        reading: &SlotReading,
    ) -> Result<(), sqlx::Error> {
        let Some(spool_id) = slot.assigned_spool_id else {
            return Ok(());
        };
        if !slot.spool_confirmed {
            return Ok(());
        }
        let Some(reported_hex) = reading.color_hex.as_deref() else {
            return Ok(());
        };
        let Some(spool) = self.store.find_spool(spool_id).await? else {
            return Ok(());
        };
        if spool.rfid_tag.is_some() {
            return Ok(());
        }

        let recorded_hex = match spool.library_id {
            Some(library_id) => self
                .store
                .library_entry(library_id)
                .await?
                .map(|entry| entry.color_hex)
                .unwrap_or(spool.color_hex.clone()),
            None => spool.color_hex.clone(),
        };
        let (Some(reported), Some(recorded)) =
            (colors::parse_hex(reported_hex), colors::parse_hex(&recorded_hex))
        else {
            return Ok(());
        };

        if colors::distance(reported, recorded) > DRIFT_DISTANCE {
            self.store.clear_slot_confirmation(slot.id).await?;
            self.bus.publish(Event::SpoolMismatch {
                printer_id,
                slot_number: slot.slot_number,
                spool_id,
                reported_hex: reported_hex.to_string(),
            });
            tracing::warn!(
                printer_id,
                slot = slot.slot_number,
                spool_id,
                reported_hex,
                recorded_hex,
                "slot color drifted from assigned spool"
            );
        }
        Ok(())
    }

    /// Consumption deduction on job completion. Gram amounts come from
    /// the linked model first, then the linked artifact; with neither,
    /// nothing is deducted and a warning is logged.
    pub async fn deduct_for_job(&self, job: &Job) -> Result<(), sqlx::Error> {
        let Some(printer_id) = job.printer_id else {
            tracing::warn!(job_id = job.id, "completed without a printer, skipping deduction");
            return Ok(());
        };

        let slot_grams = self.slot_grams_for(job).await?;
        if slot_grams.is_empty() {
            tracing::warn!(
                job_id = job.id,
                "no gram data on model or artifact, nothing deducted"
            );
            return Ok(());
        }

        let quantity = job.quantity.max(1) as f64;
        for (slot_number, grams) in slot_grams {
            let grams = grams * quantity;
            if grams <= 0.0 {
                continue;
            }
            let Some(spool) = self.store.active_spool_at(printer_id, slot_number).await? else {
                tracing::warn!(
                    job_id = job.id,
                    slot = slot_number,
                    "no active spool loaded, deduction skipped"
                );
                continue;
            };

            let _guard = self.spool_locks.acquire(spool.id).await;
            let note = format!("Auto-deducted on job #{} complete ({})", job.id, job.item_name);
            let Some(outcome) = self
                .store
                .deduct_spool(spool.id, grams, Some(job.id), Some(&note))
                .await?
            else {
                continue;
            };

            tracing::info!(
                job_id = job.id,
                spool_id = spool.id,
                slot = slot_number,
                deducted = outcome.deducted,
                remaining = outcome.remaining,
                "filament deducted"
            );
            if outcome.now_empty {
                self.bus.publish(Event::SpoolEmpty { spool_id: spool.id });
            } else if outcome.crossed_low {
                self.bus.publish(Event::SpoolLow {
                    spool_id: spool.id,
                    remaining_grams: outcome.remaining,
                });
            }
        }
        Ok(())
    }

    /// Per-slot grams: the linked model's requirements win over the
    /// linked artifact's slicer estimates.
    async fn slot_grams_for(&self, job: &Job) -> Result<Vec<(i64, f64)>, sqlx::Error> {
        if let Some(model_id) = job.model_id {
            if let Some(model) = self.store.find_model(model_id).await? {
                let from_model: Vec<(i64, f64)> = model
                    .requirements()
                    .into_iter()
                    .filter_map(|(slot, requirement)| requirement.grams.map(|g| (slot, g)))
                    .collect();
                if !from_model.is_empty() {
                    return Ok(from_model);
                }
            }
        }
        if let Some(artifact_id) = job.artifact_id {
            if let Some(artifact) = self.store.find_artifact(artifact_id).await? {
                let from_artifact: Vec<(i64, f64)> = artifact
                    .filament_list()
                    .into_iter()
                    .filter_map(|filament| filament.used_grams.map(|g| (filament.slot, g)))
                    .collect();
                if !from_artifact.is_empty() {
                    return Ok(from_artifact);
                }
            }
        }
        Ok(Vec::new())
    }
}

/// Thin client for the optional external filament catalog.
struct CatalogClient {
    url: String,
    http: reqwest::Client,
}

impl CatalogClient {
    fn new(url: String) -> Self {
        Self {
            url,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
        }
    }

    async fn match_color(&self, hex: &str, material: Option<&str>) -> Option<String> {
        let mut request = self
            .http
            .get(format!("{}/match", self.url.trim_end_matches('/')))
            .query(&[("hex", hex.trim_start_matches('#'))]);
        if let Some(material) = material {
            request = request.query(&[("material", material)]);
        }
        let response = request.send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body: serde_json::Value = response.json().await.ok()?;
        body.get("name").and_then(|v| v.as_str()).map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ApiType;
    use crate::db::printers::NewPrinter;
    use crate::db::spools::SpoolStatus;
    use crate::db::test_store;
    use crate::db::models::ColorRequirement;
    use std::collections::BTreeMap;

    async fn setup() -> (Store, EventBus, FilamentAccounting, i64) {
        let store = test_store().await;
        let bus = EventBus::new();
        let accounting = FilamentAccounting::new(store.clone(), bus.clone(), None);
        let printer = store
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
            .unwrap();
        (store, bus, accounting, printer.id)
    }

    fn rfid_reading(slot: u8, rfid: &str) -> SlotReading {
        SlotReading {
            slot,
            material: Some("PLA".into()),
            color_hex: Some("#FF0000".into()),
            remaining_pct: Some(80.0),
            rfid: Some(rfid.into()),
        }
    }

    #[tokio::test]
    async fn rfid_adopts_unknown_spool_confirmed() {
        let (store, _bus, accounting, printer_id) = setup().await;

        accounting
            .reconcile_slots(printer_id, &[rfid_reading(2, "TAG-ABC")])
            .await
            .unwrap();

        let spool = store.find_spool_by_rfid("TAG-ABC").await.unwrap().unwrap();
        assert!(spool.qr_code.unwrap().starts_with("SPL-"));
        assert!((spool.remaining_grams - 800.0).abs() < f64::EPSILON);
        assert_eq!(spool.location_printer_id, Some(printer_id));
        assert_eq!(spool.location_slot, Some(2));

        let slot = store.find_slot(printer_id, 2).await.unwrap().unwrap();
        assert_eq!(slot.assigned_spool_id, Some(spool.id));
        assert!(slot.spool_confirmed);
    }

    #[tokio::test]
    async fn reconciliation_is_idempotent() {
        let (store, _bus, accounting, printer_id) = setup().await;
        let readings = vec![rfid_reading(2, "TAG-ABC")];

        accounting.reconcile_slots(printer_id, &readings).await.unwrap();
        let spool_before = store.find_spool_by_rfid("TAG-ABC").await.unwrap().unwrap();
        let slot_before = store.find_slot(printer_id, 2).await.unwrap().unwrap();

        accounting.reconcile_slots(printer_id, &readings).await.unwrap();
        let spool_after = store.find_spool_by_rfid("TAG-ABC").await.unwrap().unwrap();
        let slot_after = store.find_slot(printer_id, 2).await.unwrap().unwrap();

        assert_eq!(spool_before.id, spool_after.id);
        assert_eq!(spool_before.remaining_grams, spool_after.remaining_grams);
        assert_eq!(slot_before.assigned_spool_id, slot_after.assigned_spool_id);
        assert_eq!(slot_before.spool_confirmed, slot_after.spool_confirmed);
    }

    #[tokio::test]
    async fn anonymous_slot_matches_library_then_falls_back() {
        let (store, _bus, accounting, printer_id) = setup().await;
        store
            .create_library_entry("Bambu Lab", "Matte Red", "PLA", "#DC2626", 0.025)
            .await
            .unwrap();

        let library_hit = SlotReading {
            slot: 1,
            material: Some("PLA".into()),
            color_hex: Some("#DC2626".into()),
            remaining_pct: None,
            rfid: None,
        };
        let decoder_fallback = SlotReading {
            slot: 2,
            material: Some("PETG".into()),
            color_hex: Some("#123456".into()),
            remaining_pct: None,
            rfid: None,
        };
        accounting
            .reconcile_slots(printer_id, &[library_hit, decoder_fallback])
            .await
            .unwrap();

        let slot1 = store.find_slot(printer_id, 1).await.unwrap().unwrap();
        assert_eq!(slot1.color.as_deref(), Some("Matte Red"));
        assert!(!slot1.spool_confirmed);

        let slot2 = store.find_slot(printer_id, 2).await.unwrap().unwrap();
        assert_eq!(slot2.color_hex.as_deref(), Some("#123456"));
        assert_eq!(slot2.color.as_deref(), Some("Navy"));
    }

    #[tokio::test]
    async fn drift_clears_confirmation_and_publishes() {
        let (store, bus, accounting, printer_id) = setup().await;
        let mut sub = bus.subscribe("test");

        let spool = store
            .create_spool(NewSpool {
                material: "PLA".into(),
                color_hex: "#DC2626".into(),
                initial_grams: 1000.0,
                remaining_grams: 900.0,
                ..NewSpool::default()
            })
            .await
            .unwrap();
        store.place_spool_on_printer(spool.id, printer_id, 1).await.unwrap();
        let slot = store.find_slot(printer_id, 1).await.unwrap().unwrap();
        store.bind_slot_spool(slot.id, Some(spool.id), true).await.unwrap();

        // Hardware now reports blue where red was recorded.
        let reading = SlotReading {
            slot: 1,
            material: Some("PLA".into()),
            color_hex: Some("#2563EB".into()),
            remaining_pct: None,
            rfid: None,
        };
        accounting.reconcile_slots(printer_id, &[reading]).await.unwrap();

        let slot = store.find_slot(printer_id, 1).await.unwrap().unwrap();
        assert!(!slot.spool_confirmed);
        let events = crate::bus::drain(&mut sub);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::SpoolMismatch { spool_id, .. } if *spool_id == spool.id)));
    }

    #[tokio::test]
    async fn deduction_uses_model_grams_first() {
        let (store, bus, accounting, printer_id) = setup().await;
        let mut sub = bus.subscribe("test");

        let mut requirements = BTreeMap::new();
        requirements.insert(1, ColorRequirement { color: "#DC2626".into(), grams: Some(42.5) });
        let model = store
            .create_model("Clip", 0.5, "PLA", Some(&requirements))
            .await
            .unwrap();

        let spool = store
            .create_spool(NewSpool {
                material: "PLA".into(),
                color_hex: "#DC2626".into(),
                initial_grams: 1000.0,
                remaining_grams: 500.0,
                ..NewSpool::default()
            })
            .await
            .unwrap();
        store.place_spool_on_printer(spool.id, printer_id, 1).await.unwrap();

        let job = store
            .create_job(crate::db::jobs::NewJob {
                model_id: Some(model.id),
                artifact_id: None,
                item_name: "Clip".into(),
                quantity: 1,
                priority: 3,
                material_type: "PLA".into(),
                colors: vec!["#DC2626".into()],
                duration_minutes: Some(30),
                due_date: None,
            })
            .await
            .unwrap();
        store.approve_job(job.id).await.unwrap();
        store
            .mark_job_scheduled(job.id, printer_id, chrono::Utc::now(), chrono::Utc::now())
            .await
            .unwrap();
        store.mark_job_printing(job.id).await.unwrap();
        let job = store.complete_job(job.id).await.unwrap().unwrap();

        accounting.deduct_for_job(&job).await.unwrap();

        let spool = store.find_spool(spool.id).await.unwrap().unwrap();
        assert!((spool.remaining_grams - 457.5).abs() < f64::EPSILON);
        assert_eq!(spool.status, SpoolStatus::Active);

        let usage = store.spool_usage(spool.id).await.unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].job_id, Some(job.id));
        assert!((usage[0].grams - 42.5).abs() < f64::EPSILON);

        // 457.5g is well above the 100g threshold: no low-stock event.
        let events = crate::bus::drain(&mut sub);
        assert!(!events.iter().any(|e| matches!(e, Event::SpoolLow { .. })));
    }

    #[tokio::test]
    async fn missing_gram_data_deducts_nothing() {
        let (store, _bus, accounting, printer_id) = setup().await;
        let spool = store
            .create_spool(NewSpool {
                material: "PLA".into(),
                color_hex: "#DC2626".into(),
                initial_grams: 1000.0,
                remaining_grams: 500.0,
                ..NewSpool::default()
            })
            .await
            .unwrap();
        store.place_spool_on_printer(spool.id, printer_id, 1).await.unwrap();

        let job = store
            .create_job(crate::db::jobs::NewJob {
                model_id: None,
                artifact_id: None,
                item_name: "Mystery".into(),
                quantity: 1,
                priority: 3,
                material_type: "PLA".into(),
                colors: vec![],
                duration_minutes: None,
                due_date: None,
            })
            .await
            .unwrap();
        store.approve_job(job.id).await.unwrap();
        store
            .mark_job_scheduled(job.id, printer_id, chrono::Utc::now(), chrono::Utc::now())
            .await
            .unwrap();
        store.mark_job_printing(job.id).await.unwrap();
        let job = store.complete_job(job.id).await.unwrap().unwrap();

        accounting.deduct_for_job(&job).await.unwrap();
        let spool = store.find_spool(spool.id).await.unwrap().unwrap();
        assert_eq!(spool.remaining_grams, 500.0);
        assert!(store.spool_usage(spool.id).await.unwrap().is_empty());
    }
}
