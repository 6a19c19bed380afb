use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::Store;

/// Per-slot color requirement on a model: which color a slot wants and
/// how many grams a print consumes from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorRequirement {
    pub color: String,
    pub grams: Option<f64>,
}

/// A printable item definition.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Model {
    pub id: i64,
    pub name: String,
    pub build_time_hours: f64,
    pub default_filament_type: String,
    /// JSON map `slot_1..slot_n` -> [`ColorRequirement`].
    pub color_requirements: Option<String>,
    pub thumbnail_png: Option<String>,
    pub artifact_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    /// Parsed color requirements keyed by 1-based slot number. Sorted
    /// so deduction and scheduling iterate deterministically.
    pub fn requirements(&self) -> BTreeMap<i64, ColorRequirement> {
        let Some(raw) = &self.color_requirements else {
            return BTreeMap::new();
        };
        let Ok(parsed) = serde_json::from_str::<BTreeMap<String, ColorRequirement>>(raw) else {
            return BTreeMap::new();
        };
        parsed
            .into_iter()
            .filter_map(|(key, requirement)| {
                key.strip_prefix("slot_")
                    .and_then(|n| n.parse::<i64>().ok())
                    .map(|slot| (slot, requirement))
            })
            .collect()
    }
}

/// One filament consumed by an artifact, in artifact slot order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactFilament {
    pub slot: i64,
    pub material: Option<String>,
    pub color_hex: Option<String>,
    pub used_grams: Option<f64>,
    pub used_meters: Option<f64>,
}

/// An uploaded sliced file plus its parsed metadata.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Artifact {
    pub id: i64,
    pub file_id: String,
    pub file_name: String,
    pub file_path: String,
    pub size_bytes: i64,
    pub content_hash: String,
    pub est_print_seconds: Option<i64>,
    pub total_grams: Option<f64>,
    /// JSON array of [`ArtifactFilament`].
    pub filaments: Option<String>,
    pub thumbnail_png: Option<String>,
    /// Comma-separated printer model compatibility tags.
    pub printer_models: Option<String>,
    pub bed_width_mm: Option<f64>,
    pub bed_depth_mm: Option<f64>,
    pub supports_used: bool,
    pub model_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn filament_list(&self) -> Vec<ArtifactFilament> {
        self.filaments
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }

    pub fn compatible_models(&self) -> Vec<String> {
        self.printer_models
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|tag| !tag.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewArtifact {
    pub file_id: String,
    pub file_name: String,
    pub file_path: String,
    pub size_bytes: i64,
    pub content_hash: String,
    pub est_print_seconds: Option<i64>,
    pub total_grams: Option<f64>,
    pub filaments: Vec<ArtifactFilament>,
    pub thumbnail_png: Option<String>,
    pub printer_models: Option<String>,
    pub bed_width_mm: Option<f64>,
    pub bed_depth_mm: Option<f64>,
    pub supports_used: bool,
}

impl Store {
    pub async fn create_model(
        &self,
        name: &str,
        build_time_hours: f64,
        default_filament_type: &str,
        color_requirements: Option<&BTreeMap<i64, ColorRequirement>>,
    ) -> Result<Model, sqlx::Error> {
        let now = Utc::now();
        let requirements_json = color_requirements.map(|map| {
            let keyed: BTreeMap<String, &ColorRequirement> = map
                .iter()
                .map(|(slot, requirement)| (format!("slot_{slot}"), requirement))
                .collect();
            serde_json::to_string(&keyed).unwrap_or_default()
        });
        sqlx::query_as::<_, Model>(
            r#"
            INSERT INTO models (name, build_time_hours, default_filament_type,
                                color_requirements, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(build_time_hours)
        .bind(default_filament_type)
        .bind(requirements_json)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool())
        .await
    }

    pub async fn find_model(&self, id: i64) -> Result<Option<Model>, sqlx::Error> {
        sqlx::query_as::<_, Model>("SELECT * FROM models WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
    }

    /// Delete a model unless a non-terminal job still references it.
    pub async fn delete_model(&self, id: i64) -> Result<bool, sqlx::Error> {
        let open_jobs: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE model_id = ?
              AND status IN ('submitted', 'pending', 'scheduled', 'printing')
            "#,
        )
        .bind(id)
        .fetch_one(self.pool())
        .await?;
        if open_jobs > 0 {
            return Ok(false);
        }
        sqlx::query("DELETE FROM models WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(true)
    }

    pub async fn link_model_artifact(&self, model_id: i64, artifact_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE models SET artifact_id = ?, updated_at = ? WHERE id = ?")
            .bind(artifact_id)
            .bind(Utc::now())
            .bind(model_id)
            .execute(self.pool())
            .await?;
        sqlx::query("UPDATE artifacts SET model_id = ? WHERE id = ?")
            .bind(model_id)
            .bind(artifact_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn create_artifact(&self, input: NewArtifact) -> Result<Artifact, sqlx::Error> {
        let filaments_json = serde_json::to_string(&input.filaments).unwrap_or_default();
        sqlx::query_as::<_, Artifact>(
            r#"
            INSERT INTO artifacts (file_id, file_name, file_path, size_bytes, content_hash,
                                   est_print_seconds, total_grams, filaments, thumbnail_png,
                                   printer_models, bed_width_mm, bed_depth_mm, supports_used,
                                   created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&input.file_id)
        .bind(&input.file_name)
        .bind(&input.file_path)
        .bind(input.size_bytes)
        .bind(&input.content_hash)
        .bind(input.est_print_seconds)
        .bind(input.total_grams)
        .bind(&filaments_json)
        .bind(&input.thumbnail_png)
        .bind(&input.printer_models)
        .bind(input.bed_width_mm)
        .bind(input.bed_depth_mm)
        .bind(input.supports_used)
        .bind(Utc::now())
        .fetch_one(self.pool())
        .await
    }

    pub async fn find_artifact(&self, id: i64) -> Result<Option<Artifact>, sqlx::Error> {
        sqlx::query_as::<_, Artifact>("SELECT * FROM artifacts WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
    }

    /// Duplicate detection by content hash.
    pub async fn find_artifact_by_hash(&self, hash: &str) -> Result<Option<Artifact>, sqlx::Error> {
        sqlx::query_as::<_, Artifact>("SELECT * FROM artifacts WHERE content_hash = ? LIMIT 1")
            .bind(hash)
            .fetch_optional(self.pool())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_store;

    #[tokio::test]
    async fn requirements_round_trip_sorted() {
        let store = test_store().await;
        let mut requirements = BTreeMap::new();
        requirements.insert(2, ColorRequirement { color: "#1A1A1A".into(), grams: Some(12.0) });
        requirements.insert(1, ColorRequirement { color: "#DC2626".into(), grams: Some(42.5) });

        let model = store
            .create_model("Cable Clip", 0.5, "PLA", Some(&requirements))
            .await
            .unwrap();

        let parsed = model.requirements();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[&1].color, "#DC2626");
        assert_eq!(parsed[&1].grams, Some(42.5));
        assert_eq!(parsed.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn malformed_requirements_parse_to_empty() {
        let store = test_store().await;
        let model = store.create_model("Plain", 1.0, "PLA", None).await.unwrap();
        assert!(model.requirements().is_empty());

        sqlx::query("UPDATE models SET color_requirements = 'not json' WHERE id = ?")
            .bind(model.id)
            .execute(store.pool())
            .await
            .unwrap();
        let model = store.find_model(model.id).await.unwrap().unwrap();
        assert!(model.requirements().is_empty());
    }

    #[tokio::test]
    async fn artifact_filaments_and_compat_parse() {
        let store = test_store().await;
        let artifact = store
            .create_artifact(NewArtifact {
                file_id: "abc123".into(),
                file_name: "clip.3mf".into(),
                file_path: "/data/print_files/abc123_clip.3mf".into(),
                size_bytes: 2048,
                content_hash: "deadbeef".into(),
                filaments: vec![ArtifactFilament {
                    slot: 1,
                    material: Some("PLA".into()),
                    color_hex: Some("#DC2626".into()),
                    used_grams: Some(17.3),
                    used_meters: Some(5.8),
                }],
                printer_models: Some("X1C, P1S".into()),
                ..NewArtifact::default()
            })
            .await
            .unwrap();

        let filaments = artifact.filament_list();
        assert_eq!(filaments.len(), 1);
        assert_eq!(filaments[0].used_grams, Some(17.3));
        assert_eq!(artifact.compatible_models(), vec!["X1C", "P1S"]);

        let duplicate = store.find_artifact_by_hash("deadbeef").await.unwrap();
        assert_eq!(duplicate.unwrap().id, artifact.id);
    }

    #[tokio::test]
    async fn model_delete_guarded_by_open_jobs() {
        let store = test_store().await;
        let model = store.create_model("Clip", 0.5, "PLA", None).await.unwrap();

        sqlx::query(
            "INSERT INTO jobs (item_name, status, model_id, created_at, updated_at)
             VALUES ('clip', 'pending', ?, ?, ?)",
        )
        .bind(model.id)
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(store.pool())
        .await
        .unwrap();

        assert!(!store.delete_model(model.id).await.unwrap());
        sqlx::query("UPDATE jobs SET status = 'cancelled'")
            .execute(store.pool())
            .await
            .unwrap();
        assert!(store.delete_model(model.id).await.unwrap());
    }
}
