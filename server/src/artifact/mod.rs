//! Uploaded artifact handling: filename sanitization, size and
//! zip-bomb guards, 3mf metadata extraction, content hashing, and the
//! on-disk `print_files/` layout.

use std::io::Read;
use std::path::{Path, PathBuf};

use base64::Engine;
use quick_xml::events::Event as XmlEvent;
use quick_xml::Reader;
use sha2::{Digest, Sha256};

use crate::db::models::ArtifactFilament;
use crate::error::ArtifactError;

/// Upload cap for any artifact.
pub const MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;
/// Total uncompressed size a 3mf may expand to.
pub const MAX_UNCOMPRESSED_BYTES: u64 = 500 * 1024 * 1024;

/// Metadata pulled out of a sliced file.
#[derive(Debug, Clone, Default)]
pub struct ParsedArtifact {
    pub est_print_seconds: Option<i64>,
    pub total_grams: Option<f64>,
    pub filaments: Vec<ArtifactFilament>,
    pub thumbnail_png: Option<String>,
    pub printer_models: Option<String>,
    pub bed_width_mm: Option<f64>,
    pub bed_depth_mm: Option<f64>,
    pub supports_used: bool,
}

/// Keep `[A-Za-z0-9._-]`, replace the rest with `_`. Traversal and
/// absolute paths are rejected outright.
pub fn sanitize_file_name(raw: &str) -> Result<String, ArtifactError> {
    if raw.is_empty() || raw.contains("..") || raw.starts_with('/') || raw.starts_with('\\') {
        return Err(ArtifactError::UnsafeName(raw.to_string()));
    }
    let sanitized: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.chars().all(|c| matches!(c, '.' | '_')) {
        return Err(ArtifactError::UnsafeName(raw.to_string()));
    }
    Ok(sanitized)
}

pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Validate size limits and parse by extension. `.3mf` gets the full
/// metadata parse; gcode variants are opaque, size-checked bytes.
pub fn parse_artifact(file_name: &str, bytes: &[u8]) -> Result<ParsedArtifact, ArtifactError> {
    if bytes.len() as u64 > MAX_UPLOAD_BYTES {
        return Err(ArtifactError::Oversized {
            limit: MAX_UPLOAD_BYTES,
            actual: bytes.len() as u64,
        });
    }
    let lower = file_name.to_ascii_lowercase();
    if lower.ends_with(".3mf") {
        parse_threemf(bytes)
    } else if lower.ends_with(".gcode") || lower.ends_with(".bgcode") {
        Ok(ParsedArtifact::default())
    } else {
        let extension = Path::new(&lower)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_string();
        Err(ArtifactError::UnsupportedExtension(extension))
    }
}

fn parse_threemf(bytes: &[u8]) -> Result<ParsedArtifact, ArtifactError> {
    let cursor = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(cursor)
        .map_err(|e| ArtifactError::Parse(format!("bad zip structure: {e}")))?;

    // Zip-bomb guard before touching any entry contents.
    let mut total: u64 = 0;
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .map_err(|e| ArtifactError::Parse(format!("bad zip entry: {e}")))?;
        total = total.saturating_add(entry.size());
    }
    if total > MAX_UNCOMPRESSED_BYTES {
        return Err(ArtifactError::ZipBomb { total, limit: MAX_UNCOMPRESSED_BYTES });
    }

    let mut parsed = ParsedArtifact::default();

    if let Some(slice_info) = read_entry(&mut archive, "Metadata/slice_info.config")? {
        parse_slice_info(&slice_info, &mut parsed)?;
    }
    if let Some(settings) = read_entry(&mut archive, "Metadata/project_settings.config")? {
        parse_project_settings(&settings, &mut parsed);
    }
    if let Some(thumbnail) = read_binary_entry(&mut archive, "Metadata/plate_1.png")? {
        parsed.thumbnail_png =
            Some(base64::engine::general_purpose::STANDARD.encode(thumbnail));
    }

    Ok(parsed)
}

fn read_entry(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> Result<Option<String>, ArtifactError> {
    match archive.by_name(name) {
        Ok(mut entry) => {
            let mut content = String::new();
            entry
                .read_to_string(&mut content)
                .map_err(|e| ArtifactError::Parse(format!("unreadable {name}: {e}")))?;
            Ok(Some(content))
        }
        Err(zip::result::ZipError::FileNotFound) => Ok(None),
        Err(e) => Err(ArtifactError::Parse(format!("bad zip entry {name}: {e}"))),
    }
}

fn read_binary_entry(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> Result<Option<Vec<u8>>, ArtifactError> {
    match archive.by_name(name) {
        Ok(mut entry) => {
            let mut content = Vec::new();
            entry
                .read_to_end(&mut content)
                .map_err(|e| ArtifactError::Parse(format!("unreadable {name}: {e}")))?;
            Ok(Some(content))
        }
        Err(zip::result::ZipError::FileNotFound) => Ok(None),
        Err(e) => Err(ArtifactError::Parse(format!("bad zip entry {name}: {e}"))),
    }
}

/// `slice_info.config`: plate metadata key/value pairs plus one
/// `<filament>` element per used slot.
fn parse_slice_info(xml: &str, parsed: &mut ParsedArtifact) -> Result<(), ArtifactError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buffer = Vec::new();

    loop {
        match reader.read_event_into(&mut buffer) {
            Ok(XmlEvent::Start(element)) | Ok(XmlEvent::Empty(element)) => {
                match element.name().as_ref() {
                    b"metadata" => {
                        let (mut key, mut value) = (None, None);
                        for attribute in element.attributes().flatten() {
                            let attr_value =
                                String::from_utf8_lossy(&attribute.value).to_string();
                            match attribute.key.as_ref() {
                                b"key" => key = Some(attr_value),
                                b"value" => value = Some(attr_value),
                                _ => {}
                            }
                        }
                        if let (Some(key), Some(value)) = (key, value) {
                            match key.as_str() {
                                "prediction" => {
                                    parsed.est_print_seconds = value.parse().ok();
                                }
                                "weight" => parsed.total_grams = value.parse().ok(),
                                "support_used" => parsed.supports_used = value == "true",
                                _ => {}
                            }
                        }
                    }
                    b"filament" => {
                        let mut filament = ArtifactFilament {
                            slot: 0,
                            material: None,
                            color_hex: None,
                            used_grams: None,
                            used_meters: None,
                        };
                        for attribute in element.attributes().flatten() {
                            let attr_value =
                                String::from_utf8_lossy(&attribute.value).to_string();
                            match attribute.key.as_ref() {
                                b"id" => filament.slot = attr_value.parse().unwrap_or(0),
                                b"type" => filament.material = Some(attr_value),
                                b"color" => {
                                    filament.color_hex = Some(attr_value.to_uppercase())
                                }
                                b"used_g" => filament.used_grams = attr_value.parse().ok(),
                                b"used_m" => filament.used_meters = attr_value.parse().ok(),
                                _ => {}
                            }
                        }
                        if filament.slot > 0 {
                            parsed.filaments.push(filament);
                        }
                    }
                    _ => {}
                }
            }
            Ok(XmlEvent::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(ArtifactError::Parse(format!("slice info xml: {e}"))),
        }
        buffer.clear();
    }
    parsed.filaments.sort_by_key(|f| f.slot);
    Ok(())
}

/// `project_settings.config` is JSON carrying the target printer model
/// and bed geometry.
fn parse_project_settings(json: &str, parsed: &mut ParsedArtifact) {
    let Ok(settings) = serde_json::from_str::<serde_json::Value>(json) else {
        return;
    };
    parsed.printer_models = settings
        .get("printer_model")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    // printable_area is corner points like "256x256".
    if let Some(corners) = settings.get("printable_area").and_then(|v| v.as_array()) {
        let (mut max_x, mut max_y) = (0.0f64, 0.0f64);
        for corner in corners.iter().filter_map(|v| v.as_str()) {
            if let Some((x, y)) = corner.split_once('x') {
                if let (Ok(x), Ok(y)) = (x.parse::<f64>(), y.parse::<f64>()) {
                    max_x = max_x.max(x);
                    max_y = max_y.max(y);
                }
            }
        }
        if max_x > 0.0 && max_y > 0.0 {
            parsed.bed_width_mm = Some(max_x);
            parsed.bed_depth_mm = Some(max_y);
        }
    }
}

/// Full ingest path for an uploaded artifact: sanitize, guard sizes,
/// parse metadata, dedupe by content hash, persist bytes, insert the
/// store row. Returns the existing row when the same content was
/// uploaded before.
pub async fn ingest(
    store: &crate::db::Store,
    print_files_dir: &Path,
    original_name: &str,
    bytes: &[u8],
) -> Result<(crate::db::models::Artifact, bool), IngestError> {
    let sanitized = sanitize_file_name(original_name)?;
    let parsed = parse_artifact(&sanitized, bytes)?;

    let hash = content_hash(bytes);
    if let Some(existing) = store.find_artifact_by_hash(&hash).await? {
        return Ok((existing, true));
    }

    let file_id = uuid::Uuid::new_v4().simple().to_string();
    let path = store_artifact_bytes(print_files_dir, &file_id, &sanitized, bytes)?;

    let artifact = store
        .create_artifact(crate::db::models::NewArtifact {
            file_id,
            file_name: sanitized,
            file_path: path.display().to_string(),
            size_bytes: bytes.len() as i64,
            content_hash: hash,
            est_print_seconds: parsed.est_print_seconds,
            total_grams: parsed.total_grams,
            filaments: parsed.filaments,
            thumbnail_png: parsed.thumbnail_png,
            printer_models: parsed.printer_models,
            bed_width_mm: parsed.bed_width_mm,
            bed_depth_mm: parsed.bed_depth_mm,
            supports_used: parsed.supports_used,
        })
        .await?;
    Ok((artifact, false))
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Store(#[from] sqlx::Error),
}

/// Persist artifact bytes under `<data>/print_files/<file_id>_<name>`.
pub fn store_artifact_bytes(
    print_files_dir: &Path,
    file_id: &str,
    sanitized_name: &str,
    bytes: &[u8],
) -> Result<PathBuf, ArtifactError> {
    std::fs::create_dir_all(print_files_dir).map_err(|e| ArtifactError::Io {
        path: print_files_dir.to_path_buf(),
        source: e,
    })?;
    let path = print_files_dir.join(format!("{file_id}_{sanitized_name}"));
    std::fs::write(&path, bytes).map_err(|e| ArtifactError::Io { path: path.clone(), source: e })?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn build_threemf(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            for (name, content) in entries {
                writer.start_file(*name, SimpleFileOptions::default()).unwrap();
                writer.write_all(content).unwrap();
            }
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    const SLICE_INFO: &str = r##"<?xml version="1.0" encoding="UTF-8"?>
<config>
  <plate>
    <metadata key="index" value="1"/>
    <metadata key="prediction" value="5381"/>
    <metadata key="weight" value="34.33"/>
    <metadata key="support_used" value="true"/>
    <filament id="1" type="PLA" color="#ff0000" used_m="3.71" used_g="11.07"/>
    <filament id="2" type="PLA" color="#1a1a1a" used_m="7.80" used_g="23.26"/>
  </plate>
</config>"##;

    const PROJECT_SETTINGS: &str = r#"{
  "printer_model": "Bambu Lab X1 Carbon",
  "printable_area": ["0x0", "256x0", "256x256", "0x256"]
}"#;

    #[test]
    fn sanitizes_names() {
        assert_eq!(sanitize_file_name("bracket v2 (final).3mf").unwrap(), "bracket_v2__final_.3mf");
        assert_eq!(sanitize_file_name("clip.gcode").unwrap(), "clip.gcode");
        assert!(sanitize_file_name("../../etc/passwd").is_err());
        assert!(sanitize_file_name("/absolute.3mf").is_err());
        assert!(sanitize_file_name("").is_err());
    }

    #[test]
    fn parses_threemf_metadata() {
        let bytes = build_threemf(&[
            ("Metadata/slice_info.config", SLICE_INFO.as_bytes()),
            ("Metadata/project_settings.config", PROJECT_SETTINGS.as_bytes()),
            ("Metadata/plate_1.png", b"\x89PNG fake"),
        ]);
        let parsed = parse_artifact("clip.3mf", &bytes).unwrap();

        assert_eq!(parsed.est_print_seconds, Some(5381));
        assert_eq!(parsed.total_grams, Some(34.33));
        assert!(parsed.supports_used);
        assert_eq!(parsed.filaments.len(), 2);
        assert_eq!(parsed.filaments[0].slot, 1);
        assert_eq!(parsed.filaments[0].color_hex.as_deref(), Some("#FF0000"));
        assert_eq!(parsed.filaments[1].used_grams, Some(23.26));
        assert_eq!(parsed.printer_models.as_deref(), Some("Bambu Lab X1 Carbon"));
        assert_eq!(parsed.bed_width_mm, Some(256.0));
        assert_eq!(parsed.bed_depth_mm, Some(256.0));
        assert!(parsed.thumbnail_png.is_some());
    }

    #[test]
    fn gcode_is_opaque() {
        let parsed = parse_artifact("part.gcode", b"G28\nG1 X10\n").unwrap();
        assert_eq!(parsed.est_print_seconds, None);
        assert!(parsed.filaments.is_empty());
    }

    #[test]
    fn rejects_unknown_extensions_and_bad_zip() {
        assert!(matches!(
            parse_artifact("model.stl", b"solid"),
            Err(ArtifactError::UnsupportedExtension(_))
        ));
        assert!(matches!(
            parse_artifact("broken.3mf", b"not a zip"),
            Err(ArtifactError::Parse(_))
        ));
    }

    #[test]
    fn content_hash_is_stable() {
        assert_eq!(content_hash(b"abc"), content_hash(b"abc"));
        assert_ne!(content_hash(b"abc"), content_hash(b"abd"));
        assert_eq!(content_hash(b"abc").len(), 64);
    }

    #[tokio::test]
    async fn ingest_round_trips_and_dedupes() {
        let store = crate::db::test_store().await;
        let dir = tempfile::tempdir().unwrap();
        let bytes = build_threemf(&[("Metadata/slice_info.config", SLICE_INFO.as_bytes())]);

        let (artifact, duplicate) = ingest(&store, dir.path(), "clip v2.3mf", &bytes)
            .await
            .unwrap();
        assert!(!duplicate);
        assert_eq!(artifact.file_name, "clip_v2.3mf");
        assert_eq!(artifact.est_print_seconds, Some(5381));
        assert!(std::path::Path::new(&artifact.file_path).exists());

        // Same bytes under another name resolve to the existing row.
        let (again, duplicate) = ingest(&store, dir.path(), "renamed.3mf", &bytes)
            .await
            .unwrap();
        assert!(duplicate);
        assert_eq!(again.id, artifact.id);
    }

    #[test]
    fn stores_bytes_under_print_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_artifact_bytes(
            &dir.path().join("print_files"),
            "abc123",
            "clip.3mf",
            b"payload",
        )
        .unwrap();
        assert!(path.ends_with("abc123_clip.3mf"));
        assert_eq!(std::fs::read(path).unwrap(), b"payload");
    }
}
