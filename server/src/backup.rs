//! State-store snapshots via SQLite `VACUUM INTO`.

use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::bus::EventBus;
use crate::db::Store;
use crate::events::Event;

/// Snapshot the store into `target` (a file path, or a directory that
/// receives a timestamped file). Returns the written path.
pub async fn create_backup(
    store: &Store,
    bus: &EventBus,
    target: &Path,
) -> Result<PathBuf, anyhow::Error> {
    let path = if target.extension().is_some() {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        target.to_path_buf()
    } else {
        tokio::fs::create_dir_all(target).await?;
        target.join(format!("printfarm-{}.db", Utc::now().format("%Y%m%d-%H%M%S")))
    };

    let escaped = path.to_string_lossy().replace('\'', "''");
    sqlx::query(&format!("VACUUM INTO '{escaped}'"))
        .execute(store.pool())
        .await?;

    store
        .log_audit(
            "backup.create",
            "backup",
            path.display(),
            None,
            None,
        )
        .await;
    bus.publish(Event::BackupCompleted { path: path.display().to_string() });
    tracing::info!(path = %path.display(), "backup written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_store;

    #[tokio::test]
    async fn snapshot_lands_in_directory_with_timestamped_name() {
        let store = test_store().await;
        let bus = EventBus::new();
        let mut sub = bus.subscribe("test");
        let dir = tempfile::tempdir().unwrap();

        let path = create_backup(&store, &bus, dir.path()).await.unwrap();
        assert!(path.exists());
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("printfarm-"));

        // The snapshot is a usable database.
        let pool = crate::db::connect(&format!("sqlite://{}", path.display()))
            .await
            .unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM printers")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);

        let events = crate::bus::drain(&mut sub);
        assert!(events.iter().any(|e| matches!(e, Event::BackupCompleted { .. })));
    }

    #[tokio::test]
    async fn explicit_file_target_is_respected() {
        let store = test_store().await;
        let bus = EventBus::new();
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("snap.db");

        let path = create_backup(&store, &bus, &target).await.unwrap();
        assert_eq!(path, target);
        assert!(path.exists());
    }
}
