pub mod alerts;
pub mod jobs;
mod migrations;
pub mod models;
pub mod printers;
pub mod prints;
pub mod spools;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::crypto::SecretCipher;

/// Open the SQLite pool, creating the database file if needed.
pub async fn connect(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
    SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
}

/// Apply forward-only migrations guarded by `PRAGMA user_version`.
pub async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let current: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await?;

    for (index, batch) in migrations::MIGRATIONS.iter().enumerate() {
        let version = (index + 1) as i64;
        if version <= current {
            continue;
        }
        let mut tx = pool.begin().await?;
        for statement in batch.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        sqlx::query(&format!("PRAGMA user_version = {version}"))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::info!(version, "applied schema migration");
    }
    Ok(())
}

/// Durable store handle: pool plus the secret-column cipher. Cheap to
/// clone; all subsystem queries hang off this type.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    cipher: SecretCipher,
}

impl Store {
    pub fn new(pool: SqlitePool, cipher: SecretCipher) -> Self {
        Self { pool, cipher }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn cipher(&self) -> &SecretCipher {
        &self.cipher
    }
}

#[cfg(test)]
pub(crate) async fn test_store() -> Store {
    use base64::Engine;

    // A single never-idle connection: each pooled connection would
    // otherwise open its own private in-memory database.
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .expect("in-memory options")
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .expect("in-memory pool");
    migrate(&pool).await.expect("migrations apply");
    let key = base64::engine::general_purpose::STANDARD.encode([9u8; 32]);
    Store::new(pool, SecretCipher::from_base64_key(&key).expect("test key"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_apply_cleanly_and_are_idempotent() {
        let store = test_store().await;
        migrate(store.pool()).await.unwrap();

        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(version, migrations::MIGRATIONS.len() as i64);
    }
}
