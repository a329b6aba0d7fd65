//! Record store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{FileRepo, ModelRepo, ReleaseRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined record store trait.
#[async_trait]
pub trait RecordStore: ModelRepo + FileRepo + ReleaseRepo + Send + Sync {
    /// Create tables if needed.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check store connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based record store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    pub async fn new(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // One writer avoids "database is locked" under concurrent handlers.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use sqlx::FromRow;

    // Nested collections are stored as JSON text.

    #[derive(FromRow)]
    struct ModelRow {
        id: String,
        name: String,
        collaborators: String,
        destination_model_id: Option<String>,
    }

    impl ModelRow {
        fn into_record(self) -> MetadataResult<ModelRecord> {
            Ok(ModelRecord {
                id: self.id,
                name: self.name,
                collaborators: serde_json::from_str(&self.collaborators)?,
                mirror: MirrorSettings {
                    destination_model_id: self.destination_model_id,
                },
            })
        }
    }

    #[derive(FromRow)]
    struct FileRow {
        id: String,
        model_id: String,
        name: String,
        size: i64,
        path: String,
        scan_results: String,
        complete: bool,
    }

    impl FileRow {
        fn into_record(self) -> MetadataResult<FileRecord> {
            let size = u64::try_from(self.size).map_err(|_| {
                MetadataError::Internal(format!("negative size stored for file {}", self.id))
            })?;
            Ok(FileRecord {
                id: self.id,
                model_id: self.model_id,
                name: self.name,
                size,
                path: self.path,
                scan_results: serde_json::from_str(&self.scan_results)?,
                complete: self.complete,
            })
        }
    }

    #[derive(FromRow)]
    struct ReleaseRow {
        model_id: String,
        semver: String,
        images: String,
        file_ids: String,
    }

    impl ReleaseRow {
        fn into_record(self) -> MetadataResult<ReleaseRecord> {
            Ok(ReleaseRecord {
                model_id: self.model_id,
                semver: self.semver,
                images: serde_json::from_str(&self.images)?,
                file_ids: serde_json::from_str(&self.file_ids)?,
            })
        }
    }

    fn size_to_i64(size: u64) -> MetadataResult<i64> {
        i64::try_from(size)
            .map_err(|_| MetadataError::Internal(format!("file size {size} exceeds i64")))
    }

    #[async_trait]
    impl ModelRepo for SqliteStore {
        async fn get_model(&self, model_id: &str) -> MetadataResult<Option<ModelRecord>> {
            let row = sqlx::query_as::<_, ModelRow>("SELECT * FROM models WHERE id = ?")
                .bind(model_id)
                .fetch_optional(&self.pool)
                .await?;
            row.map(ModelRow::into_record).transpose()
        }

        async fn put_model(&self, model: &ModelRecord) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO models (id, name, collaborators, destination_model_id)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    collaborators = excluded.collaborators,
                    destination_model_id = excluded.destination_model_id
                "#,
            )
            .bind(&model.id)
            .bind(&model.name)
            .bind(serde_json::to_string(&model.collaborators)?)
            .bind(&model.mirror.destination_model_id)
            .execute(&self.pool)
            .await?;
            Ok(())
        }
    }

    #[async_trait]
    impl FileRepo for SqliteStore {
        async fn get_file(&self, file_id: &str) -> MetadataResult<Option<FileRecord>> {
            let row = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE id = ?")
                .bind(file_id)
                .fetch_optional(&self.pool)
                .await?;
            row.map(FileRow::into_record).transpose()
        }

        async fn get_file_by_path(&self, path: &str) -> MetadataResult<Option<FileRecord>> {
            let row = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE path = ?")
                .bind(path)
                .fetch_optional(&self.pool)
                .await?;
            row.map(FileRow::into_record).transpose()
        }

        async fn put_file(&self, file: &FileRecord) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO files (id, model_id, name, size, path, scan_results, complete)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    model_id = excluded.model_id,
                    name = excluded.name,
                    size = excluded.size,
                    path = excluded.path,
                    scan_results = excluded.scan_results,
                    complete = excluded.complete
                "#,
            )
            .bind(&file.id)
            .bind(&file.model_id)
            .bind(&file.name)
            .bind(size_to_i64(file.size)?)
            .bind(&file.path)
            .bind(serde_json::to_string(&file.scan_results)?)
            .bind(file.complete)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn mark_file_complete(
            &self,
            path: &str,
            model_id: &str,
            size: u64,
        ) -> MetadataResult<FileRecord> {
            let name = path.rsplit('/').next().unwrap_or(path);
            sqlx::query(
                r#"
                INSERT INTO files (id, model_id, name, size, path, scan_results, complete)
                VALUES (?, ?, ?, ?, ?, '[]', 1)
                ON CONFLICT(path) DO UPDATE SET
                    size = excluded.size,
                    complete = 1
                "#,
            )
            .bind(path)
            .bind(model_id)
            .bind(name)
            .bind(size_to_i64(size)?)
            .bind(path)
            .execute(&self.pool)
            .await?;

            self.get_file_by_path(path)
                .await?
                .ok_or_else(|| MetadataError::NotFound(format!("file at {path}")))
        }
    }

    #[async_trait]
    impl ReleaseRepo for SqliteStore {
        async fn get_release(
            &self,
            model_id: &str,
            semver: &str,
        ) -> MetadataResult<Option<ReleaseRecord>> {
            let row = sqlx::query_as::<_, ReleaseRow>(
                "SELECT * FROM releases WHERE model_id = ? AND semver = ?",
            )
            .bind(model_id)
            .bind(semver)
            .fetch_optional(&self.pool)
            .await?;
            row.map(ReleaseRow::into_record).transpose()
        }

        async fn put_release(&self, release: &ReleaseRecord) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO releases (model_id, semver, images, file_ids)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(model_id, semver) DO UPDATE SET
                    images = excluded.images,
                    file_ids = excluded.file_ids
                "#,
            )
            .bind(&release.model_id)
            .bind(&release.semver)
            .bind(serde_json::to_string(&release.images)?)
            .bind(serde_json::to_string(&release.file_ids)?)
            .execute(&self.pool)
            .await?;
            Ok(())
        }
    }
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS models (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL DEFAULT '',
    collaborators TEXT NOT NULL DEFAULT '[]',
    destination_model_id TEXT
);

CREATE TABLE IF NOT EXISTS files (
    id TEXT PRIMARY KEY,
    model_id TEXT NOT NULL,
    name TEXT NOT NULL,
    size INTEGER NOT NULL,
    path TEXT NOT NULL UNIQUE,
    scan_results TEXT NOT NULL DEFAULT '[]',
    complete INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_files_model ON files(model_id);

CREATE TABLE IF NOT EXISTS releases (
    model_id TEXT NOT NULL,
    semver TEXT NOT NULL,
    images TEXT NOT NULL DEFAULT '[]',
    file_ids TEXT NOT NULL DEFAULT '[]',
    PRIMARY KEY (model_id, semver)
);
"#;
