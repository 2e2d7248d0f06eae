use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{CollectionPath, DocumentId, Identity},
    protocol::StoredDocument,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub identity: Identity,
    pub is_anonymous: bool,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to an in-memory database sees its own empty schema.
        let max_connections = if is_memory_url(database_url) { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn upsert_user(&self, identity: &Identity, is_anonymous: bool) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (identity, is_anonymous) VALUES (?, ?)
             ON CONFLICT(identity) DO UPDATE SET is_anonymous = excluded.is_anonymous",
        )
        .bind(identity.as_str())
        .bind(is_anonymous)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_user(&self, identity: &Identity) -> Result<Option<StoredUser>> {
        let row = sqlx::query("SELECT identity, is_anonymous FROM users WHERE identity = ?")
            .bind(identity.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| StoredUser {
            identity: Identity(r.get::<String, _>(0)),
            is_anonymous: r.get::<bool, _>(1),
        }))
    }

    pub async fn add_document(
        &self,
        path: &CollectionPath,
        data: &Map<String, Value>,
    ) -> Result<StoredDocument> {
        let id = DocumentId(uuid::Uuid::new_v4().simple().to_string());
        let create_time = Utc::now();
        let encoded = serde_json::to_string(data).context("failed to encode document data")?;

        sqlx::query(
            "INSERT INTO documents (id, collection_path, owner_identity, data, create_time)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id.as_str())
        .bind(path.to_string())
        .bind(path.owner().as_str())
        .bind(encoded)
        .bind(create_time)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert document into {path}"))?;

        Ok(StoredDocument {
            id,
            create_time,
            data: data.clone(),
        })
    }

    /// Returns `false` when no document with `id` exists under `path`.
    pub async fn delete_document(&self, path: &CollectionPath, id: &DocumentId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE collection_path = ? AND id = ?")
            .bind(path.to_string())
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete document {id} from {path}"))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_documents(&self, path: &CollectionPath) -> Result<Vec<StoredDocument>> {
        let rows = sqlx::query(
            "SELECT id, data, create_time
             FROM documents
             WHERE collection_path = ?
             ORDER BY create_time DESC, rowid DESC",
        )
        .bind(path.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(document_from_row).collect()
    }
}

fn document_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<StoredDocument> {
    let id = DocumentId(row.get::<String, _>(0));
    let raw = row.get::<String, _>(1);
    let data = match serde_json::from_str::<Value>(&raw)
        .with_context(|| format!("document {id} holds invalid json"))?
    {
        Value::Object(map) => map,
        other => return Err(anyhow!("document {id} is not an object: {other}")),
    };
    Ok(StoredDocument {
        id,
        create_time: row.get::<DateTime<Utc>, _>(2),
        data,
    })
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
