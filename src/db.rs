use std::path::Path;
use std::sync::Arc;

use tracing::info;
use turso::{Builder, Connection, Database, Row};

use crate::error::ChatError;

/// Open the database at `path` and create all tables.
///
/// The handle is shared by the stores that need durability (daily ledger,
/// routing settings, error log, admin sessions); each store opens its own
/// connections from it.
pub async fn open(path: &Path) -> Result<Arc<Database>, ChatError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ChatError::Database(format!("Failed to create DB directory: {e}")))?;
    }

    let path_str = path.to_str().unwrap_or("folio-chat.db");
    let db = Builder::new_local(path_str)
        .build()
        .await
        .map_err(|e| ChatError::Database(format!("Failed to open database: {e}")))?;

    create_tables(&db).await?;
    info!("Database initialized at {}", path_str);
    Ok(Arc::new(db))
}

/// Throwaway in-memory database for tests.
pub async fn open_in_memory() -> Result<Arc<Database>, ChatError> {
    let db = Builder::new_local(":memory:")
        .build()
        .await
        .map_err(|e| ChatError::Database(format!("Failed to open database: {e}")))?;
    create_tables(&db).await?;
    Ok(Arc::new(db))
}

pub fn connect(db: &Database) -> Result<Connection, ChatError> {
    db.connect()
        .map_err(|e| ChatError::Database(format!("Failed to get connection: {e}")))
}

async fn create_tables(db: &Database) -> Result<(), ChatError> {
    let conn = db
        .connect()
        .map_err(|e| ChatError::Database(format!("Failed to connect: {e}")))?;

    // One row per (reference-timezone day, provider); incremented atomically
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS daily_usage (
            day TEXT NOT NULL,
            provider TEXT NOT NULL,
            requests INTEGER NOT NULL DEFAULT 0,
            tokens_in INTEGER NOT NULL DEFAULT 0,
            tokens_out INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (day, provider)
        )
        "#,
        (),
    )
    .await
    .map_err(|e| ChatError::Database(format!("Failed to create daily_usage table: {e}")))?;

    // Singleton row (id = 1): preferred provider + JSON fallback order
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS routing_settings (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            preferred TEXT NOT NULL,
            fallback_order TEXT NOT NULL
        )
        "#,
        (),
    )
    .await
    .map_err(|e| ChatError::Database(format!("Failed to create routing_settings table: {e}")))?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS provider_errors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            provider TEXT NOT NULL,
            error_type TEXT NOT NULL,
            message TEXT NOT NULL,
            fallback_used TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
        (),
    )
    .await
    .map_err(|e| ChatError::Database(format!("Failed to create provider_errors table: {e}")))?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS admin_sessions (
            token TEXT PRIMARY KEY,
            expires_at INTEGER NOT NULL
        )
        "#,
        (),
    )
    .await
    .map_err(|e| ChatError::Database(format!("Failed to create admin_sessions table: {e}")))?;

    Ok(())
}

// --- Row helpers ---

pub fn get_u64(row: &Row, idx: usize) -> u64 {
    row.get::<i64>(idx).unwrap_or(0).max(0) as u64
}

pub fn get_string(row: &Row, idx: usize) -> String {
    row.get::<String>(idx).unwrap_or_default()
}

pub fn opt_string(row: &Row, idx: usize) -> Option<String> {
    row.get::<Option<String>>(idx).ok().flatten()
}
