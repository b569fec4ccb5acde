//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS artisans (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                trade TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS inbox_items (
                id TEXT PRIMARY KEY,
                artisan_id TEXT NOT NULL REFERENCES artisans(id) ON DELETE CASCADE,
                source TEXT NOT NULL,
                source_sender TEXT,
                file_url TEXT,
                file_type TEXT NOT NULL,
                file_name TEXT,
                raw_text TEXT,
                classification TEXT,
                ai_summary TEXT,
                ai_extracted_data TEXT NOT NULL DEFAULT '{}',
                confidence REAL,
                status TEXT NOT NULL DEFAULT 'new',
                error_message TEXT,
                routed_entity_kind TEXT,
                routed_entity_id TEXT,
                routing_claim TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_inbox_items_artisan ON inbox_items(artisan_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_inbox_items_status ON inbox_items(status);

            CREATE TABLE IF NOT EXISTS clients (
                id TEXT PRIMARY KEY,
                artisan_id TEXT NOT NULL REFERENCES artisans(id) ON DELETE CASCADE,
                name TEXT,
                phone TEXT,
                email TEXT,
                address TEXT,
                notes TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_clients_artisan ON clients(artisan_id);
            CREATE INDEX IF NOT EXISTS idx_clients_phone ON clients(artisan_id, phone);
            CREATE INDEX IF NOT EXISTS idx_clients_email ON clients(artisan_id, email);

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                artisan_id TEXT NOT NULL REFERENCES artisans(id) ON DELETE CASCADE,
                client_id TEXT REFERENCES clients(id) ON DELETE SET NULL,
                title TEXT NOT NULL,
                description TEXT,
                work_type TEXT,
                materials TEXT,
                urgency TEXT,
                notes TEXT,
                status TEXT NOT NULL DEFAULT 'draft',
                source_inbox_item_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_artisan ON jobs(artisan_id);

            CREATE TABLE IF NOT EXISTS expense_invoices (
                id TEXT PRIMARY KEY,
                artisan_id TEXT NOT NULL REFERENCES artisans(id) ON DELETE CASCADE,
                supplier_name TEXT,
                invoice_number TEXT,
                amount TEXT,
                issue_date TEXT,
                status TEXT NOT NULL DEFAULT 'needs_review',
                file_url TEXT,
                source_inbox_item_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_expense_invoices_artisan ON expense_invoices(artisan_id);

            CREATE TABLE IF NOT EXISTS expenses (
                id TEXT PRIMARY KEY,
                artisan_id TEXT NOT NULL REFERENCES artisans(id) ON DELETE CASCADE,
                description TEXT NOT NULL,
                vendor TEXT,
                amount TEXT NOT NULL,
                expense_date TEXT,
                category TEXT,
                file_url TEXT,
                source_inbox_item_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_expenses_artisan ON expenses(artisan_id);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let applied = get_current_version(conn).await?;
    tracing::info!(version = applied, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
