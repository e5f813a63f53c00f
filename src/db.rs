//! SQLite persistence layer for the sync engine.
//!
//! Owns the connection state, schema migrations, and local settings helpers.
//! One database file under the data directory holds orders, order items, the
//! outbound sync queue, and device-local settings.

use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::SyncError;

const DB_FILE_NAME: &str = "dinesync.db";

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i64 = 3;

/// Shared database handle. All access serializes through the mutex; WAL mode
/// keeps readers cheap enough that one connection suffices for a terminal.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Initialize the database at `{data_dir}/dinesync.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas, and
/// runs any pending migrations. On corruption or open failure, the broken
/// file is moved aside and the open is retried once with a fresh database.
pub fn init(data_dir: &Path) -> Result<DbState, SyncError> {
    fs::create_dir_all(data_dir)
        .map_err(|e| SyncError::persistence(format!("Failed to create data dir: {e}")))?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            error!(error = %first_err, "Database open failed, quarantining and retrying once");
            quarantine_db(&db_path);
            open_and_configure(&db_path)
                .map_err(|e| SyncError::persistence(format!("Database open failed after retry: {e}")))?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

fn open_and_configure(db_path: &Path) -> Result<Connection, SyncError> {
    let conn = Connection::open(db_path)
        .map_err(|e| SyncError::persistence(format!("Failed to open database: {e}")))?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| SyncError::persistence(format!("Failed to configure connection: {e}")))?;
    Ok(conn)
}

/// Move a broken database file (and its WAL/SHM siblings) out of the way,
/// keeping the main file for forensics.
fn quarantine_db(db_path: &Path) {
    if !db_path.exists() {
        return;
    }
    let backup = db_path.with_extension(format!(
        "corrupt-{}",
        chrono::Utc::now().format("%Y%m%d%H%M%S")
    ));
    match fs::rename(db_path, &backup) {
        Ok(()) => warn!(backup = %backup.display(), "Corrupt database moved aside"),
        Err(e) => warn!(error = %e, "Could not move corrupt database aside"),
    }
    let _ = fs::remove_file(db_path.with_extension("db-wal"));
    let _ = fs::remove_file(db_path.with_extension("db-shm"));
}

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

fn run_migrations(conn: &Connection) -> Result<(), SyncError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
        [],
    )?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        return Ok(());
    }
    info!(from = current, to = CURRENT_SCHEMA_VERSION, "Migrating database schema");

    if current < 1 {
        migrate_v1(conn)?;
        record_version(conn, 1)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
        record_version(conn, 2)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
        record_version(conn, 3)?;
    }
    Ok(())
}

fn record_version(conn: &Connection, version: i64) -> Result<(), SyncError> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    info!(version, "Schema migration applied");
    Ok(())
}

/// Core tables: orders, order items, the outbound sync queue, and local
/// settings (device-scoped key/value, also backing the order number counter).
fn migrate_v1(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            order_number TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            branch_id TEXT,
            table_number TEXT,
            customer_name TEXT,
            order_type TEXT NOT NULL DEFAULT 'dine_in',
            status TEXT NOT NULL DEFAULT 'pending',
            payment_status TEXT NOT NULL DEFAULT 'pending',
            subtotal REAL NOT NULL DEFAULT 0,
            discount_amount REAL NOT NULL DEFAULT 0,
            tax_amount REAL NOT NULL DEFAULT 0,
            delivery_fee REAL NOT NULL DEFAULT 0,
            total_amount REAL NOT NULL DEFAULT 0,
            special_instructions TEXT,
            order_date TEXT NOT NULL DEFAULT (datetime('now')),
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            sync_status TEXT NOT NULL DEFAULT 'pending',
            remote_id TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_orders_tenant ON orders(tenant_id);
        CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
        CREATE INDEX IF NOT EXISTS idx_orders_sync_status ON orders(sync_status);
        CREATE INDEX IF NOT EXISTS idx_orders_order_date ON orders(order_date);

        CREATE TABLE IF NOT EXISTS order_items (
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
            food_item_id TEXT,
            buffet_id TEXT,
            combo_meal_id TEXT,
            name TEXT NOT NULL,
            quantity INTEGER NOT NULL DEFAULT 1,
            unit_price REAL NOT NULL DEFAULT 0,
            subtotal REAL NOT NULL DEFAULT 0,
            variation TEXT,
            addons TEXT NOT NULL DEFAULT '[]',
            special_instructions TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_order_items_order ON order_items(order_id);
        CREATE INDEX IF NOT EXISTS idx_order_items_status ON order_items(status);

        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            payload TEXT NOT NULL,
            idempotency_key TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 5,
            last_error TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            synced_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_entity ON sync_queue(entity_type, entity_id);

        CREATE TABLE IF NOT EXISTS local_settings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            category TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(category, key)
        );",
    )?;
    Ok(())
}

/// Soft deletion for orders plus the per-tenant business key constraint.
fn migrate_v2(conn: &Connection) -> Result<(), SyncError> {
    if !column_exists(conn, "orders", "deleted_at")? {
        conn.execute("ALTER TABLE orders ADD COLUMN deleted_at TEXT", [])?;
    }
    conn.execute_batch(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_orders_tenant_number
             ON orders(tenant_id, order_number);
         CREATE INDEX IF NOT EXISTS idx_orders_branch ON orders(branch_id);",
    )?;
    Ok(())
}

/// Retry pacing for the sync queue: bounded per-entry backoff instead of
/// hammering a struggling server every cycle.
fn migrate_v3(conn: &Connection) -> Result<(), SyncError> {
    if !column_exists(conn, "sync_queue", "next_retry_at")? {
        conn.execute("ALTER TABLE sync_queue ADD COLUMN next_retry_at TEXT", [])?;
    }
    if !column_exists(conn, "sync_queue", "retry_delay_ms")? {
        conn.execute(
            "ALTER TABLE sync_queue ADD COLUMN retry_delay_ms INTEGER NOT NULL DEFAULT 5000",
            [],
        )?;
    }
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_sync_queue_retry
             ON sync_queue(status, next_retry_at);",
    )?;
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, SyncError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

// ---------------------------------------------------------------------------
// Local settings helpers
// ---------------------------------------------------------------------------

pub fn setting_get(
    conn: &Connection,
    category: &str,
    key: &str,
) -> Result<Option<String>, SyncError> {
    use rusqlite::OptionalExtension;
    let value = conn
        .query_row(
            "SELECT value FROM local_settings WHERE category = ?1 AND key = ?2",
            [category, key],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?;
    Ok(value.flatten())
}

pub fn setting_set(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), SyncError> {
    conn.execute(
        "INSERT INTO local_settings (category, key, value, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)
         ON CONFLICT(category, key)
         DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        rusqlite::params![category, key, value, chrono::Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

/// In-memory database with the full schema, shared by test modules.
#[cfg(test)]
pub(crate) fn test_db() -> DbState {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .expect("configure test db");
    run_migrations(&conn).expect("migrate test db");
    DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_create_expected_tables() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        for table in ["orders", "order_items", "sync_queue", "local_settings"] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        run_migrations(&conn).expect("second run");
        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_retry_columns_present_after_migration() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        assert!(column_exists(&conn, "sync_queue", "next_retry_at").unwrap());
        assert!(column_exists(&conn, "sync_queue", "retry_delay_ms").unwrap());
        assert!(column_exists(&conn, "orders", "deleted_at").unwrap());
        assert!(!column_exists(&conn, "orders", "no_such_column").unwrap());
    }

    #[test]
    fn test_settings_round_trip_and_overwrite() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        assert_eq!(setting_get(&conn, "orders", "order_counter").unwrap(), None);
        setting_set(&conn, "orders", "order_counter", "41").unwrap();
        setting_set(&conn, "orders", "order_counter", "42").unwrap();
        assert_eq!(
            setting_get(&conn, "orders", "order_counter").unwrap(),
            Some("42".to_string())
        );
    }

    #[test]
    fn test_duplicate_business_key_rejected_per_tenant() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        let insert = "INSERT INTO orders (id, order_number, tenant_id, order_date, created_at, updated_at)
                      VALUES (?1, ?2, ?3, datetime('now'), datetime('now'), datetime('now'))";
        conn.execute(insert, ["a", "ORD-22082026-00001", "tenant-1"]).unwrap();
        // Same number under another tenant is fine.
        conn.execute(insert, ["b", "ORD-22082026-00001", "tenant-2"]).unwrap();
        // Same tenant and number must fail.
        assert!(conn
            .execute(insert, ["c", "ORD-22082026-00001", "tenant-1"])
            .is_err());
    }
}
