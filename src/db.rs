//! Local SQLite database layer for the offline queue.
//!
//! Uses rusqlite with WAL mode. Holds two tables: `local_settings`
//! (category/key/value tuning knobs) and `local_records`, a named-record store
//! where the pending queue and the dead-letter list are written as whole JSON
//! documents after every mutation.

use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::error::StorageError;

/// Database connection shared by the queue stores and config loading.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 1;

const DB_FILE_NAME: &str = "pos-offline.db";

/// Durable storage for named records.
///
/// Implementations must have finished writing (or failed) before `save`
/// returns.
pub trait RecordStore: Send + Sync {
    fn load(&self, name: &str) -> Result<Option<String>, StorageError>;
    fn save(&self, name: &str, value: &str) -> Result<(), StorageError>;
}

/// Initialize the database at `{app_data_dir}/pos-offline.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas, and
/// runs any pending migrations. If the file cannot be opened at all it is
/// moved aside (never deleted: it may hold unsynced sales) and a fresh one is
/// created.
pub fn init(app_data_dir: &Path) -> Result<DbState, StorageError> {
    fs::create_dir_all(app_data_dir)
        .map_err(|e| StorageError::Unavailable(format!("create data dir: {e}")))?;

    let db_path = app_data_dir.join(DB_FILE_NAME);
    info!("Opening offline queue database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                error = %first_err,
                "Database open failed, moving file aside and retrying once"
            );
            if db_path.exists() {
                let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
                let aside = db_path.with_extension(format!("db.broken-{stamp}"));
                if let Err(e) = fs::rename(&db_path, &aside) {
                    warn!(error = %e, "Could not move broken database aside");
                }
            }
            open_and_configure(&db_path)?
        }
    };

    run_migrations(&conn)?;

    info!("Offline queue database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open a throwaway in-memory database with the full schema.
pub fn open_in_memory() -> Result<DbState, StorageError> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, StorageError> {
    let conn = Connection::open(path)?;

    // FULL rather than NORMAL: an acknowledged enqueue must survive power loss.
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = FULL;",
    )?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        apply_migration(conn, 1, MIGRATION_V1)?;
    }

    Ok(())
}

/// Apply one migration and record its version in a single transaction, so a
/// crash never leaves a schema change without its version row.
fn apply_migration(conn: &Connection, version: i32, sql: &str) -> Result<(), StorageError> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(sql)?;
    tx.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        params![version],
    )?;
    tx.commit()?;
    info!("Applied schema migration v{version}");
    Ok(())
}

/// Migration v1: settings and the named-record store.
const MIGRATION_V1: &str = "
    CREATE TABLE IF NOT EXISTS local_settings (
        id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
        setting_category TEXT NOT NULL,
        setting_key TEXT NOT NULL,
        setting_value TEXT NOT NULL,
        created_at TEXT DEFAULT (datetime('now')),
        updated_at TEXT DEFAULT (datetime('now')),
        UNIQUE(setting_category, setting_key)
    );

    CREATE TABLE IF NOT EXISTS local_records (
        record_name TEXT PRIMARY KEY,
        record_value TEXT NOT NULL,
        updated_at TEXT DEFAULT (datetime('now'))
    );
";

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Read a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Named records
// ---------------------------------------------------------------------------

pub fn read_record(conn: &Connection, name: &str) -> Result<Option<String>, StorageError> {
    let value = conn
        .query_row(
            "SELECT record_value FROM local_records WHERE record_name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

pub fn write_record(conn: &Connection, name: &str, value: &str) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO local_records (record_name, record_value, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(record_name) DO UPDATE SET
            record_value = excluded.record_value,
            updated_at = excluded.updated_at",
        params![name, value],
    )?;
    Ok(())
}

impl DbState {
    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|e| StorageError::Unavailable(format!("database lock poisoned: {e}")))
    }

    pub fn setting(&self, category: &str, key: &str) -> Option<String> {
        let conn = self.lock().ok()?;
        get_setting(&conn, category, key)
    }

    pub fn set_setting(&self, category: &str, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.lock()?;
        set_setting(&conn, category, key, value)
    }
}

impl RecordStore for DbState {
    fn load(&self, name: &str) -> Result<Option<String>, StorageError> {
        let conn = self.lock()?;
        read_record(&conn, name)
    }

    fn save(&self, name: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.lock()?;
        write_record(&conn, name, value)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
