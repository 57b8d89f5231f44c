//! SQLite schema for label actions and the firehose checkpoint.

use rusqlite::{Connection, Result};

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: i32 = 2;

/// Create all tables if missing and run pending migrations.
pub fn init_schema(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        migrate(conn, current_version, SCHEMA_VERSION)?;
    }

    Ok(())
}

/// Current schema version (0 if not initialized).
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Label decisions waiting to be emitted
        CREATE TABLE IF NOT EXISTS label_actions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            label TEXT NOT NULL,
            action TEXT NOT NULL CHECK (action IN ('create', 'remove')),
            subject TEXT NOT NULL,
            comment TEXT,
            scheduled_at INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_label_actions_scheduled ON label_actions(scheduled_at);

        -- Firehose resume point (single row)
        CREATE TABLE IF NOT EXISTS subscription_checkpoint (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            last_sequence INTEGER NOT NULL DEFAULT -1,
            updated_at INTEGER NOT NULL DEFAULT 0
        );
        "#,
    )?;

    Ok(())
}

fn migrate(conn: &Connection, from: i32, to: i32) -> Result<()> {
    for version in from..to {
        if version == 1 {
            migrate_v1_to_v2(conn)?;
        }
    }
    set_schema_version(conn, to)?;
    Ok(())
}

/// v1 -> v2: index due actions and timestamp checkpoint writes.
fn migrate_v1_to_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE INDEX IF NOT EXISTS idx_label_actions_scheduled ON label_actions(scheduled_at);
        ALTER TABLE subscription_checkpoint ADD COLUMN updated_at INTEGER NOT NULL DEFAULT 0;
        "#,
    )?;
    Ok(())
}
