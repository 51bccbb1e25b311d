use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use serde::Serialize;
use sha2::{Digest, Sha256};

const LEDGER_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS migrated_pages (
    path TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    revision_count INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    last_timestamp TEXT,
    migrated_at_unix INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS failed_revisions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    page_path TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    diagnostics TEXT NOT NULL,
    recorded_at_unix INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_failed_revisions_page_path ON failed_revisions(page_path);

CREATE TABLE IF NOT EXISTS migration_config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

#[derive(Debug, Clone, Serialize)]
pub struct FailedRevisionRecord {
    pub page_path: String,
    pub timestamp: String,
    pub diagnostics: String,
}

/// Open (or create) the migration ledger and make sure its schema exists.
pub fn open_ledger(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create ledger directory {}", parent.display()))?;
    }
    let connection = Connection::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    connection
        .busy_timeout(std::time::Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign_keys pragma")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    connection
        .execute_batch(LEDGER_SCHEMA_SQL)
        .context("failed to initialize ledger schema")?;
    Ok(connection)
}

/// Upsert the final state of one migrated page.
pub fn record_page(
    connection: &Connection,
    path: &str,
    title: &str,
    revision_count: usize,
    content_hash: &str,
    last_timestamp: Option<&str>,
) -> Result<()> {
    let now = unix_timestamp()?;
    connection
        .execute(
            "INSERT INTO migrated_pages (
                path, title, revision_count, content_hash, last_timestamp, migrated_at_unix
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(path) DO UPDATE SET
                title = excluded.title,
                revision_count = excluded.revision_count,
                content_hash = excluded.content_hash,
                last_timestamp = excluded.last_timestamp,
                migrated_at_unix = excluded.migrated_at_unix",
            params![
                path,
                title,
                i64::try_from(revision_count).context("revision count does not fit into i64")?,
                content_hash,
                last_timestamp,
                i64::try_from(now).context("timestamp does not fit into i64")?
            ],
        )
        .with_context(|| format!("failed to upsert ledger row for {path}"))?;
    Ok(())
}

/// Append one dropped revision with the diagnostics that sank it.
pub fn record_failed_revision(
    connection: &Connection,
    page_path: &str,
    timestamp: &str,
    diagnostics: &str,
) -> Result<()> {
    let now = unix_timestamp()?;
    connection
        .execute(
            "INSERT INTO failed_revisions (page_path, timestamp, diagnostics, recorded_at_unix)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                page_path,
                timestamp,
                diagnostics,
                i64::try_from(now).context("timestamp does not fit into i64")?
            ],
        )
        .with_context(|| format!("failed to record failed revision for {page_path}"))?;
    Ok(())
}

pub fn page_count(connection: &Connection) -> Result<i64> {
    connection
        .query_row("SELECT COUNT(*) FROM migrated_pages", [], |row| row.get(0))
        .context("failed to count migrated pages")
}

pub fn failure_count(connection: &Connection) -> Result<i64> {
    connection
        .query_row("SELECT COUNT(*) FROM failed_revisions", [], |row| row.get(0))
        .context("failed to count failed revisions")
}

/// Most recently recorded failures first.
pub fn recent_failures(connection: &Connection, limit: usize) -> Result<Vec<FailedRevisionRecord>> {
    let mut statement = connection
        .prepare(
            "SELECT page_path, timestamp, diagnostics
             FROM failed_revisions ORDER BY id DESC LIMIT ?1",
        )
        .context("failed to prepare failed revision query")?;
    let rows = statement
        .query_map(
            [i64::try_from(limit).context("limit does not fit into i64")?],
            |row| {
                Ok(FailedRevisionRecord {
                    page_path: row.get(0)?,
                    timestamp: row.get(1)?,
                    diagnostics: row.get(2)?,
                })
            },
        )
        .context("failed to run failed revision query")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to decode failed revision row")?);
    }
    Ok(out)
}

pub fn get_ledger_config(connection: &Connection, key: &str) -> Result<Option<String>> {
    let mut statement = connection
        .prepare("SELECT value FROM migration_config WHERE key = ?1 LIMIT 1")
        .context("failed to prepare ledger config query")?;
    let mut rows = statement
        .query([key])
        .with_context(|| format!("failed to read ledger config key {key}"))?;
    let row = match rows.next().context("failed to decode ledger config row")? {
        Some(row) => row,
        None => return Ok(None),
    };
    let value = row.get(0).context("failed to decode ledger config value")?;
    Ok(Some(value))
}

pub fn set_ledger_config(connection: &Connection, key: &str, value: &str) -> Result<()> {
    connection
        .execute(
            "INSERT INTO migration_config (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .with_context(|| format!("failed to set ledger config key {key}"))?;
    Ok(())
}

/// Short content fingerprint: first eight bytes of a SHA-256, hex encoded.
pub fn compute_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut output = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

pub(crate) fn unix_timestamp() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")
        .map(|duration| duration.as_secs())
}
