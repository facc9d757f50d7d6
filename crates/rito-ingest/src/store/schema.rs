//! SQLite schema for the bookmark index.
//!
//! Every record-backed table carries `event_time_us`, the Jetstream position of
//! the event that last wrote the row. Together with `tombstones` this lets the
//! store ignore stale writes when events are redelivered after a restart.

use rusqlite::{Connection, Result};

use rito_core::VERIFIED_TAG;

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
///
/// Creates all tables if they don't exist and seeds reserved tags.
pub fn init_schema(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    }

    seed_reserved_tags(conn)?;

    Ok(())
}

/// Get the current schema version (0 if not initialized).
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

/// Version 1 tables.
const V1_TABLES: &str = r#"
    CREATE TABLE IF NOT EXISTS bookmarks (
        uri TEXT PRIMARY KEY,
        did TEXT NOT NULL,
        handle TEXT NOT NULL,
        subject TEXT NOT NULL,
        ogp_title TEXT,
        ogp_description TEXT,
        ogp_image TEXT,
        moderation_result TEXT,
        created_at TEXT NOT NULL,
        indexed_at TEXT NOT NULL,
        event_time_us INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS comments (
        bookmark_uri TEXT NOT NULL REFERENCES bookmarks(uri) ON DELETE CASCADE,
        lang TEXT NOT NULL,
        title TEXT NOT NULL DEFAULT '',
        comment TEXT NOT NULL DEFAULT '',
        moderation_result TEXT,
        PRIMARY KEY (bookmark_uri, lang)
    );

    CREATE TABLE IF NOT EXISTS tags (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        name_key TEXT NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS bookmark_tags (
        bookmark_uri TEXT NOT NULL REFERENCES bookmarks(uri) ON DELETE CASCADE,
        tag_id INTEGER NOT NULL REFERENCES tags(id),
        PRIMARY KEY (bookmark_uri, tag_id)
    );

    CREATE TABLE IF NOT EXISTS likes (
        uri TEXT PRIMARY KEY,
        did TEXT NOT NULL,
        subject TEXT NOT NULL,
        created_at TEXT NOT NULL,
        event_time_us INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS resolvers (
        nsid TEXT PRIMARY KEY,
        schema_template TEXT NOT NULL,
        verified INTEGER NOT NULL DEFAULT 0,
        did TEXT NOT NULL,
        uri TEXT NOT NULL,
        created_at TEXT NOT NULL,
        event_time_us INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS verifications (
        uri TEXT PRIMARY KEY,
        did TEXT NOT NULL,
        subject TEXT NOT NULL,
        nsid TEXT,
        created_at TEXT NOT NULL,
        event_time_us INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS user_did_handles (
        did TEXT PRIMARY KEY,
        handle TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS jetstream_index (
        service TEXT PRIMARY KEY,
        cursor INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_bookmarks_indexed_at ON bookmarks(indexed_at DESC);
    CREATE INDEX IF NOT EXISTS idx_bookmarks_subject ON bookmarks(subject);
    CREATE INDEX IF NOT EXISTS idx_bookmarks_did ON bookmarks(did);
    CREATE INDEX IF NOT EXISTS idx_bookmark_tags_tag ON bookmark_tags(tag_id);
    CREATE INDEX IF NOT EXISTS idx_likes_subject ON likes(subject);
    CREATE INDEX IF NOT EXISTS idx_resolvers_uri ON resolvers(uri);
    CREATE INDEX IF NOT EXISTS idx_verifications_subject ON verifications(subject);

    CREATE TABLE IF NOT EXISTS tombstones (
        uri TEXT PRIMARY KEY,
        time_us INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_tombstones_time ON tombstones(time_us);
"#;

fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(V1_TABLES)
}

/// Uniqueness key for a tag name. Tags that differ only by case share a row,
/// using the full Unicode case fold rather than SQLite's ASCII-only `NOCASE`.
pub fn tag_key(name: &str) -> String {
    name.to_lowercase()
}

fn seed_reserved_tags(conn: &Connection) -> Result<()> {
    conn.execute(
        "INSERT INTO tags (name, name_key) VALUES (?1, ?2) ON CONFLICT(name_key) DO NOTHING",
        [VERIFIED_TAG, tag_key(VERIFIED_TAG).as_str()],
    )?;
    Ok(())
}
