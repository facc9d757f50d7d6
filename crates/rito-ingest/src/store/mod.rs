//! SQLite persistence for the index and the Jetstream cursor.
//!
//! One database file holds both, so a checkpoint and the rows it covers live
//! side by side. [`IndexStore`] owns record writes and idempotency,
//! [`CursorStore`] owns the durable cursor.

mod cursor;
mod index;
pub mod schema;

pub use cursor::CursorStore;
pub use index::{
    BookmarkAggregate, BookmarkWrite, CommentRow, CommentWrite, IndexCounts, IndexStore, LikeRow,
    LikeWrite, OgpData, ResolverRow, ResolverWrite, StoredPreview, VerificationWrite,
    WriteOutcome,
};

use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;

use crate::Result;

/// Shared handle to the SQLite connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;",
        )?;
        schema::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        schema::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
