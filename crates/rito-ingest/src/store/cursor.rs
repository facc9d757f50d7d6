//! Durable Jetstream cursor.

use rusqlite::{OptionalExtension, params};

use super::{Database, unix_now};
use crate::Result;

/// Reads and writes the `jetstream_index` table.
#[derive(Clone)]
pub struct CursorStore {
    db: Database,
}

impl CursorStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Last checkpointed position for `service`, or `None` on a fresh start.
    pub fn get(&self, service: &str) -> Result<Option<i64>> {
        let conn = self.db.lock();
        let cursor = conn
            .query_row(
                "SELECT cursor FROM jetstream_index WHERE service = ?1",
                [service],
                |row| row.get(0),
            )
            .optional()?;
        Ok(cursor)
    }

    /// Record a checkpoint. The stored value only ever moves forward.
    pub fn checkpoint(&self, service: &str, cursor: i64) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO jetstream_index (service, cursor, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(service) DO UPDATE SET
                cursor = MAX(cursor, excluded.cursor),
                updated_at = excluded.updated_at",
            params![service, cursor, unix_now()],
        )?;
        Ok(())
    }

    /// Force the cursor to `cursor`, even backwards. Operator use only.
    pub fn reset(&self, service: &str, cursor: i64) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO jetstream_index (service, cursor, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(service) DO UPDATE SET
                cursor = excluded.cursor,
                updated_at = excluded.updated_at",
            params![service, cursor, unix_now()],
        )?;
        Ok(())
    }

    /// Remove the cursor so the next start subscribes from "now".
    pub fn clear(&self, service: &str) -> Result<bool> {
        let conn = self.db.lock();
        let removed = conn.execute("DELETE FROM jetstream_index WHERE service = ?1", [service])?;
        Ok(removed > 0)
    }

    /// All cursors with their last update time (for introspection).
    pub fn list(&self) -> Result<Vec<(String, i64, i64)>> {
        let conn = self.db.lock();
        let mut stmt =
            conn.prepare("SELECT service, cursor, updated_at FROM jetstream_index ORDER BY service")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rito_core::JETSTREAM_SERVICE;

    fn store() -> CursorStore {
        CursorStore::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn test_cursor_fresh_db() {
        assert_eq!(store().get(JETSTREAM_SERVICE).unwrap(), None);
    }

    #[test]
    fn test_checkpoint_update_and_read() {
        let cursors = store();
        cursors.checkpoint(JETSTREAM_SERVICE, 1_700_000_000_000_000).unwrap();
        assert_eq!(
            cursors.get(JETSTREAM_SERVICE).unwrap(),
            Some(1_700_000_000_000_000)
        );

        cursors.checkpoint(JETSTREAM_SERVICE, 1_700_000_000_500_000).unwrap();
        assert_eq!(
            cursors.get(JETSTREAM_SERVICE).unwrap(),
            Some(1_700_000_000_500_000)
        );
    }

    #[test]
    fn test_checkpoint_only_increases() {
        let cursors = store();
        cursors.checkpoint(JETSTREAM_SERVICE, 2_000).unwrap();
        cursors.checkpoint(JETSTREAM_SERVICE, 1_000).unwrap();
        assert_eq!(cursors.get(JETSTREAM_SERVICE).unwrap(), Some(2_000));
    }

    #[test]
    fn test_reset_moves_backwards() {
        let cursors = store();
        cursors.checkpoint(JETSTREAM_SERVICE, 2_000).unwrap();
        cursors.reset(JETSTREAM_SERVICE, 500).unwrap();
        assert_eq!(cursors.get(JETSTREAM_SERVICE).unwrap(), Some(500));
    }

    #[test]
    fn test_clear_and_list() {
        let cursors = store();
        assert!(cursors.list().unwrap().is_empty());

        cursors.checkpoint(JETSTREAM_SERVICE, 42).unwrap();
        let listed = cursors.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, JETSTREAM_SERVICE);
        assert_eq!(listed[0].1, 42);

        assert!(cursors.clear(JETSTREAM_SERVICE).unwrap());
        assert!(!cursors.clear(JETSTREAM_SERVICE).unwrap());
        assert_eq!(cursors.get(JETSTREAM_SERVICE).unwrap(), None);
    }
}
