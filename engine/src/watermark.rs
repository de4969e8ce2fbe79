//! Per-table pull watermarks and parked pull failures.

use crate::{db::Database, error::Result, RecordId, Timestamp};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

/// Highest remote `updated_at` pulled per table. Watermarks only move forward.
#[derive(Debug, Clone)]
pub struct Watermarks {
    db: Arc<Database>,
}

impl Watermarks {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Current watermark; `0` when the table was never pulled.
    pub fn get(&self, table: &str) -> Result<Timestamp> {
        self.db.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT watermark FROM watermarks WHERE table_name = ?1",
                    params![table],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(0))
        })
    }

    /// Advance the watermark to `to` unless it is already further along.
    pub fn advance(&self, table: &str, to: Timestamp) -> Result<()> {
        self.db.transaction(|tx| {
            tx.execute(
                "INSERT INTO watermarks (table_name, watermark) VALUES (?1, ?2)
                 ON CONFLICT(table_name) DO UPDATE SET watermark = MAX(watermark, excluded.watermark)",
                params![table, to],
            )?;
            Ok(())
        })
    }

    /// Remember a pulled record that failed to apply so later cycles can
    /// fetch it again after the watermark has moved past it.
    pub fn park(&self, table: &str, id: &str, updated_at: Timestamp, error: &str) -> Result<()> {
        self.db.transaction(|tx| {
            tx.execute(
                "INSERT INTO pull_failures (table_name, record_id, updated_at, last_error)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(table_name, record_id) DO UPDATE SET
                    updated_at = MAX(updated_at, excluded.updated_at),
                    last_error = excluded.last_error,
                    attempts = attempts + 1",
                params![table, id, updated_at, error],
            )?;
            Ok(())
        })
    }

    /// Ids parked for `table`, oldest failure first.
    pub fn parked(&self, table: &str) -> Result<Vec<RecordId>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT record_id FROM pull_failures WHERE table_name = ?1
                 ORDER BY updated_at ASC, record_id ASC",
            )?;
            let ids = stmt
                .query_map(params![table], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<RecordId>>>()?;
            Ok(ids)
        })
    }

    /// Forget a parked failure. Returns whether one was parked.
    pub fn unpark(&self, table: &str, id: &str) -> Result<bool> {
        self.db.transaction(|tx| {
            let n = tx.execute(
                "DELETE FROM pull_failures WHERE table_name = ?1 AND record_id = ?2",
                params![table, id],
            )?;
            Ok(n > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;

    #[test]
    fn watermark_never_moves_back() {
        let db = Arc::new(Database::open_in_memory(&Schema::new(1)).unwrap());
        let marks = Watermarks::new(db);
        assert_eq!(marks.get("notes").unwrap(), 0);

        marks.advance("notes", 50).unwrap();
        marks.advance("notes", 20).unwrap();
        assert_eq!(marks.get("notes").unwrap(), 50);

        marks.advance("notes", 70).unwrap();
        assert_eq!(marks.get("notes").unwrap(), 70);
    }

    #[test]
    fn parked_failures_are_listed_until_unparked() {
        let db = Arc::new(Database::open_in_memory(&Schema::new(1)).unwrap());
        let marks = Watermarks::new(db.clone());

        marks.park("notes", "b", 20, "missing field").unwrap();
        marks.park("notes", "a", 10, "missing field").unwrap();
        marks.park("notes", "a", 15, "still broken").unwrap();
        marks.park("tags", "c", 5, "bad").unwrap();
        assert_eq!(marks.parked("notes").unwrap(), vec!["a", "b"]);

        let (attempts, error): (i64, String) = db
            .read(|conn| {
                Ok(conn.query_row(
                    "SELECT attempts, last_error FROM pull_failures
                     WHERE table_name = 'notes' AND record_id = 'a'",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?)
            })
            .unwrap();
        assert_eq!(attempts, 2);
        assert_eq!(error, "still broken");

        assert!(marks.unpark("notes", "a").unwrap());
        assert!(!marks.unpark("notes", "a").unwrap());
        assert_eq!(marks.parked("notes").unwrap(), vec!["b"]);
        assert_eq!(marks.parked("tags").unwrap(), vec!["c"]);
    }
}
