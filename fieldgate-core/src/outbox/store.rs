//! SQLite-backed outbox store
//!
//! Provides the enqueue, ordered peek, and idempotent remove operations.

use crate::config::OutboxConfig;
use crate::error::{Error, Result};
use crate::types::{from_unix_seconds, to_unix_seconds, Observation, OutboxRecord};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Durable, ordered, at-least-once queue of observations.
///
/// All access goes through a single connection behind a mutex, so each
/// enqueue and remove is one writer at a time. Records are only ever removed
/// by sequence id; nothing rewrites them in place.
pub struct Outbox {
    conn: Mutex<Connection>,
    /// 0 means unbounded
    max_records: usize,
    page_size: usize,
}

impl Outbox {
    /// Open or create an outbox at the given path
    pub fn open(path: &Path, config: &OutboxConfig) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // FULL sync: a committed enqueue must survive power loss, not just a crash.
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            ",
        )?;

        Self::with_connection(conn, config)
    }

    /// Open an in-memory outbox (for testing)
    pub fn open_in_memory(config: &OutboxConfig) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, config)
    }

    fn with_connection(conn: Connection, config: &OutboxConfig) -> Result<Self> {
        super::schema::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_records: config.max_records,
            page_size: config.drain_page_size.max(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // Each statement commits atomically, so a poisoned guard still holds a
        // consistent connection.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Persist an observation and return its stored handle.
    ///
    /// Fails with [`Error::OutboxFull`] instead of evicting older records
    /// once the configured capacity is reached.
    pub fn enqueue(&self, observation: &Observation) -> Result<OutboxRecord> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        if self.max_records > 0 {
            let pending: i64 = tx.query_row("SELECT COUNT(*) FROM outbox", [], |r| r.get(0))?;
            if pending as usize >= self.max_records {
                return Err(Error::OutboxFull {
                    capacity: self.max_records,
                });
            }
        }

        tx.execute(
            "INSERT INTO outbox (topic, payload, observed_at) VALUES (?1, ?2, ?3)",
            params![
                observation.topic(),
                observation.payload(),
                to_unix_seconds(&observation.observed_at()),
            ],
        )?;
        let sequence_id = tx.last_insert_rowid();
        tx.commit()?;

        tracing::debug!(sequence_id, topic = %observation.topic(), "Enqueued observation");

        Ok(OutboxRecord {
            sequence_id,
            observation: observation.clone(),
        })
    }

    /// Lazily iterate pending records, oldest first.
    ///
    /// Records are fetched a page at a time and the lock is released between
    /// pages, so enqueues can proceed while a drain publishes. Peeking never
    /// mutates the outbox; calling this again starts over from the oldest
    /// remaining record.
    pub fn peek_all_ordered(&self) -> OutboxCursor<'_> {
        OutboxCursor {
            outbox: self,
            after: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Delete exactly one record.
    ///
    /// Returns whether a record was deleted; removing an id that is already
    /// gone is not an error.
    pub fn remove(&self, sequence_id: i64) -> Result<bool> {
        let conn = self.lock();
        let deleted = conn.execute(
            "DELETE FROM outbox WHERE sequence_id = ?1",
            params![sequence_id],
        )?;

        if deleted == 0 {
            tracing::debug!(sequence_id, "Outbox record already removed");
        }
        Ok(deleted > 0)
    }

    /// Number of pending records
    pub fn len(&self) -> Result<usize> {
        let conn = self.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM outbox", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Oldest pending record, if any
    pub fn oldest(&self) -> Result<Option<OutboxRecord>> {
        let conn = self.lock();
        let record = conn
            .query_row(
                "SELECT sequence_id, topic, payload, observed_at FROM outbox
                 ORDER BY sequence_id ASC LIMIT 1",
                [],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Configured capacity (0 = unbounded)
    pub fn capacity(&self) -> usize {
        self.max_records
    }

    fn fetch_page(&self, after: i64) -> Result<Vec<OutboxRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT sequence_id, topic, payload, observed_at FROM outbox
             WHERE sequence_id > ?1
             ORDER BY sequence_id ASC
             LIMIT ?2",
        )?;
        let records = stmt
            .query_map(params![after, self.page_size as i64], row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<OutboxRecord> {
    let observed_at: f64 = row.get(3)?;
    let observed_at = from_unix_seconds(observed_at).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            Type::Real,
            format!("observed_at out of range: {}", observed_at).into(),
        )
    })?;

    Ok(OutboxRecord {
        sequence_id: row.get(0)?,
        observation: Observation::from_parts(row.get(1)?, row.get(2)?, observed_at),
    })
}

/// Iterator returned by [`Outbox::peek_all_ordered`].
///
/// Yields `Err` at most once, after which it is exhausted.
pub struct OutboxCursor<'a> {
    outbox: &'a Outbox,
    /// Highest sequence id handed out so far
    after: i64,
    buffer: VecDeque<OutboxRecord>,
    exhausted: bool,
}

impl Iterator for OutboxCursor<'_> {
    type Item = Result<OutboxRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self.outbox.fetch_page(self.after) {
                Ok(page) => {
                    if page.len() < self.outbox.page_size {
                        self.exhausted = true;
                    }
                    self.buffer.extend(page);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }

        let record = self.buffer.pop_front()?;
        self.after = record.sequence_id;
        Some(Ok(record))
    }
}
