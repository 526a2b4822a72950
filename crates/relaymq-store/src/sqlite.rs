//! `SQLite` durable store.
//!
//! Publish records are stored as CBOR blobs; retained messages keep their
//! payload and QoS in plain columns.

use crate::{DurableStore, KeyedRecord, RecordKind, StoreError, StoreResult};
use parking_lot::Mutex;
use relaymq_core::{InFlightKey, PublishRecord, QoS, RetainedMessage};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

/// `SQLite`-backed durable store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}


impl SqliteStore {
    /// Open or create a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// All in-flight records, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or a record cannot be decoded.
    pub fn list_in_flight(&self) -> StoreResult<Vec<KeyedRecord>> {
        self.list_keyed("in_flight")
    }

    /// All QoS 2 publishes awaiting release, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or a record cannot be decoded.
    pub fn list_qos2(&self) -> StoreResult<Vec<KeyedRecord>> {
        self.list_keyed("qos2_pending")
    }

    /// All retained messages, ordered by topic.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn list_retained(&self) -> StoreResult<Vec<RetainedMessage>> {
        self.search_retained(&|_: &str| true)
    }

    /// All queued publishes, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or a record cannot be decoded.
    pub fn list_queued(&self) -> StoreResult<Vec<PublishRecord>> {
        let blobs = query_blobs(
            &self.conn.lock(),
            "SELECT record FROM queued ORDER BY id ASC",
            (),
        )?;
        decode_all(&blobs)
    }

    fn list_keyed(&self, table: &str) -> StoreResult<Vec<KeyedRecord>> {
        self.query_keyed(
            &format!(
                "SELECT client_id, message_id, record FROM {table} ORDER BY client_id, message_id"
            ),
            (),
        )
    }

    fn query_keyed<P: rusqlite::Params>(&self, sql: &str, params: P) -> StoreResult<Vec<KeyedRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u16>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(client_id, message_id, blob)| {
                Ok((
                    InFlightKey::new(client_id, message_id),
                    PublishRecord::from_cbor(&blob)?,
                ))
            })
            .collect()
    }

    fn upsert_keyed(&self, table: &str, key: &InFlightKey, record: &PublishRecord) -> StoreResult<()> {
        let blob = record.to_cbor()?;
        self.conn.lock().execute(
            &format!(
                "INSERT OR REPLACE INTO {table} (client_id, message_id, record, created_at)
                 VALUES (?1, ?2, ?3, ?4)"
            ),
            (&key.client_id, key.message_id, blob, now()),
        )?;
        Ok(())
    }

    fn get_keyed(&self, table: &str, key: &InFlightKey) -> StoreResult<Option<PublishRecord>> {
        let blob: Option<Vec<u8>> = self
            .conn
            .lock()
            .query_row(
                &format!("SELECT record FROM {table} WHERE client_id = ?1 AND message_id = ?2"),
                (&key.client_id, key.message_id),
                |row| row.get(0),
            )
            .optional()?;

        blob.map(|bytes| PublishRecord::from_cbor(&bytes))
            .transpose()
            .map_err(StoreError::from)
    }
}

/// Initialize database schema.
fn init_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        r"
        -- QoS 1 publishes being fanned out, QoS 2 forwards awaiting PUBCOMP
        CREATE TABLE IF NOT EXISTS in_flight (
            client_id TEXT NOT NULL,
            message_id INTEGER NOT NULL,
            record BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (client_id, message_id)
        );

        -- QoS 2 publishes awaiting PUBREL from their sender
        CREATE TABLE IF NOT EXISTS qos2_pending (
            client_id TEXT NOT NULL,
            message_id INTEGER NOT NULL,
            record BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (client_id, message_id)
        );

        -- Last retained message per topic
        CREATE TABLE IF NOT EXISTS retained (
            topic TEXT PRIMARY KEY,
            payload BLOB NOT NULL,
            qos INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        -- Publishes held for offline durable subscribers
        CREATE TABLE IF NOT EXISTS queued (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            client_id TEXT NOT NULL,
            record BLOB NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_queued_client_id ON queued(client_id);
        ",
    )?;

    Ok(())
}

impl DurableStore for SqliteStore {
    fn add_in_flight(&self, key: &InFlightKey, record: &PublishRecord) -> StoreResult<()> {
        self.upsert_keyed("in_flight", key, record)
    }

    fn clean_in_flight(&self, key: &InFlightKey) -> StoreResult<PublishRecord> {
        let conn = self.conn.lock();
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT record FROM in_flight WHERE client_id = ?1 AND message_id = ?2",
                (&key.client_id, key.message_id),
                |row| row.get(0),
            )
            .optional()?;

        let Some(blob) = blob else {
            return Err(StoreError::NotFound {
                kind: RecordKind::InFlight,
                key: key.clone(),
            });
        };

        conn.execute(
            "DELETE FROM in_flight WHERE client_id = ?1 AND message_id = ?2",
            (&key.client_id, key.message_id),
        )?;

        Ok(PublishRecord::from_cbor(&blob)?)
    }

    fn in_flight(&self, key: &InFlightKey) -> StoreResult<Option<PublishRecord>> {
        self.get_keyed("in_flight", key)
    }

    fn in_flight_for_client(&self, client_id: &str) -> StoreResult<Vec<KeyedRecord>> {
        self.query_keyed(
            "SELECT client_id, message_id, record FROM in_flight
             WHERE client_id = ?1 ORDER BY message_id",
            [client_id],
        )
    }

    fn persist_qos2(&self, key: &InFlightKey, record: &PublishRecord) -> StoreResult<()> {
        self.upsert_keyed("qos2_pending", key, record)
    }

    fn retrieve_qos2(&self, key: &InFlightKey) -> StoreResult<PublishRecord> {
        self.get_keyed("qos2_pending", key)?
            .ok_or_else(|| StoreError::NotFound {
                kind: RecordKind::Qos2,
                key: key.clone(),
            })
    }

    fn remove_qos2(&self, key: &InFlightKey) -> StoreResult<()> {
        self.conn.lock().execute(
            "DELETE FROM qos2_pending WHERE client_id = ?1 AND message_id = ?2",
            (&key.client_id, key.message_id),
        )?;
        Ok(())
    }

    fn store_retained(&self, topic: &str, payload: &[u8], qos: QoS) -> StoreResult<()> {
        let conn = self.conn.lock();
        if payload.is_empty() {
            conn.execute("DELETE FROM retained WHERE topic = ?1", [topic])?;
        } else {
            conn.execute(
                r"
                INSERT OR REPLACE INTO retained (topic, payload, qos, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ",
                (topic, payload, u8::from(qos), now()),
            )?;
        }
        Ok(())
    }

    fn store_for_future(&self, record: &PublishRecord) -> StoreResult<()> {
        let blob = record.to_cbor()?;
        self.conn.lock().execute(
            "INSERT INTO queued (client_id, record, created_at) VALUES (?1, ?2, ?3)",
            (&record.client_id, blob, now()),
        )?;
        Ok(())
    }

    fn take_queued(&self, client_id: &str) -> StoreResult<Vec<PublishRecord>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let blobs = query_blobs(
            &tx,
            "SELECT record FROM queued WHERE client_id = ?1 ORDER BY id ASC",
            [client_id],
        )?;
        tx.execute("DELETE FROM queued WHERE client_id = ?1", [client_id])?;
        tx.commit()?;

        decode_all(&blobs)
    }

    fn search_retained(
        &self,
        condition: &dyn Fn(&str) -> bool,
    ) -> StoreResult<Vec<RetainedMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT topic, payload, qos FROM retained ORDER BY topic")?;
        let rows = stmt
            .query_map((), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, u8>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .filter(|(topic, _, _)| condition(topic))
            .map(|(topic, payload, qos)| {
                let qos = QoS::try_from(qos)
                    .map_err(|e| StoreError::Corrupt(format!("retained {topic}: {e}")))?;
                Ok(RetainedMessage {
                    topic,
                    payload,
                    qos,
                })
            })
            .collect()
    }

    fn clean_persisted_for_client(&self, client_id: &str) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM in_flight WHERE client_id = ?1", [client_id])?;
        tx.execute("DELETE FROM qos2_pending WHERE client_id = ?1", [client_id])?;
        let queued = tx.execute("DELETE FROM queued WHERE client_id = ?1", [client_id])?;
        tx.commit()?;

        tracing::debug!(client_id, queued, "Cleaned persisted state for client");
        Ok(())
    }
}

fn query_blobs<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> StoreResult<Vec<Vec<u8>>> {
    let mut stmt = conn.prepare(sql)?;
    let blobs = stmt
        .query_map(params, |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<Vec<u8>>>>()?;
    Ok(blobs)
}

fn decode_all(blobs: &[Vec<u8>]) -> StoreResult<Vec<PublishRecord>> {
    blobs
        .iter()
        .map(|blob| PublishRecord::from_cbor(blob).map_err(StoreError::from))
        .collect()
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
