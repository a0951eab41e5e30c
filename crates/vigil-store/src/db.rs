//! SQLite repository for guests, face encodings, and attendance records.

use crate::pending::PendingRegistration;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use vigil_core::{Embedding, KnownFace};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid timestamp in row: {0}")]
    BadTimestamp(String),
}

/// One persisted attendance row.
#[derive(Debug, Clone)]
pub struct AttendanceRow {
    pub guest_id: String,
    pub device_id: String,
    pub method: String,
    pub timestamp: DateTime<Utc>,
}

/// A registered guest, as stored.
#[derive(Debug, Clone)]
pub struct GuestRow {
    pub guest_id: String,
    pub name: String,
    pub guest_type: String,
    pub status: String,
}

/// Connection wrapper shared across pipeline stages. SQLite access is
/// serialized behind one mutex; all writes are short.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        tracing::info!(path = %path.display(), "opened attendance database");
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// In-memory database, for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS guests (
                guest_id   TEXT PRIMARY KEY,
                name       TEXT NOT NULL,
                guest_type TEXT NOT NULL,
                bed_no     TEXT NOT NULL,
                status     TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS guest_faces (
                id       INTEGER PRIMARY KEY AUTOINCREMENT,
                guest_id TEXT NOT NULL,
                encoding TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS attendance (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                guest_id  TEXT NOT NULL,
                device_id TEXT NOT NULL,
                method    TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_attendance_guest_ts
                ON attendance (guest_id, timestamp);",
        )?;
        Ok(())
    }

    pub fn insert_attendance(
        &self,
        guest_id: &str,
        device_id: &str,
        method: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO attendance (guest_id, device_id, method, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![guest_id, device_id, method, timestamp.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Load all gallery encodings for guests in an attendable status.
    /// Rows with unparseable encodings are skipped with a warning.
    pub fn known_faces(&self) -> Result<Vec<KnownFace>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT gf.guest_id, gf.encoding
             FROM guest_faces AS gf
             JOIN guests AS g ON gf.guest_id = g.guest_id
             WHERE g.status IN ('active', 'leave')",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut faces = Vec::new();
        for row in rows {
            let (guest_id, encoding_json) = row?;
            match serde_json::from_str::<Vec<f32>>(&encoding_json) {
                Ok(values) => faces.push(KnownFace {
                    guest_id,
                    embedding: Embedding::new(values),
                }),
                Err(err) => {
                    tracing::warn!(guest_id, error = %err, "skipping malformed stored encoding");
                }
            }
        }
        Ok(faces)
    }

    pub fn guest_exists(&self, guest_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM guests WHERE guest_id = ?1",
            params![guest_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Promote a pending registration into a known identity: guest row plus
    /// its valid encodings, in one transaction. Returns `false` without
    /// writing when the guest already exists (idempotent under retry).
    pub fn promote_guest(&self, reg: &PendingRegistration) -> Result<bool, StoreError> {
        let mut conn = self.conn.lock().expect("store lock poisoned");

        let existing: i64 = conn.query_row(
            "SELECT COUNT(*) FROM guests WHERE guest_id = ?1",
            params![reg.guest_id],
            |row| row.get(0),
        )?;
        if existing > 0 {
            tracing::info!(guest_id = %reg.guest_id, "guest already promoted, skipping insert");
            return Ok(false);
        }

        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO guests (guest_id, name, guest_type, bed_no, status) VALUES (?1, ?2, ?3, ?4, 'inactive')",
            params![
                reg.guest_id,
                reg.name.as_deref().unwrap_or("Unknown"),
                reg.guest_type.as_deref().unwrap_or("Unknown"),
                reg.bed_no.as_deref().unwrap_or("N/A"),
            ],
        )?;
        for encoding in reg.valid_encodings() {
            let encoding_json = serde_json::to_string(encoding)
                .expect("Vec<f32> serializes infallibly");
            tx.execute(
                "INSERT INTO guest_faces (guest_id, encoding) VALUES (?1, ?2)",
                params![reg.guest_id, encoding_json],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    /// Most recent attendance timestamp per guest, for seeding the ledger's
    /// cooldown map after a restart.
    pub fn latest_attendance(&self) -> Result<Vec<(String, DateTime<Utc>)>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT guest_id, MAX(timestamp) FROM attendance GROUP BY guest_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut latest = Vec::new();
        for row in rows {
            let (guest_id, ts) = row?;
            let parsed = DateTime::parse_from_rfc3339(&ts)
                .map_err(|_| StoreError::BadTimestamp(ts.clone()))?;
            latest.push((guest_id, parsed.with_timezone(&Utc)));
        }
        Ok(latest)
    }

    pub fn recent_attendance(&self, limit: u32) -> Result<Vec<AttendanceRow>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT guest_id, device_id, method, timestamp
             FROM attendance ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (guest_id, device_id, method, ts) = row?;
            let timestamp = DateTime::parse_from_rfc3339(&ts)
                .map_err(|_| StoreError::BadTimestamp(ts.clone()))?
                .with_timezone(&Utc);
            records.push(AttendanceRow { guest_id, device_id, method, timestamp });
        }
        Ok(records)
    }

    pub fn guests(&self) -> Result<Vec<GuestRow>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT guest_id, name, guest_type, status FROM guests ORDER BY guest_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(GuestRow {
                guest_id: row.get(0)?,
                name: row.get(1)?,
                guest_type: row.get(2)?,
                status: row.get(3)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Test/CLI helper: flip a guest's status (e.g. to `active`) so their
    /// encodings participate in matching.
    pub fn set_guest_status(&self, guest_id: &str, status: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "UPDATE guests SET status = ?1 WHERE guest_id = ?2",
            params![status, guest_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn reg(guest_id: &str, encodings: Vec<Vec<f32>>) -> PendingRegistration {
        PendingRegistration {
            schema_version: crate::pending::SCHEMA_VERSION,
            guest_id: guest_id.into(),
            name: Some("Test Guest".into()),
            guest_type: None,
            bed_no: None,
            confirmed: true,
            face_encodings: encodings,
        }
    }

    fn encoding(seed: f32) -> Vec<f32> {
        (0..32).map(|i| seed + i as f32).collect()
    }

    #[test]
    fn test_insert_and_list_attendance() {
        let store = Store::open_in_memory().unwrap();
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        store.insert_attendance("g1", "LIFT", "Face", ts).unwrap();
        store.insert_attendance("g2", "LIFT", "Face", ts).unwrap();

        let rows = store.recent_attendance(10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].guest_id, "g2");
        assert_eq!(rows[1].timestamp, ts);
    }

    #[test]
    fn test_known_faces_filters_by_status() {
        let store = Store::open_in_memory().unwrap();
        store.promote_guest(&reg("active-guest", vec![encoding(0.0), encoding(1.0)])).unwrap();
        store.promote_guest(&reg("inactive-guest", vec![encoding(2.0), encoding(3.0)])).unwrap();
        store.set_guest_status("active-guest", "active").unwrap();

        let faces = store.known_faces().unwrap();
        assert_eq!(faces.len(), 2);
        assert!(faces.iter().all(|f| f.guest_id == "active-guest"));
    }

    #[test]
    fn test_known_faces_skips_malformed_encoding() {
        let store = Store::open_in_memory().unwrap();
        store.promote_guest(&reg("g1", vec![encoding(0.0), encoding(1.0)])).unwrap();
        store.set_guest_status("g1", "active").unwrap();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO guest_faces (guest_id, encoding) VALUES ('g1', 'not-json')",
                [],
            )
            .unwrap();
        }
        let faces = store.known_faces().unwrap();
        assert_eq!(faces.len(), 2);
    }

    #[test]
    fn test_promote_guest_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let r = reg("g1", vec![encoding(0.0), encoding(1.0)]);
        assert!(store.promote_guest(&r).unwrap());
        assert!(!store.promote_guest(&r).unwrap());

        let guests = store.guests().unwrap();
        assert_eq!(guests.len(), 1);
        assert_eq!(guests[0].status, "inactive");
    }

    #[test]
    fn test_latest_attendance_per_guest() {
        let store = Store::open_in_memory().unwrap();
        let early = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        store.insert_attendance("g1", "LIFT", "Face", early).unwrap();
        store.insert_attendance("g1", "LIFT", "Face", late).unwrap();

        let latest = store.latest_attendance().unwrap();
        assert_eq!(latest, vec![("g1".to_string(), late)]);
    }
}
