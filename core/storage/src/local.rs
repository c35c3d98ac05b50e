//! SQLite-backed local store for pinned objects and cached query results.
//!
//! Persists object payloads with their pin memberships so that pinned data
//! survives restarts. Every multi-row write runs in one transaction, and a
//! per-pin manifest records how many members each pin should have so a
//! partially applied write is detected on open.
//!
//! Each pin also remembers its roots, the objects that were pinned by
//! name rather than reached through a reference.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

use eaves_common::{Error, Result};

const SCHEMA_VERSION: i64 = 1;

fn sql(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

/// One object to place under a pin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub class_name: String,
    pub object_key: String,
    /// Serialized object state. `None` records pin membership only, for
    /// referenced objects whose data was never fetched.
    pub payload: Option<String>,
    /// Pinned by name rather than through a reference.
    pub root: bool,
}

/// Summary of one named pin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinSummary {
    pub pin_name: String,
    pub members: usize,
    pub with_content: usize,
}

/// Result of a successful integrity check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub pins_checked: usize,
    pub memberships_checked: usize,
    pub objects_checked: usize,
}

/// Local store using SQLite.
pub struct LocalStore {
    conn: Mutex<Connection>,
}

impl LocalStore {
    /// Create or open a local store database.
    ///
    /// # Arguments
    /// - `db_path`: Path to the SQLite database file
    ///
    /// # Postconditions
    /// - Schema exists
    /// - Stored pins passed an integrity check
    ///
    /// # Errors
    /// - Database creation failure
    /// - `Integrity` if a previous write was only partially applied
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(sql)?;
        Self::init(conn)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sql)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS objects (
                class_name TEXT NOT NULL,
                object_key TEXT NOT NULL,
                payload TEXT NOT NULL,
                PRIMARY KEY (class_name, object_key)
            );

            CREATE TABLE IF NOT EXISTS pins (
                pin_name TEXT NOT NULL,
                class_name TEXT NOT NULL,
                object_key TEXT NOT NULL,
                has_content INTEGER NOT NULL,
                PRIMARY KEY (pin_name, class_name, object_key)
            );

            CREATE TABLE IF NOT EXISTS pin_roots (
                pin_name TEXT NOT NULL,
                class_name TEXT NOT NULL,
                object_key TEXT NOT NULL,
                PRIMARY KEY (pin_name, class_name, object_key)
            );

            CREATE TABLE IF NOT EXISTS pin_manifest (
                pin_name TEXT PRIMARY KEY,
                member_count INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS query_results (
                signature TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                cached_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS store_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_pins_object ON pins(class_name, object_key);
            "#,
        )
        .map_err(sql)?;

        let version: Option<String> = conn
            .query_row(
                "SELECT value FROM store_meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql)?;
        match version {
            None => {
                conn.execute(
                    "INSERT INTO store_meta (key, value) VALUES ('schema_version', ?1)",
                    [SCHEMA_VERSION.to_string()],
                )
                .map_err(sql)?;
            }
            Some(v) if v != SCHEMA_VERSION.to_string() => {
                return Err(Error::Storage(format!("Unsupported schema version {}", v)));
            }
            Some(_) => {}
        }

        let store = Self {
            conn: Mutex::new(conn),
        };
        let report = store.verify()?;
        info!(
            "Local store opened: {} pins, {} objects",
            report.pins_checked, report.objects_checked
        );
        Ok(store)
    }

    /// Place records under a pin in one transaction.
    ///
    /// Records with a payload replace any stored payload for the object.
    /// Membership-only records never downgrade an existing content-bearing
    /// membership.
    ///
    /// # Postconditions
    /// - Either every record is stored and the manifest updated, or nothing is
    pub fn write_pin(&self, pin_name: &str, records: &[StoredRecord]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(sql)?;
        for record in records {
            if let Some(payload) = &record.payload {
                tx.execute(
                    r#"
                    INSERT OR REPLACE INTO objects (class_name, object_key, payload)
                    VALUES (?1, ?2, ?3)
                    "#,
                    params![record.class_name, record.object_key, payload],
                )
                .map_err(sql)?;
            }
            tx.execute(
                r#"
                INSERT INTO pins (pin_name, class_name, object_key, has_content)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT (pin_name, class_name, object_key)
                DO UPDATE SET has_content = MAX(has_content, excluded.has_content)
                "#,
                params![
                    pin_name,
                    record.class_name,
                    record.object_key,
                    record.payload.is_some() as i32
                ],
            )
            .map_err(sql)?;
            if record.root {
                tx.execute(
                    r#"
                    INSERT OR IGNORE INTO pin_roots (pin_name, class_name, object_key)
                    VALUES (?1, ?2, ?3)
                    "#,
                    params![pin_name, record.class_name, record.object_key],
                )
                .map_err(sql)?;
            }
        }
        Self::sync_manifest(&tx, pin_name)?;
        tx.commit().map_err(sql)?;
        debug!("Pinned {} records under '{}'", records.len(), pin_name);
        Ok(())
    }

    fn sync_manifest(tx: &rusqlite::Transaction<'_>, pin_name: &str) -> Result<()> {
        let count: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM pins WHERE pin_name = ?1",
                [pin_name],
                |row| row.get(0),
            )
            .map_err(sql)?;
        if count == 0 {
            tx.execute("DELETE FROM pin_manifest WHERE pin_name = ?1", [pin_name])
                .map_err(sql)?;
        } else {
            tx.execute(
                "INSERT OR REPLACE INTO pin_manifest (pin_name, member_count) VALUES (?1, ?2)",
                params![pin_name, count],
            )
            .map_err(sql)?;
        }
        Ok(())
    }

    /// Read a stored payload.
    ///
    /// Returns `None` unless the object is a content-bearing member of at
    /// least one pin.
    pub fn read_object(&self, class_name: &str, object_key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"
            SELECT o.payload FROM objects o
            WHERE o.class_name = ?1 AND o.object_key = ?2
              AND EXISTS (
                SELECT 1 FROM pins p
                WHERE p.class_name = o.class_name
                  AND p.object_key = o.object_key
                  AND p.has_content = 1
              )
            "#,
            params![class_name, object_key],
            |row| row.get(0),
        )
        .optional()
        .map_err(sql)
    }

    /// Whether the object belongs to any pin.
    pub fn is_pinned(&self, class_name: &str, object_key: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM pins WHERE class_name = ?1 AND object_key = ?2",
                params![class_name, object_key],
                |row| row.get(0),
            )
            .map_err(sql)?;
        Ok(count > 0)
    }

    /// Replace the payload of an object that is already stored.
    ///
    /// Returns false if the object is not stored.
    pub fn refresh_object(&self, class_name: &str, object_key: &str, payload: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE objects SET payload = ?3 WHERE class_name = ?1 AND object_key = ?2",
                params![class_name, object_key, payload],
            )
            .map_err(sql)?;
        Ok(changed > 0)
    }

    /// Roots of a pin as `(class_name, object_key)` pairs.
    pub fn pin_roots(&self, pin_name: &str) -> Result<Vec<(String, String)>> {
        self.pin_keys("SELECT class_name, object_key FROM pin_roots WHERE pin_name = ?1", pin_name)
    }

    /// Members of a pin as `(class_name, object_key)` pairs.
    pub fn pin_members(&self, pin_name: &str) -> Result<Vec<(String, String)>> {
        self.pin_keys("SELECT class_name, object_key FROM pins WHERE pin_name = ?1", pin_name)
    }

    fn pin_keys(&self, query: &str, pin_name: &str) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(query).map_err(sql)?;
        let rows = stmt
            .query_map([pin_name], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(sql)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(sql)
    }

    /// Remove objects from one pin, as members and as roots.
    ///
    /// Payloads stay until [`compact`](Self::compact) so that other pins
    /// holding the same object are unaffected.
    pub fn remove_from_pin(&self, pin_name: &str, keys: &[(String, String)]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(sql)?;
        let mut removed = 0;
        for (class_name, object_key) in keys {
            removed += tx
                .execute(
                    "DELETE FROM pins WHERE pin_name = ?1 AND class_name = ?2 AND object_key = ?3",
                    params![pin_name, class_name, object_key],
                )
                .map_err(sql)?;
            tx.execute(
                "DELETE FROM pin_roots WHERE pin_name = ?1 AND class_name = ?2 AND object_key = ?3",
                params![pin_name, class_name, object_key],
            )
            .map_err(sql)?;
        }
        Self::sync_manifest(&tx, pin_name)?;
        tx.commit().map_err(sql)?;
        Ok(removed)
    }

    /// Remove every member of a pin.
    pub fn clear_pin(&self, pin_name: &str) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(sql)?;
        let removed = tx
            .execute("DELETE FROM pins WHERE pin_name = ?1", [pin_name])
            .map_err(sql)?;
        tx.execute("DELETE FROM pin_roots WHERE pin_name = ?1", [pin_name])
            .map_err(sql)?;
        Self::sync_manifest(&tx, pin_name)?;
        tx.commit().map_err(sql)?;
        debug!("Cleared pin '{}' ({} members)", pin_name, removed);
        Ok(removed)
    }

    /// List pins with their member counts.
    pub fn pins(&self) -> Result<Vec<PinSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT pin_name, COUNT(*), SUM(has_content)
                FROM pins GROUP BY pin_name ORDER BY pin_name
                "#,
            )
            .map_err(sql)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(PinSummary {
                    pin_name: row.get(0)?,
                    members: row.get::<_, i64>(1)? as usize,
                    with_content: row.get::<_, i64>(2)? as usize,
                })
            })
            .map_err(sql)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(sql)
    }

    /// Payloads of content-bearing pinned objects, optionally restricted to
    /// one pin and/or one class.
    pub fn pinned_payloads(
        &self,
        pin_name: Option<&str>,
        class_name: Option<&str>,
    ) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT o.payload FROM objects o
                WHERE (?2 IS NULL OR o.class_name = ?2)
                  AND EXISTS (
                    SELECT 1 FROM pins p
                    WHERE p.class_name = o.class_name
                      AND p.object_key = o.object_key
                      AND p.has_content = 1
                      AND (?1 IS NULL OR p.pin_name = ?1)
                  )
                ORDER BY o.class_name, o.object_key
                "#,
            )
            .map_err(sql)?;
        let rows = stmt
            .query_map(params![pin_name, class_name], |row| row.get(0))
            .map_err(sql)?;
        rows.collect::<std::result::Result<Vec<String>, _>>().map_err(sql)
    }

    /// Drop an object and all of its pin memberships.
    pub fn forget_object(&self, class_name: &str, object_key: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(sql)?;
        let pin_names: Vec<String> = {
            let mut stmt = tx
                .prepare("SELECT pin_name FROM pins WHERE class_name = ?1 AND object_key = ?2")
                .map_err(sql)?;
            let rows = stmt
                .query_map(params![class_name, object_key], |row| row.get(0))
                .map_err(sql)?;
            rows.collect::<std::result::Result<_, _>>().map_err(sql)?
        };
        for table in ["pins", "pin_roots"] {
            tx.execute(
                &format!("DELETE FROM {} WHERE class_name = ?1 AND object_key = ?2", table),
                params![class_name, object_key],
            )
            .map_err(sql)?;
        }
        tx.execute(
            "DELETE FROM objects WHERE class_name = ?1 AND object_key = ?2",
            params![class_name, object_key],
        )
        .map_err(sql)?;
        for pin_name in &pin_names {
            Self::sync_manifest(&tx, pin_name)?;
        }
        tx.commit().map_err(sql)
    }

    /// Move an object stored under a local key to its remote object id.
    pub fn rekey_object(&self, class_name: &str, old_key: &str, new_key: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(sql)?;
        tx.execute(
            "UPDATE OR REPLACE objects SET object_key = ?3 WHERE class_name = ?1 AND object_key = ?2",
            params![class_name, old_key, new_key],
        )
        .map_err(sql)?;
        for table in ["pins", "pin_roots"] {
            tx.execute(
                &format!(
                    "UPDATE OR REPLACE {} SET object_key = ?3 WHERE class_name = ?1 AND object_key = ?2",
                    table
                ),
                params![class_name, old_key, new_key],
            )
            .map_err(sql)?;
        }
        let pin_names: Vec<String> = {
            let mut stmt = tx
                .prepare("SELECT DISTINCT pin_name FROM pins WHERE class_name = ?1 AND object_key = ?2")
                .map_err(sql)?;
            let rows = stmt
                .query_map(params![class_name, new_key], |row| row.get(0))
                .map_err(sql)?;
            rows.collect::<std::result::Result<_, _>>().map_err(sql)?
        };
        for pin_name in &pin_names {
            Self::sync_manifest(&tx, pin_name)?;
        }
        tx.commit().map_err(sql)
    }

    /// Store the serialized result of a query.
    pub fn put_query_result(&self, signature: &str, payload: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT OR REPLACE INTO query_results (signature, payload, cached_at)
            VALUES (?1, ?2, ?3)
            "#,
            params![signature, payload, chrono::Utc::now().to_rfc3339()],
        )
        .map_err(sql)?;
        Ok(())
    }

    /// Load the serialized result of a query, if cached.
    pub fn get_query_result(&self, signature: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT payload FROM query_results WHERE signature = ?1",
            [signature],
            |row| row.get(0),
        )
        .optional()
        .map_err(sql)
    }

    /// Drop every cached query result.
    pub fn clear_query_results(&self) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM query_results", []).map_err(sql)
    }

    /// Delete stored payloads that no pin references.
    pub fn compact(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn
            .execute(
                r#"
                DELETE FROM objects WHERE NOT EXISTS (
                    SELECT 1 FROM pins p
                    WHERE p.class_name = objects.class_name
                      AND p.object_key = objects.object_key
                )
                "#,
                [],
            )
            .map_err(sql)?;
        if removed > 0 {
            info!("Compacted {} unpinned objects", removed);
        }
        Ok(removed)
    }

    /// Check that every pin matches its manifest and every content-bearing
    /// membership has a readable payload.
    ///
    /// # Errors
    /// - `Integrity` describing the first violation found
    pub fn verify(&self) -> Result<IntegrityReport> {
        let conn = self.conn.lock();
        let mut report = IntegrityReport::default();

        let mismatched: Option<(String, i64, i64)> = conn
            .query_row(
                r#"
                SELECT m.pin_name, m.member_count,
                       (SELECT COUNT(*) FROM pins p WHERE p.pin_name = m.pin_name)
                FROM pin_manifest m
                WHERE m.member_count != (SELECT COUNT(*) FROM pins p WHERE p.pin_name = m.pin_name)
                LIMIT 1
                "#,
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(sql)?;
        if let Some((pin_name, expected, actual)) = mismatched {
            warn!("Pin '{}' manifest mismatch", pin_name);
            return Err(Error::Integrity(format!(
                "pin '{}' should have {} members but has {}",
                pin_name, expected, actual
            )));
        }

        let orphan_pin: Option<String> = conn
            .query_row(
                r#"
                SELECT DISTINCT p.pin_name FROM pins p
                WHERE NOT EXISTS (SELECT 1 FROM pin_manifest m WHERE m.pin_name = p.pin_name)
                LIMIT 1
                "#,
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql)?;
        if let Some(pin_name) = orphan_pin {
            return Err(Error::Integrity(format!(
                "pin '{}' has members but no manifest",
                pin_name
            )));
        }

        let stray_root: Option<(String, String, String)> = conn
            .query_row(
                r#"
                SELECT r.pin_name, r.class_name, r.object_key FROM pin_roots r
                WHERE NOT EXISTS (
                    SELECT 1 FROM pins p
                    WHERE p.pin_name = r.pin_name
                      AND p.class_name = r.class_name
                      AND p.object_key = r.object_key
                )
                LIMIT 1
                "#,
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(sql)?;
        if let Some((pin_name, class_name, object_key)) = stray_root {
            return Err(Error::Integrity(format!(
                "pin '{}' has root {}/{} that is not a member",
                pin_name, class_name, object_key
            )));
        }

        let missing: Option<(String, String, String)> = conn
            .query_row(
                r#"
                SELECT p.pin_name, p.class_name, p.object_key FROM pins p
                WHERE p.has_content = 1 AND NOT EXISTS (
                    SELECT 1 FROM objects o
                    WHERE o.class_name = p.class_name AND o.object_key = p.object_key
                )
                LIMIT 1
                "#,
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(sql)?;
        if let Some((pin_name, class_name, object_key)) = missing {
            return Err(Error::Integrity(format!(
                "pin '{}' references {}/{} but its data is missing",
                pin_name, class_name, object_key
            )));
        }

        report.pins_checked = conn
            .query_row("SELECT COUNT(*) FROM pin_manifest", [], |row| row.get::<_, i64>(0))
            .map_err(sql)? as usize;
        report.memberships_checked = conn
            .query_row("SELECT COUNT(*) FROM pins", [], |row| row.get::<_, i64>(0))
            .map_err(sql)? as usize;

        let mut stmt = conn
            .prepare("SELECT class_name, object_key, payload FROM objects")
            .map_err(sql)?;
        let mut rows = stmt.query([]).map_err(sql)?;
        while let Some(row) = rows.next().map_err(sql)? {
            let payload: String = row.get(2).map_err(sql)?;
            if serde_json::from_str::<serde_json::Value>(&payload).is_err() {
                let class_name: String = row.get(0).map_err(sql)?;
                let object_key: String = row.get(1).map_err(sql)?;
                return Err(Error::Integrity(format!(
                    "stored data for {}/{} is corrupt",
                    class_name, object_key
                )));
            }
            report.objects_checked += 1;
        }

        Ok(report)
    }
}
