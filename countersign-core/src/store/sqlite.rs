//! `SQLite`-backed store.
//!
//! Uses WAL mode. Requests and signature records are stored as JSON bodies
//! next to the columns used for filtering; audit entries are stored column by
//! column keyed by `sequence_number`, and triggers refuse updates and deletes.

// SQLite hands back i64 for integers; sequence numbers are never negative.
#![allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]

use super::{AuditFilter, CommitBatch, Store};
use crate::audit::{AuditEntry, ChainHead, Metadata};
use crate::emergency::EmergencyState;
use crate::error::{Error, Result};
use crate::ledger::{SignatureRecord, SignatureSet};
use crate::request::{AuthorizationRequest, RequestFilter, RequestId};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::ToSql;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

const AUDIT_COLUMNS: &str = "sequence_number, timestamp, actor, action, subject_ref, request_id, \
                             metadata, previous_entry_hash, entry_hash";

/// [`Store`] backed by a single `SQLite` connection.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        debug!(path = %path.display(), "sqlite store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an existing database without write access (offline verification).
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Private in-memory database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::poisoned("sqlite connection"))
    }
}

fn timestamp(t: &DateTime<Utc>) -> String {
    // Fixed-width so lexical order is chronological.
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::StorageError(format!("bad timestamp '{}': {}", s, e)))
}

/// Audit row exactly as stored.
struct AuditRow {
    sequence_number: i64,
    timestamp: String,
    actor: String,
    action: String,
    subject_ref: String,
    request_id: Option<String>,
    metadata: String,
    previous_entry_hash: String,
    entry_hash: String,
}

impl AuditRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            sequence_number: row.get(0)?,
            timestamp: row.get(1)?,
            actor: row.get(2)?,
            action: row.get(3)?,
            subject_ref: row.get(4)?,
            request_id: row.get(5)?,
            metadata: row.get(6)?,
            previous_entry_hash: row.get(7)?,
            entry_hash: row.get(8)?,
        })
    }
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = Error;

    fn try_from(row: AuditRow) -> Result<Self> {
        let metadata: Metadata = serde_json::from_str(&row.metadata)?;
        Ok(AuditEntry {
            sequence_number: row.sequence_number as u64,
            timestamp: parse_timestamp(&row.timestamp)?,
            actor: row.actor,
            action: row.action.parse()?,
            subject_ref: row.subject_ref,
            request_id: row.request_id.map(RequestId::parse).transpose()?,
            metadata,
            previous_entry_hash: row.previous_entry_hash,
            entry_hash: row.entry_hash,
        })
    }
}

fn collect_entries(rows: Vec<AuditRow>) -> Result<Vec<AuditEntry>> {
    rows.into_iter().map(AuditEntry::try_from).collect()
}

impl Store for SqliteStore {
    fn commit(&self, batch: CommitBatch) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        if let Some(request) = &batch.request {
            tx.execute(
                "INSERT INTO requests (id, kind, subject_ref, status, created_at, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET status = excluded.status, body = excluded.body",
                params![
                    request.id.as_str(),
                    request.kind.as_str(),
                    request.subject_ref,
                    request.status.as_str(),
                    timestamp(&request.created_at),
                    serde_json::to_string(request)?,
                ],
            )?;
        }

        if !batch.signatures.is_empty() {
            let mut stmt = tx.prepare(
                "INSERT INTO signatures (request_id, authority_id, recorded_at, body)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for record in &batch.signatures {
                stmt.execute(params![
                    record.request_id.as_str(),
                    record.authority_id.as_str(),
                    timestamp(&record.recorded_at),
                    serde_json::to_string(record)?,
                ])?;
            }
        }

        if let Some(first) = batch.audit.first() {
            let last: Option<i64> =
                tx.query_row("SELECT MAX(sequence_number) FROM audit_entries", [], |row| {
                    row.get(0)
                })?;
            let expected = last.unwrap_or(0) as u64 + 1;
            if first.sequence_number != expected {
                return Err(Error::StorageError(format!(
                    "audit entry {} does not continue chain at {}",
                    first.sequence_number, expected
                )));
            }

            let mut stmt = tx.prepare(&format!(
                "INSERT INTO audit_entries ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                AUDIT_COLUMNS
            ))?;
            for entry in &batch.audit {
                stmt.execute(params![
                    entry.sequence_number as i64,
                    entry
                        .timestamp
                        .to_rfc3339_opts(SecondsFormat::Millis, true),
                    entry.actor,
                    entry.action.as_str(),
                    entry.subject_ref,
                    entry.request_id.as_ref().map(RequestId::as_str),
                    serde_json::to_string(&entry.metadata)?,
                    entry.previous_entry_hash,
                    entry.entry_hash,
                ])?;
            }
        }

        if let Some(emergency) = &batch.emergency {
            tx.execute(
                "INSERT OR REPLACE INTO emergency_state (id, body) VALUES (1, ?1)",
                params![serde_json::to_string(emergency)?],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn load_request(&self, id: &RequestId) -> Result<Option<AuthorizationRequest>> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM requests WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(Error::from))
            .transpose()
    }

    fn load_signatures(&self, id: &RequestId) -> Result<SignatureSet> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT body FROM signatures WHERE request_id = ?1 ORDER BY id ASC")?;
        let bodies = stmt
            .query_map(params![id.as_str()], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str::<SignatureRecord>(b).map_err(Error::from))
            .collect()
    }

    fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<AuthorizationRequest>> {
        let mut sql = String::from("SELECT body FROM requests WHERE 1 = 1");
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(status) = filter.status {
            args.push(Box::new(status.as_str()));
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        if let Some(kind) = filter.kind {
            args.push(Box::new(kind.as_str()));
            sql.push_str(&format!(" AND kind = ?{}", args.len()));
        }
        if let Some(subject) = &filter.subject_ref {
            args.push(Box::new(subject.clone()));
            sql.push_str(&format!(" AND subject_ref = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            args.push(Box::new(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", args.len()));
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let bodies = stmt
            .query_map(params_from_iter(args.iter()), |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(Error::from))
            .collect()
    }

    fn open_requests(&self) -> Result<Vec<AuthorizationRequest>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT body FROM requests WHERE status IN ('PENDING', 'PARTIAL') \
             ORDER BY created_at ASC",
        )?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(Error::from))
            .collect()
    }

    fn audit_entries(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let mut sql = format!("SELECT {} FROM audit_entries WHERE 1 = 1", AUDIT_COLUMNS);
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(action) = filter.action {
            args.push(Box::new(action.as_str()));
            sql.push_str(&format!(" AND action = ?{}", args.len()));
        }
        if let Some(actor) = &filter.actor {
            args.push(Box::new(actor.clone()));
            sql.push_str(&format!(" AND actor = ?{}", args.len()));
        }
        if let Some(subject) = &filter.subject_ref {
            args.push(Box::new(subject.clone()));
            sql.push_str(&format!(" AND subject_ref = ?{}", args.len()));
        }
        if let Some(request_id) = &filter.request_id {
            args.push(Box::new(request_id.as_str().to_string()));
            sql.push_str(&format!(" AND request_id = ?{}", args.len()));
        }
        if let Some(from) = filter.from_sequence {
            args.push(Box::new(from as i64));
            sql.push_str(&format!(" AND sequence_number >= ?{}", args.len()));
        }
        sql.push_str(" ORDER BY sequence_number ASC");
        if let Some(limit) = filter.limit {
            args.push(Box::new(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", args.len()));
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), AuditRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        collect_entries(rows)
    }

    fn audit_page(&self, from: u64, limit: usize) -> Result<Vec<AuditEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM audit_entries WHERE sequence_number >= ?1
             ORDER BY sequence_number ASC LIMIT ?2",
            AUDIT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![from as i64, limit as i64], AuditRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        collect_entries(rows)
    }

    fn audit_entry(&self, sequence_number: u64) -> Result<Option<AuditEntry>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM audit_entries WHERE sequence_number = ?1",
                    AUDIT_COLUMNS
                ),
                params![sequence_number as i64],
                AuditRow::read,
            )
            .optional()?;
        row.map(AuditEntry::try_from).transpose()
    }

    fn chain_head(&self) -> Result<ChainHead> {
        let conn = self.lock()?;
        let head: Option<(i64, String)> = conn
            .query_row(
                "SELECT sequence_number, entry_hash FROM audit_entries
                 ORDER BY sequence_number DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(head.map_or_else(ChainHead::genesis, |(seq, hash)| ChainHead {
            last_sequence: seq as u64,
            last_hash: hash,
        }))
    }

    fn load_emergency(&self) -> Result<Option<EmergencyState>> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row("SELECT body FROM emergency_state WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(Error::from))
            .transpose()
    }
}
