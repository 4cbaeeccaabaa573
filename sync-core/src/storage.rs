//! Storage layer using SQLite
//!
//! # Tables
//!
//! - `sync_items` - Outbound queue items (key: seq, unique id)
//! - `sync_logs` - Audit log entries (key: seq, unique id)
//! - `heartbeat` - Worker liveness record (single row)
//! - `credentials` - LOS credentials per tenant
//! - `loans` - Local loan documents (key: loan id)
//! - `meta` - Schema version and other store facts
//!
//! Every queue transition touches an item and its log entries inside one
//! transaction.

use crate::{
    error::{Error, Result},
    types::{
        payload_hash, Credentials, Heartbeat, LocalLoan, LogStatus, OutcomeCounts, QueueDepth,
        QueueItem, QueueState, SyncLogEntry, SyncMode, SyncStatus,
    },
    Config,
};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Database file name inside the data directory
const DB_FILE: &str = "los_sync.db";

const ITEM_COLUMNS: &str = "seq, id, loan_id, mode, note, state, reason, attempts, \
     next_attempt_at_ms, payload_hash, replay_of, created_at_ms, updated_at_ms";

const LOG_COLUMNS: &str = "seq, id, item_id, loan_id, mode, status, message, note, \
     committed_fields, replay_of, attempts, created_at_ms, updated_at_ms";

/// Storage wrapper for SQLite
pub struct Storage {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").field("path", &self.path).finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let path = config.data_dir.join(DB_FILE);
        let conn = Connection::open(&path)?;

        let storage = Self {
            conn: Mutex::new(conn),
            path,
        };
        storage.migrate()?;

        tracing::info!("Opened sync store at {:?}", storage.path);

        Ok(storage)
    }

    /// Database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn migrate(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;

            CREATE TABLE IF NOT EXISTS sync_items (
              seq INTEGER PRIMARY KEY AUTOINCREMENT,
              id TEXT NOT NULL UNIQUE,
              loan_id TEXT NOT NULL,
              mode TEXT NOT NULL,
              note TEXT,
              state TEXT NOT NULL,
              reason TEXT,
              attempts INTEGER NOT NULL DEFAULT 0,
              next_attempt_at_ms INTEGER NOT NULL,
              payload_hash TEXT NOT NULL,
              replay_of TEXT,
              created_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sync_logs (
              seq INTEGER PRIMARY KEY AUTOINCREMENT,
              id TEXT NOT NULL UNIQUE,
              item_id TEXT,
              loan_id TEXT NOT NULL,
              mode TEXT,
              status TEXT NOT NULL,
              message TEXT NOT NULL,
              note TEXT,
              committed_fields TEXT NOT NULL DEFAULT '[]',
              replay_of TEXT,
              attempts INTEGER NOT NULL DEFAULT 0,
              created_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS heartbeat (
              id TEXT PRIMARY KEY,
              last_loop_at_ms INTEGER,
              last_error TEXT,
              updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS credentials (
              tenant TEXT PRIMARY KEY,
              username TEXT NOT NULL,
              password TEXT NOT NULL,
              site_name TEXT NOT NULL,
              updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS loans (
              id TEXT PRIMARY KEY,
              doc TEXT NOT NULL,
              updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS meta (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );
            INSERT OR IGNORE INTO meta(key, value) VALUES ('schema_version', '1');

            CREATE INDEX IF NOT EXISTS idx_items_state_seq ON sync_items(state, seq);
            CREATE INDEX IF NOT EXISTS idx_items_loan_state ON sync_items(loan_id, state);
            CREATE INDEX IF NOT EXISTS idx_items_replay_of ON sync_items(replay_of);
            CREATE INDEX IF NOT EXISTS idx_logs_updated ON sync_logs(updated_at_ms);
            CREATE INDEX IF NOT EXISTS idx_logs_loan ON sync_logs(loan_id, updated_at_ms);
            CREATE INDEX IF NOT EXISTS idx_logs_status ON sync_logs(status, updated_at_ms);
            "#,
        )?;
        Ok(())
    }

    /// Schema version recorded in `meta`
    pub fn schema_version(&self) -> Result<u32> {
        let version: String = self.conn.lock().query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )?;
        version
            .parse()
            .map_err(|_| Error::Storage(format!("Invalid schema version: {}", version)))
    }

    // Queue transitions (each one atomic)

    /// Insert a pending item and its primary log entry
    pub fn insert_item(
        &self,
        loan_id: &str,
        mode: SyncMode,
        note: Option<&str>,
        replay_of: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<QueueItem> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let id = Uuid::now_v7();
        let now_ms = to_ms(now);
        let hash = payload_hash(loan_id, mode, note);

        tx.execute(
            r#"
            INSERT INTO sync_items(id, loan_id, mode, note, state, reason, attempts,
                                   next_attempt_at_ms, payload_hash, replay_of,
                                   created_at_ms, updated_at_ms)
            VALUES (?1, ?2, ?3, ?4, 'pending', NULL, 0, ?5, ?6, ?7, ?5, ?5)
            "#,
            params![
                id.to_string(),
                loan_id,
                mode.as_str(),
                note,
                now_ms,
                hash,
                replay_of.map(|r| r.to_string()),
            ],
        )?;

        let message = match replay_of {
            Some(original) => format!("Replay of {} queued ({})", original, mode),
            None => format!("Queued {} for loan {}", mode, loan_id),
        };

        insert_log_tx(
            &tx,
            &SyncLogEntry {
                id,
                item_id: Some(id),
                loan_application_id: loan_id.to_string(),
                mode: Some(mode),
                status: LogStatus::Pending,
                message,
                note: note.map(str::to_string),
                committed_fields: Vec::new(),
                replay_of,
                attempts: 0,
                timestamp: now,
                updated_at: now,
            },
        )?;

        let item = get_item_tx(&tx, id)?
            .ok_or_else(|| Error::Storage(format!("Item {} vanished after insert", id)))?;
        tx.commit()?;

        tracing::debug!(item_id = %id, loan_id, mode = %mode, "Item enqueued");

        Ok(item)
    }

    /// Move the next claimable item to `in_flight`
    ///
    /// Claimable: pending, due, and no other item of the same loan is in
    /// flight or queued ahead of it.
    pub fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<QueueItem>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now_ms = to_ms(now);

        let seq: Option<i64> = tx
            .query_row(
                r#"
                SELECT p.seq FROM sync_items p
                WHERE p.state = 'pending'
                  AND p.next_attempt_at_ms <= ?1
                  AND NOT EXISTS (
                    SELECT 1 FROM sync_items q
                    WHERE q.loan_id = p.loan_id
                      AND q.seq <> p.seq
                      AND (q.state = 'in_flight' OR (q.state = 'pending' AND q.seq < p.seq))
                  )
                ORDER BY p.seq
                LIMIT 1
                "#,
                params![now_ms],
                |row| row.get(0),
            )
            .optional()?;

        let Some(seq) = seq else {
            return Ok(None);
        };

        tx.execute(
            r#"
            UPDATE sync_items
            SET state = 'in_flight', attempts = attempts + 1, updated_at_ms = ?2
            WHERE seq = ?1 AND state = 'pending'
            "#,
            params![seq, now_ms],
        )?;

        let item = tx
            .query_row(
                &format!("SELECT {} FROM sync_items WHERE seq = ?1", ITEM_COLUMNS),
                params![seq],
                ItemRow::read,
            )?
            .into_item()?;
        tx.commit()?;

        Ok(Some(item))
    }

    /// Resolve an in-flight item to a terminal status
    ///
    /// Updates the primary log entry unless it is already terminal.
    pub fn finish_item(
        &self,
        id: Uuid,
        status: &SyncStatus,
        message: &str,
        committed_fields: &[String],
        now: DateTime<Utc>,
    ) -> Result<QueueItem> {
        if !status.state().is_terminal() {
            return Err(Error::InvalidState(format!(
                "{} is not a terminal state",
                status.state()
            )));
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now_ms = to_ms(now);

        let item = require_in_flight_tx(&tx, id)?;

        tx.execute(
            r#"
            UPDATE sync_items SET state = ?2, reason = ?3, updated_at_ms = ?4
            WHERE id = ?1 AND state = 'in_flight'
            "#,
            params![id.to_string(), status.state().as_str(), status.reason(), now_ms],
        )?;

        tx.execute(
            r#"
            UPDATE sync_logs
            SET status = ?2, message = ?3, committed_fields = ?4, attempts = ?5, updated_at_ms = ?6
            WHERE id = ?1 AND status NOT IN ('success', 'error', 'dead_letter')
            "#,
            params![
                id.to_string(),
                LogStatus::from(status).as_str(),
                message,
                serde_json::to_string(committed_fields)?,
                item.attempts,
                now_ms,
            ],
        )?;

        let item = get_item_tx(&tx, id)?
            .ok_or_else(|| Error::Storage(format!("Item {} vanished during update", id)))?;
        tx.commit()?;

        Ok(item)
    }

    /// Return an in-flight item to `pending` after a retryable failure
    pub fn reschedule_item(
        &self,
        id: Uuid,
        next_attempt_at: DateTime<Utc>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<QueueItem> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now_ms = to_ms(now);

        let item = require_in_flight_tx(&tx, id)?;

        tx.execute(
            r#"
            UPDATE sync_items
            SET state = 'pending', reason = ?2, next_attempt_at_ms = ?3, updated_at_ms = ?4
            WHERE id = ?1 AND state = 'in_flight'
            "#,
            params![id.to_string(), reason, to_ms(next_attempt_at), now_ms],
        )?;

        let message = format!(
            "Attempt {} failed: {}; retrying after {}",
            item.attempts,
            reason,
            next_attempt_at.to_rfc3339()
        );

        tx.execute(
            "UPDATE sync_logs SET attempts = ?2, updated_at_ms = ?3 WHERE id = ?1 AND status = 'pending'",
            params![id.to_string(), item.attempts, now_ms],
        )?;

        insert_log_tx(
            &tx,
            &SyncLogEntry {
                id: Uuid::now_v7(),
                item_id: Some(id),
                loan_application_id: item.loan_id.clone(),
                mode: Some(item.mode),
                status: LogStatus::Info,
                message,
                note: None,
                committed_fields: Vec::new(),
                replay_of: None,
                attempts: item.attempts,
                timestamp: now,
                updated_at: now,
            },
        )?;

        let item = get_item_tx(&tx, id)?
            .ok_or_else(|| Error::Storage(format!("Item {} vanished during update", id)))?;
        tx.commit()?;

        Ok(item)
    }

    /// Put items orphaned in `in_flight` (worker crash) back to `pending`
    ///
    /// The interrupted attempt never produced an outcome, so it is not
    /// counted: `attempts` goes back to its value before the claim.
    pub fn recover_in_flight(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now_ms = to_ms(now);

        let orphans: Vec<(String, String, Option<String>, u32)> = {
            let mut stmt = tx.prepare(
                "SELECT id, loan_id, mode, attempts FROM sync_items WHERE state = 'in_flight'",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        for (id, loan_id, mode, attempts) in &orphans {
            let attempts = attempts.saturating_sub(1);
            tx.execute(
                r#"
                UPDATE sync_items
                SET state = 'pending', attempts = ?3, next_attempt_at_ms = ?2, updated_at_ms = ?2
                WHERE id = ?1
                "#,
                params![id, now_ms, attempts],
            )?;

            insert_log_tx(
                &tx,
                &SyncLogEntry {
                    id: Uuid::now_v7(),
                    item_id: Some(parse_uuid(id)?),
                    loan_application_id: loan_id.clone(),
                    mode: mode.as_deref().map(str::parse).transpose()?,
                    status: LogStatus::Info,
                    message: "Recovered in-flight item after restart".to_string(),
                    note: None,
                    committed_fields: Vec::new(),
                    replay_of: None,
                    attempts,
                    timestamp: now,
                    updated_at: now,
                },
            )?;
        }

        tx.commit()?;
        Ok(orphans.len())
    }

    // Queue reads

    /// Get item by ID
    pub fn get_item(&self, id: Uuid) -> Result<Option<QueueItem>> {
        let conn = self.conn.lock();
        query_item(&conn, id)
    }

    /// Newest replay of `original` that has not finished yet
    pub fn active_replay_of(&self, original: Uuid) -> Result<Option<QueueItem>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM sync_items WHERE replay_of = ?1 AND state IN ('pending', 'in_flight') \
                 ORDER BY seq DESC LIMIT 1",
                ITEM_COLUMNS
            ),
            params![original.to_string()],
            ItemRow::read,
        )
        .optional()?
        .map(ItemRow::into_item)
        .transpose()
    }

    /// Count items per non-terminal state plus dead letters
    pub fn queue_depth(&self) -> Result<QueueDepth> {
        let counts = self.state_counts()?;
        let get = |state: QueueState| {
            counts
                .iter()
                .find(|(s, _)| *s == state)
                .map(|(_, n)| *n)
                .unwrap_or(0)
        };

        Ok(QueueDepth {
            pending: get(QueueState::Pending),
            in_flight: get(QueueState::InFlight),
            dead_letter: get(QueueState::DeadLetter),
        })
    }

    /// Count items per terminal state
    pub fn outcome_counts(&self) -> Result<OutcomeCounts> {
        let counts = self.state_counts()?;
        let get = |state: QueueState| {
            counts
                .iter()
                .find(|(s, _)| *s == state)
                .map(|(_, n)| *n)
                .unwrap_or(0)
        };

        Ok(OutcomeCounts {
            success: get(QueueState::Success),
            error: get(QueueState::Error),
            dead_letter: get(QueueState::DeadLetter),
        })
    }

    fn state_counts(&self) -> Result<Vec<(QueueState, u64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM sync_items GROUP BY state")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = Vec::new();
        for row in rows {
            let (state, count) = row?;
            let state = QueueState::parse(&state)
                .ok_or_else(|| Error::Storage(format!("Unknown item state: {}", state)))?;
            counts.push((state, count.max(0) as u64));
        }
        Ok(counts)
    }

    // Log reads

    /// Get log entry by ID
    pub fn get_log(&self, id: Uuid) -> Result<Option<SyncLogEntry>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM sync_logs WHERE id = ?1", LOG_COLUMNS),
            params![id.to_string()],
            LogRow::read,
        )
        .optional()?
        .map(LogRow::into_entry)
        .transpose()
    }

    /// Most recent log entries, newest first
    pub fn recent_logs(&self, limit: usize) -> Result<Vec<SyncLogEntry>> {
        self.query_logs(
            &format!(
                "SELECT {} FROM sync_logs ORDER BY updated_at_ms DESC, seq DESC LIMIT ?1",
                LOG_COLUMNS
            ),
            params![limit as i64],
        )
    }

    /// Log entries of one loan, newest first
    pub fn loan_logs(&self, loan_id: &str, limit: usize) -> Result<Vec<SyncLogEntry>> {
        self.query_logs(
            &format!(
                "SELECT {} FROM sync_logs WHERE loan_id = ?1 \
                 ORDER BY updated_at_ms DESC, seq DESC LIMIT ?2",
                LOG_COLUMNS
            ),
            params![loan_id, limit as i64],
        )
    }

    /// Dead-lettered primary entries, newest first
    pub fn dead_letter_logs(&self, limit: usize) -> Result<Vec<SyncLogEntry>> {
        self.query_logs(
            &format!(
                "SELECT {} FROM sync_logs WHERE status = 'dead_letter' \
                 ORDER BY updated_at_ms DESC, seq DESC LIMIT ?1",
                LOG_COLUMNS
            ),
            params![limit as i64],
        )
    }

    fn query_logs(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<SyncLogEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, LogRow::read)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_entry()?);
        }
        Ok(entries)
    }

    // Heartbeat

    /// Store the worker heartbeat
    pub fn put_heartbeat(&self, heartbeat: &Heartbeat, now: DateTime<Utc>) -> Result<()> {
        self.conn.lock().execute(
            r#"
            INSERT INTO heartbeat(id, last_loop_at_ms, last_error, updated_at_ms)
            VALUES ('sync', ?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
              last_loop_at_ms = excluded.last_loop_at_ms,
              last_error = excluded.last_error,
              updated_at_ms = excluded.updated_at_ms
            "#,
            params![
                heartbeat.last_loop_at.map(to_ms),
                heartbeat.last_error,
                to_ms(now)
            ],
        )?;
        Ok(())
    }

    /// Read the worker heartbeat
    pub fn get_heartbeat(&self) -> Result<Option<Heartbeat>> {
        let conn = self.conn.lock();
        let row: Option<(Option<i64>, Option<String>)> = conn
            .query_row(
                "SELECT last_loop_at_ms, last_error FROM heartbeat WHERE id = 'sync'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((last_loop_at_ms, last_error)) = row else {
            return Ok(None);
        };

        Ok(Some(Heartbeat {
            last_loop_at: last_loop_at_ms.map(from_ms).transpose()?,
            last_error,
        }))
    }

    // Credentials

    /// Store credentials for a tenant
    pub fn put_credentials(&self, tenant: &str, creds: &Credentials, now: DateTime<Utc>) -> Result<()> {
        self.conn.lock().execute(
            r#"
            INSERT INTO credentials(tenant, username, password, site_name, updated_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(tenant) DO UPDATE SET
              username = excluded.username,
              password = excluded.password,
              site_name = excluded.site_name,
              updated_at_ms = excluded.updated_at_ms
            "#,
            params![tenant, creds.username, creds.password, creds.site_name, to_ms(now)],
        )?;
        Ok(())
    }

    /// Read credentials for a tenant
    pub fn get_credentials(&self, tenant: &str) -> Result<Option<Credentials>> {
        let conn = self.conn.lock();
        let creds = conn
            .query_row(
                "SELECT username, password, site_name FROM credentials WHERE tenant = ?1",
                params![tenant],
                |row| {
                    Ok(Credentials {
                        username: row.get(0)?,
                        password: row.get(1)?,
                        site_name: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(creds)
    }

    // Loan documents

    /// Upsert a loan document
    pub fn put_loan(&self, loan: &LocalLoan) -> Result<()> {
        let doc = serde_json::to_string(loan)?;
        self.conn.lock().execute(
            r#"
            INSERT INTO loans(id, doc, updated_at_ms) VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET doc = excluded.doc, updated_at_ms = excluded.updated_at_ms
            "#,
            params![loan.id, doc, to_ms(loan.updated_at)],
        )?;
        Ok(())
    }

    /// Get a loan document by ID
    pub fn get_loan(&self, id: &str) -> Result<Option<LocalLoan>> {
        let conn = self.conn.lock();
        let doc: Option<String> = conn
            .query_row("SELECT doc FROM loans WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;

        match doc {
            Some(doc) => Ok(Some(serde_json::from_str(&doc)?)),
            None => Ok(None),
        }
    }
}

// Transaction helpers

fn insert_log_tx(tx: &Transaction<'_>, entry: &SyncLogEntry) -> Result<()> {
    tx.execute(
        r#"
        INSERT INTO sync_logs(id, item_id, loan_id, mode, status, message, note,
                              committed_fields, replay_of, attempts, created_at_ms, updated_at_ms)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
        params![
            entry.id.to_string(),
            entry.item_id.map(|i| i.to_string()),
            entry.loan_application_id,
            entry.mode.map(|m| m.as_str()),
            entry.status.as_str(),
            entry.message,
            entry.note,
            serde_json::to_string(&entry.committed_fields)?,
            entry.replay_of.map(|r| r.to_string()),
            entry.attempts,
            to_ms(entry.timestamp),
            to_ms(entry.updated_at),
        ],
    )?;
    Ok(())
}

fn query_item(conn: &Connection, id: Uuid) -> Result<Option<QueueItem>> {
    conn.query_row(
        &format!("SELECT {} FROM sync_items WHERE id = ?1", ITEM_COLUMNS),
        params![id.to_string()],
        ItemRow::read,
    )
    .optional()?
    .map(ItemRow::into_item)
    .transpose()
}

fn get_item_tx(tx: &Transaction<'_>, id: Uuid) -> Result<Option<QueueItem>> {
    query_item(tx, id)
}

fn require_in_flight_tx(tx: &Transaction<'_>, id: Uuid) -> Result<QueueItem> {
    let item = get_item_tx(tx, id)?.ok_or_else(|| Error::NotFound(format!("Queue item {}", id)))?;

    if item.status.state() != QueueState::InFlight {
        return Err(Error::InvalidState(format!(
            "Item {} is {}, expected in_flight",
            id,
            item.status.state()
        )));
    }

    Ok(item)
}

// Row mapping

struct ItemRow {
    seq: i64,
    id: String,
    loan_id: String,
    mode: String,
    note: Option<String>,
    state: String,
    reason: Option<String>,
    attempts: i64,
    next_attempt_at_ms: i64,
    payload_hash: String,
    replay_of: Option<String>,
    created_at_ms: i64,
    updated_at_ms: i64,
}

impl ItemRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            loan_id: row.get(2)?,
            mode: row.get(3)?,
            note: row.get(4)?,
            state: row.get(5)?,
            reason: row.get(6)?,
            attempts: row.get(7)?,
            next_attempt_at_ms: row.get(8)?,
            payload_hash: row.get(9)?,
            replay_of: row.get(10)?,
            created_at_ms: row.get(11)?,
            updated_at_ms: row.get(12)?,
        })
    }

    fn into_item(self) -> Result<QueueItem> {
        let attempts = self.attempts.max(0) as u32;
        let state = QueueState::parse(&self.state)
            .ok_or_else(|| Error::Storage(format!("Unknown item state: {}", self.state)))?;
        let reason = self.reason.unwrap_or_default();

        let status = match state {
            QueueState::Pending => SyncStatus::Pending,
            QueueState::InFlight => SyncStatus::InFlight,
            QueueState::Success => SyncStatus::Success,
            QueueState::Error => SyncStatus::Error { reason },
            QueueState::DeadLetter => SyncStatus::DeadLetter { reason, attempts },
        };

        Ok(QueueItem {
            id: parse_uuid(&self.id)?,
            seq: self.seq,
            loan_id: self.loan_id,
            mode: self.mode.parse()?,
            note: self.note,
            status,
            attempts,
            next_attempt_at: from_ms(self.next_attempt_at_ms)?,
            payload_hash: self.payload_hash,
            replay_of: self.replay_of.as_deref().map(parse_uuid).transpose()?,
            created_at: from_ms(self.created_at_ms)?,
            updated_at: from_ms(self.updated_at_ms)?,
        })
    }
}

struct LogRow {
    id: String,
    item_id: Option<String>,
    loan_id: String,
    mode: Option<String>,
    status: String,
    message: String,
    note: Option<String>,
    committed_fields: String,
    replay_of: Option<String>,
    attempts: i64,
    created_at_ms: i64,
    updated_at_ms: i64,
}

impl LogRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(1)?,
            item_id: row.get(2)?,
            loan_id: row.get(3)?,
            mode: row.get(4)?,
            status: row.get(5)?,
            message: row.get(6)?,
            note: row.get(7)?,
            committed_fields: row.get(8)?,
            replay_of: row.get(9)?,
            attempts: row.get(10)?,
            created_at_ms: row.get(11)?,
            updated_at_ms: row.get(12)?,
        })
    }

    fn into_entry(self) -> Result<SyncLogEntry> {
        Ok(SyncLogEntry {
            id: parse_uuid(&self.id)?,
            item_id: self.item_id.as_deref().map(parse_uuid).transpose()?,
            loan_application_id: self.loan_id,
            mode: self.mode.as_deref().map(str::parse).transpose()?,
            status: LogStatus::parse(&self.status)
                .ok_or_else(|| Error::Storage(format!("Unknown log status: {}", self.status)))?,
            message: self.message,
            note: self.note,
            committed_fields: serde_json::from_str(&self.committed_fields)?,
            replay_of: self.replay_of.as_deref().map(parse_uuid).transpose()?,
            attempts: self.attempts.max(0) as u32,
            timestamp: from_ms(self.created_at_ms)?,
            updated_at: from_ms(self.updated_at_ms)?,
        })
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::Storage(format!("Invalid id {}: {}", s, e)))
}

fn to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_ms(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| Error::Storage(format!("Invalid timestamp: {}", ms)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (Storage::open(&config).unwrap(), temp_dir)
    }

    #[test]
    fn test_storage_open_creates_file() {
        let (storage, _temp) = test_storage();
        assert!(storage.path().exists());
        assert_eq!(storage.schema_version().unwrap(), 1);
    }

    #[test]
    fn test_insert_item_creates_pending_log() {
        let (storage, _temp) = test_storage();
        let now = Utc::now();

        let item = storage
            .insert_item("L1", SyncMode::Commit, Some("month-end"), None, now)
            .unwrap();
        assert_eq!(item.status, SyncStatus::Pending);
        assert_eq!(item.attempts, 0);

        let log = storage.get_log(item.id).unwrap().unwrap();
        assert_eq!(log.status, LogStatus::Pending);
        assert_eq!(log.item_id, Some(item.id));
        assert_eq!(log.note.as_deref(), Some("month-end"));
        assert_eq!(log.mode, Some(SyncMode::Commit));
    }

    #[test]
    fn test_claim_respects_per_loan_order() {
        let (storage, _temp) = test_storage();
        let now = Utc::now();

        let first = storage.insert_item("L1", SyncMode::DryRun, None, None, now).unwrap();
        let _second = storage.insert_item("L1", SyncMode::Commit, None, None, now).unwrap();
        let other = storage.insert_item("L2", SyncMode::DryRun, None, None, now).unwrap();

        let claimed = storage.claim_next(now).unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.attempts, 1);

        // L1's second item waits while the first is in flight
        let claimed = storage.claim_next(now).unwrap().unwrap();
        assert_eq!(claimed.id, other.id);
        assert!(storage.claim_next(now).unwrap().is_none());
    }

    #[test]
    fn test_backoff_blocks_later_items_of_same_loan() {
        let (storage, _temp) = test_storage();
        let now = Utc::now();

        let first = storage.insert_item("L1", SyncMode::Commit, None, None, now).unwrap();
        storage.insert_item("L1", SyncMode::DryRun, None, None, now).unwrap();

        storage.claim_next(now).unwrap().unwrap();
        storage
            .reschedule_item(first.id, now + Duration::seconds(30), "timeout", now)
            .unwrap();

        assert!(storage.claim_next(now).unwrap().is_none());

        let later = now + Duration::seconds(31);
        let claimed = storage.claim_next(later).unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.attempts, 2);
    }

    #[test]
    fn test_finish_item_requires_in_flight() {
        let (storage, _temp) = test_storage();
        let now = Utc::now();

        let item = storage.insert_item("L1", SyncMode::DryRun, None, None, now).unwrap();
        let result = storage.finish_item(item.id, &SyncStatus::Success, "done", &[], now);
        assert!(matches!(result, Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_finish_item_updates_primary_log() {
        let (storage, _temp) = test_storage();
        let now = Utc::now();

        let item = storage.insert_item("L1", SyncMode::Commit, None, None, now).unwrap();
        storage.claim_next(now).unwrap();
        let fields = vec!["requestedAmount".to_string()];
        let done = storage
            .finish_item(item.id, &SyncStatus::Success, "Committed 1 field", &fields, now)
            .unwrap();
        assert_eq!(done.status, SyncStatus::Success);

        let log = storage.get_log(item.id).unwrap().unwrap();
        assert_eq!(log.status, LogStatus::Success);
        assert_eq!(log.committed_fields, fields);
        assert_eq!(log.attempts, 1);
    }

    #[test]
    fn test_reschedule_appends_info_entry() {
        let (storage, _temp) = test_storage();
        let now = Utc::now();

        let item = storage.insert_item("L1", SyncMode::Validate, None, None, now).unwrap();
        storage.claim_next(now).unwrap();
        storage
            .reschedule_item(item.id, now + Duration::seconds(2), "connection refused", now)
            .unwrap();

        let logs = storage.loan_logs("L1", 10).unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().any(|l| l.status == LogStatus::Info));
        assert_eq!(storage.get_log(item.id).unwrap().unwrap().status, LogStatus::Pending);
    }

    #[test]
    fn test_recover_in_flight() {
        let (storage, _temp) = test_storage();
        let now = Utc::now();

        let item = storage.insert_item("L1", SyncMode::DryRun, None, None, now).unwrap();
        storage.claim_next(now).unwrap();
        assert_eq!(storage.queue_depth().unwrap().in_flight, 1);

        assert_eq!(storage.recover_in_flight(now).unwrap(), 1);
        let depth = storage.queue_depth().unwrap();
        assert_eq!(depth.in_flight, 0);
        assert_eq!(depth.pending, 1);
        assert_eq!(storage.get_item(item.id).unwrap().unwrap().attempts, 0);

        // Reclaiming counts the attempt once, not twice
        let reclaimed = storage.claim_next(now).unwrap().unwrap();
        assert_eq!(reclaimed.attempts, 1);
    }

    #[test]
    fn test_heartbeat_roundtrip() {
        let (storage, _temp) = test_storage();
        assert!(storage.get_heartbeat().unwrap().is_none());

        let now = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let heartbeat = Heartbeat {
            last_loop_at: Some(now),
            last_error: Some("boom".to_string()),
        };
        storage.put_heartbeat(&heartbeat, now).unwrap();
        assert_eq!(storage.get_heartbeat().unwrap(), Some(heartbeat));
    }

    #[test]
    fn test_loan_document_upsert() {
        let (storage, _temp) = test_storage();
        let mut loan = LocalLoan {
            id: "L1".to_string(),
            business_name: Some("Acme Corp".to_string()),
            requested_amount: Some(rust_decimal::Decimal::new(50000, 0)),
            status: "in_review".to_string(),
            officer_name: None,
            external_loan_id: None,
            target_close_date: None,
            updated_at: Utc::now(),
        };
        storage.put_loan(&loan).unwrap();

        loan.external_loan_id = Some("1001".to_string());
        storage.put_loan(&loan).unwrap();

        let stored = storage.get_loan("L1").unwrap().unwrap();
        assert_eq!(stored.external_loan_id.as_deref(), Some("1001"));
        assert!(storage.get_loan("missing").unwrap().is_none());
    }
}
