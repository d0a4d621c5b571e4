//! SQLite-backed durable message queue.
//!
//! Every inbound and outbound HL7 message is persisted here so nothing is
//! lost across crashes or rolling upgrades. Rows are never deleted; each
//! status transition appends its own timestamp column, leaving a full audit
//! trail.
//!
//! The queue file is single-writer by convention. An ownership marker file
//! beside the database records the owning process id so the next agent
//! generation can wait for a safe handoff (see
//! [`DurableQueue::wait_for_queue_release`]).
//!
//! # Thread Safety
//!
//! All access funnels through one connection and its statement cache; the
//! queue itself adds no locking. Callers on a multi-threaded runtime wrap
//! the queue in their own synchronization.

mod status;

pub use status::MessageStatus;

use crate::config::QueueConfig;
use crate::error::{AgentError, Result};
use crate::hl7::Hl7Message;
use crate::platform;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Ordered schema migrations, tracked by numeric id (index + 1) in the
/// `schema_migrations` table. Append only - never edit an applied entry.
const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS hl7_messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        received_time INTEGER NOT NULL,
        raw_message TEXT NOT NULL,
        sender TEXT,
        receiver TEXT,
        message_ctrl_id TEXT,
        channel TEXT,
        remote TEXT,
        callback TEXT,
        status TEXT NOT NULL CHECK(status IN (
            'received','sent','timed_out','error','commit_acked','app_acked',
            'response_queued','response_sent','response_timed_out','response_error')),
        retry_count INTEGER DEFAULT 0,
        last_retry INTEGER,
        queued_time INTEGER,
        sent_time INTEGER,
        timed_out_time INTEGER,
        error_time INTEGER,
        commit_acked_time INTEGER,
        app_acked_time INTEGER,
        response_message TEXT,
        response_queued_time INTEGER,
        response_sent_time INTEGER,
        response_timed_out_time INTEGER,
        response_error_time INTEGER,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP,
        updated_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    // Performance indexes for common query patterns
    "CREATE INDEX IF NOT EXISTS idx_hl7_messages_status ON hl7_messages(status);",
    "CREATE INDEX IF NOT EXISTS idx_hl7_messages_status_received_time
        ON hl7_messages(status, received_time);",
    "CREATE INDEX IF NOT EXISTS idx_hl7_messages_callback
        ON hl7_messages(callback) WHERE callback IS NOT NULL;",
    "CREATE INDEX IF NOT EXISTS idx_hl7_messages_remote
        ON hl7_messages(remote) WHERE remote IS NOT NULL;",
    "CREATE INDEX IF NOT EXISTS idx_hl7_messages_channel_status
        ON hl7_messages(channel, status, received_time);",
];

const INSERT_MESSAGE: &str = "INSERT INTO hl7_messages \
    (received_time, raw_message, sender, receiver, message_ctrl_id, channel, remote, callback, status) \
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'received')";

const GET_NEXT_MESSAGE: &str = "SELECT id, received_time, raw_message, sender, receiver, \
    message_ctrl_id, channel, remote, callback, status, retry_count, last_retry, response_message \
    FROM hl7_messages \
    WHERE channel = ?1 AND status IN ('received', 'timed_out') \
    ORDER BY received_time ASC \
    LIMIT 1";

const GET_NEXT_RECEIVED: &str = "SELECT id, received_time, raw_message, sender, receiver, \
    message_ctrl_id, channel, remote, callback, status, retry_count, last_retry, response_message \
    FROM hl7_messages \
    WHERE status = 'received' \
    ORDER BY received_time ASC \
    LIMIT 1";

const GET_ALL_RECEIVED: &str = "SELECT id, received_time, raw_message, sender, receiver, \
    message_ctrl_id, channel, remote, callback, status, retry_count, last_retry, response_message \
    FROM hl7_messages \
    WHERE status = 'received' \
    ORDER BY received_time ASC \
    LIMIT ?1";

const GET_NEXT_RESPONSE_QUEUED: &str = "SELECT id, received_time, raw_message, sender, receiver, \
    message_ctrl_id, channel, remote, callback, status, retry_count, last_retry, response_message \
    FROM hl7_messages \
    WHERE status = 'response_queued' \
    ORDER BY response_queued_time ASC \
    LIMIT 1";

const GET_BY_CALLBACK: &str = "SELECT id, received_time, raw_message, sender, receiver, \
    message_ctrl_id, channel, remote, callback, status, retry_count, last_retry, response_message \
    FROM hl7_messages \
    WHERE callback = ?1 \
    LIMIT 1";

const GET_BY_REMOTE: &str = "SELECT id, received_time, raw_message, sender, receiver, \
    message_ctrl_id, channel, remote, callback, status, retry_count, last_retry, response_message \
    FROM hl7_messages \
    WHERE remote = ?1 \
    LIMIT 1";

const COUNT_BY_STATUS: &str = "SELECT COUNT(*) FROM hl7_messages WHERE status = ?1";

const MARK_SENT: &str = "UPDATE hl7_messages \
    SET status = 'sent', sent_time = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2";
const MARK_COMMIT_ACKED: &str = "UPDATE hl7_messages \
    SET status = 'commit_acked', commit_acked_time = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2";
const MARK_APP_ACKED: &str = "UPDATE hl7_messages \
    SET status = 'app_acked', app_acked_time = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2";
const MARK_ERROR: &str = "UPDATE hl7_messages \
    SET status = 'error', error_time = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2";
const MARK_TIMED_OUT: &str = "UPDATE hl7_messages \
    SET status = 'timed_out', timed_out_time = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2";
const MARK_RESPONSE_QUEUED: &str = "UPDATE hl7_messages \
    SET status = 'response_queued', response_message = ?1, response_queued_time = ?2, \
        updated_at = CURRENT_TIMESTAMP WHERE id = ?3";
const MARK_RESPONSE_SENT: &str = "UPDATE hl7_messages \
    SET status = 'response_sent', response_sent_time = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2";
const MARK_RESPONSE_TIMED_OUT: &str = "UPDATE hl7_messages \
    SET status = 'response_timed_out', response_timed_out_time = ?1, updated_at = CURRENT_TIMESTAMP \
    WHERE id = ?2";
const MARK_RESPONSE_ERROR: &str = "UPDATE hl7_messages \
    SET status = 'response_error', response_error_time = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2";

/// Every statement the queue uses; the cache is warmed with these at init
/// so no statement is compiled twice.
const ALL_STATEMENTS: &[&str] = &[
    INSERT_MESSAGE,
    GET_NEXT_MESSAGE,
    GET_NEXT_RECEIVED,
    GET_ALL_RECEIVED,
    GET_NEXT_RESPONSE_QUEUED,
    GET_BY_CALLBACK,
    GET_BY_REMOTE,
    COUNT_BY_STATUS,
    MARK_SENT,
    MARK_COMMIT_ACKED,
    MARK_APP_ACKED,
    MARK_ERROR,
    MARK_TIMED_OUT,
    MARK_RESPONSE_QUEUED,
    MARK_RESPONSE_SENT,
    MARK_RESPONSE_TIMED_OUT,
    MARK_RESPONSE_ERROR,
];

/// One persisted queue row.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub id: i64,
    pub received_time: i64,
    pub raw_message: String,
    pub sender: Option<String>,
    pub receiver: Option<String>,
    pub message_ctrl_id: Option<String>,
    pub channel: Option<String>,
    pub remote: Option<String>,
    pub callback: Option<String>,
    pub status: MessageStatus,
    /// Persisted for observability; no queue read path consults these to
    /// cap retries or apply backoff - that policy belongs to the worker.
    pub retry_count: i64,
    pub last_retry: Option<i64>,
    pub response_message: Option<String>,
}

impl QueueMessage {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status_str: String = row.get(9)?;
        let status = MessageStatus::parse(&status_str).map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                9,
                rusqlite::types::Type::Text,
                format!("unknown status {}", status_str).into(),
            )
        })?;
        Ok(Self {
            id: row.get(0)?,
            received_time: row.get(1)?,
            raw_message: row.get(2)?,
            sender: row.get(3)?,
            receiver: row.get(4)?,
            message_ctrl_id: row.get(5)?,
            channel: row.get(6)?,
            remote: row.get(7)?,
            callback: row.get(8)?,
            status,
            retry_count: row.get(10)?,
            last_retry: row.get(11)?,
            response_message: row.get(12)?,
        })
    }
}

/// The SQLite-backed durable queue.
pub struct DurableQueue {
    db_path: PathBuf,
    owner_path: PathBuf,
    conn: Option<Connection>,
}

impl DurableQueue {
    /// Create a queue handle for the given database path. No file is
    /// touched until [`DurableQueue::init`] runs.
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        let db_path = db_path.into();
        let mut owner = db_path.as_os_str().to_os_string();
        owner.push(".owner");
        Self {
            db_path,
            owner_path: PathBuf::from(owner),
            conn: None,
        }
    }

    /// Open the database, apply pending migrations, warm the statement
    /// cache, and claim ownership. Idempotent: a second call warns and
    /// no-ops.
    pub fn init(&mut self) -> Result<()> {
        if self.conn.is_some() {
            warn!("init() called but queue is already initialized");
            return Ok(());
        }

        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| AgentError::io_with_path(e, parent))?;
            }
        }

        let mut conn = Connection::open(&self.db_path).map_err(|e| AgentError::Database {
            message: format!("Failed to open queue database: {}", e),
            source: Some(e),
        })?;

        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL;\n\
             PRAGMA synchronous=NORMAL;\n\
             PRAGMA busy_timeout={};\n\
             PRAGMA cache_size=-{};",
            QueueConfig::BUSY_TIMEOUT_MS,
            QueueConfig::CACHE_SIZE_KIB,
        ))
        .map_err(|e| AgentError::Database {
            message: format!("Failed to set queue pragmas: {}", e),
            source: Some(e),
        })?;

        Self::apply_migrations(&mut conn)?;

        conn.set_prepared_statement_cache_capacity(QueueConfig::STATEMENT_CACHE_CAPACITY);
        for sql in ALL_STATEMENTS {
            conn.prepare_cached(sql).map_err(|e| AgentError::Database {
                message: format!("Failed to prepare queue statement: {}", e),
                source: Some(e),
            })?;
        }

        self.conn = Some(conn);
        self.write_owner_marker()?;
        info!("Durable queue ready at {}", self.db_path.display());
        Ok(())
    }

    /// Apply every migration with an id greater than the last applied one,
    /// in order, each inside its own transaction.
    fn apply_migrations(conn: &mut Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                id INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )?;

        let applied: i64 = conn
            .query_row("SELECT COALESCE(MAX(id), 0) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap_or(0);

        let mut newly_applied = 0;
        for (index, migration) in MIGRATIONS.iter().enumerate() {
            let id = (index + 1) as i64;
            if id <= applied {
                continue;
            }
            let tx = conn.transaction()?;
            tx.execute_batch(migration)?;
            tx.execute(
                "INSERT INTO schema_migrations (id, applied_at) VALUES (?1, ?2)",
                params![id, Utc::now().to_rfc3339()],
            )?;
            tx.commit()?;
            newly_applied += 1;
        }

        if newly_applied > 0 {
            info!("Applied {} queue migration(s)", newly_applied);
        } else {
            debug!("Queue schema up to date");
        }
        Ok(())
    }

    fn conn(&self, operation: &'static str) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or(AgentError::NotReady { operation })
    }

    /// Insert a message with status `received`, extracting queue metadata
    /// from the MSH header. Returns the new row id.
    pub fn add_message(
        &self,
        message: &Hl7Message,
        channel: &str,
        remote: &str,
        callback: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn("add_message")?;
        let mut stmt = conn.prepare_cached(INSERT_MESSAGE)?;
        stmt.execute(params![
            now_millis(),
            message.to_string(),
            message.sender(),
            message.receiver(),
            message.control_id().unwrap_or(""),
            channel,
            remote,
            callback,
        ])?;
        Ok(conn.last_insert_rowid())
    }

    /// The oldest pending message for a channel. Both `received` and
    /// `timed_out` rows qualify - this dual-status read is the retry
    /// re-pickup mechanism.
    pub fn get_next_message(&self, channel: &str) -> Result<Option<QueueMessage>> {
        let conn = self.conn("get_next_message")?;
        let mut stmt = conn.prepare_cached(GET_NEXT_MESSAGE)?;
        Ok(stmt
            .query_row(params![channel], QueueMessage::from_row)
            .optional()?)
    }

    /// The oldest `received` message across all channels.
    pub fn get_next_received_message(&self) -> Result<Option<QueueMessage>> {
        let conn = self.conn("get_next_received_message")?;
        let mut stmt = conn.prepare_cached(GET_NEXT_RECEIVED)?;
        Ok(stmt.query_row([], QueueMessage::from_row).optional()?)
    }

    /// All `received` messages across channels, oldest first.
    pub fn get_all_received_messages(&self, limit: usize) -> Result<Vec<QueueMessage>> {
        let conn = self.conn("get_all_received_messages")?;
        let mut stmt = conn.prepare_cached(GET_ALL_RECEIVED)?;
        let rows = stmt.query_map(params![limit as i64], QueueMessage::from_row)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// The oldest message waiting for its response to be delivered.
    pub fn get_next_response_queued_message(&self) -> Result<Option<QueueMessage>> {
        let conn = self.conn("get_next_response_queued_message")?;
        let mut stmt = conn.prepare_cached(GET_NEXT_RESPONSE_QUEUED)?;
        Ok(stmt.query_row([], QueueMessage::from_row).optional()?)
    }

    /// Look up a message by the callback id attached at enqueue time.
    pub fn get_message_by_callback(&self, callback: &str) -> Result<Option<QueueMessage>> {
        let conn = self.conn("get_message_by_callback")?;
        let mut stmt = conn.prepare_cached(GET_BY_CALLBACK)?;
        Ok(stmt
            .query_row(params![callback], QueueMessage::from_row)
            .optional()?)
    }

    /// Look up a message by the remote address it arrived from.
    pub fn get_message_by_remote(&self, remote: &str) -> Result<Option<QueueMessage>> {
        let conn = self.conn("get_message_by_remote")?;
        let mut stmt = conn.prepare_cached(GET_BY_REMOTE)?;
        Ok(stmt
            .query_row(params![remote], QueueMessage::from_row)
            .optional()?)
    }

    fn mark(&self, operation: &'static str, sql: &str, message_id: i64) -> Result<()> {
        let conn = self.conn(operation)?;
        let mut stmt = conn.prepare_cached(sql)?;
        stmt.execute(params![now_millis(), message_id])?;
        Ok(())
    }

    pub fn mark_as_sent(&self, message_id: i64) -> Result<()> {
        self.mark("mark_as_sent", MARK_SENT, message_id)
    }

    pub fn mark_as_commit_acked(&self, message_id: i64) -> Result<()> {
        self.mark("mark_as_commit_acked", MARK_COMMIT_ACKED, message_id)
    }

    pub fn mark_as_app_acked(&self, message_id: i64) -> Result<()> {
        self.mark("mark_as_app_acked", MARK_APP_ACKED, message_id)
    }

    pub fn mark_as_error(&self, message_id: i64) -> Result<()> {
        self.mark("mark_as_error", MARK_ERROR, message_id)
    }

    pub fn mark_as_timed_out(&self, message_id: i64) -> Result<()> {
        self.mark("mark_as_timed_out", MARK_TIMED_OUT, message_id)
    }

    /// Store the response for a message and queue it for delivery.
    pub fn mark_as_response_queued(&self, message_id: i64, response: &str) -> Result<()> {
        let conn = self.conn("mark_as_response_queued")?;
        let mut stmt = conn.prepare_cached(MARK_RESPONSE_QUEUED)?;
        stmt.execute(params![response, now_millis(), message_id])?;
        Ok(())
    }

    pub fn mark_as_response_sent(&self, message_id: i64) -> Result<()> {
        self.mark("mark_as_response_sent", MARK_RESPONSE_SENT, message_id)
    }

    pub fn mark_as_response_timed_out(&self, message_id: i64) -> Result<()> {
        self.mark(
            "mark_as_response_timed_out",
            MARK_RESPONSE_TIMED_OUT,
            message_id,
        )
    }

    pub fn mark_as_response_error(&self, message_id: i64) -> Result<()> {
        self.mark("mark_as_response_error", MARK_RESPONSE_ERROR, message_id)
    }

    /// Exact count of messages with the given status, for backlog and
    /// backpressure observation.
    pub fn count_by_status(&self, status: MessageStatus) -> Result<i64> {
        let conn = self.conn("count_by_status")?;
        let mut stmt = conn.prepare_cached(COUNT_BY_STATUS)?;
        Ok(stmt.query_row(params![status.as_str()], |row| row.get(0))?)
    }

    /// Release the database handle and remove the ownership marker.
    /// Best-effort: marker removal failures are logged, not returned.
    pub fn close(&mut self) {
        if self.conn.take().is_none() {
            warn!("close() called but queue was not initialized");
            return;
        }
        match std::fs::remove_file(&self.owner_path) {
            Ok(()) => debug!("Removed queue ownership marker"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove queue ownership marker {}: {}",
                self.owner_path.display(),
                e
            ),
        }
        info!("Durable queue closed");
    }

    /// Path of the ownership marker beside the database file.
    pub fn owner_marker_path(&self) -> &Path {
        &self.owner_path
    }

    /// Wait for the previous queue owner to release its marker.
    ///
    /// A marker whose PID is no longer alive is stale and removed
    /// immediately. If the timeout elapses while a live owner still holds
    /// the marker, it is force-cleared with a warning - startup is never
    /// blocked indefinitely.
    pub async fn wait_for_queue_release(&self, timeout: std::time::Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.owner_path.exists() {
                return Ok(());
            }

            let owner_pid = std::fs::read_to_string(&self.owner_path)
                .ok()
                .and_then(|contents| contents.trim().parse::<u32>().ok());

            match owner_pid {
                Some(pid) if platform::is_process_alive(pid) => {
                    if Instant::now() >= deadline {
                        warn!(
                            "Queue still owned by live process {} after {:?}; force-clearing marker",
                            pid, timeout
                        );
                        self.remove_marker_best_effort();
                        return Ok(());
                    }
                    debug!("Waiting for queue release by process {}", pid);
                }
                Some(pid) => {
                    warn!("Removing stale queue ownership marker (dead process {})", pid);
                    self.remove_marker_best_effort();
                    return Ok(());
                }
                None => {
                    warn!("Removing unreadable queue ownership marker");
                    self.remove_marker_best_effort();
                    return Ok(());
                }
            }

            tokio::time::sleep(QueueConfig::RELEASE_POLL_INTERVAL).await;
        }
    }

    /// Write the current process id to the ownership marker via a
    /// temp-file + atomic rename, so no reader observes a partial write.
    fn write_owner_marker(&self) -> Result<()> {
        let pid = std::process::id();
        let tmp_path = self.owner_path.with_extension(format!("owner.{}.tmp", pid));
        std::fs::write(&tmp_path, pid.to_string())
            .map_err(|e| AgentError::io_with_path(e, &tmp_path))?;
        std::fs::rename(&tmp_path, &self.owner_path)
            .map_err(|e| AgentError::io_with_path(e, &self.owner_path))?;
        debug!("Claimed queue ownership (pid {})", pid);
        Ok(())
    }

    fn remove_marker_best_effort(&self) {
        if let Err(e) = std::fs::remove_file(&self.owner_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "Failed to clear queue ownership marker {}: {}",
                    self.owner_path.display(),
                    e
                );
            }
        }
    }
}

impl Drop for DurableQueue {
    fn drop(&mut self) {
        if self.conn.is_some() {
            self.close();
        }
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ADT: &str = "MSH|^~\\&|ADT1|MCM|LABADT|MCM|198808181126|SECURITY|ADT^A01|MSG00001|P|2.2\r\
        PID|||PATID1234^5^M11||JONES^WILLIAM^A^III||19610615|M-";

    fn create_test_queue() -> (TempDir, DurableQueue) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("messages.sqlite3");
        let mut queue = DurableQueue::new(&db_path);
        queue.init().unwrap();
        (temp_dir, queue)
    }

    fn message() -> Hl7Message {
        Hl7Message::parse(ADT).unwrap()
    }

    #[test]
    fn test_add_and_get_next_message() {
        let (_temp, queue) = create_test_queue();

        let id = queue
            .add_message(&message(), "adt", "10.0.0.5:51234", Some("Agent/cb-1"))
            .unwrap();
        assert!(id > 0);

        let next = queue.get_next_message("adt").unwrap().unwrap();
        assert_eq!(next.id, id);
        assert_eq!(next.status, MessageStatus::Received);
        assert_eq!(next.sender.as_deref(), Some("ADT1"));
        assert_eq!(next.receiver.as_deref(), Some("LABADT"));
        assert_eq!(next.message_ctrl_id.as_deref(), Some("MSG00001"));
        assert_eq!(next.channel.as_deref(), Some("adt"));

        // Other channels see nothing
        assert!(queue.get_next_message("oru").unwrap().is_none());
    }

    #[test]
    fn test_timed_out_messages_are_picked_up_again() {
        let (_temp, queue) = create_test_queue();
        let id = queue.add_message(&message(), "adt", "remote", None).unwrap();

        queue.mark_as_sent(id).unwrap();
        assert!(queue.get_next_message("adt").unwrap().is_none());

        queue.mark_as_timed_out(id).unwrap();
        let retried = queue.get_next_message("adt").unwrap().unwrap();
        assert_eq!(retried.id, id);
        assert_eq!(retried.status, MessageStatus::TimedOut);
    }

    #[test]
    fn test_pickup_order_is_oldest_first() {
        let (_temp, queue) = create_test_queue();
        let first = queue.add_message(&message(), "adt", "remote", None).unwrap();
        let _second = queue.add_message(&message(), "adt", "remote", None).unwrap();

        assert_eq!(queue.get_next_message("adt").unwrap().unwrap().id, first);
    }

    #[test]
    fn test_status_transitions_and_counts() {
        let (_temp, queue) = create_test_queue();
        let id = queue.add_message(&message(), "adt", "remote", None).unwrap();
        assert_eq!(queue.count_by_status(MessageStatus::Received).unwrap(), 1);

        queue.mark_as_sent(id).unwrap();
        assert_eq!(queue.count_by_status(MessageStatus::Received).unwrap(), 0);
        assert_eq!(queue.count_by_status(MessageStatus::Sent).unwrap(), 1);

        queue.mark_as_commit_acked(id).unwrap();
        assert_eq!(queue.count_by_status(MessageStatus::CommitAcked).unwrap(), 1);

        queue.mark_as_app_acked(id).unwrap();
        assert_eq!(queue.count_by_status(MessageStatus::AppAcked).unwrap(), 1);
        // Rows are never deleted
        assert_eq!(queue.count_by_status(MessageStatus::Sent).unwrap(), 0);
    }

    #[test]
    fn test_transition_timestamps_are_retained() {
        let (_temp, queue) = create_test_queue();
        let id = queue.add_message(&message(), "adt", "remote", None).unwrap();
        queue.mark_as_sent(id).unwrap();
        queue.mark_as_timed_out(id).unwrap();

        let (sent_time, timed_out_time): (Option<i64>, Option<i64>) = queue
            .conn
            .as_ref()
            .unwrap()
            .query_row(
                "SELECT sent_time, timed_out_time FROM hl7_messages WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();

        // The sent timestamp survives the later transition
        assert!(sent_time.is_some());
        assert!(timed_out_time.is_some());
    }

    #[test]
    fn test_global_received_drain() {
        let (_temp, queue) = create_test_queue();
        queue.add_message(&message(), "adt", "remote", None).unwrap();
        queue.add_message(&message(), "oru", "remote", None).unwrap();

        let next = queue.get_next_received_message().unwrap().unwrap();
        assert_eq!(next.channel.as_deref(), Some("adt"));

        let all = queue.get_all_received_messages(10).unwrap();
        assert_eq!(all.len(), 2);

        let limited = queue.get_all_received_messages(1).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_response_lifecycle() {
        let (_temp, queue) = create_test_queue();
        let id = queue.add_message(&message(), "adt", "remote", None).unwrap();

        let response = message().build_ack(crate::hl7::AckCode::AA).to_string();
        queue.mark_as_response_queued(id, &response).unwrap();

        let queued = queue.get_next_response_queued_message().unwrap().unwrap();
        assert_eq!(queued.id, id);
        assert_eq!(queued.response_message.as_deref(), Some(response.as_str()));

        queue.mark_as_response_sent(id).unwrap();
        assert!(queue.get_next_response_queued_message().unwrap().is_none());
        assert_eq!(
            queue.count_by_status(MessageStatus::ResponseSent).unwrap(),
            1
        );
    }

    #[test]
    fn test_lookup_by_callback_and_remote() {
        let (_temp, queue) = create_test_queue();
        queue
            .add_message(&message(), "adt", "10.1.2.3:4000", Some("Agent/abc-123"))
            .unwrap();

        let by_callback = queue.get_message_by_callback("Agent/abc-123").unwrap();
        assert!(by_callback.is_some());
        assert!(queue.get_message_by_callback("Agent/zzz").unwrap().is_none());

        let by_remote = queue.get_message_by_remote("10.1.2.3:4000").unwrap();
        assert!(by_remote.is_some());
    }

    #[test]
    fn test_operations_fail_fast_before_init() {
        let temp_dir = TempDir::new().unwrap();
        let queue = DurableQueue::new(temp_dir.path().join("q.sqlite3"));
        let err = queue.get_next_message("adt").unwrap_err();
        assert!(matches!(err, AgentError::NotReady { .. }));
    }

    #[test]
    fn test_operations_fail_fast_after_close() {
        let (_temp, mut queue) = create_test_queue();
        queue.close();
        let err = queue
            .add_message(&message(), "adt", "remote", None)
            .unwrap_err();
        assert!(matches!(
            err,
            AgentError::NotReady {
                operation: "add_message"
            }
        ));
    }

    #[test]
    fn test_init_is_idempotent() {
        let (_temp, mut queue) = create_test_queue();
        queue.add_message(&message(), "adt", "remote", None).unwrap();
        queue.init().unwrap();
        // Existing state is untouched
        assert_eq!(queue.count_by_status(MessageStatus::Received).unwrap(), 1);
    }

    #[test]
    fn test_reopening_applies_zero_additional_migrations() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("messages.sqlite3");

        let mut first = DurableQueue::new(&db_path);
        first.init().unwrap();
        let id = first.add_message(&message(), "adt", "remote", None).unwrap();
        first.close();

        let mut second = DurableQueue::new(&db_path);
        second.init().unwrap();

        let migration_count: i64 = second
            .conn
            .as_ref()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(migration_count, MIGRATIONS.len() as i64);

        // Data written by the previous generation survived the handoff
        let next = second.get_next_message("adt").unwrap().unwrap();
        assert_eq!(next.id, id);
    }

    #[test]
    fn test_ownership_marker_lifecycle() {
        let (_temp, mut queue) = create_test_queue();
        let marker = queue.owner_marker_path().to_path_buf();

        let contents = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(contents, std::process::id().to_string());

        queue.close();
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_wait_for_queue_release_removes_stale_marker() {
        let temp_dir = TempDir::new().unwrap();
        let queue = DurableQueue::new(temp_dir.path().join("q.sqlite3"));

        // A marker left behind by a dead process
        std::fs::write(queue.owner_marker_path(), "4000000000").unwrap();

        let start = Instant::now();
        queue
            .wait_for_queue_release(std::time::Duration::from_secs(5))
            .await
            .unwrap();
        assert!(start.elapsed() < std::time::Duration::from_secs(1));
        assert!(!queue.owner_marker_path().exists());
    }

    #[tokio::test]
    async fn test_wait_for_queue_release_force_clears_on_timeout() {
        let temp_dir = TempDir::new().unwrap();
        let queue = DurableQueue::new(temp_dir.path().join("q.sqlite3"));

        // A live owner (ourselves) that never releases
        std::fs::write(queue.owner_marker_path(), std::process::id().to_string()).unwrap();

        queue
            .wait_for_queue_release(std::time::Duration::from_millis(300))
            .await
            .unwrap();
        assert!(!queue.owner_marker_path().exists());
    }

    #[tokio::test]
    async fn test_wait_for_queue_release_with_no_marker_returns_immediately() {
        let temp_dir = TempDir::new().unwrap();
        let queue = DurableQueue::new(temp_dir.path().join("q.sqlite3"));
        queue
            .wait_for_queue_release(std::time::Duration::from_secs(5))
            .await
            .unwrap();
    }
}
