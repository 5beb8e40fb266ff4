// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! Database module for persistent storage
//!
//! Holds every validated event (accepted or rejected), operator feedback on
//! past events, and the durable outbox used by the delivery queue.

use std::sync::Arc;
use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::delivery::{MessageStatus, OutboxStore, QueuedMessage, StatusCounts};
use crate::error::Result;
use crate::events::{EventCandidate, EventType};

/// Samples needed before a threshold suggestion is offered
pub const MIN_FEEDBACK_SAMPLES: usize = 10;

/// Database manager
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database
    pub fn open(config: &DatabaseConfig) -> anyhow::Result<Self> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory {:?}", parent))?;
        }

        let conn = Connection::open(&config.path)
            .with_context(|| format!("Failed to open database {:?}", config.path))?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -16000;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
        "#,
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.create_tables()?;

        info!("Database opened at {:?}", config.path);
        Ok(db)
    }

    /// Scratch database for tests and the demo
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.create_tables()?;
        Ok(db)
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Validated event candidates
            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                camera_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                track_id INTEGER NOT NULL,
                zone_id TEXT,
                confidence REAL NOT NULL,
                score REAL NOT NULL,
                accepted INTEGER NOT NULL,
                severity TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                bbox TEXT,
                metadata TEXT NOT NULL,
                evidence_ref TEXT,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
            CREATE INDEX IF NOT EXISTS idx_events_camera ON events(camera_id);
            CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);

            -- Operator true/false positive marks
            CREATE TABLE IF NOT EXISTS feedback (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
                is_true_positive INTEGER NOT NULL,
                note TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_feedback_event ON feedback(event_id);

            -- Delivery outbox
            CREATE TABLE IF NOT EXISTS outbox (
                id TEXT PRIMARY KEY,
                event_id TEXT,
                camera_id TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                evidence_ref TEXT,
                recipients TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                next_attempt_at TEXT NOT NULL,
                status TEXT NOT NULL,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_outbox_due ON outbox(status, next_attempt_at);
        "#,
        )?;

        Ok(())
    }

    /// Store a validated candidate with its verdict
    pub fn record_event(
        &self,
        candidate: &EventCandidate,
        accepted: bool,
        score: f32,
        evidence_ref: Option<&str>,
    ) -> Result<()> {
        let bbox = candidate.bbox.as_ref().map(serde_json::to_string).transpose()?;
        let metadata = serde_json::to_string(&candidate.metadata)?;
        let conn = self.conn.lock();

        conn.execute(
            r#"INSERT OR REPLACE INTO events
               (id, camera_id, event_type, track_id, zone_id, confidence, score, accepted,
                severity, timestamp, bbox, metadata, evidence_ref)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"#,
            params![
                candidate.id.to_string(),
                candidate.camera_id,
                candidate.event_type.as_str(),
                candidate.track_id as i64,
                candidate.zone_id,
                candidate.confidence as f64,
                score as f64,
                accepted,
                candidate.severity.to_string(),
                ts(candidate.timestamp),
                bbox,
                metadata,
                evidence_ref,
            ],
        )?;

        debug!(event_id = %candidate.id, accepted, "Event recorded");
        Ok(())
    }

    pub fn get_event(&self, id: Uuid) -> Result<Option<StoredEvent>> {
        let conn = self.conn.lock();
        let event = conn
            .query_row(
                &format!("SELECT {} FROM events WHERE id = ?1", EVENT_COLUMNS),
                params![id.to_string()],
                stored_event,
            )
            .optional()?;
        Ok(event)
    }

    /// Most recent events, optionally for one camera
    pub fn recent_events(&self, camera_id: Option<&str>, limit: usize) -> Result<Vec<StoredEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM events WHERE (?1 IS NULL OR camera_id = ?1)
             ORDER BY timestamp DESC LIMIT ?2",
            EVENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![camera_id, limit as i64], stored_event)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Mark a past event as a true or false positive. Returns false when
    /// the event is unknown.
    pub fn record_feedback(&self, event_id: Uuid, is_true_positive: bool, note: Option<&str>) -> Result<bool> {
        let conn = self.conn.lock();
        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM events WHERE id = ?1", params![event_id.to_string()], |row| row.get(0))
            .optional()?;
        if exists.is_none() {
            return Ok(false);
        }

        conn.execute(
            "INSERT INTO feedback (event_id, is_true_positive, note, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![event_id.to_string(), is_true_positive, note, ts(Utc::now())],
        )?;
        Ok(true)
    }

    pub fn feedback_stats(&self, event_type: EventType) -> Result<FeedbackStats> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"SELECT f.is_true_positive, COUNT(*), AVG(e.score)
               FROM feedback f JOIN events e ON e.id = f.event_id
               WHERE e.event_type = ?1
               GROUP BY f.is_true_positive"#,
        )?;
        let rows = stmt.query_map(params![event_type.as_str()], |row| {
            Ok((row.get::<_, bool>(0)?, row.get::<_, i64>(1)?, row.get::<_, Option<f64>>(2)?))
        })?;

        let mut stats = FeedbackStats {
            event_type,
            ..FeedbackStats::default()
        };
        for row in rows {
            let (tp, count, mean) = row?;
            if tp {
                stats.true_positives = count as usize;
                stats.mean_true_positive_score = mean;
            } else {
                stats.false_positives = count as usize;
                stats.mean_false_positive_score = mean;
            }
        }
        Ok(stats)
    }

    /// Midpoint between mean true and false positive scores. Offline
    /// recalibration aid only; never applied automatically.
    pub fn suggest_threshold(&self, event_type: EventType) -> Result<Option<f32>> {
        let stats = self.feedback_stats(event_type)?;
        if stats.total() < MIN_FEEDBACK_SAMPLES {
            return Ok(None);
        }
        Ok(match (stats.mean_true_positive_score, stats.mean_false_positive_score) {
            (Some(tp), Some(fp)) => Some(((tp + fp) / 2.0) as f32),
            _ => None,
        })
    }

    pub fn get_stats(&self) -> Result<DatabaseStats> {
        let conn = self.conn.lock();

        let (event_count, accepted_count): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(accepted), 0) FROM events",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let feedback_count: i64 = conn.query_row("SELECT COUNT(*) FROM feedback", [], |row| row.get(0))?;
        let outbox_count: i64 = conn.query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?;
        let size_bytes: i64 = conn
            .query_row(
                "SELECT page_count * page_size as size FROM pragma_page_count(), pragma_page_size()",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        Ok(DatabaseStats {
            event_count: event_count as usize,
            accepted_count: accepted_count as usize,
            feedback_count: feedback_count as usize,
            outbox_count: outbox_count as usize,
            size_bytes: size_bytes as u64,
        })
    }

    /// Cleanup old events and terminal outbox rows
    pub fn cleanup(&self, retention_days: u32) -> Result<usize> {
        let cutoff = ts(Utc::now() - chrono::Duration::days(retention_days as i64));
        let conn = self.conn.lock();

        let deleted_events = conn.execute("DELETE FROM events WHERE timestamp < ?1", params![cutoff])?;
        let deleted_messages = conn.execute(
            "DELETE FROM outbox WHERE status != 'pending' AND updated_at < ?1",
            params![cutoff],
        )?;

        if deleted_events + deleted_messages > 0 {
            conn.execute("VACUUM", [])?;
        }

        info!(
            "Cleaned up {} events and {} outbox messages older than {} days",
            deleted_events, deleted_messages, retention_days
        );
        Ok(deleted_events + deleted_messages)
    }
}

impl OutboxStore for Database {
    fn insert(&self, message: &QueuedMessage) -> Result<()> {
        let recipients = serde_json::to_string(&message.recipients)?;
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO outbox ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                OUTBOX_COLUMNS
            ),
            params![
                message.id.to_string(),
                message.event_id.map(|id| id.to_string()),
                message.camera_id,
                message.subject,
                message.body,
                message.evidence_ref,
                recipients,
                message.attempts,
                ts(message.next_attempt_at),
                message.status.as_str(),
                message.last_error,
                ts(message.created_at),
                ts(message.updated_at),
            ],
        )?;
        Ok(())
    }

    fn update(&self, message: &QueuedMessage) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            r#"UPDATE outbox SET attempts = ?2, next_attempt_at = ?3, status = ?4,
               last_error = ?5, updated_at = ?6 WHERE id = ?1"#,
            params![
                message.id.to_string(),
                message.attempts,
                ts(message.next_attempt_at),
                message.status.as_str(),
                message.last_error,
                ts(message.updated_at),
            ],
        )?;
        if changed == 0 {
            return Err(rusqlite::Error::QueryReturnedNoRows.into());
        }
        Ok(())
    }

    fn get(&self, id: Uuid) -> Result<Option<QueuedMessage>> {
        let conn = self.conn.lock();
        let message = conn
            .query_row(
                &format!("SELECT {} FROM outbox WHERE id = ?1", OUTBOX_COLUMNS),
                params![id.to_string()],
                queued_message,
            )
            .optional()?;
        Ok(message)
    }

    fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueuedMessage>> {
        self.select_messages(
            "status = 'pending' AND next_attempt_at <= ?1 ORDER BY next_attempt_at, created_at LIMIT ?2",
            params![ts(now), limit as i64],
        )
    }

    fn pending(&self, limit: usize) -> Result<Vec<QueuedMessage>> {
        self.select_messages("status = 'pending' ORDER BY created_at LIMIT ?1", params![limit as i64])
    }

    fn counts(&self) -> Result<StatusCounts> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM outbox GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, n) = row?;
            match status.parse::<MessageStatus>()? {
                MessageStatus::Pending => counts.pending = n as usize,
                MessageStatus::Sent => counts.sent = n as usize,
                MessageStatus::Failed => counts.failed = n as usize,
            }
        }
        Ok(counts)
    }

    fn failed(&self, limit: usize) -> Result<Vec<QueuedMessage>> {
        self.select_messages("status = 'failed' ORDER BY updated_at DESC LIMIT ?1", params![limit as i64])
    }

    fn purge_terminal(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM outbox WHERE status != 'pending' AND updated_at < ?1",
            params![ts(cutoff)],
        )?;
        Ok(deleted)
    }

    fn is_durable(&self) -> bool {
        true
    }
}

impl Database {
    fn select_messages(&self, clause: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<QueuedMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM outbox WHERE {}", OUTBOX_COLUMNS, clause))?;
        let rows = stmt.query_map(params, queued_message)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}

const EVENT_COLUMNS: &str = "id, camera_id, event_type, track_id, zone_id, confidence, score, accepted, \
                             severity, timestamp, metadata, evidence_ref";

const OUTBOX_COLUMNS: &str = "id, event_id, camera_id, subject, body, evidence_ref, recipients, attempts, \
                              next_attempt_at, status, last_error, created_at, updated_at";

/// Fixed-width UTC timestamps so text ordering matches time ordering
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn parse_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion(idx, e))
}

fn parse_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let text: String = row.get(idx)?;
    Uuid::parse_str(&text).map_err(|e| conversion(idx, e))
}

fn stored_event(row: &Row<'_>) -> rusqlite::Result<StoredEvent> {
    let metadata: String = row.get(10)?;
    Ok(StoredEvent {
        id: parse_uuid(row, 0)?,
        camera_id: row.get(1)?,
        event_type: row.get(2)?,
        track_id: row.get::<_, i64>(3)? as u64,
        zone_id: row.get(4)?,
        confidence: row.get(5)?,
        score: row.get(6)?,
        accepted: row.get(7)?,
        severity: row.get(8)?,
        timestamp: parse_ts(row, 9)?,
        metadata: serde_json::from_str(&metadata).map_err(|e| conversion(10, e))?,
        evidence_ref: row.get(11)?,
    })
}

fn queued_message(row: &Row<'_>) -> rusqlite::Result<QueuedMessage> {
    let event_id: Option<String> = row.get(1)?;
    let recipients: String = row.get(6)?;
    let status: String = row.get(9)?;
    Ok(QueuedMessage {
        id: parse_uuid(row, 0)?,
        event_id: event_id
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| conversion(1, e))?,
        camera_id: row.get(2)?,
        subject: row.get(3)?,
        body: row.get(4)?,
        evidence_ref: row.get(5)?,
        recipients: serde_json::from_str(&recipients).map_err(|e| conversion(6, e))?,
        attempts: row.get(7)?,
        next_attempt_at: parse_ts(row, 8)?,
        status: status.parse().map_err(|e| conversion(9, e))?,
        last_error: row.get(10)?,
        created_at: parse_ts(row, 11)?,
        updated_at: parse_ts(row, 12)?,
    })
}

/// Event row as stored
#[derive(Debug, Clone, Serialize)]
pub struct StoredEvent {
    pub id: Uuid,
    pub camera_id: String,
    pub event_type: String,
    pub track_id: u64,
    pub zone_id: Option<String>,
    pub confidence: f64,
    pub score: f64,
    pub accepted: bool,
    pub severity: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Value,
    pub evidence_ref: Option<String>,
}

/// Feedback summary for one event type
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackStats {
    pub event_type: EventType,
    pub true_positives: usize,
    pub false_positives: usize,
    pub mean_true_positive_score: Option<f64>,
    pub mean_false_positive_score: Option<f64>,
}

impl Default for FeedbackStats {
    fn default() -> Self {
        Self {
            event_type: EventType::Intrusion,
            true_positives: 0,
            false_positives: 0,
            mean_true_positive_score: None,
            mean_false_positive_score: None,
        }
    }
}

impl FeedbackStats {
    pub fn total(&self) -> usize {
        self.true_positives + self.false_positives
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub event_count: usize,
    pub accepted_count: usize,
    pub feedback_count: usize,
    pub outbox_count: usize,
    pub size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BBox;
    use chrono::Duration;
    use serde_json::json;

    fn candidate(event_type: EventType) -> EventCandidate {
        EventCandidate::new(event_type, "dock", 4, Some("bay".into()), 0.8, Utc::now())
            .with_bbox(BBox::new(1.0, 2.0, 30.0, 40.0))
            .with_meta("dwell_secs", json!(4.5))
    }

    #[test]
    fn test_record_and_fetch_event() {
        let db = Database::open_in_memory().unwrap();
        let c = candidate(EventType::Intrusion);
        db.record_event(&c, true, 0.8, Some("/snap/a.jpg")).unwrap();
        db.record_event(&candidate(EventType::Intrusion), false, 0.3, None).unwrap();

        let stored = db.get_event(c.id).unwrap().unwrap();
        assert_eq!(stored.event_type, "intrusion");
        assert!(stored.accepted);
        assert_eq!(stored.evidence_ref.as_deref(), Some("/snap/a.jpg"));
        assert_eq!(stored.metadata["dwell_secs"], json!(4.5));
        assert!(db.get_event(Uuid::new_v4()).unwrap().is_none());

        let stats = db.get_stats().unwrap();
        assert_eq!(stats.event_count, 2);
        assert_eq!(stats.accepted_count, 1);
        assert_eq!(db.recent_events(Some("dock"), 10).unwrap().len(), 2);
        assert!(db.recent_events(Some("other"), 10).unwrap().is_empty());
    }

    #[test]
    fn test_threshold_suggestion_needs_samples() {
        let db = Database::open_in_memory().unwrap();
        let mark = |score: f32, tp: bool| {
            let c = candidate(EventType::Loitering);
            db.record_event(&c, true, score, None).unwrap();
            assert!(db.record_feedback(c.id, tp, None).unwrap());
        };
        for _ in 0..4 {
            mark(0.9, true);
        }
        for _ in 0..4 {
            mark(0.5, false);
        }
        assert_eq!(db.suggest_threshold(EventType::Loitering).unwrap(), None);

        mark(0.9, true);
        mark(0.5, false);
        let stats = db.feedback_stats(EventType::Loitering).unwrap();
        assert_eq!(stats.true_positives, 5);
        assert_eq!(stats.false_positives, 5);

        let suggested = db.suggest_threshold(EventType::Loitering).unwrap().unwrap();
        assert!((suggested - 0.7).abs() < 1e-4);
        assert_eq!(db.suggest_threshold(EventType::Intrusion).unwrap(), None);
    }

    #[test]
    fn test_feedback_for_unknown_event() {
        let db = Database::open_in_memory().unwrap();
        assert!(!db.record_feedback(Uuid::new_v4(), true, Some("?")).unwrap());
    }

    #[test]
    fn test_outbox_store() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        let mut msg = QueuedMessage::new("dock", "[HIGH] intrusion", "body", now);
        msg.event_id = Some(Uuid::new_v4());
        msg.recipients = vec!["ops".into()];
        db.insert(&msg).unwrap();

        let due = db.due(now, 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, msg.id);
        assert_eq!(due[0].recipients, vec!["ops".to_string()]);
        assert_eq!(due[0].event_id, msg.event_id);

        msg.attempts = 1;
        msg.next_attempt_at = now + Duration::seconds(60);
        msg.last_error = Some("refused".into());
        db.update(&msg).unwrap();
        assert!(db.due(now, 10).unwrap().is_empty());
        assert_eq!(db.pending(10).unwrap().len(), 1);

        msg.status = MessageStatus::Failed;
        db.update(&msg).unwrap();
        assert_eq!(db.counts().unwrap(), StatusCounts { pending: 0, sent: 0, failed: 1 });
        let failed = db.failed(5).unwrap();
        assert_eq!(failed[0].last_error.as_deref(), Some("refused"));
        assert!(db.is_durable());
    }

    #[test]
    fn test_outbox_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            path: dir.path().join("sentryline.db"),
            ..DatabaseConfig::default()
        };
        let msg = QueuedMessage::new("dock", "s", "b", Utc::now());
        {
            let db = Database::open(&config).unwrap();
            db.insert(&msg).unwrap();
        }
        let db = Database::open(&config).unwrap();
        assert_eq!(db.get(msg.id).unwrap().unwrap().subject, "s");
    }

    #[test]
    fn test_cleanup_removes_old_rows() {
        let db = Database::open_in_memory().unwrap();
        let old = Utc::now() - Duration::days(45);

        let mut c = candidate(EventType::Intrusion);
        c.timestamp = old;
        db.record_event(&c, true, 0.9, None).unwrap();
        db.record_feedback(c.id, true, None).unwrap();
        db.record_event(&candidate(EventType::Intrusion), true, 0.9, None).unwrap();

        let mut sent = QueuedMessage::new("dock", "s", "b", old);
        sent.status = MessageStatus::Sent;
        db.insert(&sent).unwrap();
        db.insert(&QueuedMessage::new("dock", "p", "b", old)).unwrap();

        assert_eq!(db.cleanup(30).unwrap(), 2);
        let stats = db.get_stats().unwrap();
        assert_eq!(stats.event_count, 1);
        assert_eq!(stats.feedback_count, 0);
        assert_eq!(stats.outbox_count, 1);
    }
}
