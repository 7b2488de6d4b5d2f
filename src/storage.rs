//! Relational persistence for incidents and audit artifacts.
//!
//! The store is deliberately thin: the pipeline treats every write as
//! best-effort (failures are logged, never propagated into the frame loop),
//! and open incidents are reconciled by upsert so a failed write is repaired
//! by the next successful one.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::aggregate::Incident;

pub struct IncidentStore {
    conn: Connection,
}

impl IncidentStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS incidents (
              id INTEGER PRIMARY KEY,
              kind TEXT NOT NULL,
              subtype TEXT NOT NULL DEFAULT '',
              timestamp REAL NOT NULL,
              count INTEGER NOT NULL DEFAULT 1,
              description TEXT NOT NULL,
              created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audio_logs (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              incident_id INTEGER,
              text TEXT NOT NULL,
              timestamp REAL NOT NULL,
              created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS glare_images (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              incident_id INTEGER,
              file_path TEXT NOT NULL,
              glare_percentage REAL NOT NULL,
              timestamp REAL NOT NULL,
              created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS liveness_validations (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              incident_id INTEGER,
              file_path TEXT NOT NULL,
              status TEXT NOT NULL,
              frame_results TEXT NOT NULL,
              timestamp REAL NOT NULL,
              created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_incidents_timestamp ON incidents(timestamp);
            CREATE INDEX IF NOT EXISTS idx_incidents_kind ON incidents(kind);
            CREATE INDEX IF NOT EXISTS idx_audio_logs_timestamp ON audio_logs(timestamp);
            "#,
        )?;
        Ok(())
    }

    /// Insert or reconcile an incident row. The aggregator's incident id is
    /// the primary key, so repeated writes for the same open incident update
    /// in place.
    pub fn upsert_incident(&mut self, incident: &Incident) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO incidents (id, kind, subtype, timestamp, count, description, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
              count = excluded.count,
              description = excluded.description
            "#,
            params![
                incident.id as i64,
                incident.kind.as_str(),
                incident.subtype,
                incident.first_seen_ts,
                incident.count as i64,
                incident.description,
                now_s()? as i64,
            ],
        )?;
        Ok(())
    }

    /// Highest incident id on record, used to seed the aggregator's counter
    /// so ids stay unique across restarts.
    pub fn max_incident_id(&self) -> Result<u64> {
        let max: Option<i64> = self
            .conn
            .query_row("SELECT MAX(id) FROM incidents", [], |row| row.get(0))?;
        Ok(max.unwrap_or(0) as u64)
    }

    pub fn record_audio_log(
        &mut self,
        incident_id: Option<u64>,
        text: &str,
        timestamp_s: f64,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO audio_logs (incident_id, text, timestamp, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![incident_id.map(|id| id as i64), text, timestamp_s, now_s()? as i64],
        )?;
        Ok(())
    }

    pub fn record_glare_image(
        &mut self,
        incident_id: Option<u64>,
        file_path: &str,
        glare_percentage: f64,
        timestamp_s: f64,
    ) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO glare_images (incident_id, file_path, glare_percentage, timestamp, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                incident_id.map(|id| id as i64),
                file_path,
                glare_percentage,
                timestamp_s,
                now_s()? as i64,
            ],
        )?;
        Ok(())
    }

    pub fn record_validation(
        &mut self,
        incident_id: Option<u64>,
        file_path: &str,
        status: &str,
        frame_results_json: &str,
        timestamp_s: f64,
    ) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO liveness_validations (incident_id, file_path, status, frame_results, timestamp, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                incident_id.map(|id| id as i64),
                file_path,
                status,
                frame_results_json,
                timestamp_s,
                now_s()? as i64,
            ],
        )?;
        Ok(())
    }

    /// Most recent incidents, newest first.
    pub fn recent_incidents(&self, limit: usize) -> Result<Vec<StoredIncident>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, kind, subtype, timestamp, count, description FROM incidents
             ORDER BY timestamp DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(StoredIncident {
                id: row.get::<_, i64>(0)? as u64,
                kind: row.get(1)?,
                subtype: row.get(2)?,
                timestamp: row.get(3)?,
                count: row.get::<_, i64>(4)? as u32,
                description: row.get(5)?,
            })
        })?;
        let mut incidents = Vec::new();
        for row in rows {
            incidents.push(row?);
        }
        Ok(incidents)
    }
}

/// Incident row as read back from storage.
#[derive(Clone, Debug)]
pub struct StoredIncident {
    pub id: u64,
    pub kind: String,
    pub subtype: String,
    pub timestamp: f64,
    pub count: u32,
    pub description: String,
}

fn now_s() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| anyhow!("system clock before epoch: {e}"))
}
