use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

use crate::events::IrrigationEvent;
use crate::phase::PhaseChange;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct IrrigationEventRow {
    pub id: i64,
    pub zone_id: String,
    pub ts_start: i64,
    pub ts_end: i64,
    pub local_day: String,
    pub duration_s: f64,
    pub shot_kind: String,
    pub phase: String,
    pub volume_l: f64,
    pub size_pct: f64,
    pub pre_vwc: Option<f64>,
    pub post_vwc: Option<f64>,
    pub efficiency: Option<f64>,
    pub result: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PhaseTransitionRow {
    pub id: i64,
    pub zone_id: String,
    pub ts: i64,
    pub from_phase: String,
    pub to_phase: String,
    pub event: String,
    pub reason: String,
    pub forced: bool,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DailyTotals {
    pub local_day: String, // YYYY-MM-DD
    pub zone_id: String,
    pub shots: i64,
    pub volume_l: f64,
    pub duration_s: f64,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/steering/steering.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // every connection to :memory: is its own database
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Irrigation events
    // ----------------------------

    pub async fn insert_irrigation_event(&self, e: &IrrigationEvent, local_day: NaiveDate) -> Result<i64> {
        let res = sqlx::query(
            r#"
            INSERT INTO irrigation_events (
              zone_id, ts_start, ts_end, local_day, duration_s,
              shot_kind, phase, volume_l, size_pct,
              pre_vwc, post_vwc, efficiency, result, reason
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&e.zone_id)
        .bind(e.start.timestamp())
        .bind(e.end.timestamp())
        .bind(local_day.format("%Y-%m-%d").to_string())
        .bind(e.duration_s)
        .bind(e.kind.to_string())
        .bind(e.phase.code())
        .bind(e.volume_l)
        .bind(e.size_pct)
        .bind(e.pre_vwc)
        .bind(e.post_vwc)
        .bind(e.efficiency)
        .bind(e.result.as_str())
        .bind(&e.reason)
        .execute(&self.pool)
        .await
        .context("insert_irrigation_event failed")?;
        Ok(res.last_insert_rowid())
    }

    /// Newest first.
    pub async fn recent_irrigation_events(&self, zone_id: &str, limit: i64) -> Result<Vec<IrrigationEventRow>> {
        sqlx::query_as::<_, IrrigationEventRow>(
            r#"
            SELECT id, zone_id, ts_start, ts_end, local_day, duration_s,
                   shot_kind, phase, volume_l, size_pct,
                   pre_vwc, post_vwc, efficiency, result, reason
            FROM irrigation_events
            WHERE zone_id = ?
            ORDER BY ts_start DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(zone_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_irrigation_events failed")
    }

    /// Completed shots per zone for one local day.
    pub async fn daily_totals(&self, local_day: NaiveDate) -> Result<Vec<DailyTotals>> {
        sqlx::query_as::<_, DailyTotals>(
            r#"
            SELECT local_day, zone_id,
                   COUNT(*) AS shots,
                   TOTAL(volume_l) AS volume_l,
                   TOTAL(duration_s) AS duration_s
            FROM irrigation_events
            WHERE local_day = ? AND result = 'completed'
            GROUP BY local_day, zone_id
            ORDER BY zone_id
            "#,
        )
        .bind(local_day.format("%Y-%m-%d").to_string())
        .fetch_all(&self.pool)
        .await
        .context("daily_totals failed")
    }

    // ----------------------------
    // Phase transitions
    // ----------------------------

    pub async fn insert_phase_transition(&self, c: &PhaseChange) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO phase_transitions (zone_id, ts, from_phase, to_phase, event, reason, forced)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&c.zone_id)
        .bind(c.at.timestamp())
        .bind(c.from.code())
        .bind(c.to.code())
        .bind(c.event.to_string())
        .bind(&c.reason)
        .bind(c.forced)
        .execute(&self.pool)
        .await
        .context("insert_phase_transition failed")?;
        Ok(())
    }

    pub async fn recent_phase_transitions(&self, zone_id: &str, limit: i64) -> Result<Vec<PhaseTransitionRow>> {
        sqlx::query_as::<_, PhaseTransitionRow>(
            r#"
            SELECT id, zone_id, ts, from_phase, to_phase, event, reason, forced
            FROM phase_transitions
            WHERE zone_id = ?
            ORDER BY ts DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(zone_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_phase_transitions failed")
    }
}

// ===========================================================================
// Tests
// ===========================================================================
