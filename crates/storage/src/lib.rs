#![forbid(unsafe_code)]

//! SQLite audit ledger for gate decisions.
//!
//! One `runs` row per `Decision`, one `attempts` row per `GateAttempt`.
//! Rows are append-only; nothing here updates or deletes history.

use gate_core::{ChangesetId, Decision, EngineState, EscalationCause, GateAttempt, Outcome};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

const DB_FILENAME: &str = "gate_ledger.db";
const SCHEMA_VERSION: &str = "v1";

#[derive(Debug)]
pub enum LedgerError {
    Io(std::io::Error),
    Sql(rusqlite::Error),
    Json(serde_json::Error),
    Corrupt(String),
    UnknownId,
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io: {err}"),
            Self::Sql(err) => write!(f, "sqlite: {err}"),
            Self::Json(err) => write!(f, "json: {err}"),
            Self::Corrupt(message) => write!(f, "corrupt ledger row: {message}"),
            Self::UnknownId => write!(f, "unknown id"),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<std::io::Error> for LedgerError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql(value)
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunRow {
    pub seq: i64,
    pub run_id: String,
    pub changeset_id: String,
    pub outcome: Outcome,
    pub escalation: Option<EscalationCause>,
    pub profile_fingerprint: String,
    pub blocking_issues_summary: Vec<String>,
    pub attempts_count: i64,
    pub recorded_at: String,
    pub recorded_at_ms: i64,
}

#[derive(Debug)]
pub struct SqliteLedger {
    storage_dir: Option<PathBuf>,
    conn: Connection,
}

impl SqliteLedger {
    pub fn open(storage_dir: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&storage_dir)?;
        let conn = Connection::open(storage_dir.join(DB_FILENAME))?;
        let ledger = Self {
            storage_dir: Some(storage_dir),
            conn,
        };
        ledger.migrate(true)?;
        Ok(ledger)
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let ledger = Self {
            storage_dir: None,
            conn: Connection::open_in_memory()?,
        };
        ledger.migrate(false)?;
        Ok(ledger)
    }

    pub fn storage_dir(&self) -> Option<&Path> {
        self.storage_dir.as_deref()
    }

    fn migrate(&self, wal: bool) -> Result<(), LedgerError> {
        if wal {
            self.conn.execute_batch(
                r#"
                PRAGMA journal_mode=WAL;
                PRAGMA synchronous=NORMAL;
                "#,
            )?;
        }
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS counters (
              name TEXT PRIMARY KEY,
              value INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS runs (
              seq INTEGER PRIMARY KEY AUTOINCREMENT,
              run_id TEXT NOT NULL UNIQUE,
              changeset_id TEXT NOT NULL,
              outcome TEXT NOT NULL,
              escalation_json TEXT,
              profile_fingerprint TEXT NOT NULL,
              summary_json TEXT NOT NULL,
              state_trail_json TEXT NOT NULL,
              attempts_count INTEGER NOT NULL,
              recorded_at TEXT NOT NULL,
              recorded_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS attempts (
              run_id TEXT NOT NULL,
              ordinal INTEGER NOT NULL,
              validator TEXT NOT NULL,
              attempt_number INTEGER NOT NULL,
              status TEXT NOT NULL,
              resumed INTEGER NOT NULL,
              session_id TEXT,
              failure TEXT,
              attempt_json TEXT NOT NULL,
              PRIMARY KEY (run_id, ordinal)
            );

            CREATE INDEX IF NOT EXISTS idx_runs_changeset_seq ON runs(changeset_id, seq);
            CREATE INDEX IF NOT EXISTS idx_attempts_validator ON attempts(run_id, validator, attempt_number);
            "#,
        )?;
        self.conn.execute(
            "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
            params!["schema_version", SCHEMA_VERSION],
        )?;
        Ok(())
    }

    /// Persist a decision and its full attempt history in one transaction.
    pub fn record_decision(&mut self, decision: &Decision) -> Result<RunRow, LedgerError> {
        let now = OffsetDateTime::now_utc();
        let recorded_at = now
            .format(&Rfc3339)
            .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string());
        let recorded_at_ms = unix_ms(now);

        let escalation_json = decision
            .escalation
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let summary_json = serde_json::to_string(&decision.blocking_issues_summary)?;
        let state_trail_json = serde_json::to_string(&decision.state_trail)?;

        let tx = self.conn.transaction()?;
        let run_id = format!("RUN-{:06}", next_counter_tx(&tx, "run_seq")?);
        tx.execute(
            r#"
            INSERT INTO runs(run_id, changeset_id, outcome, escalation_json, profile_fingerprint,
                             summary_json, state_trail_json, attempts_count, recorded_at, recorded_at_ms)
            VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)
            "#,
            params![
                run_id,
                decision.changeset_id.as_str(),
                decision.outcome.as_str(),
                escalation_json,
                decision.profile_fingerprint,
                summary_json,
                state_trail_json,
                decision.attempts.len() as i64,
                recorded_at,
                recorded_at_ms
            ],
        )?;
        let seq = tx.last_insert_rowid();
        for (ordinal, attempt) in decision.attempts.iter().enumerate() {
            insert_attempt_tx(&tx, &run_id, ordinal as i64, attempt)?;
        }
        tx.commit()?;

        Ok(RunRow {
            seq,
            run_id,
            changeset_id: decision.changeset_id.as_str().to_string(),
            outcome: decision.outcome,
            escalation: decision.escalation.clone(),
            profile_fingerprint: decision.profile_fingerprint.clone(),
            blocking_issues_summary: decision.blocking_issues_summary.clone(),
            attempts_count: decision.attempts.len() as i64,
            recorded_at,
            recorded_at_ms,
        })
    }

    pub fn run_get(&self, run_id: &str) -> Result<RunRow, LedgerError> {
        self.conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"),
                params![run_id],
                read_run_raw,
            )
            .optional()?
            .ok_or(LedgerError::UnknownId)?
            .into_row()
    }

    pub fn run_attempts(&self, run_id: &str) -> Result<Vec<GateAttempt>, LedgerError> {
        // Distinguish "no such run" from "run with zero attempts".
        self.run_get(run_id)?;
        let mut stmt = self.conn.prepare(
            "SELECT attempt_json FROM attempts WHERE run_id = ?1 ORDER BY ordinal ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str::<GateAttempt>(&row?)?);
        }
        Ok(out)
    }

    /// Newest first, bounded by `limit`.
    pub fn runs_for_changeset(
        &self,
        changeset_id: &ChangesetId,
        limit: usize,
    ) -> Result<Vec<RunRow>, LedgerError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE changeset_id = ?1 ORDER BY seq DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(
            params![changeset_id.as_str(), limit.min(i64::MAX as usize) as i64],
            read_run_raw,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_row()?);
        }
        Ok(out)
    }

    /// Rebuild the full `Decision` recorded under `run_id`.
    pub fn decision_get(&self, run_id: &str) -> Result<Decision, LedgerError> {
        let (changeset_raw, state_trail_json) = self
            .conn
            .query_row(
                "SELECT changeset_id, state_trail_json FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?
            .ok_or(LedgerError::UnknownId)?;
        let run = self.run_get(run_id)?;
        let changeset_id = ChangesetId::try_new(changeset_raw)
            .map_err(|err| LedgerError::Corrupt(format!("changeset_id: {}", err.message())))?;
        let state_trail: Vec<EngineState> = serde_json::from_str(&state_trail_json)?;
        Ok(Decision {
            changeset_id,
            outcome: run.outcome,
            attempts: self.run_attempts(run_id)?,
            blocking_issues_summary: run.blocking_issues_summary,
            escalation: run.escalation,
            profile_fingerprint: run.profile_fingerprint,
            state_trail,
        })
    }
}

const RUN_COLUMNS: &str = "seq, run_id, changeset_id, outcome, escalation_json, profile_fingerprint, \
     summary_json, attempts_count, recorded_at, recorded_at_ms";

struct RunRaw {
    seq: i64,
    run_id: String,
    changeset_id: String,
    outcome: String,
    escalation_json: Option<String>,
    profile_fingerprint: String,
    summary_json: String,
    attempts_count: i64,
    recorded_at: String,
    recorded_at_ms: i64,
}

impl RunRaw {
    fn into_row(self) -> Result<RunRow, LedgerError> {
        let outcome = Outcome::parse(&self.outcome)
            .ok_or_else(|| LedgerError::Corrupt(format!("outcome `{}`", self.outcome)))?;
        let escalation = self
            .escalation_json
            .as_deref()
            .map(serde_json::from_str::<EscalationCause>)
            .transpose()?;
        Ok(RunRow {
            seq: self.seq,
            run_id: self.run_id,
            changeset_id: self.changeset_id,
            outcome,
            escalation,
            profile_fingerprint: self.profile_fingerprint,
            blocking_issues_summary: serde_json::from_str(&self.summary_json)?,
            attempts_count: self.attempts_count,
            recorded_at: self.recorded_at,
            recorded_at_ms: self.recorded_at_ms,
        })
    }
}

fn read_run_raw(row: &Row<'_>) -> rusqlite::Result<RunRaw> {
    Ok(RunRaw {
        seq: row.get(0)?,
        run_id: row.get(1)?,
        changeset_id: row.get(2)?,
        outcome: row.get(3)?,
        escalation_json: row.get(4)?,
        profile_fingerprint: row.get(5)?,
        summary_json: row.get(6)?,
        attempts_count: row.get(7)?,
        recorded_at: row.get(8)?,
        recorded_at_ms: row.get(9)?,
    })
}

fn insert_attempt_tx(
    tx: &Transaction<'_>,
    run_id: &str,
    ordinal: i64,
    attempt: &GateAttempt,
) -> Result<(), LedgerError> {
    let attempt_json = serde_json::to_string(attempt)?;
    tx.execute(
        r#"
        INSERT INTO attempts(run_id, ordinal, validator, attempt_number, status, resumed,
                             session_id, failure, attempt_json)
        VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
        "#,
        params![
            run_id,
            ordinal,
            attempt.name().as_str(),
            attempt.attempt_number as i64,
            attempt.status.as_str(),
            attempt.resumed as i64,
            attempt.session.as_ref().map(|s| s.session_id.as_str()),
            attempt.failure.as_ref().map(|f| f.label()),
            attempt_json
        ],
    )?;
    Ok(())
}

fn next_counter_tx(tx: &Transaction<'_>, name: &str) -> Result<i64, LedgerError> {
    let current: i64 = tx
        .query_row(
            "SELECT value FROM counters WHERE name=?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);
    let next = current + 1;
    tx.execute(
        r#"
        INSERT INTO counters(name, value) VALUES (?1, ?2)
        ON CONFLICT(name) DO UPDATE SET value=excluded.value
        "#,
        params![name, next],
    )?;
    Ok(next)
}

fn unix_ms(at: OffsetDateTime) -> i64 {
    let ms = at.unix_timestamp_nanos() / 1_000_000i128;
    ms.clamp(0, i64::MAX as i128) as i64
}
