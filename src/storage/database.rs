//! Database Layer with Connection Pooling and Safe Transactions
//!
//! SQLite persistence for report rows, checkpointed pipeline state and
//! clarification waits:
//! - Connection pooling via r2d2
//! - Panic-safe transactions with automatic rollback
//! - WAL mode for concurrent readers while a run checkpoints

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, params};

use crate::pipeline::{
    ClarificationWait, PipelineState, ProgressUpdate, ReportSink, ReportStatus, ReportStatusView,
    TerminalResult, state_checksum,
};
use crate::types::{LoomError, ReportId, Result, ResultExt};

/// Shared database handle for async contexts.
pub type SharedDatabase = Arc<Database>;

const SCHEMA: &str = include_str!("schema.sql");

/// Current schema version
const SCHEMA_VERSION: u32 = 1;

/// Connection pool configuration
///
/// Pool size is dynamically calculated based on CPU cores.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_size: u32,
    pub min_idle: u32,
    /// Timeout for acquiring a connection (seconds)
    pub connection_timeout_secs: u64,
}

impl PoolConfig {
    const MIN_POOL_SIZE: u32 = 2;
    const MAX_POOL_SIZE: u32 = 16;

    /// clamp(cores * 2, MIN, MAX)
    pub fn optimal_pool_size() -> u32 {
        let cores = std::thread::available_parallelism()
            .map(|p| p.get() as u32)
            .unwrap_or(4);
        (cores * 2).clamp(Self::MIN_POOL_SIZE, Self::MAX_POOL_SIZE)
    }

    pub fn auto() -> Self {
        let max_size = Self::optimal_pool_size();
        Self {
            max_size,
            min_idle: (max_size / 4).max(1),
            connection_timeout_secs: crate::constants::network::CONNECTION_TIMEOUT_SECS,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::auto()
    }
}

/// Fixed-width UTC timestamp so text comparison orders correctly
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LoomError::Storage(format!("Invalid timestamp '{}': {}", value, e)))
}

/// Thread-safe database with connection pooling.
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    /// Open database with connection pooling at the specified path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, PoolConfig::default())
    }

    pub fn open_with_config<P: AsRef<Path>>(path: P, config: PoolConfig) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let manager =
            SqliteConnectionManager::file(path.as_ref()).with_init(Self::configure_connection);

        let pool = Pool::builder()
            .max_size(config.max_size)
            .min_idle(Some(config.min_idle))
            .connection_timeout(std::time::Duration::from_secs(
                config.connection_timeout_secs,
            ))
            .build(manager)
            .map_err(|e| LoomError::Storage(format!("Failed to create connection pool: {}", e)))?;

        Ok(Self { pool })
    }

    /// Open an in-memory database for testing or temporary use.
    ///
    /// Single connection, so every caller sees the same memory database.
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory().with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| LoomError::Storage(format!("Failed to create in-memory pool: {}", e)))?;

        Ok(Self { pool })
    }

    fn configure_connection(conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            PRAGMA wal_autocheckpoint = 1000;
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| {
            LoomError::Storage(format!("Failed to acquire database connection: {}", e))
        })
    }

    /// Initialize database schema.
    pub fn initialize(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA)
            .with_context("Failed to initialize database schema")?;

        let current: u32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);
        if current > SCHEMA_VERSION {
            return Err(LoomError::Storage(format!(
                "Database schema version {} is newer than supported version {}",
                current, SCHEMA_VERSION
            )));
        }
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .with_context("Failed to set schema version")?;
        Ok(())
    }

    /// Get a raw connection for advanced operations.
    pub fn connection(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.conn()
    }

    /// Execute a function within a panic-safe database transaction.
    ///
    /// If the closure errors or panics the transaction is rolled back and the
    /// pool stays usable.
    pub fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + std::panic::UnwindSafe,
    {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .with_context("Failed to start transaction")?;

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(&tx)));

        match result {
            Ok(Ok(value)) => {
                tx.commit().with_context("Failed to commit transaction")?;
                Ok(value)
            }
            // Rolled back on drop
            Ok(Err(e)) => Err(e),
            Err(panic_payload) => {
                let panic_msg = panic_payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic_payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "Unknown panic".to_string());

                tracing::error!("Transaction panicked: {}", panic_msg);
                Err(LoomError::Storage(format!(
                    "Transaction panicked: {}",
                    panic_msg
                )))
            }
        }
    }

    // =========================================================================
    // Reports
    // =========================================================================

    pub fn insert_report(&self, state: &PipelineState) -> Result<()> {
        let now = timestamp(Utc::now());
        let identity = &state.identity;
        self.conn()?
            .execute(
                "INSERT INTO reports
                 (id, conversation_id, account_id, user_id, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    identity.report_id.as_str(),
                    identity.conversation_id,
                    identity.account_id,
                    identity.user_id,
                    ReportStatus::Processing.as_str(),
                    now,
                ],
            )
            .with_context_fn(|| format!("Failed to create report {}", identity.report_id))?;
        tracing::debug!(report_id = %identity.report_id, "Report row created");
        Ok(())
    }

    pub fn update_progress(&self, report_id: &ReportId, update: &ProgressUpdate) -> Result<()> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE reports
                 SET current_step = ?1, percent_complete = ?2, status = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![
                    update.current_step.map(|s| s.as_str()),
                    update.percent as i64,
                    update.status.as_str(),
                    timestamp(Utc::now()),
                    report_id.as_str(),
                ],
            )
            .with_context("Failed to update report progress")?;
        require_row(changed, report_id)
    }

    /// Checkpoint the state alongside its checksum and derived columns
    pub fn store_state(&self, state: &PipelineState) -> Result<()> {
        let json = state.to_json()?;
        let checksum = state_checksum(&json);
        let report_id = state.report_id();

        let changed = self
            .conn()?
            .execute(
                "UPDATE reports
                 SET state_json = ?1, state_checksum = ?2, status = ?3, current_step = ?4,
                     percent_complete = ?5, total_tokens = ?6, cost_usd = ?7, updated_at = ?8
                 WHERE id = ?9",
                params![
                    json,
                    checksum as i64,
                    state.status().as_str(),
                    state.current_stage.map(|s| s.as_str()),
                    state.percent_complete() as i64,
                    state.usage.total() as i64,
                    state.usage.cost_usd,
                    timestamp(Utc::now()),
                    report_id.as_str(),
                ],
            )
            .with_context("Failed to store pipeline state")?;
        require_row(changed, report_id)?;

        tracing::debug!(
            report_id = %report_id,
            completed = state.completed_stages.len(),
            checksum,
            "Pipeline state checkpointed"
        );
        Ok(())
    }

    pub fn fetch_state(&self, report_id: &ReportId) -> Result<Option<PipelineState>> {
        let row: Option<(Option<String>, Option<i64>)> = self
            .conn()?
            .query_row(
                "SELECT state_json, state_checksum FROM reports WHERE id = ?1",
                params![report_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .with_context("Failed to load pipeline state")?;

        match row {
            Some((Some(json), checksum)) => {
                let state = PipelineState::from_json(&json, checksum.map(|c| c as u32))?;
                Ok(Some(state))
            }
            _ => Ok(None),
        }
    }

    pub fn finish_report(&self, report_id: &ReportId, result: &TerminalResult) -> Result<()> {
        let now = timestamp(Utc::now());
        let complete = result.status == ReportStatus::Complete;
        let changed = self.transaction(|conn| {
            let changed = conn
                .execute(
                    "UPDATE reports
                     SET status = ?1, error_message = ?2, total_tokens = ?3, cost_usd = ?4,
                         percent_complete = CASE WHEN ?5 THEN 100 ELSE percent_complete END,
                         completed_at = ?6, updated_at = ?6
                     WHERE id = ?7",
                    params![
                        result.status.as_str(),
                        result.error_message,
                        result.usage.total() as i64,
                        result.usage.cost_usd,
                        complete,
                        now,
                        report_id.as_str(),
                    ],
                )
                .with_context("Failed to record terminal result")?;
            conn.execute(
                "DELETE FROM clarification_waits WHERE report_id = ?1",
                params![report_id.as_str()],
            )
            .with_context("Failed to clear clarification wait")?;
            Ok(changed)
        })?;
        require_row(changed, report_id)?;

        tracing::info!(
            report_id = %report_id,
            status = %result.status,
            tokens = result.usage.total(),
            "Terminal result recorded"
        );
        Ok(())
    }

    pub fn status_view(&self, report_id: &ReportId) -> Result<Option<ReportStatusView>> {
        type StatusRow = (
            String,
            Option<String>,
            i64,
            Option<String>,
            i64,
            f64,
            String,
            Option<String>,
            Option<String>,
        );

        let row: Option<StatusRow> = self
            .conn()?
            .query_row(
                "SELECT r.status, r.current_step, r.percent_complete, r.error_message,
                        r.total_tokens, r.cost_usd, r.updated_at, r.state_json, w.question
                 FROM reports r
                 LEFT JOIN clarification_waits w ON w.report_id = r.id AND w.answer IS NULL
                 WHERE r.id = ?1",
                params![report_id.as_str()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                    ))
                },
            )
            .optional()
            .with_context("Failed to load report status")?;

        let Some((status, step, percent, error, tokens, cost, updated_at, state_json, question)) =
            row
        else {
            return Ok(None);
        };

        let status = ReportStatus::parse(&status)
            .ok_or_else(|| LoomError::Storage(format!("Unknown report status '{}'", status)))?;

        // The final report lives in the checkpointed state
        let report = match (status, state_json) {
            (ReportStatus::Complete, Some(json)) => serde_json::from_str::<PipelineState>(&json)
                .ok()
                .and_then(|s| s.outputs.report_synthesis),
            _ => None,
        };

        Ok(Some(ReportStatusView {
            report_id: report_id.to_string(),
            status,
            current_step: step,
            percent_complete: percent.clamp(0, 100) as u8,
            error_message: error,
            clarification_question: question,
            total_tokens: tokens.max(0) as u64,
            cost_usd: cost,
            title: report.as_ref().map(|r| r.title.clone()),
            report,
            updated_at,
        }))
    }

    // =========================================================================
    // Clarification waits
    // =========================================================================

    pub fn insert_wait(&self, report_id: &ReportId, question: &str, deadline: DateTime<Utc>) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO clarification_waits
                 (report_id, question, deadline, answer, answered_at, created_at)
                 VALUES (?1, ?2, ?3, NULL, NULL, ?4)",
                params![
                    report_id.as_str(),
                    question,
                    timestamp(deadline),
                    timestamp(Utc::now()),
                ],
            )
            .with_context("Failed to record clarification wait")?;
        Ok(())
    }

    /// Store the first answer for a wait that is open and not yet due
    pub fn answer_wait(&self, report_id: &ReportId, answer: &str, now: DateTime<Utc>) -> Result<bool> {
        let now = timestamp(now);
        let changed = self
            .conn()?
            .execute(
                "UPDATE clarification_waits SET answer = ?1, answered_at = ?2
                 WHERE report_id = ?3 AND answer IS NULL AND deadline > ?2",
                params![answer, now, report_id.as_str()],
            )
            .with_context("Failed to record clarification answer")?;
        Ok(changed > 0)
    }

    pub fn fetch_wait(&self, report_id: &ReportId) -> Result<Option<ClarificationWait>> {
        let row: Option<(String, String, Option<String>, Option<String>)> = self
            .conn()?
            .query_row(
                "SELECT question, deadline, answer, answered_at
                 FROM clarification_waits WHERE report_id = ?1",
                params![report_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .with_context("Failed to load clarification wait")?;

        row.map(|(question, deadline, answer, answered_at)| {
            Ok(ClarificationWait {
                report_id: report_id.clone(),
                question,
                deadline: parse_timestamp(&deadline)?,
                answer,
                answered_at: answered_at.as_deref().map(parse_timestamp).transpose()?,
            })
        })
        .transpose()
    }

    pub fn delete_wait(&self, report_id: &ReportId) -> Result<()> {
        self.conn()?
            .execute(
                "DELETE FROM clarification_waits WHERE report_id = ?1",
                params![report_id.as_str()],
            )
            .with_context("Failed to delete clarification wait")?;
        Ok(())
    }

    pub fn overdue_wait_ids(&self, now: DateTime<Utc>) -> Result<Vec<ReportId>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT report_id FROM clarification_waits
                 WHERE answer IS NULL AND deadline <= ?1
                 ORDER BY deadline",
            )
            .with_context("Failed to prepare overdue query")?;
        let ids = stmt
            .query_map(params![timestamp(now)], |row| row.get::<_, String>(0))
            .with_context("Failed to query overdue waits")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context("Failed to read overdue waits")?;
        Ok(ids.into_iter().map(ReportId::new).collect())
    }
}

fn require_row(changed: usize, report_id: &ReportId) -> Result<()> {
    if changed == 0 {
        return Err(LoomError::NotFound(format!("report {}", report_id)));
    }
    Ok(())
}

#[async_trait]
impl ReportSink for Database {
    async fn create_report(&self, state: &PipelineState) -> Result<()> {
        self.insert_report(state)?;
        self.store_state(state)
    }

    async fn record_progress(&self, report_id: &ReportId, update: &ProgressUpdate) -> Result<()> {
        self.update_progress(report_id, update)
    }

    async fn save_state(&self, state: &PipelineState) -> Result<()> {
        self.store_state(state)
    }

    async fn load_state(&self, report_id: &ReportId) -> Result<Option<PipelineState>> {
        self.fetch_state(report_id)
    }

    async fn record_clarification_wait(
        &self,
        report_id: &ReportId,
        question: &str,
        deadline: DateTime<Utc>,
    ) -> Result<()> {
        self.insert_wait(report_id, question, deadline)
    }

    async fn record_answer(&self, report_id: &ReportId, answer: &str) -> Result<bool> {
        self.answer_wait(report_id, answer, Utc::now())
    }

    async fn clarification_wait(&self, report_id: &ReportId) -> Result<Option<ClarificationWait>> {
        self.fetch_wait(report_id)
    }

    async fn close_wait(&self, report_id: &ReportId) -> Result<()> {
        self.delete_wait(report_id)
    }

    async fn overdue_waits(&self, now: DateTime<Utc>) -> Result<Vec<ReportId>> {
        self.overdue_wait_ids(now)
    }

    async fn finish(&self, report_id: &ReportId, result: &TerminalResult) -> Result<()> {
        self.finish_report(report_id, result)
    }

    async fn report_status(&self, report_id: &ReportId) -> Result<Option<ReportStatusView>> {
        self.status_view(report_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{CumulativeUsage, TokenUsage};
    use crate::pipeline::state::tests::{framing, sample_state};
    use crate::pipeline::{StageName, StageOutput};
    use crate::types::FailureKind;

    fn db() -> Database {
        let db = Database::open_in_memory().expect("Failed to open in-memory database");
        db.initialize().expect("Failed to initialize schema");
        db
    }

    #[test]
    fn test_open_in_memory_creates_tables() {
        let db = db();
        let conn = db.connection().unwrap();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(tables.contains(&"reports".to_string()));
        assert!(tables.contains(&"clarification_waits".to_string()));
    }

    #[test]
    fn test_transaction_panic_safety() {
        let db = db();
        let result = db.transaction(|_conn| {
            panic!("Intentional panic for testing");
            #[allow(unreachable_code)]
            Ok(())
        });

        assert!(result.unwrap_err().to_string().contains("panicked"));
        assert!(db.connection().is_ok());
    }

    #[tokio::test]
    async fn test_state_checkpoint_roundtrip() {
        let db = db();
        let state = sample_state();
        db.create_report(&state).await.unwrap();

        let usage = CumulativeUsage::default().plus(&TokenUsage::new(1_000, 200), 0.02);
        let next = state
            .apply_stage_result(StageOutput::ProblemFraming(framing()), &usage)
            .unwrap();
        db.save_state(&next).await.unwrap();

        let loaded = db.load_state(next.report_id()).await.unwrap().unwrap();
        assert_eq!(loaded, next);
        assert_eq!(loaded.completed_stages, vec![StageName::ProblemFraming]);

        let view = db.report_status(next.report_id()).await.unwrap().unwrap();
        assert_eq!(view.total_tokens, 1_200);
        assert_eq!(view.current_step.as_deref(), Some("problem_framing"));
    }

    #[tokio::test]
    async fn test_tampered_state_is_rejected() {
        let db = db();
        let state = sample_state();
        db.create_report(&state).await.unwrap();

        db.connection()
            .unwrap()
            .execute(
                "UPDATE reports SET state_json = replace(state_json, 'battery', 'BATTERY')",
                [],
            )
            .unwrap();

        let err = db.load_state(state.report_id()).await.unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[tokio::test]
    async fn test_wait_lifecycle() {
        let db = db();
        let state = sample_state();
        let id = state.report_id().clone();
        db.create_report(&state).await.unwrap();

        let deadline = Utc::now() + chrono::Duration::hours(24);
        db.record_clarification_wait(&id, "Which climate?", deadline)
            .await
            .unwrap();

        assert!(db.overdue_waits(Utc::now()).await.unwrap().is_empty());
        assert_eq!(
            db.overdue_waits(deadline + chrono::Duration::seconds(1))
                .await
                .unwrap(),
            vec![id.clone()]
        );

        assert!(db.record_answer(&id, "Desert").await.unwrap());
        // First answer wins
        assert!(!db.record_answer(&id, "Arctic").await.unwrap());
        assert_eq!(db.pending_answer(&id).await.unwrap().as_deref(), Some("Desert"));
        assert!(
            db.overdue_waits(deadline + chrono::Duration::hours(1))
                .await
                .unwrap()
                .is_empty()
        );

        db.close_wait(&id).await.unwrap();
        assert!(db.clarification_wait(&id).await.unwrap().is_none());
        assert!(!db.record_answer(&id, "late").await.unwrap());
    }

    #[tokio::test]
    async fn test_answer_after_deadline_is_refused() {
        let db = db();
        let state = sample_state();
        let id = state.report_id().clone();
        db.create_report(&state).await.unwrap();

        let deadline = Utc::now() + chrono::Duration::hours(24);
        db.record_clarification_wait(&id, "Which climate?", deadline)
            .await
            .unwrap();

        // Exactly at the deadline is already too late
        assert!(!db.answer_wait(&id, "Desert", deadline).unwrap());
        assert!(
            !db.answer_wait(&id, "Desert", deadline + chrono::Duration::hours(1))
                .unwrap()
        );
        let wait = db.clarification_wait(&id).await.unwrap().unwrap();
        assert!(wait.answer.is_none());
        assert!(wait.is_overdue(deadline));

        assert!(
            db.answer_wait(&id, "Desert", deadline - chrono::Duration::seconds(1))
                .unwrap()
        );
        assert_eq!(db.pending_answer(&id).await.unwrap().as_deref(), Some("Desert"));
    }

    #[tokio::test]
    async fn test_finish_records_sanitized_failure() {
        let db = db();
        let state = sample_state();
        let id = state.report_id().clone();
        db.create_report(&state).await.unwrap();
        db.record_clarification_wait(&id, "q", Utc::now()).await.unwrap();

        let failed = state.into_failed(FailureKind::ClarificationExpired);
        db.save_state(&failed).await.unwrap();
        db.finish(&id, &TerminalResult::from_state(&failed))
            .await
            .unwrap();

        let view = db.report_status(&id).await.unwrap().unwrap();
        assert_eq!(view.status, ReportStatus::Failed);
        assert!(view.error_message.unwrap().contains("expired"));
        assert!(view.clarification_question.is_none());
        assert!(db.clarification_wait(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_report() {
        let db = db();
        let id = ReportId::new("missing");
        assert!(db.load_state(&id).await.unwrap().is_none());
        assert!(db.report_status(&id).await.unwrap().is_none());
        assert!(matches!(
            db.save_state(&sample_state()).await,
            Err(LoomError::NotFound(_))
        ));
    }

    #[test]
    fn test_on_disk_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("reports.db");
        let db = Database::open(&path).unwrap();
        db.initialize().unwrap();
        assert!(path.exists());
    }
}
