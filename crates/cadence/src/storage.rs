//! SQLite state store for runs, iterations, agent outputs, and human
//! inputs.
//!
//! Single-file database under the project's state directory, WAL mode,
//! forward-only embedded migrations. Columns added after the initial
//! schema are nullable so old rows keep loading. All timestamps are unix
//! epoch milliseconds.

use cadence_core::{
    AgentKind, AgentOutput, HumanInput, HumanInputKind, Iteration, IterationOutcome, Run,
    RunConfig, RunStatus,
};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use thiserror::Error;

/// Explicit column list for runs queries. Explicit columns instead of
/// SELECT * keep the mapping stable as ALTER TABLE appends columns.
const RUNS_COLUMNS: &str = "id, spec_path, spec_content, status, config_json, \
    started_at, ended_at, root_work_item_id, milestone_branch";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("iteration not found: {0}")]
    IterationNotFound(i64),
    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage backend for the orchestrator.
#[derive(Debug)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Open (creating if needed) the database at `db_path` and apply
    /// migrations.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await?;

        let storage = Self { pool };
        storage.migrate_embedded().await?;
        Ok(storage)
    }

    /// Apply embedded migrations in order, tolerating re-application.
    async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [
            include_str!("../../../migrations/0001_init.sql"),
            include_str!("../../../migrations/0002_add_milestone_branch.sql"),
        ];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    let msg = e.to_string();
                    // Idempotent re-application: duplicate column / table
                    // exists errors are expected on upgraded databases.
                    if !msg.contains("duplicate column") && !msg.contains("already exists") {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    // --- Run operations ---

    pub async fn insert_run(&self, run: &Run) -> Result<()> {
        let config_json = serde_json::to_string(&run.config)?;
        sqlx::query(
            "INSERT INTO runs (id, spec_path, spec_content, status, config_json, \
             started_at, ended_at, root_work_item_id, milestone_branch) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&run.id)
        .bind(&run.spec_path)
        .bind(&run.spec_content)
        .bind(run.status.as_str())
        .bind(&config_json)
        .bind(run.started_at.timestamp_millis())
        .bind(run.ended_at.map(|t| t.timestamp_millis()))
        .bind(&run.root_work_item_id)
        .bind(&run.milestone_branch)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_run(&self, id: &str) -> Result<Run> {
        let query = format!("SELECT {RUNS_COLUMNS} FROM runs WHERE id = ?1");
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::RunNotFound(id.to_string()))?;
        row.into_run()
    }

    /// Most recently started run, if any.
    pub async fn latest_run(&self) -> Result<Option<Run>> {
        let query = format!("SELECT {RUNS_COLUMNS} FROM runs ORDER BY started_at DESC LIMIT 1");
        let row = sqlx::query_as::<_, RunRow>(&query)
            .fetch_optional(&self.pool)
            .await?;
        row.map(RunRow::into_run).transpose()
    }

    /// Runs ordered newest first, optionally limited.
    pub async fn list_runs(&self, limit: Option<u32>) -> Result<Vec<Run>> {
        let query = match limit {
            Some(n) => format!(
                "SELECT {RUNS_COLUMNS} FROM runs ORDER BY started_at DESC LIMIT {n}"
            ),
            None => format!("SELECT {RUNS_COLUMNS} FROM runs ORDER BY started_at DESC"),
        };
        let rows = sqlx::query_as::<_, RunRow>(&query)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(RunRow::into_run).collect()
    }

    /// Update run status. Terminal statuses stamp `ended_at`; resuming
    /// from `paused` leaves it NULL.
    pub async fn update_run_status(&self, id: &str, status: RunStatus) -> Result<()> {
        let ended_at = status
            .is_terminal()
            .then(|| Utc::now().timestamp_millis());
        let result = sqlx::query("UPDATE runs SET status = ?1, ended_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(ended_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::RunNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn set_milestone_branch(&self, id: &str, branch: &str) -> Result<()> {
        let result = sqlx::query("UPDATE runs SET milestone_branch = ?1 WHERE id = ?2")
            .bind(branch)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::RunNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn set_root_work_item(&self, id: &str, work_item_id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE runs SET root_work_item_id = ?1 WHERE id = ?2")
            .bind(work_item_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::RunNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn delete_run(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM runs WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Iteration operations ---

    /// Insert a new iteration with outcome `continue` and no end time,
    /// returning its row id.
    pub async fn insert_iteration(&self, run_id: &str, number: u32, intent: &str) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO iterations (run_id, number, intent, outcome, started_at, ended_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
        )
        .bind(run_id)
        .bind(number as i64)
        .bind(intent)
        .bind(IterationOutcome::Continue.as_str())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Record the planner's intent once ORIENT has produced it.
    pub async fn set_iteration_intent(&self, id: i64, intent: &str) -> Result<()> {
        let result = sqlx::query("UPDATE iterations SET intent = ?1 WHERE id = ?2")
            .bind(intent)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::IterationNotFound(id));
        }
        Ok(())
    }

    /// Write outcome and end time exactly once, at iteration end.
    pub async fn finish_iteration(&self, id: i64, outcome: IterationOutcome) -> Result<()> {
        let result = sqlx::query(
            "UPDATE iterations SET outcome = ?1, ended_at = ?2 WHERE id = ?3",
        )
        .bind(outcome.as_str())
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::IterationNotFound(id));
        }
        Ok(())
    }

    pub async fn list_iterations(&self, run_id: &str) -> Result<Vec<Iteration>> {
        let rows = sqlx::query_as::<_, IterationRow>(
            "SELECT id, run_id, number, intent, outcome, started_at, ended_at \
             FROM iterations WHERE run_id = ?1 ORDER BY number ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(IterationRow::into_iteration).collect()
    }

    /// `max(number) + 1` for the run; 1 for a fresh run.
    pub async fn next_iteration_number(&self, run_id: &str) -> Result<u32> {
        let max: (Option<i64>,) =
            sqlx::query_as("SELECT MAX(number) FROM iterations WHERE run_id = ?1")
                .bind(run_id)
                .fetch_one(&self.pool)
                .await?;
        Ok((max.0.unwrap_or(0) + 1) as u32)
    }

    // --- Agent output operations ---

    pub async fn insert_agent_output(
        &self,
        iteration_id: i64,
        kind: AgentKind,
        raw_output_path: &str,
        summary: &str,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO agent_outputs (iteration_id, agent_type, raw_output_path, summary) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(iteration_id)
        .bind(kind.as_str())
        .bind(raw_output_path)
        .bind(summary)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn list_agent_outputs(&self, iteration_id: i64) -> Result<Vec<AgentOutput>> {
        let rows = sqlx::query_as::<_, AgentOutputRow>(
            "SELECT id, iteration_id, agent_type, raw_output_path, summary \
             FROM agent_outputs WHERE iteration_id = ?1 ORDER BY id ASC",
        )
        .bind(iteration_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(AgentOutputRow::into_agent_output)
            .collect()
    }

    // --- Human input operations ---

    pub async fn push_human_input(
        &self,
        run_id: &str,
        kind: HumanInputKind,
        content: &str,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO human_inputs (run_id, input_type, content, created_at, consumed_at) \
             VALUES (?1, ?2, ?3, ?4, NULL)",
        )
        .bind(run_id)
        .bind(kind.as_str())
        .bind(content)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Pop the oldest unconsumed input for the run, marking it consumed in
    /// the same transaction so each input is observed at most once.
    pub async fn pop_unconsumed_input(&self, run_id: &str) -> Result<Option<HumanInput>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, HumanInputRow>(
            "SELECT id, run_id, input_type, content, created_at, consumed_at \
             FROM human_inputs \
             WHERE run_id = ?1 AND consumed_at IS NULL ORDER BY id ASC LIMIT 1",
        )
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let consumed_at = Utc::now().timestamp_millis();
        sqlx::query("UPDATE human_inputs SET consumed_at = ?1 WHERE id = ?2")
            .bind(consumed_at)
            .bind(row.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let mut input = row.into_human_input()?;
        input.consumed_at = DateTime::from_timestamp_millis(consumed_at);
        Ok(Some(input))
    }
}

// --- Row types ---

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    spec_path: String,
    spec_content: String,
    status: String,
    config_json: String,
    started_at: i64,
    ended_at: Option<i64>,
    root_work_item_id: Option<String>,
    milestone_branch: Option<String>,
}

impl RunRow {
    fn into_run(self) -> Result<Run> {
        let status = RunStatus::parse(&self.status)
            .ok_or_else(|| StorageError::CorruptRow(format!("run status: {}", self.status)))?;
        let config: RunConfig = serde_json::from_str(&self.config_json)?;
        Ok(Run {
            id: self.id,
            spec_path: self.spec_path,
            spec_content: self.spec_content,
            status,
            config,
            started_at: DateTime::from_timestamp_millis(self.started_at).unwrap_or_default(),
            ended_at: self.ended_at.and_then(DateTime::from_timestamp_millis),
            root_work_item_id: self.root_work_item_id,
            milestone_branch: self.milestone_branch,
        })
    }
}

#[derive(sqlx::FromRow)]
struct IterationRow {
    id: i64,
    run_id: String,
    number: i64,
    intent: String,
    outcome: String,
    started_at: i64,
    ended_at: Option<i64>,
}

impl IterationRow {
    fn into_iteration(self) -> Result<Iteration> {
        let outcome = IterationOutcome::parse(&self.outcome).ok_or_else(|| {
            StorageError::CorruptRow(format!("iteration outcome: {}", self.outcome))
        })?;
        Ok(Iteration {
            id: self.id,
            run_id: self.run_id,
            number: self.number as u32,
            intent: self.intent,
            outcome,
            started_at: DateTime::from_timestamp_millis(self.started_at).unwrap_or_default(),
            ended_at: self.ended_at.and_then(DateTime::from_timestamp_millis),
        })
    }
}

#[derive(sqlx::FromRow)]
struct AgentOutputRow {
    id: i64,
    iteration_id: i64,
    agent_type: String,
    raw_output_path: String,
    summary: String,
}

impl AgentOutputRow {
    fn into_agent_output(self) -> Result<AgentOutput> {
        let agent_kind = AgentKind::parse(&self.agent_type).ok_or_else(|| {
            StorageError::CorruptRow(format!("agent type: {}", self.agent_type))
        })?;
        Ok(AgentOutput {
            id: self.id,
            iteration_id: self.iteration_id,
            agent_kind,
            raw_output_path: self.raw_output_path,
            summary: self.summary,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HumanInputRow {
    id: i64,
    run_id: String,
    input_type: String,
    content: String,
    created_at: i64,
    consumed_at: Option<i64>,
}

impl HumanInputRow {
    fn into_human_input(self) -> Result<HumanInput> {
        let kind = HumanInputKind::parse(&self.input_type).ok_or_else(|| {
            StorageError::CorruptRow(format!("input type: {}", self.input_type))
        })?;
        Ok(HumanInput {
            id: self.id,
            run_id: self.run_id,
            kind,
            content: self.content,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            consumed_at: self.consumed_at.and_then(DateTime::from_timestamp_millis),
        })
    }
}
