use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A monitored rule as stored: identity, current logic, and revision counter.
///
/// `rid` is the caller-assigned identity and never changes; `id` is the
/// numeric surrogate assigned on first save. Every save bumps `revision`
/// after appending a history snapshot of the previous state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub id: i64,
    pub rid: String,
    pub logic: String,
    pub description: String,
    pub revision: i64,
    pub updated_at: DateTime<Utc>,
}

/// Append-only history snapshot of a rule at one revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleRevision {
    pub rule_id: i64,
    pub revision: i64,
    pub logic: String,
    pub description: String,
    pub changed_by: String,
    pub changed_at: DateTime<Utc>,
}

/// Per-event, per-rule outcome row (production or shadow stream).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub event_id: String,
    pub rule_id: i64,
    pub revision: i64,
    pub outcome: String,
    pub created_at: DateTime<Utc>,
}

/// Shadow deployment row: one candidate per rule, optionally carrying draft
/// logic/description that has not been written to the RuleDefinition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowEntry {
    pub rid: String,
    pub draft_logic: Option<String>,
    pub draft_description: Option<String>,
    pub deployed_at: DateTime<Utc>,
}

/// Backtest task lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BacktestState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl BacktestState {
    pub fn as_str(&self) -> &str {
        match self {
            BacktestState::Pending => "pending",
            BacktestState::Running => "running",
            BacktestState::Succeeded => "succeeded",
            BacktestState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BacktestState::Pending),
            "running" => Some(BacktestState::Running),
            "succeeded" => Some(BacktestState::Succeeded),
            "failed" => Some(BacktestState::Failed),
            _ => None,
        }
    }
}

/// A submitted backtest: replay of a historical window through the stored
/// logic and a candidate logic, compared as outcome-frequency tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestTask {
    pub id: String,
    pub rid: String,
    pub candidate_logic: String,
    pub state: BacktestState,
    pub error: Option<String>,
    /// outcome -> count over the replayed window, stored logic.
    pub stored_counts: Option<std::collections::HashMap<String, u64>>,
    /// outcome -> count over the replayed window, candidate logic.
    pub candidate_counts: Option<std::collections::HashMap<String, u64>>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub backtest_max_events: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./sentinel.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let backtest_max_events = std::env::var("BACKTEST_MAX_EVENTS")
            .unwrap_or_else(|_| "10000".to_string())
            .parse()
            .unwrap_or(10000);

        Ok(Self {
            database_path,
            port,
            backtest_max_events,
        })
    }
}
