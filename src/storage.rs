//! SQLite-backed persistence for rules, configs, results, and telemetry.
//!
//! One WAL-mode connection behind a `parking_lot::Mutex`; the lock is held
//! across every multi-statement transaction, which is what serializes
//! snapshot-then-update sequences (rule saves, promotion) without a separate
//! fencing token. Config rows are copy-on-write: a new `active_config`
//! version row is appended per change, never edited in place.

use std::collections::{HashMap, HashSet};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info, warn};

use crate::models::{
    BacktestState, BacktestTask, EvaluationRecord, RuleDefinition, RuleRevision, ShadowEntry,
};
use crate::typing::{FieldType, FieldTypeConfig};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -16000;
PRAGMA temp_store = MEMORY;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    rid TEXT NOT NULL UNIQUE,
    logic TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    revision INTEGER NOT NULL DEFAULT 1,
    updated_at INTEGER NOT NULL
);

-- Append-only: one row per (rule, revision), written before the rules row
-- is mutated to that revision.
CREATE TABLE IF NOT EXISTS rule_history (
    rule_id INTEGER NOT NULL,
    revision INTEGER NOT NULL,
    logic TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    changed_by TEXT NOT NULL DEFAULT '',
    changed_at INTEGER NOT NULL,
    PRIMARY KEY (rule_id, revision)
) WITHOUT ROWID;

-- Copy-on-write production rule set: highest version is current.
CREATE TABLE IF NOT EXISTS active_config (
    version INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_ids_json TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

-- One candidate per rule; draft logic/description are uncommitted overrides.
CREATE TABLE IF NOT EXISTS shadow_config (
    rid TEXT PRIMARY KEY,
    draft_logic TEXT,
    draft_description TEXT,
    deployed_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS eval_results (
    event_id TEXT NOT NULL,
    rule_id INTEGER NOT NULL,
    revision INTEGER NOT NULL,
    outcome TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_eval_results_rule ON eval_results(rule_id, outcome);
CREATE INDEX IF NOT EXISTS idx_eval_results_event ON eval_results(event_id);

CREATE TABLE IF NOT EXISTS shadow_results (
    event_id TEXT NOT NULL,
    rule_id INTEGER NOT NULL,
    revision INTEGER NOT NULL,
    outcome TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_shadow_results_rule ON shadow_results(rule_id, outcome);
CREATE INDEX IF NOT EXISTS idx_shadow_results_event ON shadow_results(event_id);

CREATE TABLE IF NOT EXISTS field_types (
    field TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    format TEXT
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS field_observations (
    field TEXT NOT NULL,
    observed_type TEXT NOT NULL,
    count INTEGER NOT NULL DEFAULT 0,
    last_seen INTEGER NOT NULL,
    PRIMARY KEY (field, observed_type)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS named_lists (
    name TEXT NOT NULL,
    member TEXT NOT NULL,
    PRIMARY KEY (name, member)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS allowed_outcomes (
    name TEXT PRIMARY KEY
) WITHOUT ROWID;

-- Raw event log; this is the population backtests replay.
CREATE TABLE IF NOT EXISTS events (
    event_id TEXT PRIMARY KEY,
    event_timestamp INTEGER NOT NULL,
    payload_json TEXT NOT NULL,
    received_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_events_ts ON events(event_timestamp);

CREATE TABLE IF NOT EXISTS backtest_tasks (
    id TEXT PRIMARY KEY,
    rid TEXT NOT NULL,
    candidate_logic TEXT NOT NULL,
    state TEXT NOT NULL,
    error TEXT,
    stored_counts_json TEXT,
    candidate_counts_json TEXT,
    created_at INTEGER NOT NULL,
    finished_at INTEGER
) WITHOUT ROWID;
"#;

/// Per-rule shadow accounting row for the stats endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ShadowRuleStats {
    pub rid: String,
    pub shadow_outcomes: HashMap<String, u64>,
    pub prod_outcomes: HashMap<String, u64>,
    pub total: u64,
}

/// A field's observed runtime types with occurrence counts.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FieldObservation {
    pub field: String,
    pub observed_type: String,
    pub count: u64,
    pub last_seen: DateTime<Utc>,
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        // Seed an empty production config so readers always find a version.
        let have_config: i64 =
            conn.query_row("SELECT COUNT(*) FROM active_config", [], |row| row.get(0))?;
        if have_config == 0 {
            conn.execute(
                "INSERT INTO active_config (rule_ids_json, created_at) VALUES ('[]', ?1)",
                params![Utc::now().timestamp()],
            )?;
        }

        let rule_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM rules", [], |row| row.get(0))
            .unwrap_or(0);
        info!("Database initialized at {} ({} rules)", db_path, rule_count);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ===== Rules =====

    /// First save of a rule: revision 1, history row, and a new active
    /// config version that appends the rule to production order.
    pub fn create_rule(
        &self,
        rid: &str,
        logic: &str,
        description: &str,
        changed_by: &str,
    ) -> Result<RuleDefinition> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock();

        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = (|| -> Result<RuleDefinition> {
            conn.execute(
                "INSERT INTO rules (rid, logic, description, revision, updated_at)
                 VALUES (?1, ?2, ?3, 1, ?4)",
                params![rid, logic, description, now],
            )
            .with_context(|| format!("rule '{}' already exists?", rid))?;
            let id = conn.last_insert_rowid();

            conn.execute(
                "INSERT INTO rule_history (rule_id, revision, logic, description, changed_by, changed_at)
                 VALUES (?1, 1, ?2, ?3, ?4, ?5)",
                params![id, logic, description, changed_by, now],
            )?;

            let mut rule_ids = current_rule_ids(&conn)?;
            rule_ids.push(id);
            append_config_version(&conn, &rule_ids, now)?;

            Ok(RuleDefinition {
                id,
                rid: rid.to_string(),
                logic: logic.to_string(),
                description: description.to_string(),
                revision: 1,
                updated_at: ts_col(now),
            })
        })();

        finish_txn(&conn, result)
    }

    /// Subsequent save: history row for the new revision first, then the
    /// rules row swap and a fresh active config version, all inside one
    /// transaction.
    pub fn update_rule(
        &self,
        rid: &str,
        logic: &str,
        description: &str,
        changed_by: &str,
    ) -> Result<RuleDefinition> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock();

        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = (|| -> Result<RuleDefinition> {
            let existing = get_rule_inner(&conn, rid)?
                .with_context(|| format!("no rule with rid '{}'", rid))?;
            let revision = existing.revision + 1;

            conn.execute(
                "INSERT INTO rule_history (rule_id, revision, logic, description, changed_by, changed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![existing.id, revision, logic, description, changed_by, now],
            )?;
            conn.execute(
                "UPDATE rules SET logic = ?1, description = ?2, revision = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![logic, description, revision, now, existing.id],
            )?;

            // Membership is unchanged, but behavior is not: every logic swap
            // gets its own config version so results stay attributable.
            let rule_ids = current_rule_ids(&conn)?;
            append_config_version(&conn, &rule_ids, now)?;

            Ok(RuleDefinition {
                id: existing.id,
                rid: rid.to_string(),
                logic: logic.to_string(),
                description: description.to_string(),
                revision,
                updated_at: ts_col(now),
            })
        })();

        finish_txn(&conn, result)
    }

    pub fn get_rule(&self, rid: &str) -> Result<Option<RuleDefinition>> {
        let conn = self.conn.lock();
        get_rule_inner(&conn, rid)
    }

    pub fn get_rules_by_ids(&self, ids: &[i64]) -> Result<Vec<RuleDefinition>> {
        let conn = self.conn.lock();
        let mut out = Vec::with_capacity(ids.len());
        let mut stmt = conn.prepare_cached(
            "SELECT id, rid, logic, description, revision, updated_at FROM rules WHERE id = ?1",
        )?;
        for id in ids {
            if let Some(rule) = stmt
                .query_row([id], row_to_rule)
                .optional()
                .context("rule lookup failed")?
            {
                out.push(rule);
            } else {
                // A config version referencing a deleted rule is skipped, not fatal.
                warn!("active config references missing rule id {}", id);
            }
        }
        Ok(out)
    }

    pub fn get_rule_history(&self, rid: &str) -> Result<Vec<RuleRevision>> {
        let conn = self.conn.lock();
        let Some(rule) = get_rule_inner(&conn, rid)? else {
            return Ok(Vec::new());
        };
        let mut stmt = conn.prepare_cached(
            "SELECT rule_id, revision, logic, description, changed_by, changed_at
             FROM rule_history WHERE rule_id = ?1 ORDER BY revision",
        )?;
        let rows = stmt
            .query_map([rule.id], |row| {
                Ok(RuleRevision {
                    rule_id: row.get(0)?,
                    revision: row.get(1)?,
                    logic: row.get(2)?,
                    description: row.get(3)?,
                    changed_by: row.get(4)?,
                    changed_at: ts_col(row.get(5)?),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // ===== Active / shadow config =====

    /// Current production config: (version, rule ids in production order).
    pub fn get_active_config(&self) -> Result<(i64, Vec<i64>)> {
        let conn = self.conn.lock();
        let (version, json): (i64, String) = conn.query_row(
            "SELECT version, rule_ids_json FROM active_config ORDER BY version DESC LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let rule_ids = serde_json::from_str(&json).context("corrupt active_config row")?;
        Ok((version, rule_ids))
    }

    /// Overwrite (or create) the shadow deployment for a rule. Previously
    /// accumulated shadow results for that rule are cleared in the same
    /// transaction so stale candidate counts never mix with the new one.
    pub fn deploy_shadow(
        &self,
        rid: &str,
        draft_logic: Option<&str>,
        draft_description: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock();

        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = (|| -> Result<()> {
            let rule = get_rule_inner(&conn, rid)?
                .with_context(|| format!("no rule with rid '{}'", rid))?;
            conn.execute(
                "INSERT INTO shadow_config (rid, draft_logic, draft_description, deployed_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(rid) DO UPDATE SET
                    draft_logic=excluded.draft_logic,
                    draft_description=excluded.draft_description,
                    deployed_at=excluded.deployed_at",
                params![rid, draft_logic, draft_description, now],
            )?;
            let cleared = conn.execute(
                "DELETE FROM shadow_results WHERE rule_id = ?1",
                params![rule.id],
            )?;
            if cleared > 0 {
                debug!("cleared {} stale shadow results for rule {}", cleared, rid);
            }
            Ok(())
        })();

        finish_txn(&conn, result)
    }

    pub fn get_shadow_entries(&self) -> Result<Vec<ShadowEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT rid, draft_logic, draft_description, deployed_at FROM shadow_config",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ShadowEntry {
                    rid: row.get(0)?,
                    draft_logic: row.get(1)?,
                    draft_description: row.get(2)?,
                    deployed_at: ts_col(row.get(3)?),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Discard a shadow deployment. Nothing in production is touched.
    pub fn remove_shadow(&self, rid: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM shadow_config WHERE rid = ?1", params![rid])?;
        Ok(removed > 0)
    }

    /// Promote a shadow candidate: write the draft into the rule (new
    /// revision + history snapshot), point a new active config version at
    /// it, and clear the shadow entry — atomically.
    pub fn promote_shadow(&self, rid: &str, changed_by: &str) -> Result<RuleDefinition> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock();

        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = (|| -> Result<RuleDefinition> {
            let entry: Option<(Option<String>, Option<String>)> = conn
                .query_row(
                    "SELECT draft_logic, draft_description FROM shadow_config WHERE rid = ?1",
                    params![rid],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((draft_logic, draft_description)) = entry else {
                bail!("rule '{}' is not deployed to shadow", rid);
            };

            let existing = get_rule_inner(&conn, rid)?
                .with_context(|| format!("no rule with rid '{}'", rid))?;

            let logic = draft_logic.unwrap_or_else(|| existing.logic.clone());
            let description = draft_description.unwrap_or_else(|| existing.description.clone());
            let revision = existing.revision + 1;

            conn.execute(
                "INSERT INTO rule_history (rule_id, revision, logic, description, changed_by, changed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![existing.id, revision, logic, description, changed_by, now],
            )?;
            conn.execute(
                "UPDATE rules SET logic = ?1, description = ?2, revision = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![logic, description, revision, now, existing.id],
            )?;

            let mut rule_ids = current_rule_ids(&conn)?;
            if !rule_ids.contains(&existing.id) {
                rule_ids.push(existing.id);
            }
            append_config_version(&conn, &rule_ids, now)?;

            conn.execute("DELETE FROM shadow_config WHERE rid = ?1", params![rid])?;

            Ok(RuleDefinition {
                id: existing.id,
                rid: rid.to_string(),
                logic,
                description,
                revision,
                updated_at: ts_col(now),
            })
        })();

        finish_txn(&conn, result)
    }

    // ===== Results =====

    pub fn insert_eval_results(
        &self,
        event_id: &str,
        results: &[(i64, i64, String)],
    ) -> Result<()> {
        self.insert_results("eval_results", event_id, results)
    }

    pub fn insert_shadow_results(
        &self,
        event_id: &str,
        results: &[(i64, i64, String)],
    ) -> Result<()> {
        self.insert_results("shadow_results", event_id, results)
    }

    /// Replace-per-event: re-evaluating an event swaps its rows instead of
    /// appending, so the outcome distributions never double-count.
    fn insert_results(
        &self,
        table: &str,
        event_id: &str,
        results: &[(i64, i64, String)],
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = (|| -> Result<()> {
            conn.execute(
                &format!("DELETE FROM {table} WHERE event_id = ?1"),
                params![event_id],
            )?;
            let sql = format!(
                "INSERT INTO {table} (event_id, rule_id, revision, outcome, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)"
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            for (rule_id, revision, outcome) in results {
                stmt.execute(params![event_id, rule_id, revision, outcome, now])?;
            }
            Ok(())
        })();
        finish_txn(&conn, result)
    }

    pub fn shadow_stats(&self) -> Result<Vec<ShadowRuleStats>> {
        let conn = self.conn.lock();
        let entries: Vec<(String, i64)> = {
            let mut stmt = conn.prepare_cached(
                "SELECT s.rid, r.id FROM shadow_config s JOIN rules r ON r.rid = s.rid",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };

        let mut out = Vec::with_capacity(entries.len());
        for (rid, rule_id) in entries {
            let shadow_outcomes = outcome_counts(&conn, "shadow_results", rule_id)?;
            let prod_outcomes = outcome_counts(&conn, "eval_results", rule_id)?;
            let total = shadow_outcomes.values().sum();
            out.push(ShadowRuleStats {
                rid,
                shadow_outcomes,
                prod_outcomes,
                total,
            });
        }
        Ok(out)
    }

    // ===== Field typing & observation =====

    pub fn set_field_type(&self, field: &str, ty: &FieldType) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO field_types (field, type, format) VALUES (?1, ?2, ?3)
             ON CONFLICT(field) DO UPDATE SET type=excluded.type, format=excluded.format",
            params![field, ty.as_str(), ty.format()],
        )?;
        Ok(())
    }

    pub fn clear_field_type(&self, field: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM field_types WHERE field = ?1", params![field])?;
        Ok(removed > 0)
    }

    pub fn get_field_types(&self) -> Result<FieldTypeConfig> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT field, type, format FROM field_types")?;
        let mut out = HashMap::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let field: String = row.get(0)?;
            let ty: String = row.get(1)?;
            let format: Option<String> = row.get(2)?;
            match FieldType::from_parts(&ty, format.as_deref()) {
                Some(parsed) => {
                    out.insert(field, parsed);
                }
                None => warn!("ignoring unparseable field type row for '{}': {}", field, ty),
            }
        }
        Ok(out)
    }

    /// Fire-and-forget occurrence counting; callers swallow the `Err`.
    pub fn record_observation(&self, field: &str, observed_type: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO field_observations (field, observed_type, count, last_seen)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(field, observed_type) DO UPDATE SET
                count = count + 1, last_seen = excluded.last_seen",
            params![field, observed_type, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn get_observations(&self) -> Result<Vec<FieldObservation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT field, observed_type, count, last_seen FROM field_observations
             ORDER BY field, observed_type",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(FieldObservation {
                    field: row.get(0)?,
                    observed_type: row.get(1)?,
                    count: row.get::<_, i64>(2)? as u64,
                    last_seen: ts_col(row.get(3)?),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // ===== Named lists & allowed outcomes =====

    pub fn replace_named_list(&self, name: &str, members: &[String]) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = (|| -> Result<()> {
            conn.execute("DELETE FROM named_lists WHERE name = ?1", params![name])?;
            let mut stmt =
                conn.prepare_cached("INSERT OR IGNORE INTO named_lists (name, member) VALUES (?1, ?2)")?;
            for member in members {
                stmt.execute(params![name, member])?;
            }
            Ok(())
        })();
        finish_txn(&conn, result)
    }

    pub fn get_named_lists(&self) -> Result<HashMap<String, Vec<String>>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT name, member FROM named_lists ORDER BY name, member")?;
        let mut out: HashMap<String, Vec<String>> = HashMap::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let name: String = row.get(0)?;
            let member: String = row.get(1)?;
            out.entry(name).or_default().push(member);
        }
        Ok(out)
    }

    pub fn set_allowed_outcomes(&self, outcomes: &[String]) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = (|| -> Result<()> {
            conn.execute("DELETE FROM allowed_outcomes", [])?;
            let mut stmt =
                conn.prepare_cached("INSERT OR IGNORE INTO allowed_outcomes (name) VALUES (?1)")?;
            for outcome in outcomes {
                stmt.execute(params![outcome])?;
            }
            Ok(())
        })();
        finish_txn(&conn, result)
    }

    /// Empty set means the constraint is not configured (everything allowed).
    pub fn get_allowed_outcomes(&self) -> Result<HashSet<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT name FROM allowed_outcomes")?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // ===== Event log =====

    pub fn insert_event(&self, event_id: &str, event_timestamp: i64, payload_json: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO events (event_id, event_timestamp, payload_json, received_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![event_id, event_timestamp, payload_json, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    /// Historical events in `[start_ts, end_ts]`, oldest first, bounded.
    pub fn get_events_window(
        &self,
        start_ts: i64,
        end_ts: i64,
        limit: usize,
    ) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT event_id, payload_json FROM events
             WHERE event_timestamp >= ?1 AND event_timestamp <= ?2
             ORDER BY event_timestamp ASC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![start_ts, end_ts, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // ===== Backtest tasks =====

    pub fn insert_backtest_task(&self, task: &BacktestTask) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO backtest_tasks (id, rid, candidate_logic, state, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                task.id,
                task.rid,
                task.candidate_logic,
                task.state.as_str(),
                task.created_at.timestamp()
            ],
        )?;
        Ok(())
    }

    pub fn set_backtest_running(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE backtest_tasks SET state = 'running' WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn set_backtest_succeeded(
        &self,
        id: &str,
        stored_counts: &HashMap<String, u64>,
        candidate_counts: &HashMap<String, u64>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE backtest_tasks
             SET state = 'succeeded', stored_counts_json = ?1, candidate_counts_json = ?2,
                 finished_at = ?3
             WHERE id = ?4",
            params![
                serde_json::to_string(stored_counts)?,
                serde_json::to_string(candidate_counts)?,
                Utc::now().timestamp(),
                id
            ],
        )?;
        Ok(())
    }

    pub fn set_backtest_failed(&self, id: &str, error: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE backtest_tasks SET state = 'failed', error = ?1, finished_at = ?2 WHERE id = ?3",
            params![error, Utc::now().timestamp(), id],
        )?;
        Ok(())
    }

    pub fn get_backtest_task(&self, id: &str) -> Result<Option<BacktestTask>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, rid, candidate_logic, state, error, stored_counts_json,
                    candidate_counts_json, created_at, finished_at
             FROM backtest_tasks WHERE id = ?1",
        )?;
        let task = stmt
            .query_row([id], |row| {
                let state_str: String = row.get(3)?;
                let stored_json: Option<String> = row.get(5)?;
                let candidate_json: Option<String> = row.get(6)?;
                let finished_at: Option<i64> = row.get(8)?;
                Ok(BacktestTask {
                    id: row.get(0)?,
                    rid: row.get(1)?,
                    candidate_logic: row.get(2)?,
                    state: BacktestState::parse(&state_str).unwrap_or(BacktestState::Failed),
                    error: row.get(4)?,
                    stored_counts: stored_json.and_then(|j| serde_json::from_str(&j).ok()),
                    candidate_counts: candidate_json.and_then(|j| serde_json::from_str(&j).ok()),
                    created_at: ts_col(row.get(7)?),
                    finished_at: finished_at.map(ts_col),
                })
            })
            .optional()?;
        Ok(task)
    }

    /// Production result rows for one event, most recent evaluation order.
    pub fn get_eval_results(&self, event_id: &str) -> Result<Vec<EvaluationRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT event_id, rule_id, revision, outcome, created_at
             FROM eval_results WHERE event_id = ?1 ORDER BY rule_id",
        )?;
        let rows = stmt
            .query_map([event_id], |row| {
                Ok(EvaluationRecord {
                    event_id: row.get(0)?,
                    rule_id: row.get(1)?,
                    revision: row.get(2)?,
                    outcome: row.get(3)?,
                    created_at: ts_col(row.get(4)?),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn get_shadow_results(&self, event_id: &str) -> Result<Vec<EvaluationRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT event_id, rule_id, revision, outcome, created_at
             FROM shadow_results WHERE event_id = ?1 ORDER BY rule_id",
        )?;
        let rows = stmt
            .query_map([event_id], |row| {
                Ok(EvaluationRecord {
                    event_id: row.get(0)?,
                    rule_id: row.get(1)?,
                    revision: row.get(2)?,
                    outcome: row.get(3)?,
                    created_at: ts_col(row.get(4)?),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }
}

fn row_to_rule(row: &rusqlite::Row) -> rusqlite::Result<RuleDefinition> {
    Ok(RuleDefinition {
        id: row.get(0)?,
        rid: row.get(1)?,
        logic: row.get(2)?,
        description: row.get(3)?,
        revision: row.get(4)?,
        updated_at: ts_col(row.get(5)?),
    })
}

fn get_rule_inner(conn: &Connection, rid: &str) -> Result<Option<RuleDefinition>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, rid, logic, description, revision, updated_at FROM rules WHERE rid = ?1",
    )?;
    stmt.query_row([rid], row_to_rule)
        .optional()
        .context("rule lookup failed")
}

fn current_rule_ids(conn: &Connection) -> Result<Vec<i64>> {
    let json: String = conn.query_row(
        "SELECT rule_ids_json FROM active_config ORDER BY version DESC LIMIT 1",
        [],
        |row| row.get(0),
    )?;
    serde_json::from_str(&json).context("corrupt active_config row")
}

fn append_config_version(conn: &Connection, rule_ids: &[i64], now: i64) -> Result<i64> {
    conn.execute(
        "INSERT INTO active_config (rule_ids_json, created_at) VALUES (?1, ?2)",
        params![serde_json::to_string(rule_ids)?, now],
    )?;
    Ok(conn.last_insert_rowid())
}

fn outcome_counts(
    conn: &Connection,
    table: &str,
    rule_id: i64,
) -> Result<HashMap<String, u64>> {
    let sql =
        format!("SELECT outcome, COUNT(*) FROM {table} WHERE rule_id = ?1 GROUP BY outcome");
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut out = HashMap::new();
    let mut rows = stmt.query([rule_id])?;
    while let Some(row) = rows.next()? {
        let outcome: String = row.get(0)?;
        let count: i64 = row.get(1)?;
        out.insert(outcome, count as u64);
    }
    Ok(out)
}

/// Commit on success, roll back on failure, preserving the original error.
fn finish_txn<T>(conn: &Connection, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            conn.execute("COMMIT", [])?;
            Ok(value)
        }
        Err(err) => {
            let _ = conn.execute("ROLLBACK", []);
            Err(err)
        }
    }
}

fn ts_col(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        Database::new(":memory:").expect("Failed to create database")
    }

    #[test]
    fn create_rule_appends_history_and_config_version() {
        let db = db();
        let (v0, ids0) = db.get_active_config().unwrap();
        assert!(ids0.is_empty());

        let rule = db
            .create_rule("r-1", "return 'HOLD'", "holds everything", "tester")
            .unwrap();
        assert_eq!(rule.revision, 1);

        let (v1, ids1) = db.get_active_config().unwrap();
        assert!(v1 > v0);
        assert_eq!(ids1, vec![rule.id]);

        let history = db.get_rule_history("r-1").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].revision, 1);
    }

    #[test]
    fn duplicate_rid_is_rejected_and_rolled_back() {
        let db = db();
        db.create_rule("r-1", "return 'A'", "", "t").unwrap();
        let (v_before, _) = db.get_active_config().unwrap();

        assert!(db.create_rule("r-1", "return 'B'", "", "t").is_err());

        let (v_after, _) = db.get_active_config().unwrap();
        assert_eq!(v_before, v_after, "failed create must not add a config version");
    }

    #[test]
    fn update_rule_bumps_revision_with_snapshot() {
        let db = db();
        db.create_rule("r-1", "return 'A'", "", "t").unwrap();
        let updated = db.update_rule("r-1", "return 'B'", "v2", "t").unwrap();
        assert_eq!(updated.revision, 2);

        let history = db.get_rule_history("r-1").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].logic, "return 'B'");

        let current = db.get_rule("r-1").unwrap().unwrap();
        assert_eq!(current.logic, "return 'B'");
        assert_eq!(current.revision, 2);
    }

    #[test]
    fn update_rule_appends_a_config_version() {
        let db = db();
        let rule = db.create_rule("r-1", "return 'A'", "", "t").unwrap();
        let (v1, ids1) = db.get_active_config().unwrap();

        db.update_rule("r-1", "return 'B'", "", "t").unwrap();
        let (v2, ids2) = db.get_active_config().unwrap();
        assert!(v2 > v1, "a logic change must get its own config version");
        assert_eq!(ids2, vec![rule.id]);
        assert_eq!(ids1, ids2, "membership is unchanged by an update");
    }

    #[test]
    fn shadow_deploy_clears_prior_results() {
        let db = db();
        let rule = db.create_rule("r-1", "return 'A'", "", "t").unwrap();

        db.deploy_shadow("r-1", Some("return 'B'"), None).unwrap();
        db.insert_shadow_results("e-1", &[(rule.id, 1, "B".to_string())])
            .unwrap();
        assert_eq!(db.shadow_stats().unwrap()[0].total, 1);

        // Redeploy resets accumulated counts to zero.
        db.deploy_shadow("r-1", Some("return 'C'"), None).unwrap();
        assert_eq!(db.shadow_stats().unwrap()[0].total, 0);
    }

    #[test]
    fn promote_is_atomic_in_a_single_read() {
        let db = db();
        let rule = db.create_rule("r-1", "return 'A'", "old", "t").unwrap();
        db.deploy_shadow("r-1", Some("return 'B'"), Some("new desc"))
            .unwrap();

        let promoted = db.promote_shadow("r-1", "t").unwrap();
        assert_eq!(promoted.revision, 2);
        assert_eq!(promoted.logic, "return 'B'");

        // All three legs visible at once: rule updated, config references it,
        // shadow entry gone.
        let current = db.get_rule("r-1").unwrap().unwrap();
        assert_eq!(current.logic, "return 'B'");
        assert_eq!(current.description, "new desc");
        let (_, ids) = db.get_active_config().unwrap();
        assert!(ids.contains(&rule.id));
        assert!(db.get_shadow_entries().unwrap().is_empty());
    }

    #[test]
    fn promote_without_deploy_fails_cleanly() {
        let db = db();
        db.create_rule("r-1", "return 'A'", "", "t").unwrap();
        let err = db.promote_shadow("r-1", "t").unwrap_err();
        assert!(err.to_string().contains("not deployed"));
        // Rule untouched.
        assert_eq!(db.get_rule("r-1").unwrap().unwrap().revision, 1);
    }

    #[test]
    fn field_types_round_trip() {
        let db = db();
        db.set_field_type("amount", &FieldType::Float).unwrap();
        db.set_field_type(
            "ts",
            &FieldType::Datetime {
                format: "%Y-%m-%d".to_string(),
            },
        )
        .unwrap();

        let types = db.get_field_types().unwrap();
        assert_eq!(types.get("amount"), Some(&FieldType::Float));
        assert_eq!(
            types.get("ts"),
            Some(&FieldType::Datetime {
                format: "%Y-%m-%d".to_string()
            })
        );

        assert!(db.clear_field_type("amount").unwrap());
        assert!(!db.get_field_types().unwrap().contains_key("amount"));
    }

    #[test]
    fn observations_accumulate() {
        let db = db();
        db.record_observation("amount", "string").unwrap();
        db.record_observation("amount", "string").unwrap();
        db.record_observation("amount", "int").unwrap();

        let obs = db.get_observations().unwrap();
        let string_row = obs
            .iter()
            .find(|o| o.field == "amount" && o.observed_type == "string")
            .unwrap();
        assert_eq!(string_row.count, 2);
    }

    #[test]
    fn named_lists_replace_semantics() {
        let db = db();
        db.replace_named_list("HighRisk", &["KP".to_string(), "IR".to_string()])
            .unwrap();
        db.replace_named_list("HighRisk", &["IR".to_string()]).unwrap();
        let lists = db.get_named_lists().unwrap();
        assert_eq!(lists.get("HighRisk").unwrap(), &vec!["IR".to_string()]);
    }

    #[test]
    fn events_window_is_bounded_and_ordered() {
        let db = db();
        for i in 0..5 {
            db.insert_event(&format!("e-{i}"), 100 + i, "{}").unwrap();
        }
        let window = db.get_events_window(101, 104, 2).unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].0, "e-1");
        assert_eq!(window[1].0, "e-2");
    }

    #[test]
    fn backtest_task_lifecycle_rows() {
        let db = db();
        let task = BacktestTask {
            id: "t-1".to_string(),
            rid: "r-1".to_string(),
            candidate_logic: "return 'B'".to_string(),
            state: BacktestState::Pending,
            error: None,
            stored_counts: None,
            candidate_counts: None,
            created_at: Utc::now(),
            finished_at: None,
        };
        db.insert_backtest_task(&task).unwrap();
        db.set_backtest_running("t-1").unwrap();
        assert_eq!(
            db.get_backtest_task("t-1").unwrap().unwrap().state,
            BacktestState::Running
        );

        let mut stored = HashMap::new();
        stored.insert("A".to_string(), 3u64);
        let mut candidate = HashMap::new();
        candidate.insert("B".to_string(), 3u64);
        db.set_backtest_succeeded("t-1", &stored, &candidate).unwrap();

        let done = db.get_backtest_task("t-1").unwrap().unwrap();
        assert_eq!(done.state, BacktestState::Succeeded);
        assert_eq!(done.stored_counts.unwrap().get("A"), Some(&3));
        assert_eq!(done.candidate_counts.unwrap().get("B"), Some(&3));
        assert!(done.finished_at.is_some());
    }

    #[test]
    fn result_rows_are_replaced_per_event() {
        let db = db();
        let rule = db.create_rule("r-1", "return 'A'", "", "t").unwrap();
        db.deploy_shadow("r-1", Some("return 'B'"), None).unwrap();

        for _ in 0..2 {
            db.insert_eval_results("e-1", &[(rule.id, 1, "A".to_string())])
                .unwrap();
            db.insert_shadow_results("e-1", &[(rule.id, 1, "B".to_string())])
                .unwrap();
        }

        assert_eq!(db.get_eval_results("e-1").unwrap().len(), 1);
        assert_eq!(db.shadow_stats().unwrap()[0].total, 1);
    }

    #[test]
    fn results_carry_the_revision_at_evaluation_time() {
        let db = db();
        let rule = db.create_rule("r-1", "return 'A'", "", "t").unwrap();
        db.insert_eval_results("e-1", &[(rule.id, rule.revision, "A".to_string())])
            .unwrap();

        // Later revision must not reattribute the stored row.
        db.update_rule("r-1", "return 'B'", "", "t").unwrap();
        let rows = db.get_eval_results("e-1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].revision, 1);
        assert_eq!(rows[0].outcome, "A");
    }
}
