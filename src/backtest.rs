//! Backtesting: replay a bounded historical window through a rule's stored
//! logic and a candidate logic, and compare outcome distributions.
//!
//! Only the task state machine (Pending -> Running -> Succeeded | Failed)
//! and the comparison live here; dispatch is a `tokio::spawn` at the API
//! layer so the replay never rides the synchronous request path. Status
//! reads are plain row lookups and safe to poll repeatedly. There is no
//! automatic retry: a failed task records its error and the operator
//! resubmits.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::models::{BacktestState, BacktestTask};
use crate::rules::{self, CompileError, CompiledRule};
use crate::typing;

#[derive(Debug, Clone, Deserialize)]
pub struct BacktestRequest {
    pub rid: String,
    pub candidate_logic: String,
    /// Replay window over event timestamps, inclusive.
    pub start_ts: i64,
    pub end_ts: i64,
}

#[derive(Debug)]
pub enum BacktestError {
    UnknownRule(String),
    Compile(CompileError),
    Storage(anyhow::Error),
}

impl fmt::Display for BacktestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BacktestError::UnknownRule(rid) => write!(f, "no rule with rid '{rid}'"),
            BacktestError::Compile(err) => write!(f, "invalid candidate logic: {err}"),
            BacktestError::Storage(err) => write!(f, "storage failure: {err}"),
        }
    }
}

#[derive(Clone)]
pub struct BacktestRunner {
    engine: Arc<Engine>,
    max_events: usize,
}

impl BacktestRunner {
    pub fn new(engine: Arc<Engine>, max_events: usize) -> Self {
        Self { engine, max_events }
    }

    /// Validate and enqueue: the task row is Pending until `run` picks it
    /// up. Candidate logic that does not compile is rejected here, not
    /// recorded as a failed task.
    pub fn submit(&self, request: &BacktestRequest) -> Result<BacktestTask, BacktestError> {
        match self.engine.db.get_rule(&request.rid) {
            Ok(Some(_)) => {}
            Ok(None) => return Err(BacktestError::UnknownRule(request.rid.clone())),
            Err(err) => return Err(BacktestError::Storage(err)),
        }
        rules::compile(&request.candidate_logic).map_err(BacktestError::Compile)?;

        let task = BacktestTask {
            id: Uuid::new_v4().to_string(),
            rid: request.rid.clone(),
            candidate_logic: request.candidate_logic.clone(),
            state: BacktestState::Pending,
            error: None,
            stored_counts: None,
            candidate_counts: None,
            created_at: Utc::now(),
            finished_at: None,
        };
        self.engine
            .db
            .insert_backtest_task(&task)
            .map_err(BacktestError::Storage)?;
        info!("backtest {} queued for rule '{}'", task.id, task.rid);
        Ok(task)
    }

    /// Execute a submitted task to a terminal state. Any failure lands in
    /// the task row; this function never propagates it to the caller.
    pub fn run(&self, task_id: &str, request: &BacktestRequest) {
        if let Err(err) = self.engine.db.set_backtest_running(task_id) {
            warn!("backtest {} could not enter Running: {}", task_id, err);
            return;
        }

        match self.replay(request) {
            Ok((stored, candidate)) => {
                if let Err(err) = self
                    .engine
                    .db
                    .set_backtest_succeeded(task_id, &stored, &candidate)
                {
                    warn!("backtest {} result write failed: {}", task_id, err);
                }
                info!("backtest {} succeeded", task_id);
            }
            Err(err) => {
                let message = err.to_string();
                warn!("backtest {} failed: {}", task_id, message);
                if let Err(err) = self.engine.db.set_backtest_failed(task_id, &message) {
                    warn!("backtest {} failure write failed: {}", task_id, err);
                }
            }
        }
    }

    pub fn status(&self, task_id: &str) -> anyhow::Result<Option<BacktestTask>> {
        self.engine.db.get_backtest_task(task_id)
    }

    /// Replay the window through both compiled forms, once each per event.
    /// Per-event failures (unparseable payload, cast error, runtime error)
    /// drop that event from the affected tally, mirroring the shadow
    /// path's containment; they never abort the run.
    fn replay(
        &self,
        request: &BacktestRequest,
    ) -> anyhow::Result<(HashMap<String, u64>, HashMap<String, u64>)> {
        let rule = self
            .engine
            .db
            .get_rule(&request.rid)?
            .ok_or_else(|| anyhow::anyhow!("rule '{}' disappeared", request.rid))?;

        let stored = rules::compile(&rule.logic)
            .map_err(|err| anyhow::anyhow!("stored logic no longer compiles: {err}"))?;
        let candidate = rules::compile(&request.candidate_logic)
            .map_err(|err| anyhow::anyhow!("candidate logic does not compile: {err}"))?;

        // One consistent view of types and lists for the whole replay.
        let field_types = self.engine.db.get_field_types()?;
        let lists = self.engine.db.get_named_lists()?;

        let events =
            self.engine
                .db
                .get_events_window(request.start_ts, request.end_ts, self.max_events)?;
        debug!(
            "backtest replaying {} events for rule '{}'",
            events.len(),
            request.rid
        );

        let mut stored_counts: HashMap<String, u64> = HashMap::new();
        let mut candidate_counts: HashMap<String, u64> = HashMap::new();

        for (event_id, payload_json) in &events {
            let Ok(serde_json::Value::Object(payload)) =
                serde_json::from_str::<serde_json::Value>(payload_json)
            else {
                debug!("backtest skipping unparseable event '{}'", event_id);
                continue;
            };

            let mut event = rules::interp::TypedEvent::new();
            let mut cast_failed = false;
            for (field, raw) in &payload {
                match typing::cast(field, raw, field_types.get(field)) {
                    Ok(value) => {
                        event.insert(field.clone(), value);
                    }
                    Err(err) => {
                        debug!("backtest skipping event '{}': {}", event_id, err);
                        cast_failed = true;
                        break;
                    }
                }
            }
            if cast_failed {
                continue;
            }

            tally(&stored, &event, &lists, &mut stored_counts);
            tally(&candidate, &event, &lists, &mut candidate_counts);
        }

        Ok((stored_counts, candidate_counts))
    }
}

fn tally(
    compiled: &CompiledRule,
    event: &rules::interp::TypedEvent,
    lists: &HashMap<String, Vec<String>>,
    counts: &mut HashMap<String, u64>,
) {
    if let Ok(Some(outcome)) = rules::execute(compiled, event, lists) {
        *counts.entry(outcome).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EvalRequest;
    use crate::storage::Database;
    use serde_json::json;

    fn setup() -> (Arc<Engine>, BacktestRunner) {
        let db = Arc::new(Database::new(":memory:").expect("Failed to create database"));
        let engine = Arc::new(Engine::new(db).expect("Failed to build engine"));
        let runner = BacktestRunner::new(engine.clone(), 1000);
        (engine, runner)
    }

    fn feed_event(engine: &Engine, event_id: &str, ts: i64, data: serde_json::Value) {
        engine
            .evaluate(&EvalRequest {
                event_id: event_id.to_string(),
                event_timestamp: ts,
                event_data: data.as_object().cloned().expect("object payload"),
            })
            .unwrap();
    }

    #[test]
    fn submit_rejects_unknown_rule_and_bad_candidate() {
        let (engine, runner) = setup();
        let missing = BacktestRequest {
            rid: "ghost".to_string(),
            candidate_logic: "return 'A'".to_string(),
            start_ts: 0,
            end_ts: 10,
        };
        assert!(matches!(
            runner.submit(&missing),
            Err(BacktestError::UnknownRule(_))
        ));

        engine.create_rule("r-1", "return 'A'", "", "t").unwrap();
        let bad = BacktestRequest {
            rid: "r-1".to_string(),
            candidate_logic: "import os".to_string(),
            start_ts: 0,
            end_ts: 10,
        };
        assert!(matches!(runner.submit(&bad), Err(BacktestError::Compile(_))));
    }

    #[test]
    fn run_compares_stored_and_candidate_distributions() {
        let (engine, runner) = setup();
        engine.db.set_field_type("amount", &crate::typing::FieldType::Float).unwrap();
        engine
            .create_rule("r-1", "if $amount > 100:\n    return 'HOLD'", "", "t")
            .unwrap();

        feed_event(&engine, "e-1", 100, json!({"amount": 50}));
        feed_event(&engine, "e-2", 110, json!({"amount": 150}));
        feed_event(&engine, "e-3", 120, json!({"amount": 250}));

        let request = BacktestRequest {
            rid: "r-1".to_string(),
            candidate_logic: "if $amount > 40:\n    return 'HOLD'".to_string(),
            start_ts: 0,
            end_ts: 1_000,
        };
        let task = runner.submit(&request).unwrap();
        assert_eq!(task.state, BacktestState::Pending);

        runner.run(&task.id, &request);

        let done = runner.status(&task.id).unwrap().unwrap();
        assert_eq!(done.state, BacktestState::Succeeded);
        assert_eq!(done.stored_counts.unwrap().get("HOLD"), Some(&2));
        assert_eq!(done.candidate_counts.unwrap().get("HOLD"), Some(&3));
    }

    #[test]
    fn window_bounds_are_respected() {
        let (engine, runner) = setup();
        engine
            .create_rule("r-1", "return 'SEEN'", "", "t")
            .unwrap();

        feed_event(&engine, "e-1", 100, json!({"x": 1}));
        feed_event(&engine, "e-2", 200, json!({"x": 2}));
        feed_event(&engine, "e-3", 300, json!({"x": 3}));

        let request = BacktestRequest {
            rid: "r-1".to_string(),
            candidate_logic: "return 'SEEN'".to_string(),
            start_ts: 150,
            end_ts: 250,
        };
        let task = runner.submit(&request).unwrap();
        runner.run(&task.id, &request);

        let done = runner.status(&task.id).unwrap().unwrap();
        assert_eq!(done.stored_counts.unwrap().get("SEEN"), Some(&1));
    }

    #[test]
    fn per_event_failures_drop_the_event_not_the_run() {
        let (engine, runner) = setup();
        engine
            .create_rule("r-1", "if $flag == True:\n    return 'A'", "", "t")
            .unwrap();

        // Second event lacks the field the candidate needs; it should be
        // dropped from the candidate tally only.
        feed_event(&engine, "e-1", 100, json!({"flag": true, "amount": 10}));
        feed_event(&engine, "e-2", 110, json!({"flag": true}));

        let request = BacktestRequest {
            rid: "r-1".to_string(),
            candidate_logic: "if $amount > 5:\n    return 'B'".to_string(),
            start_ts: 0,
            end_ts: 1_000,
        };
        let task = runner.submit(&request).unwrap();
        runner.run(&task.id, &request);

        let done = runner.status(&task.id).unwrap().unwrap();
        assert_eq!(done.state, BacktestState::Succeeded);
        assert_eq!(done.stored_counts.unwrap().get("A"), Some(&2));
        assert_eq!(done.candidate_counts.unwrap().get("B"), Some(&1));
    }

    #[test]
    fn status_polling_is_idempotent() {
        let (engine, runner) = setup();
        engine.create_rule("r-1", "return 'A'", "", "t").unwrap();
        let request = BacktestRequest {
            rid: "r-1".to_string(),
            candidate_logic: "return 'B'".to_string(),
            start_ts: 0,
            end_ts: 10,
        };
        let task = runner.submit(&request).unwrap();
        runner.run(&task.id, &request);

        let first = runner.status(&task.id).unwrap().unwrap();
        let second = runner.status(&task.id).unwrap().unwrap();
        assert_eq!(first.state, second.state);
        assert_eq!(first.stored_counts, second.stored_counts);
    }
}
