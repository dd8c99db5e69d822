//! Evaluation orchestrator: fan-out of one event across the active rule
//! set, aggregation of per-rule outcomes, and the best-effort shadow pass.
//!
//! Rule sets are held as immutable snapshots behind `ArcSwap`, so an
//! evaluator never observes a half-updated config: it reads one snapshot
//! pointer and works off that version for the whole event. Snapshots are
//! rebuilt (and rules recompiled) only when configuration changes, which
//! keeps compilation off the per-event path.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::RuleDefinition;
use crate::rules::{self, CompileError, CompiledRule, ListResolver, RuntimeError};
use crate::storage::Database;
use crate::typing::{self, CastError};

/// One production or shadow rule, compiled at a pinned revision.
#[derive(Debug)]
pub struct LoadedRule {
    pub id: i64,
    pub rid: String,
    pub revision: i64,
    pub compiled: CompiledRule,
}

/// Immutable view of one active-config version.
#[derive(Debug, Default)]
pub struct ActiveSnapshot {
    pub version: i64,
    pub rules: Vec<Arc<LoadedRule>>,
}

/// Immutable view of the current shadow deployments (possibly empty).
#[derive(Debug, Default)]
pub struct ShadowSnapshot {
    pub rules: Vec<Arc<LoadedRule>>,
}

#[derive(Debug, Deserialize)]
pub struct EvalRequest {
    pub event_id: String,
    pub event_timestamp: i64,
    pub event_data: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct EvalResponse {
    /// rid -> outcome, one entry per rule that produced an outcome.
    pub rule_results: HashMap<String, String>,
    /// outcome -> number of rules that produced it.
    pub outcome_counters: HashMap<String, u64>,
    /// Distinct outcomes, sorted for deterministic responses.
    pub outcome_set: Vec<String>,
}

/// Production-path evaluation failure. Shadow failures never surface here.
#[derive(Debug)]
pub enum EvalError {
    Cast(CastError),
    /// Every rule in a non-empty active set hit a runtime error.
    AllRulesFailed { failed: usize, last: RuntimeError },
    Storage(anyhow::Error),
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::Cast(err) => write!(f, "{err}"),
            EvalError::AllRulesFailed { failed, last } => {
                write!(f, "all {failed} active rules failed; last error: {last}")
            }
            EvalError::Storage(err) => write!(f, "storage failure: {err}"),
        }
    }
}

/// Rejection of a rule save at authoring time.
#[derive(Debug)]
pub enum SaveError {
    Compile(CompileError),
    OutcomeNotAllowed(String),
    Storage(anyhow::Error),
}

impl fmt::Display for SaveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaveError::Compile(err) => write!(f, "invalid rule logic: {err}"),
            SaveError::OutcomeNotAllowed(outcome) => {
                write!(f, "outcome '{outcome}' is not in the allowed outcome set")
            }
            SaveError::Storage(err) => write!(f, "storage failure: {err}"),
        }
    }
}

/// Authoring-time single-shot test result.
#[derive(Debug, Serialize)]
pub struct TestRunResult {
    pub rule_outcome: Option<String>,
    pub status: &'static str,
    pub reason: Option<String>,
}

struct MapLists(HashMap<String, Vec<String>>);

impl ListResolver for MapLists {
    fn members(&self, name: &str) -> Option<Vec<String>> {
        self.0.get(name).cloned()
    }
}

pub struct Engine {
    pub db: Arc<Database>,
    active: ArcSwap<ActiveSnapshot>,
    shadow: ArcSwap<ShadowSnapshot>,
}

impl Engine {
    pub fn new(db: Arc<Database>) -> anyhow::Result<Self> {
        let engine = Self {
            db,
            active: ArcSwap::from_pointee(ActiveSnapshot::default()),
            shadow: ArcSwap::from_pointee(ShadowSnapshot::default()),
        };
        engine.reload_active()?;
        engine.reload_shadow()?;
        Ok(engine)
    }

    /// Rebuild the production snapshot from storage and swap it in.
    ///
    /// A stored rule that no longer compiles is skipped with a warning
    /// rather than poisoning the whole set; the save path validates, so
    /// this only happens if the grammar tightened after a rule was saved.
    pub fn reload_active(&self) -> anyhow::Result<()> {
        let (version, rule_ids) = self.db.get_active_config()?;
        let definitions = self.db.get_rules_by_ids(&rule_ids)?;
        let mut rules = Vec::with_capacity(definitions.len());
        for def in definitions {
            match compile_loaded(&def, None) {
                Ok(loaded) => rules.push(Arc::new(loaded)),
                Err(err) => warn!("skipping active rule '{}': {}", def.rid, err),
            }
        }
        debug!("active snapshot v{} with {} rules", version, rules.len());
        self.active.store(Arc::new(ActiveSnapshot { version, rules }));
        Ok(())
    }

    /// Rebuild the shadow snapshot. Draft logic overrides stored logic;
    /// a draft that fails to compile drops that rule from the shadow set.
    pub fn reload_shadow(&self) -> anyhow::Result<()> {
        let entries = self.db.get_shadow_entries()?;
        let mut rules = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(def) = self.db.get_rule(&entry.rid)? else {
                warn!("shadow entry for unknown rule '{}'", entry.rid);
                continue;
            };
            match compile_loaded(&def, entry.draft_logic.as_deref()) {
                Ok(loaded) => rules.push(Arc::new(loaded)),
                Err(err) => warn!("skipping shadow rule '{}': {}", def.rid, err),
            }
        }
        self.shadow.store(Arc::new(ShadowSnapshot { rules }));
        Ok(())
    }

    pub fn active_snapshot(&self) -> Arc<ActiveSnapshot> {
        self.active.load_full()
    }

    pub fn shadow_snapshot(&self) -> Arc<ShadowSnapshot> {
        self.shadow.load_full()
    }

    /// Evaluate one event against the full active rule set, then drive the
    /// shadow set best-effort. See the module docs for the isolation rules.
    pub fn evaluate(&self, request: &EvalRequest) -> Result<EvalResponse, EvalError> {
        let field_types = self.db.get_field_types().map_err(EvalError::Storage)?;

        // Advisory telemetry; never blocks or fails the evaluation.
        for (field, raw) in &request.event_data {
            if let Err(err) = self.db.record_observation(field, typing::runtime_type(raw)) {
                debug!("observation write failed for '{}': {}", field, err);
            }
        }

        // Cast the whole payload up front: one bad field rejects the event
        // before any rule runs, so there are never partial results.
        let mut event = rules::interp::TypedEvent::new();
        for (field, raw) in &request.event_data {
            let value =
                typing::cast(field, raw, field_types.get(field)).map_err(EvalError::Cast)?;
            event.insert(field.clone(), value);
        }

        let lists = MapLists(self.db.get_named_lists().map_err(EvalError::Storage)?);
        let allowed = self.db.get_allowed_outcomes().map_err(EvalError::Storage)?;

        let snapshot = self.active.load_full();
        let mut rule_results: HashMap<String, String> = HashMap::new();
        let mut outcome_counters: HashMap<String, u64> = HashMap::new();
        let mut rows: Vec<(i64, i64, String)> = Vec::new();
        let mut failures = 0usize;
        let mut last_failure: Option<RuntimeError> = None;

        for rule in &snapshot.rules {
            match rules::execute(&rule.compiled, &event, &lists) {
                Ok(Some(outcome)) => {
                    // Defense in depth: the save path already rejects
                    // literal outcomes outside the allow-list.
                    if !allowed.is_empty() && !allowed.contains(&outcome) {
                        warn!(
                            "rule '{}' produced disallowed outcome '{}'",
                            rule.rid, outcome
                        );
                        continue;
                    }
                    *outcome_counters.entry(outcome.clone()).or_insert(0) += 1;
                    rows.push((rule.id, rule.revision, outcome.clone()));
                    rule_results.insert(rule.rid.clone(), outcome);
                }
                Ok(None) => {}
                Err(err) => {
                    // Contained per rule: siblings still run.
                    warn!("rule '{}' failed on event '{}': {}", rule.rid, request.event_id, err);
                    failures += 1;
                    last_failure = Some(err);
                }
            }
        }

        // A single failing rule is contained, but an event no rule could
        // process is a top-level failure. Nothing is persisted for it.
        if let Some(last) = last_failure {
            if failures == snapshot.rules.len() {
                return Err(EvalError::AllRulesFailed { failed: failures, last });
            }
        }

        let payload = serde_json::Value::Object(request.event_data.clone()).to_string();
        self.db
            .insert_event(&request.event_id, request.event_timestamp, &payload)
            .map_err(EvalError::Storage)?;
        self.db
            .insert_eval_results(&request.event_id, &rows)
            .map_err(EvalError::Storage)?;

        self.run_shadow_pass(&request.event_id, &event, &lists);

        let mut outcome_set: Vec<String> = outcome_counters.keys().cloned().collect();
        outcome_set.sort();

        Ok(EvalResponse {
            rule_results,
            outcome_counters,
            outcome_set,
        })
    }

    /// Shadow pass: same event, same interpreter, different failure policy.
    /// Every error — execution or persistence — is swallowed; a failing
    /// shadow rule just has no row for this event (coverage is a lower
    /// bound by design).
    fn run_shadow_pass(&self, event_id: &str, event: &rules::interp::TypedEvent, lists: &MapLists) {
        let snapshot = self.shadow.load_full();
        if snapshot.rules.is_empty() {
            return;
        }

        let mut rows: Vec<(i64, i64, String)> = Vec::new();
        for rule in &snapshot.rules {
            match rules::execute(&rule.compiled, event, lists) {
                Ok(Some(outcome)) => rows.push((rule.id, rule.revision, outcome)),
                Ok(None) => {}
                Err(err) => {
                    debug!("shadow rule '{}' dropped event '{}': {}", rule.rid, event_id, err);
                }
            }
        }

        if let Err(err) = self.db.insert_shadow_results(event_id, &rows) {
            warn!("shadow result write failed for event '{}': {}", event_id, err);
        }
    }

    // ===== Authoring path =====

    /// Create a rule: compile-validate, check literal outcomes against the
    /// allow-list, persist (which appends it to a new active config
    /// version), and refresh the snapshot.
    pub fn create_rule(
        &self,
        rid: &str,
        logic: &str,
        description: &str,
        changed_by: &str,
    ) -> Result<RuleDefinition, SaveError> {
        self.validate_logic(logic)?;
        let rule = self
            .db
            .create_rule(rid, logic, description, changed_by)
            .map_err(SaveError::Storage)?;
        self.reload_active().map_err(SaveError::Storage)?;
        Ok(rule)
    }

    pub fn update_rule(
        &self,
        rid: &str,
        logic: &str,
        description: &str,
        changed_by: &str,
    ) -> Result<RuleDefinition, SaveError> {
        self.validate_logic(logic)?;
        let rule = self
            .db
            .update_rule(rid, logic, description, changed_by)
            .map_err(SaveError::Storage)?;
        self.reload_active().map_err(SaveError::Storage)?;
        self.reload_shadow().map_err(SaveError::Storage)?;
        Ok(rule)
    }

    pub(crate) fn validate_logic(&self, logic: &str) -> Result<CompiledRule, SaveError> {
        let compiled = rules::compile(logic).map_err(SaveError::Compile)?;
        let allowed = self.db.get_allowed_outcomes().map_err(SaveError::Storage)?;
        if !allowed.is_empty() {
            for outcome in rules::parser::literal_outcomes(&compiled) {
                if !allowed.contains(&outcome) {
                    return Err(SaveError::OutcomeNotAllowed(outcome));
                }
            }
        }
        Ok(compiled)
    }

    /// Static analysis only: compile and report the referenced fields.
    pub fn verify_rule(&self, logic: &str) -> Result<Vec<String>, CompileError> {
        let compiled = rules::compile(logic)?;
        Ok(compiled.referenced_fields().to_vec())
    }

    /// Compile and execute once against a caller-supplied payload, going
    /// through the same cast layer as production.
    pub fn test_rule(
        &self,
        logic: &str,
        test_data: &serde_json::Map<String, serde_json::Value>,
    ) -> anyhow::Result<TestRunResult> {
        let compiled = match rules::compile(logic) {
            Ok(compiled) => compiled,
            Err(err) => {
                return Ok(TestRunResult {
                    rule_outcome: None,
                    status: "compile_error",
                    reason: Some(err.to_string()),
                })
            }
        };

        let field_types = self.db.get_field_types()?;
        let mut event = rules::interp::TypedEvent::new();
        for (field, raw) in test_data {
            match typing::cast(field, raw, field_types.get(field)) {
                Ok(value) => {
                    event.insert(field.clone(), value);
                }
                Err(err) => {
                    return Ok(TestRunResult {
                        rule_outcome: None,
                        status: "cast_error",
                        reason: Some(err.to_string()),
                    })
                }
            }
        }

        let lists = MapLists(self.db.get_named_lists()?);
        match rules::execute(&compiled, &event, &lists) {
            Ok(outcome) => Ok(TestRunResult {
                rule_outcome: outcome,
                status: "ok",
                reason: None,
            }),
            Err(err) => Ok(TestRunResult {
                rule_outcome: None,
                status: "runtime_error",
                reason: Some(err.to_string()),
            }),
        }
    }
}

fn compile_loaded(
    def: &RuleDefinition,
    draft_logic: Option<&str>,
) -> Result<LoadedRule, CompileError> {
    let logic = draft_logic.unwrap_or(&def.logic);
    let compiled = rules::compile(logic)?;
    Ok(LoadedRule {
        id: def.id,
        rid: def.rid.clone(),
        revision: def.revision,
        compiled,
    })
}
