//! Shadow deployment lifecycle: deploy a candidate next to production,
//! let it accumulate results off the live traffic, then promote or discard.
//!
//! The candidate configuration is disjoint from production until the moment
//! of promotion, which commits draft logic, history snapshot, active-config
//! version, and shadow cleanup as one storage transaction. Accumulation
//! itself happens inside the engine's shadow pass; this module only owns
//! the transitions.

use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::engine::{Engine, SaveError};
use crate::models::{RuleDefinition, ShadowEntry};
use crate::storage::ShadowRuleStats;

#[derive(Debug)]
pub enum ShadowError {
    /// Draft logic failed validation (compile or outcome constraint).
    InvalidDraft(SaveError),
    UnknownRule(String),
    NotDeployed(String),
    Storage(anyhow::Error),
}

impl fmt::Display for ShadowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShadowError::InvalidDraft(err) => write!(f, "{err}"),
            ShadowError::UnknownRule(rid) => write!(f, "no rule with rid '{rid}'"),
            ShadowError::NotDeployed(rid) => {
                write!(f, "rule '{rid}' is not deployed to shadow")
            }
            ShadowError::Storage(err) => write!(f, "storage failure: {err}"),
        }
    }
}

pub struct ShadowManager {
    engine: Arc<Engine>,
}

impl ShadowManager {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Deploy (or redeploy) a rule to shadow, optionally with draft logic
    /// and description that stay off the RuleDefinition until promotion.
    /// Redeploying clears the rule's previously accumulated shadow results.
    pub fn deploy(
        &self,
        rid: &str,
        draft_logic: Option<&str>,
        draft_description: Option<&str>,
    ) -> Result<(), ShadowError> {
        self.require_rule(rid)?;
        if let Some(logic) = draft_logic {
            self.engine
                .validate_logic(logic)
                .map_err(ShadowError::InvalidDraft)?;
        }
        self.engine
            .db
            .deploy_shadow(rid, draft_logic, draft_description)
            .map_err(ShadowError::Storage)?;
        self.engine.reload_shadow().map_err(ShadowError::Storage)?;
        info!("rule '{}' deployed to shadow (draft logic: {})", rid, draft_logic.is_some());
        Ok(())
    }

    /// Discard the candidate. Production config and the rule itself are
    /// untouched.
    pub fn remove(&self, rid: &str) -> Result<(), ShadowError> {
        let removed = self
            .engine
            .db
            .remove_shadow(rid)
            .map_err(ShadowError::Storage)?;
        if !removed {
            return Err(ShadowError::NotDeployed(rid.to_string()));
        }
        self.engine.reload_shadow().map_err(ShadowError::Storage)?;
        info!("shadow deployment for '{}' discarded", rid);
        Ok(())
    }

    /// Promote the candidate into production atomically and refresh both
    /// snapshots.
    pub fn promote(&self, rid: &str, changed_by: &str) -> Result<RuleDefinition, ShadowError> {
        self.require_rule(rid)?;
        let deployed = self
            .entries()?
            .iter()
            .any(|entry| entry.rid == rid);
        if !deployed {
            return Err(ShadowError::NotDeployed(rid.to_string()));
        }

        let rule = self
            .engine
            .db
            .promote_shadow(rid, changed_by)
            .map_err(ShadowError::Storage)?;
        self.engine.reload_active().map_err(ShadowError::Storage)?;
        self.engine.reload_shadow().map_err(ShadowError::Storage)?;
        info!("rule '{}' promoted at revision {}", rid, rule.revision);
        Ok(rule)
    }

    pub fn entries(&self) -> Result<Vec<ShadowEntry>, ShadowError> {
        self.engine
            .db
            .get_shadow_entries()
            .map_err(ShadowError::Storage)
    }

    /// Shadow vs production outcome distributions per deployed rule.
    pub fn stats(&self) -> Result<Vec<ShadowRuleStats>, ShadowError> {
        self.engine.db.shadow_stats().map_err(ShadowError::Storage)
    }

    fn require_rule(&self, rid: &str) -> Result<(), ShadowError> {
        match self.engine.db.get_rule(rid) {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(ShadowError::UnknownRule(rid.to_string())),
            Err(err) => Err(ShadowError::Storage(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EvalRequest;
    use crate::storage::Database;
    use serde_json::json;

    fn setup() -> (Arc<Engine>, ShadowManager) {
        let db = Arc::new(Database::new(":memory:").expect("Failed to create database"));
        let engine = Arc::new(Engine::new(db).expect("Failed to build engine"));
        let manager = ShadowManager::new(engine.clone());
        (engine, manager)
    }

    fn request(event_id: &str, data: serde_json::Value) -> EvalRequest {
        EvalRequest {
            event_id: event_id.to_string(),
            event_timestamp: 1_700_000_000,
            event_data: data.as_object().cloned().expect("object payload"),
        }
    }

    #[test]
    fn deploy_requires_an_existing_rule() {
        let (_, manager) = setup();
        match manager.deploy("ghost", None, None) {
            Err(ShadowError::UnknownRule(rid)) => assert_eq!(rid, "ghost"),
            other => panic!("expected unknown rule, got {other:?}"),
        }
    }

    #[test]
    fn deploy_validates_draft_logic() {
        let (engine, manager) = setup();
        engine.create_rule("r-1", "return 'A'", "", "t").unwrap();
        match manager.deploy("r-1", Some("import os"), None) {
            Err(ShadowError::InvalidDraft(_)) => {}
            other => panic!("expected invalid draft, got {other:?}"),
        }
    }

    #[test]
    fn promote_moves_draft_into_production_atomically() {
        let (engine, manager) = setup();
        engine
            .create_rule("r-1", "if $amount > 100:\n    return 'HOLD'", "v1", "t")
            .unwrap();
        manager
            .deploy("r-1", Some("if $amount > 50:\n    return 'HOLD'"), Some("v2"))
            .unwrap();

        let promoted = manager.promote("r-1", "t").unwrap();
        assert_eq!(promoted.revision, 2);

        // Single read after promote: rule, config, and shadow all agree.
        let current = engine.db.get_rule("r-1").unwrap().unwrap();
        assert_eq!(current.logic, "if $amount > 50:\n    return 'HOLD'");
        assert_eq!(current.description, "v2");
        let (_, ids) = engine.db.get_active_config().unwrap();
        assert!(ids.contains(&current.id));
        assert!(manager.entries().unwrap().is_empty());

        // Promoted logic now drives production decisions.
        let response = engine
            .evaluate(&request("e-1", json!({"amount": 75})))
            .unwrap();
        assert_eq!(response.rule_results.get("r-1"), Some(&"HOLD".to_string()));
    }

    #[test]
    fn discard_leaves_production_untouched() {
        let (engine, manager) = setup();
        engine.create_rule("r-1", "return 'A'", "", "t").unwrap();
        manager.deploy("r-1", Some("return 'B'"), None).unwrap();
        manager.remove("r-1").unwrap();

        let rule = engine.db.get_rule("r-1").unwrap().unwrap();
        assert_eq!(rule.logic, "return 'A'");
        assert_eq!(rule.revision, 1);
        assert!(manager.entries().unwrap().is_empty());
    }

    #[test]
    fn redeploy_resets_accumulated_counts() {
        let (engine, manager) = setup();
        engine.create_rule("r-1", "return 'A'", "", "t").unwrap();
        manager.deploy("r-1", Some("return 'B'"), None).unwrap();

        engine.evaluate(&request("e-1", json!({"x": 1}))).unwrap();
        engine.evaluate(&request("e-2", json!({"x": 2}))).unwrap();
        assert_eq!(manager.stats().unwrap()[0].total, 2);

        manager.deploy("r-1", Some("return 'C'"), None).unwrap();
        assert_eq!(manager.stats().unwrap()[0].total, 0);

        engine.evaluate(&request("e-3", json!({"x": 3}))).unwrap();
        let stats = manager.stats().unwrap();
        assert_eq!(stats[0].total, 1);
        assert_eq!(stats[0].shadow_outcomes.get("C"), Some(&1));
        assert!(!stats[0].shadow_outcomes.contains_key("B"));
    }

    #[test]
    fn stats_compare_shadow_and_production_distributions() {
        let (engine, manager) = setup();
        engine
            .create_rule("r-1", "if $amount > 100:\n    return 'HOLD'", "", "t")
            .unwrap();
        manager
            .deploy("r-1", Some("if $amount > 50:\n    return 'HOLD'"), None)
            .unwrap();

        engine.evaluate(&request("e-1", json!({"amount": 75}))).unwrap();
        engine.evaluate(&request("e-2", json!({"amount": 200}))).unwrap();

        let stats = manager.stats().unwrap();
        assert_eq!(stats.len(), 1);
        // Candidate fires on both events, production only on the second.
        assert_eq!(stats[0].shadow_outcomes.get("HOLD"), Some(&2));
        assert_eq!(stats[0].prod_outcomes.get("HOLD"), Some(&1));
    }

    #[test]
    fn promote_without_deploy_is_rejected() {
        let (engine, manager) = setup();
        engine.create_rule("r-1", "return 'A'", "", "t").unwrap();
        match manager.promote("r-1", "t") {
            Err(ShadowError::NotDeployed(_)) => {}
            other => panic!("expected not deployed, got {other:?}"),
        }
    }
}
