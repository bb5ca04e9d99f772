//! Process-wide rule registry.
//!
//! Maps rule id to its [`RuleController`] and owns the shared planner,
//! cron dispatcher, and trigger-update collaborators handed to every
//! controller it creates. Restart-on-crash patrols live outside; the
//! registry only exposes the lifecycle surface they need.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::info;

use edgeflow_rules::validation::validate_rule;
use edgeflow_rules::Rule;

use crate::cron::CronDispatcher;
use crate::error::RuleError;
use crate::state::RuleController;
use crate::topology::{Planner, TriggerUpdater};

pub struct RuleRegistry {
    controllers: RwLock<HashMap<String, Arc<RuleController>>>,
    planner: Arc<dyn Planner>,
    cron: Arc<dyn CronDispatcher>,
    trigger_updater: Arc<dyn TriggerUpdater>,
}

impl RuleRegistry {
    pub fn new(
        planner: Arc<dyn Planner>,
        cron: Arc<dyn CronDispatcher>,
        trigger_updater: Arc<dyn TriggerUpdater>,
    ) -> Self {
        Self {
            controllers: RwLock::new(HashMap::new()),
            planner,
            cron,
            trigger_updater,
        }
    }

    fn controller_for(&self, rule: Rule) -> Arc<RuleController> {
        RuleController::new(
            rule,
            Arc::clone(&self.planner),
            Arc::clone(&self.cron),
            Arc::clone(&self.trigger_updater),
        )
    }

    /// Register a new rule: validate, plan, and run it when triggered
    /// (or arm it when scheduled). Fails without registering when the id
    /// is taken or the rule does not plan.
    pub async fn create(&self, rule: Rule) -> Result<(), RuleError> {
        validate_rule(&rule)?;
        let id = rule.id.clone();
        let mut map = self.controllers.write().await;
        if map.contains_key(&id) {
            return Err(RuleError::AlreadyExists(id));
        }
        let ctrl = self.controller_for(rule.clone());
        ctrl.validate_and_run(rule).await?;
        map.insert(id.clone(), ctrl);
        info!(rule_id = %id, "rule created");
        Ok(())
    }

    /// Replace an existing rule's definition atomically, or create it
    /// when absent.
    pub async fn upsert(&self, rule: Rule) -> Result<(), RuleError> {
        let existing = {
            let map = self.controllers.read().await;
            map.get(&rule.id).cloned()
        };
        match existing {
            Some(ctrl) => ctrl.validate_and_run(rule).await,
            None => self.create(rule).await,
        }
    }

    /// Drop a rule for good: stop it, tear down its topology and
    /// schedule, and forget the controller.
    pub async fn delete(&self, id: &str) -> Result<(), RuleError> {
        let ctrl = {
            let mut map = self.controllers.write().await;
            map.remove(id)
        };
        match ctrl {
            Some(ctrl) => {
                ctrl.delete().await;
                info!(rule_id = %id, "rule removed");
                Ok(())
            }
            None => Err(RuleError::NotFound(id.to_string())),
        }
    }

    pub async fn get(&self, id: &str) -> Option<Arc<RuleController>> {
        self.controllers.read().await.get(id).cloned()
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.controllers.read().await.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Status documents of every registered rule, ordered by id.
    pub async fn all_status(&self) -> IndexMap<String, IndexMap<String, Value>> {
        let controllers: Vec<Arc<RuleController>> = {
            let map = self.controllers.read().await;
            let mut list: Vec<_> = map.values().cloned().collect();
            list.sort_unstable_by(|a, b| a.id().cmp(b.id()));
            list
        };
        let mut out = IndexMap::new();
        for ctrl in controllers {
            out.insert(ctrl.id().to_string(), ctrl.status_map().await);
        }
        out
    }

    /// Stop every rule, e.g. on server shutdown. Controllers stay
    /// registered so a later start can revive them.
    pub async fn stop_all(&self, reason: &str) {
        let controllers: Vec<Arc<RuleController>> = {
            let map = self.controllers.read().await;
            map.values().cloned().collect()
        };
        for ctrl in controllers {
            ctrl.stop_with_last_will(reason).await;
        }
        info!("all rules stopped");
    }
}
