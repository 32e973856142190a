//! Action safety policy.
//!
//! The guard evaluates an ordered list of independent rules against a
//! remediation request. The first rule that is not satisfied short-circuits
//! with `allowed = false` and that rule's reason; when every rule passes,
//! the risk tier is computed independently of the rules. Rules can be
//! appended at runtime.
//!
//! Policy denials are terminal: a rejected action never retries and the
//! remote control plane is never called for it.

use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};

use crate::action::{ActionRequest, ActionRisk, ActionType};
use crate::config::GuardConfig;
use crate::error::{Error, Result};

/// Outcome of a guard evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardVerdict {
    /// Whether the action may proceed.
    pub allowed: bool,
    /// Risk tier: the failing rule's tier on denial, the computed tier on
    /// success.
    pub risk: ActionRisk,
    /// Human-readable denial reason.
    pub reason: Option<String>,
}

impl GuardVerdict {
    fn allowed(risk: ActionRisk) -> Self {
        Self {
            allowed: true,
            risk,
            reason: None,
        }
    }

    fn denied(risk: ActionRisk, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            risk,
            reason: Some(reason.into()),
        }
    }
}

type GuardCheck = Box<dyn Fn(&ActionRequest, DateTime<Utc>) -> bool + Send + Sync>;

/// A single policy rule.
pub struct GuardRule {
    /// Rule name, for logs.
    pub name: String,
    /// Risk tier reported when this rule denies.
    pub risk: ActionRisk,
    /// Denial reason shown to the requester.
    pub error_message: String,
    check: GuardCheck,
}

impl GuardRule {
    /// Creates a rule from a predicate. The predicate returns true when the
    /// rule is satisfied.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        risk: ActionRisk,
        error_message: impl Into<String>,
        check: impl Fn(&ActionRequest, DateTime<Utc>) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            risk,
            error_message: error_message.into(),
            check: Box::new(check),
        }
    }

    /// Returns true if the rule is satisfied for the action at `now`.
    #[must_use]
    pub fn is_satisfied(&self, action: &ActionRequest, now: DateTime<Utc>) -> bool {
        (self.check)(action, now)
    }
}

impl std::fmt::Debug for GuardRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardRule")
            .field("name", &self.name)
            .field("risk", &self.risk)
            .finish_non_exhaustive()
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("guard rule lock poisoned")
}

/// The action safety policy engine. Stateless between calls; the clock is
/// injected so policies are testable.
#[derive(Debug)]
pub struct ActionGuard {
    rules: RwLock<Vec<GuardRule>>,
}

impl ActionGuard {
    /// Creates a guard with the default rules for `config`.
    #[must_use]
    pub fn new(config: &GuardConfig) -> Self {
        Self {
            rules: RwLock::new(Self::default_rules(config)),
        }
    }

    /// Creates a guard with a custom rule list.
    #[must_use]
    pub fn with_rules(rules: Vec<GuardRule>) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    /// The built-in rule set, capturing the relevant `config` values.
    #[must_use]
    pub fn default_rules(config: &GuardConfig) -> Vec<GuardRule> {
        let allowed_jobs = config.allowed_jobs.clone();
        let business_hours_only = config.business_hours_only;
        let hours = (config.business_hours_start, config.business_hours_end);
        let non_production_prefixes = config.non_production_prefixes.clone();
        let rollback_max_age = config.rollback_max_age;

        vec![
            GuardRule::new(
                "job_allow_list",
                ActionRisk::Forbidden,
                "job is not in the allow-list",
                move |action, _now| {
                    // An empty allow-list is permissive: lower environments
                    // run without one.
                    allowed_jobs.is_empty() || allowed_jobs.contains(&action.target_job)
                },
            ),
            GuardRule::new(
                "business_hours",
                ActionRisk::Moderate,
                "action only permitted on weekdays within business hours",
                move |_action, now| {
                    if !business_hours_only {
                        return true;
                    }
                    if matches!(now.weekday(), Weekday::Sat | Weekday::Sun) {
                        return false;
                    }
                    let hour = now.hour();
                    hour >= hours.0 && hour < hours.1
                },
            ),
            GuardRule::new(
                "stop_requires_non_production",
                ActionRisk::Dangerous,
                "stop is only permitted against non-production jobs",
                move |action, _now| {
                    action.action_type != ActionType::Stop
                        || non_production_prefixes
                            .iter()
                            .any(|prefix| action.target_job.starts_with(prefix.as_str()))
                },
            ),
            GuardRule::new(
                "rollback_recency",
                ActionRisk::Dangerous,
                "rollback is only permitted to recent builds",
                move |action, now| {
                    if action.action_type != ActionType::Rollback {
                        return true;
                    }
                    // The bound only applies when the request carries the
                    // target build's timestamp; without it we stay permissive.
                    match action.params.target_build_at {
                        Some(built_at) => now.signed_duration_since(built_at) <= rollback_max_age,
                        None => true,
                    }
                },
            ),
        ]
    }

    /// Validates an action against the rule list.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the rule lock is poisoned.
    pub fn validate(&self, action: &ActionRequest, now: DateTime<Utc>) -> Result<GuardVerdict> {
        let rules = self.rules.read().map_err(poison_err)?;

        for rule in rules.iter() {
            if !rule.is_satisfied(action, now) {
                tracing::warn!(
                    action_id = %action.id,
                    rule = %rule.name,
                    "guard denied action"
                );
                return Ok(GuardVerdict::denied(rule.risk, rule.error_message.clone()));
            }
        }

        let risk = Self::compute_risk(action);
        tracing::debug!(action_id = %action.id, risk = risk.as_str(), "guard allowed action");
        Ok(GuardVerdict::allowed(risk))
    }

    /// Computes the risk tier of an allowed action.
    #[must_use]
    pub fn compute_risk(action: &ActionRequest) -> ActionRisk {
        match action.action_type {
            ActionType::Stop => ActionRisk::Dangerous,
            ActionType::Rollback => ActionRisk::Moderate,
            ActionType::Restart => {
                if action.target_job.contains("prod") {
                    ActionRisk::Moderate
                } else {
                    ActionRisk::Safe
                }
            }
        }
    }

    /// Appends a rule at runtime. Appended rules evaluate after the
    /// existing ones.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the rule lock is poisoned.
    pub fn add_rule(&self, rule: GuardRule) -> Result<()> {
        let mut rules = self.rules.write().map_err(poison_err)?;
        tracing::info!(rule = %rule.name, "guard rule added");
        rules.push(rule);
        Ok(())
    }
}
