//! Operation-safety policy — gates mutating adapter operations.
//!
//! Evaluation order: explicit restricted list, explicit allowed-dangerous
//! list, dangerous-prefix rules with per-prefix escape hatches, then
//! permit. Protected branch/team/repository names are checked against the
//! request parameters. A refusal never reaches the upstream.

use serde_json::Value;
use std::collections::{HashMap, HashSet};

use agentmesh_config::SafetyConfig;

/// Operation-name prefixes considered dangerous by default.
pub const DANGEROUS_PREFIXES: [&str; 6] = [
    "delete_",
    "remove_",
    "force_",
    "modify_access_",
    "set_admin_",
    "transfer_",
];

/// Result of checking an operation against the policy.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationCheck {
    /// Operation may proceed
    Allowed,
    /// Operation is refused
    Denied { operation: String, reason: String },
}

impl OperationCheck {
    pub fn is_allowed(&self) -> bool {
        matches!(self, OperationCheck::Allowed)
    }
}

/// The per-adapter safety policy.
pub struct OperationPolicy {
    restricted: HashSet<String>,
    allowed_dangerous: HashSet<String>,
    prefix_allowlist: HashMap<String, HashSet<String>>,
    protected_branches: HashSet<String>,
    protected_teams: HashSet<String>,
    protected_repos: HashSet<String>,
}

impl OperationPolicy {
    pub fn from_config(config: &SafetyConfig) -> Self {
        Self {
            restricted: config.restricted.iter().cloned().collect(),
            allowed_dangerous: config.allowed_dangerous.iter().cloned().collect(),
            prefix_allowlist: config
                .prefix_allowlist
                .iter()
                .map(|(prefix, ops)| (prefix.clone(), ops.iter().cloned().collect()))
                .collect(),
            protected_branches: config.protected_branches.iter().cloned().collect(),
            protected_teams: config.protected_teams.iter().cloned().collect(),
            protected_repos: config.protected_repos.iter().cloned().collect(),
        }
    }

    /// Check an operation name.
    ///
    /// Rules:
    /// - Explicit restricted list → refuse
    /// - Explicit allowed-dangerous list → permit
    /// - Dangerous prefix → refuse unless on that prefix's allowlist
    /// - Otherwise → permit
    pub fn check_operation(&self, operation: &str) -> OperationCheck {
        if self.restricted.contains(operation) {
            return OperationCheck::Denied {
                operation: operation.into(),
                reason: "operation is restricted".into(),
            };
        }

        if self.allowed_dangerous.contains(operation) {
            return OperationCheck::Allowed;
        }

        for prefix in DANGEROUS_PREFIXES {
            if operation.starts_with(prefix) {
                let allowlisted = self
                    .prefix_allowlist
                    .get(prefix)
                    .is_some_and(|ops| ops.contains(operation));
                if allowlisted {
                    return OperationCheck::Allowed;
                }
                return OperationCheck::Denied {
                    operation: operation.into(),
                    reason: format!("operation matches dangerous prefix '{prefix}'"),
                };
            }
        }

        OperationCheck::Allowed
    }

    /// Check request parameters against protected-name lists. Looks at the
    /// conventional keys mutating operations carry.
    pub fn check_params(&self, operation: &str, params: &Value) -> OperationCheck {
        let checks: [(&str, &HashSet<String>, &str); 4] = [
            ("branch", &self.protected_branches, "branch"),
            ("team", &self.protected_teams, "team"),
            ("repo", &self.protected_repos, "repository"),
            ("repository", &self.protected_repos, "repository"),
        ];

        for (key, protected, kind) in checks {
            if let Some(name) = params.get(key).and_then(Value::as_str)
                && protected.contains(name)
            {
                return OperationCheck::Denied {
                    operation: operation.into(),
                    reason: format!("{kind} '{name}' is protected"),
                };
            }
        }

        OperationCheck::Allowed
    }

    /// Full gate for a mutating operation: name rules, then target names.
    pub fn check(&self, operation: &str, params: &Value) -> OperationCheck {
        match self.check_operation(operation) {
            OperationCheck::Allowed => self.check_params(operation, params),
            denied => denied,
        }
    }
}

impl Default for OperationPolicy {
    fn default() -> Self {
        Self::from_config(&SafetyConfig::default())
    }
}
