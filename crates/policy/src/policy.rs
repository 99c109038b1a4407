//! Issuance policy configuration and enforcement.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ConstraintSet, Error, Operation, ResourcePattern, ResourceType, Result};

/// Policy configuration loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    /// What may be issued, per resource type. A type without a rule is denied.
    #[serde(default)]
    pub rules: BTreeMap<ResourceType, ResourceRule>,

    /// Resource types that are explicitly denied (overrides rules).
    #[serde(default)]
    pub deny: DenyRules,
}

/// Issuance limits for one resource type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceRule {
    /// Patterns a requested path pattern must fall under.
    #[serde(default)]
    pub paths: Vec<ResourcePattern>,

    /// Operations that may be granted.
    #[serde(default)]
    pub operations: BTreeSet<Operation>,
}

/// Rules for denied capabilities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DenyRules {
    /// Deny all capabilities of these types.
    #[serde(default)]
    pub all: HashSet<ResourceType>,
}

/// Why a capability request was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyViolation {
    #[error("{0} capabilities are denied by policy")]
    ResourceTypeDenied(ResourceType),

    #[error("no policy rule allows {0} capabilities")]
    ResourceTypeNotAllowed(ResourceType),

    #[error("path '{0}' is not allowed by policy")]
    PathNotAllowed(ResourcePattern),

    #[error("operation '{0}' is not allowed by policy")]
    OperationNotAllowed(Operation),
}

impl PolicyViolation {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::ResourceTypeDenied(_) => "resource_type_denied",
            Self::ResourceTypeNotAllowed(_) => "resource_type_not_allowed",
            Self::PathNotAllowed(_) => "path_not_allowed",
            Self::OperationNotAllowed(_) => "operation_not_allowed",
        }
    }
}

/// Result of a policy check.
#[derive(Debug, Clone)]
pub enum Decision {
    Allow,
    Deny(PolicyViolation),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

impl Policy {
    /// Load policy from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse policy from TOML string.
    pub fn parse(toml: &str) -> Result<Self> {
        let policy: Self = toml::from_str(toml).map_err(|e| Error::Parse(e.to_string()))?;
        policy.validate()?;
        Ok(policy)
    }

    /// Create a default restrictive policy: workspace file access only.
    pub fn restrictive() -> Self {
        let mut rules = BTreeMap::new();
        rules.insert(
            ResourceType::Filesystem,
            ResourceRule {
                paths: vec![ResourcePattern::new("./**")],
                operations: ["read", "write", "list"].into_iter().map(Operation::from).collect(),
            },
        );

        let mut deny_all = HashSet::new();
        deny_all.insert(ResourceType::Process);
        deny_all.insert(ResourceType::Network);

        Self {
            rules,
            deny: DenyRules { all: deny_all },
        }
    }

    /// Reject rules that can never grant anything.
    pub fn validate(&self) -> Result<()> {
        for (resource_type, rule) in &self.rules {
            if rule.operations.is_empty() {
                return Err(Error::Invalid(format!(
                    "rule for {resource_type} lists no operations"
                )));
            }
        }
        Ok(())
    }

    /// Check whether capabilities with `constraints` may be issued.
    pub fn check(&self, resource_type: ResourceType, constraints: &ConstraintSet) -> Decision {
        // Check explicit denials first
        if self.deny.all.contains(&resource_type) {
            return Decision::Deny(PolicyViolation::ResourceTypeDenied(resource_type));
        }

        let Some(rule) = self.rules.get(&resource_type) else {
            return Decision::Deny(PolicyViolation::ResourceTypeNotAllowed(resource_type));
        };

        if let Some(paths) = &constraints.paths {
            if let Some(path) = paths.iter().find(|p| !rule.allows_path(p)) {
                return Decision::Deny(PolicyViolation::PathNotAllowed(path.clone()));
            }
        }

        if let Some(operations) = &constraints.operations {
            if let Some(op) = operations.iter().find(|op| !rule.operations.contains(*op)) {
                return Decision::Deny(PolicyViolation::OperationNotAllowed(op.clone()));
            }
        }

        Decision::Allow
    }

    /// Fill unset paths and operations from the rule for `resource_type`.
    pub fn apply_defaults(
        &self,
        resource_type: ResourceType,
        mut constraints: ConstraintSet,
    ) -> ConstraintSet {
        if let Some(rule) = self.rules.get(&resource_type) {
            if constraints.paths.is_none() && !rule.paths.is_empty() {
                constraints.paths = Some(rule.paths.clone());
            }
            if constraints.operations.is_none() {
                constraints.operations = Some(rule.operations.clone());
            }
        }
        constraints
    }
}

impl ResourceRule {
    /// A rule without paths places no restriction on paths.
    fn allows_path(&self, requested: &ResourcePattern) -> bool {
        self.paths.is_empty() || self.paths.iter().any(|allowed| allowed.covers(requested))
    }
}
