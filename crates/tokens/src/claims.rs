use chrono::{DateTime, Utc};
use policy::{ConstraintSet, Denial, Operation, ResourcePattern, ResourceType};
use serde::{Deserialize, Serialize};

/// JWT claims of a capability token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    /// Principal holding the token.
    pub sub: String,
    pub aud: ResourceType,
    pub exp: i64,
    pub iat: i64,
    /// Token id. Tokens exported from a capability record reuse its id.
    pub jti: String,
    pub resource: ResourcePattern,
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub constraints: ConstraintSet,
    pub delegation: DelegationClaim,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationClaim {
    pub depth: u32,
    pub max_depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Ancestor token ids, root first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lineage: Vec<String>,
}

impl DelegationClaim {
    pub fn root(max_depth: u32) -> Self {
        Self {
            depth: 0,
            max_depth,
            parent_id: None,
            lineage: Vec::new(),
        }
    }
}

impl Claims {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }

    /// Expired once `exp` is in the past, matching JWT validation.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.exp < now.timestamp()
    }

    /// This token's id followed by every ancestor's. Revoking any of them
    /// revokes this token.
    pub fn lineage_ids(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.jti.as_str()).chain(self.delegation.lineage.iter().map(String::as_str))
    }

    pub fn descends_from(&self, id: &str) -> bool {
        self.lineage_ids().any(|ancestor| ancestor == id)
    }

    /// Check an operation on a concrete resource against the granted
    /// operations, the resource pattern and the stateless constraints.
    pub fn check_permission(
        &self,
        operation: &Operation,
        resource: &str,
        now: DateTime<Utc>,
    ) -> Result<(), Denial> {
        if !self.operations.contains(operation) {
            return Err(Denial::OperationNotPermitted(operation.clone()));
        }
        if !self.resource.matches(resource) {
            return Err(Denial::ResourceNotPermitted(resource.to_string()));
        }
        self.constraints.permits(operation, resource, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims() -> Claims {
        Claims {
            iss: "keel".into(),
            sub: "alice".into(),
            aud: ResourceType::Filesystem,
            exp: Utc::now().timestamp() + 60,
            iat: Utc::now().timestamp(),
            jti: "tok_c".into(),
            resource: ResourcePattern::new("/tmp/**"),
            operations: vec![Operation::read()],
            constraints: ConstraintSet::new().with_extensions(["txt"]),
            delegation: DelegationClaim {
                depth: 2,
                max_depth: 3,
                parent_id: Some("tok_b".into()),
                lineage: vec!["tok_a".into(), "tok_b".into()],
            },
        }
    }

    #[test]
    fn permission_checks_operation_then_resource_then_constraints() {
        let c = claims();
        let now = Utc::now();
        assert!(c.check_permission(&Operation::read(), "/tmp/a/b.txt", now).is_ok());
        assert_eq!(
            c.check_permission(&Operation::write(), "/tmp/a/b.txt", now)
                .unwrap_err()
                .reason(),
            "operation_not_permitted"
        );
        assert_eq!(
            c.check_permission(&Operation::read(), "/etc/passwd", now)
                .unwrap_err()
                .reason(),
            "resource_not_permitted"
        );
        assert_eq!(
            c.check_permission(&Operation::read(), "/tmp/a/b.sh", now)
                .unwrap_err()
                .reason(),
            "extension_not_allowed"
        );
    }

    #[test]
    fn lineage_includes_self_and_ancestors() {
        let c = claims();
        assert_eq!(c.lineage_ids().collect::<Vec<_>>(), ["tok_c", "tok_a", "tok_b"]);
        assert!(c.descends_from("tok_a"));
        assert!(!c.descends_from("tok_z"));
    }

    #[test]
    fn root_delegation_omits_empty_fields() {
        let json = serde_json::to_value(DelegationClaim::root(3)).unwrap();
        assert_eq!(json, serde_json::json!({ "depth": 0, "max_depth": 3 }));
    }
}
