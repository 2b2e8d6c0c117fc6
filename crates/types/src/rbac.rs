//! Role-based access control primitives.
//!
//! The core does not authenticate end users. A front door injects the
//! caller's roles in a trusted header (default `x-sentinel-roles`,
//! comma-separated); this module only parses and checks them.

use std::collections::BTreeSet;
use std::fmt;

/// Header carrying the caller's comma-separated roles.
pub const ROLES_HEADER: &str = "x-sentinel-roles";

/// Known roles. Unknown role strings are preserved verbatim so new roles
/// can be introduced without redeploying every service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    /// Policy CRUD and state transitions.
    PolicyAdmin,
    /// Submit and apply upgrade manifests.
    UpgradeAdmin,
    /// Approve upgrade manifests.
    Approver,
    /// Append audit events (internal services).
    AuditWriter,
    /// Read the audit chain.
    Auditor,
    /// Submit promotions.
    Promoter,
    /// Call the synchronous check endpoint.
    Checker,
    Other(String),
}

impl Role {
    pub fn parse(s: &str) -> Role {
        match s {
            "policy-admin" => Role::PolicyAdmin,
            "upgrade-admin" => Role::UpgradeAdmin,
            "approver" => Role::Approver,
            "audit-writer" => Role::AuditWriter,
            "auditor" => Role::Auditor,
            "promoter" => Role::Promoter,
            "checker" => Role::Checker,
            other => Role::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::PolicyAdmin => "policy-admin",
            Role::UpgradeAdmin => "upgrade-admin",
            Role::Approver => "approver",
            Role::AuditWriter => "audit-writer",
            Role::Auditor => "auditor",
            Role::Promoter => "promoter",
            Role::Checker => "checker",
            Role::Other(s) => s,
        };
        f.write_str(s)
    }
}

/// The set of roles attached to one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleSet(BTreeSet<Role>);

impl RoleSet {
    /// Parses the trusted header value. Empty segments are ignored.
    pub fn from_header(value: &str) -> Self {
        let roles = value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Role::parse)
            .collect();
        Self(roles)
    }

    pub fn contains(&self, role: &Role) -> bool {
        self.0.contains(role)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_separated_header() {
        let set = RoleSet::from_header("policy-admin, approver,, custom-role");
        assert!(set.contains(&Role::PolicyAdmin));
        assert!(set.contains(&Role::Approver));
        assert!(set.contains(&Role::Other("custom-role".into())));
        assert!(!set.contains(&Role::Auditor));
    }

    #[test]
    fn empty_header_yields_empty_set() {
        assert!(RoleSet::from_header("").is_empty());
        assert!(RoleSet::from_header(" , ").is_empty());
    }
}
