//! Roles and the permissions they grant.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Operations a caller may be permitted to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    // Model access
    LlmQuery,
    LlmStream,

    // Provider access
    ProviderAnthropic,
    ProviderOpenAi,
    ProviderGoogle,
    ProviderLocal,
    ProviderOther,

    // Audit
    AuditRead,
    AuditExport,
    AuditErase,

    // Administration
    MetricsRead,
    ConfigManage,
    SessionManage,
}

impl Permission {
    pub const ALL: [Permission; 13] = [
        Permission::LlmQuery,
        Permission::LlmStream,
        Permission::ProviderAnthropic,
        Permission::ProviderOpenAi,
        Permission::ProviderGoogle,
        Permission::ProviderLocal,
        Permission::ProviderOther,
        Permission::AuditRead,
        Permission::AuditExport,
        Permission::AuditErase,
        Permission::MetricsRead,
        Permission::ConfigManage,
        Permission::SessionManage,
    ];

    fn bit(self) -> u32 {
        1 << (self as u32)
    }

    /// Permission required to call `provider`.
    ///
    /// Unrecognized provider names map to [`Permission::ProviderOther`].
    pub fn for_provider(provider: &str) -> Permission {
        match provider.trim().to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Permission::ProviderAnthropic,
            "openai" | "azure-openai" | "azure_openai" => Permission::ProviderOpenAi,
            "google" | "gemini" | "vertex" => Permission::ProviderGoogle,
            "local" | "ollama" | "llama.cpp" | "vllm" => Permission::ProviderLocal,
            _ => Permission::ProviderOther,
        }
    }
}

/// Compact set of permissions.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Permission>", into = "Vec<Permission>")]
pub struct PermissionSet(u32);

impl PermissionSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Permission::ALL.into_iter().collect()
    }

    pub fn insert(&mut self, permission: Permission) {
        self.0 |= permission.bit();
    }

    pub fn contains(&self, permission: Permission) -> bool {
        self.0 & permission.bit() != 0
    }

    pub fn union(self, other: PermissionSet) -> Self {
        Self(self.0 | other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Permission> {
        let set = *self;
        Permission::ALL.into_iter().filter(move |p| set.contains(*p))
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = Permission>>(iter: I) -> Self {
        let mut set = PermissionSet::empty();
        for permission in iter {
            set.insert(permission);
        }
        set
    }
}

impl From<Vec<Permission>> for PermissionSet {
    fn from(permissions: Vec<Permission>) -> Self {
        permissions.into_iter().collect()
    }
}

impl From<PermissionSet> for Vec<Permission> {
    fn from(set: PermissionSet) -> Self {
        set.iter().collect()
    }
}

impl fmt::Debug for PermissionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Caller roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// No permissions.
    Guest,
    /// May query, but holds no provider grant of its own.
    User,
    /// Query and stream through every provider.
    PowerUser,
    /// Read-only access to audit data and metrics.
    Auditor,
    /// Everything.
    Admin,
}

impl Role {
    pub fn permissions(self) -> PermissionSet {
        use Permission::*;
        match self {
            Role::Guest => PermissionSet::empty(),
            Role::User => [LlmQuery].into_iter().collect(),
            Role::PowerUser => [
                LlmQuery,
                LlmStream,
                ProviderAnthropic,
                ProviderOpenAi,
                ProviderGoogle,
                ProviderLocal,
                ProviderOther,
            ]
            .into_iter()
            .collect(),
            Role::Auditor => [AuditRead, AuditExport, MetricsRead].into_iter().collect(),
            Role::Admin => PermissionSet::all(),
        }
    }
}

/// Union of the permissions granted by `roles`.
pub fn permissions_for(roles: &[Role]) -> PermissionSet {
    roles
        .iter()
        .fold(PermissionSet::empty(), |acc, role| acc.union(role.permissions()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_hierarchy() {
        assert!(Role::Guest.permissions().is_empty());
        assert!(Role::User.permissions().contains(Permission::LlmQuery));
        assert!(!Role::User.permissions().contains(Permission::LlmStream));
        assert!(!Role::User.permissions().contains(Permission::ProviderAnthropic));
        assert!(Role::PowerUser.permissions().contains(Permission::LlmStream));
        assert!(Role::PowerUser.permissions().contains(Permission::ProviderOther));
        assert!(!Role::Auditor.permissions().contains(Permission::LlmQuery));
        assert!(!Role::Auditor.permissions().contains(Permission::AuditErase));
        for p in Permission::ALL {
            assert!(Role::Admin.permissions().contains(p));
        }
    }

    #[test]
    fn test_permissions_union() {
        let set = permissions_for(&[Role::User, Role::Auditor]);
        assert!(set.contains(Permission::LlmQuery));
        assert!(set.contains(Permission::AuditRead));
        assert!(!set.contains(Permission::ConfigManage));
    }

    #[test]
    fn test_provider_mapping() {
        assert_eq!(Permission::for_provider("Anthropic"), Permission::ProviderAnthropic);
        assert_eq!(Permission::for_provider("gemini"), Permission::ProviderGoogle);
        assert_eq!(Permission::for_provider("ollama"), Permission::ProviderLocal);
        assert_eq!(Permission::for_provider("mistral"), Permission::ProviderOther);
    }

    #[test]
    fn test_permission_set_serializes_as_list() {
        let set: PermissionSet = [Permission::LlmQuery, Permission::AuditRead].into_iter().collect();
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"["llm_query","audit_read"]"#);
        let back: PermissionSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }
}
