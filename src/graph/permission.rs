//! Permission rows owned by principals
//!
//! A permission binds a URI pattern and an HTTP verb to a grant or deny flag
//! under a permission scheme. Exactly one of the two flags is set; a
//! duplicate insert for the same `(principal, uri, verb)` updates the row in
//! place instead of creating a second one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AcsError, AcsResult};
use crate::evaluator::conditions::AccessCondition;

/// HTTP verb guarded by a permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verb {
    /// HTTP GET
    Get,
    /// HTTP POST
    Post,
    /// HTTP PUT
    Put,
    /// HTTP PATCH
    Patch,
    /// HTTP DELETE
    Delete,
    /// Wildcard matching every verb
    All,
}

impl Verb {
    /// Whether a permission carrying this verb applies to a request verb
    pub fn matches(&self, requested: Verb) -> bool {
        *self == Verb::All || *self == requested
    }

    /// Canonical verb name as stored in `verb_types`
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Post => "POST",
            Verb::Put => "PUT",
            Verb::Patch => "PATCH",
            Verb::Delete => "DELETE",
            Verb::All => "ALL",
        }
    }

    /// All verbs, in `verb_types` seeding order
    pub fn all() -> [Verb; 6] {
        [
            Verb::Get,
            Verb::Post,
            Verb::Put,
            Verb::Patch,
            Verb::Delete,
            Verb::All,
        ]
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Verb {
    type Err = AcsError;

    fn from_str(s: &str) -> AcsResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Verb::Get),
            "POST" => Ok(Verb::Post),
            "PUT" => Ok(Verb::Put),
            "PATCH" => Ok(Verb::Patch),
            "DELETE" => Ok(Verb::Delete),
            "ALL" | "*" => Ok(Verb::All),
            other => Err(AcsError::NotFound(format!("unknown verb {other:?}"))),
        }
    }
}

/// Permission scheme tag
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermissionScheme {
    /// URI-based API authorization (the default scheme)
    ApiUriAuthorization,
    /// Site-specific scheme identified by name
    Custom(String),
}

impl PermissionScheme {
    /// Canonical scheme name as stored in `scheme_types`
    pub fn name(&self) -> &str {
        match self {
            PermissionScheme::ApiUriAuthorization => "ApiUriAuthorization",
            PermissionScheme::Custom(name) => name,
        }
    }
}

impl Default for PermissionScheme {
    fn default() -> Self {
        PermissionScheme::ApiUriAuthorization
    }
}

impl std::fmt::Display for PermissionScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A grant or deny owned by a principal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permission {
    /// Permission id, unique within the tenant
    pub id: i64,

    /// Owning principal id (scoped by the owner's kind)
    pub principal_id: i64,

    /// URI pattern; `*` wildcards and `{name}` variables allowed
    pub uri: String,

    /// Guarded verb
    pub verb: Verb,

    /// Grant flag; exactly one of grant/deny is set
    pub grant: bool,

    /// Deny flag; deny dominates during evaluation
    pub deny: bool,

    /// Scheme this permission belongs to
    pub scheme: PermissionScheme,

    /// Optional resource this permission is pinned to
    pub resource_id: Option<i64>,

    /// Conditions that must all hold after a grant resolves
    #[serde(default)]
    pub conditions: Vec<AccessCondition>,

    /// When the permission was granted or last updated
    pub granted_at: DateTime<Utc>,
}

impl Permission {
    /// Create a grant (or deny when `deny` is set) for a URI/verb pair
    pub fn new(id: i64, principal_id: i64, uri: impl Into<String>, verb: Verb, deny: bool) -> Self {
        Self {
            id,
            principal_id,
            uri: uri.into(),
            verb,
            grant: !deny,
            deny,
            scheme: PermissionScheme::default(),
            resource_id: None,
            conditions: Vec::new(),
            granted_at: Utc::now(),
        }
    }

    /// Attach a scheme
    pub fn with_scheme(mut self, scheme: PermissionScheme) -> Self {
        self.scheme = scheme;
        self
    }

    /// Pin to a concrete resource
    pub fn with_resource(mut self, resource_id: i64) -> Self {
        self.resource_id = Some(resource_id);
        self
    }

    /// Attach evaluation conditions
    pub fn with_conditions(mut self, conditions: Vec<AccessCondition>) -> Self {
        self.conditions = conditions;
        self
    }

    /// Key identifying this row for upsert purposes
    pub fn key(&self) -> (&str, Verb) {
        (self.uri.as_str(), self.verb)
    }

    /// Grant XOR deny must hold for every stored row
    pub fn flags_valid(&self) -> bool {
        self.grant != self.deny
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verb_matching() {
        assert!(Verb::All.matches(Verb::Get));
        assert!(Verb::All.matches(Verb::Delete));
        assert!(Verb::Get.matches(Verb::Get));
        assert!(!Verb::Get.matches(Verb::Post));
    }

    #[test]
    fn test_verb_parse_roundtrip() {
        for verb in Verb::all() {
            let parsed: Verb = verb.as_str().parse().unwrap();
            assert_eq!(parsed, verb);
        }
        assert!("TRACE".parse::<Verb>().is_err());
    }

    #[test]
    fn test_grant_xor_deny() {
        let grant = Permission::new(1, 1, "/orders/*", Verb::Get, false);
        assert!(grant.grant && !grant.deny && grant.flags_valid());

        let deny = Permission::new(2, 1, "/orders/*", Verb::Get, true);
        assert!(!deny.grant && deny.deny && deny.flags_valid());
    }
}
