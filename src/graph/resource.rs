//! Resource registry
//!
//! Resources name the protected surface: a URI template (wildcards and
//! `{name}` variables allowed), a type tag, a version, and an active flag.
//! At most one active version may exist per URI template. Resolution of a
//! concrete request URI picks the most specific matching active resource.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{AcsError, AcsResult};
use crate::evaluator::matcher::UriPattern;

/// A protected resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Resource id, unique within the tenant
    pub id: i64,

    /// URI template, e.g. `/orders/{id}` or `/reports/*`
    pub uri: String,

    /// Free-form description
    pub description: String,

    /// Resource type tag, e.g. `endpoint`
    pub resource_type: String,

    /// Version of this template registration
    pub version: i32,

    /// Optional parent resource
    pub parent_resource_id: Option<i64>,

    /// Whether this version is the live one for its URI
    pub is_active: bool,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Resource {
    /// Create an active version-1 resource
    pub fn new(id: i64, uri: impl Into<String>, resource_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            uri: uri.into(),
            description: String::new(),
            resource_type: resource_type.into(),
            version: 1,
            parent_resource_id: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// In-memory resource set with template resolution
///
/// Mutations come only from the executor task; readers resolve concurrently.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    resources: DashMap<i64, Resource>,
}

impl ResourceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource version
    ///
    /// Registering an active resource for a URI that already has an active
    /// version deactivates the previous version and assigns the next version
    /// number to the new one. Returns the stored resource and the ids of
    /// the versions this registration deactivated.
    pub fn register(&self, mut resource: Resource) -> AcsResult<(Resource, Vec<i64>)> {
        if resource.uri.trim().is_empty() {
            return Err(AcsError::InvalidArgument("resource uri must not be empty".into()));
        }
        let mut deactivated = Vec::new();
        if resource.is_active {
            for mut prior in self.resources.iter_mut() {
                if prior.uri == resource.uri && prior.is_active {
                    prior.is_active = false;
                    prior.updated_at = Utc::now();
                    resource.version = resource.version.max(prior.version + 1);
                    deactivated.push(prior.id);
                }
            }
        }
        self.resources.insert(resource.id, resource.clone());
        Ok((resource, deactivated))
    }

    /// Insert a row as loaded from the store, without version bookkeeping
    pub fn insert_loaded(&self, resource: Resource) {
        self.resources.insert(resource.id, resource);
    }

    /// Deactivate a resource version
    pub fn deactivate(&self, id: i64) -> AcsResult<Resource> {
        let mut entry = self
            .resources
            .get_mut(&id)
            .ok_or_else(|| AcsError::NotFound(format!("resource {id}")))?;
        entry.is_active = false;
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    /// Fetch a resource by id
    pub fn get(&self, id: i64) -> AcsResult<Resource> {
        self.resources
            .get(&id)
            .map(|r| r.clone())
            .ok_or_else(|| AcsError::NotFound(format!("resource {id}")))
    }

    /// Resolve a concrete URI to the most specific active resource
    pub fn resolve(&self, uri: &str) -> Option<Resource> {
        let mut best: Option<(UriPattern, Resource)> = None;
        for entry in self.resources.iter() {
            if !entry.is_active {
                continue;
            }
            let Ok(pattern) = UriPattern::compile(&entry.uri) else {
                continue;
            };
            if !pattern.matches(uri) {
                continue;
            }
            let better = match &best {
                None => true,
                Some((current, _)) => pattern.specificity() > current.specificity(),
            };
            if better {
                best = Some((pattern, entry.clone()));
            }
        }
        best.map(|(_, resource)| resource)
    }

    /// Snapshot of all resources
    pub fn snapshot(&self) -> Vec<Resource> {
        let mut all: Vec<_> = self.resources.iter().map(|r| r.clone()).collect();
        all.sort_by_key(|r| r.id);
        all
    }

    /// Highest id currently present, for counter seeding
    pub fn max_id(&self) -> i64 {
        self.resources.iter().map(|r| r.id).max().unwrap_or(0)
    }

    /// Number of registered resource rows
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_active_version_per_uri() {
        let registry = ResourceRegistry::new();
        registry.register(Resource::new(1, "/orders/{id}", "endpoint")).unwrap();
        let (v2, deactivated) = registry.register(Resource::new(2, "/orders/{id}", "endpoint")).unwrap();

        assert_eq!(v2.version, 2);
        assert_eq!(deactivated, vec![1]);
        assert!(!registry.get(1).unwrap().is_active);
        assert!(registry.get(2).unwrap().is_active);
    }

    #[test]
    fn test_resolve_prefers_specific_template() {
        let registry = ResourceRegistry::new();
        registry.register(Resource::new(1, "/a/*", "endpoint")).unwrap();
        registry.register(Resource::new(2, "/a/b/{x}", "endpoint")).unwrap();

        assert_eq!(registry.resolve("/a/b/42").unwrap().id, 2);
        assert_eq!(registry.resolve("/a/c").unwrap().id, 1);
        assert!(registry.resolve("/z").is_none());
    }

    #[test]
    fn test_inactive_resources_do_not_resolve() {
        let registry = ResourceRegistry::new();
        registry.register(Resource::new(1, "/a/*", "endpoint")).unwrap();
        registry.deactivate(1).unwrap();
        assert!(registry.resolve("/a/b").is_none());
    }
}
