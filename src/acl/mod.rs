//! ACL (Access Control List) Module
//!
//! Provides topic-based authorization with support for:
//! - MQTT wildcards (# and +)
//! - Variable substitution (%c = client_id, %u = username)
//! - Role-based permissions
//! - Per-client grants changed at runtime

use std::collections::HashMap;

use dashmap::DashMap;
use tracing::debug;

use crate::auth::Authentication;
use crate::config::AclConfig;
use crate::topic::{filter_covered_by, parse_shared_subscription, topic_matches_filter};


/// Allowed publish and subscribe filters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Permissions {
    pub publish: Vec<String>,
    pub subscribe: Vec<String>,
}

impl Permissions {
    pub fn new(publish: Vec<String>, subscribe: Vec<String>) -> Self {
        Self { publish, subscribe }
    }

    /// Allow everything
    pub fn all() -> Self {
        Self::new(vec!["#".to_string()], vec!["#".to_string()])
    }
}

/// Publish/subscribe authorization consulted by the connection handlers
pub trait Authorizer: Send + Sync {
    fn is_enabled(&self) -> bool;

    /// Effective permissions of a client, variables substituted
    fn permissions(&self, client_id: &str, auth: &Authentication) -> Permissions;

    /// Replace a client's permissions at runtime
    fn set_permissions(&self, client_id: &str, permissions: Permissions);

    fn can_publish(&self, client_id: &str, auth: &Authentication, topic: &str) -> bool {
        if !self.is_enabled() {
            return true;
        }
        self.permissions(client_id, auth)
            .publish
            .iter()
            .any(|pattern| topic_matches_filter(topic, pattern))
    }

    /// Shared subscriptions are checked by their filter part
    fn can_subscribe(&self, client_id: &str, auth: &Authentication, filter: &str) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let actual = parse_shared_subscription(filter)
            .map(|(_, actual)| actual)
            .unwrap_or(filter);
        self.permissions(client_id, auth)
            .subscribe
            .iter()
            .any(|pattern| filter_covered_by(actual, pattern))
    }
}

/// ACL provider
pub struct AclProvider {
    /// Whether ACL is enabled
    enabled: bool,
    /// Role definitions (name -> role)
    roles: HashMap<String, Permissions>,
    /// Default permissions for users without explicit role (including anonymous)
    default: Permissions,
    /// Runtime grants, replacing role and default permissions
    grants: DashMap<String, Permissions>,
}

impl AclProvider {
    /// Create a new ACL provider from configuration
    pub fn new(config: &AclConfig) -> Self {
        let roles = config
            .roles
            .iter()
            .map(|role| {
                (
                    role.name.clone(),
                    Permissions::new(role.publish.clone(), role.subscribe.clone()),
                )
            })
            .collect();

        Self {
            enabled: config.enabled,
            roles,
            default: Permissions::new(
                config.default.publish.clone(),
                config.default.subscribe.clone(),
            ),
            grants: DashMap::new(),
        }
    }

    /// Substitute `%c` and `%u` in a pattern
    fn substitute(pattern: &str, client_id: &str, username: Option<&str>) -> String {
        pattern
            .replace("%c", client_id)
            .replace("%u", username.unwrap_or(""))
    }

    fn substitute_all(patterns: &[String], client_id: &str, username: Option<&str>) -> Vec<String> {
        patterns
            .iter()
            .map(|p| Self::substitute(p, client_id, username))
            .collect()
    }
}

impl Authorizer for AclProvider {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn permissions(&self, client_id: &str, auth: &Authentication) -> Permissions {
        let username = auth.username.as_deref();

        if let Some(granted) = self.grants.get(client_id) {
            return Permissions::new(
                Self::substitute_all(&granted.publish, client_id, username),
                Self::substitute_all(&granted.subscribe, client_id, username),
            );
        }

        // Role patterns first, defaults apply to everyone
        let mut publish = Vec::new();
        let mut subscribe = Vec::new();
        if let Some(role) = auth.role.as_deref().and_then(|r| self.roles.get(r)) {
            publish.extend(Self::substitute_all(&role.publish, client_id, username));
            subscribe.extend(Self::substitute_all(&role.subscribe, client_id, username));
        }
        publish.extend(Self::substitute_all(&self.default.publish, client_id, username));
        subscribe.extend(Self::substitute_all(&self.default.subscribe, client_id, username));

        Permissions { publish, subscribe }
    }

    fn set_permissions(&self, client_id: &str, permissions: Permissions) {
        debug!(
            "Permissions of {} changed: publish={:?} subscribe={:?}",
            client_id, permissions.publish, permissions.subscribe
        );
        self.grants.insert(client_id.to_string(), permissions);
    }
}
