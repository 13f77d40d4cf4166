//! Guard directory.
//!
//! Role and capability resolution lives outside the engine; it only needs to
//! enumerate active guards and check a capability.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A person who can be scheduled for rounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Guard {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

const fn default_active() -> bool {
    true
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn list_active_guards(&self) -> Result<Vec<Guard>, String>;
    async fn has_capability(&self, guard_id: &str, capability: &str) -> Result<bool, String>;
}

/// Fixed guard list, typically loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentityProvider {
    guards: Vec<Guard>,
}

impl StaticIdentityProvider {
    #[must_use]
    pub fn new(guards: Vec<Guard>) -> Self {
        Self { guards }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn list_active_guards(&self) -> Result<Vec<Guard>, String> {
        Ok(self.guards.iter().filter(|g| g.active).cloned().collect())
    }

    async fn has_capability(&self, guard_id: &str, capability: &str) -> Result<bool, String> {
        Ok(self
            .guards
            .iter()
            .any(|g| g.id == guard_id && g.active && g.capabilities.contains(capability)))
    }
}
