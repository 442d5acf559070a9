//! Entity identity: keys, IDs, `PluginID`, and the `IDLookup` priority chain
//! used to pick the agent's own key.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier-source tags, in priority order. First non-empty source wins.
pub const ID_LOOKUP_PRIORITY: &[&str] = &[
    "instance-id",
    "azure-vm-id",
    "gcp-vm-id",
    "alibaba-vm-id",
    "display-name",
    "short-hostname",
    "hostname",
];

/// Mapping from identifier-source tag to its string value, as harvested at
/// startup (and re-derived on a `metadata/host_aliases` plugin output).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IdLookup {
    values: indexmap::IndexMap<String, String>,
}

impl IdLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, source: impl Into<String>, value: impl Into<String>) {
        self.values.insert(source.into(), value.into());
    }

    pub fn get(&self, source: &str) -> Option<&str> {
        self.values.get(source).map(String::as_str)
    }

    /// First non-empty source in `ID_LOOKUP_PRIORITY`, or
    /// `UndefinedLookupType` if none is present.
    pub fn agent_key(&self) -> Result<String, crate::error::AgentError> {
        for source in ID_LOOKUP_PRIORITY {
            if let Some(v) = self.values.get(*source) {
                if !v.is_empty() {
                    return Ok(v.clone());
                }
            }
        }
        Err(crate::error::AgentError::UndefinedLookupType)
    }
}

/// An observable subject: the host itself (the "agent entity") or a remote
/// entity discovered through plugin output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey(pub String);

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityKey {
    fn from(s: &str) -> Self {
        EntityKey(s.to_string())
    }
}

impl From<String> for EntityKey {
    fn from(s: String) -> Self {
        EntityKey(s)
    }
}

/// Opaque 64-bit ID assigned by the backend on registration. `0` is treated
/// as "not yet known" throughout the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl EntityId {
    pub const EMPTY: EntityId = EntityId(0);

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `(category, term)` pair namespacing one source of inventory under an
/// entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PluginId {
    pub category: String,
    pub term: String,
}

impl PluginId {
    pub fn new(category: impl Into<String>, term: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            term: term.into(),
        }
    }

    pub fn rendered(&self) -> String {
        format!("{}/{}", self.category, self.term)
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.rendered())
    }
}

/// The well-known plugin ID whose output carries host alias information and
/// triggers an agent-key re-derivation.
pub fn host_aliases_plugin_id() -> PluginId {
    PluginId::new("metadata", "host_aliases")
}

/// Replace filesystem-hostile characters in an entity key so it can be used
/// as a directory name. Deterministic and total.
pub fn sanitize_entity_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            c if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;

    #[test]
    fn agent_key_priority() {
        let mut lookup = IdLookup::new();
        lookup.set("instance-id", "");
        lookup.set("display-name", "dn");
        lookup.set("hostname", "hn");
        assert_eq!(lookup.agent_key().unwrap(), "dn");
    }

    #[test]
    fn agent_key_skips_empty_and_falls_through() {
        let mut lookup = IdLookup::new();
        lookup.set("instance-id", "");
        lookup.set("azure-vm-id", "");
        lookup.set("hostname", "h.example.com");
        assert_eq!(lookup.agent_key().unwrap(), "h.example.com");
    }

    #[test]
    fn agent_key_undefined_when_all_empty() {
        let lookup = IdLookup::new();
        match lookup.agent_key() {
            Err(AgentError::UndefinedLookupType) => {}
            other => panic!("expected UndefinedLookupType, got {other:?}"),
        }
    }

    #[test]
    fn sanitize_is_deterministic() {
        let key = "i-123/../weird:key name";
        assert_eq!(sanitize_entity_key(key), sanitize_entity_key(key));
        assert_eq!(sanitize_entity_key(key), "i-123_.._weird_key_name");
    }

    #[test]
    fn plugin_id_renders_category_slash_term() {
        let id = PluginId::new("metadata", "host_aliases");
        assert_eq!(id.rendered(), "metadata/host_aliases");
        assert_eq!(id, host_aliases_plugin_id());
    }
}
