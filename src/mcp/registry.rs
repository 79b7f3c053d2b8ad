//! Tool Registry: the namespaced catalog of tools discovered across every
//! connected server. Prefixing `server_name.short_name` is the sole
//! conflict-resolution mechanism — two servers may expose a same-named tool.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A discovered tool, normalized from a server's `tools/list` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub short_name: String,
    pub description: String,
    pub parameter_schema: Value,
    pub server_name: String,
    pub full_name: String,
}

impl ToolDescriptor {
    pub fn new(
        server_name: impl Into<String>,
        short_name: impl Into<String>,
        description: impl Into<String>,
        parameter_schema: Value,
    ) -> Self {
        let server_name = server_name.into();
        let short_name = short_name.into();
        let full_name = format!("{server_name}.{short_name}");
        Self {
            short_name,
            description: description.into(),
            parameter_schema,
            server_name,
            full_name,
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no tool registered as `{0}`")]
    NotFound(String),
}

/// A `full_name -> ToolDescriptor` catalog, read far more often than it is
/// written (written once per server at discovery time). Backed by
/// `DashMap` so readers never block behind a writer touching an unrelated
/// entry.
#[derive(Default)]
pub struct ToolRegistry {
    entries: DashMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `descriptor` under `server_name.short_name`, returning the
    /// full name. Repeated registration with identical metadata is a
    /// no-op; with differing metadata it replaces.
    pub fn register(&self, server_name: &str, descriptor: ToolDescriptor) -> String {
        let full_name = format!("{server_name}.{}", descriptor.short_name);
        let mut descriptor = descriptor;
        descriptor.server_name = server_name.to_string();
        descriptor.full_name = full_name.clone();
        self.entries.insert(full_name.clone(), descriptor);
        full_name
    }

    pub fn get(&self, full_name: &str) -> Result<ToolDescriptor, RegistryError> {
        self.entries
            .get(full_name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegistryError::NotFound(full_name.to_string()))
    }

    /// Lists every registered tool, optionally filtered to one server.
    pub fn list(&self, server_name: Option<&str>) -> Vec<ToolDescriptor> {
        self.entries
            .iter()
            .filter(|entry| match server_name {
                Some(name) => entry.value().server_name == name,
                None => true,
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn remove(&self, full_name: &str) {
        self.entries.remove(full_name);
    }

    pub fn remove_server(&self, server_name: &str) {
        self.entries
            .retain(|_, descriptor| descriptor.server_name != server_name);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str) -> ToolDescriptor {
        ToolDescriptor::new("fs", name, "does a thing", serde_json::json!({"type":"object"}))
    }

    #[test]
    fn register_prefixes_with_server_name() {
        let registry = ToolRegistry::new();
        let full_name = registry.register("fs", descriptor("read_file"));
        assert_eq!(full_name, "fs.read_file");
        assert!(registry.get("fs.read_file").is_ok());
    }

    #[test]
    fn same_short_name_from_different_servers_does_not_conflict() {
        let registry = ToolRegistry::new();
        registry.register("fs", descriptor("read_file"));
        registry.register("cloud", descriptor("read_file"));
        assert!(registry.get("fs.read_file").is_ok());
        assert!(registry.get("cloud.read_file").is_ok());
        assert_eq!(registry.list(None).len(), 2);
    }

    #[test]
    fn remove_server_clears_only_its_entries() {
        let registry = ToolRegistry::new();
        registry.register("fs", descriptor("read_file"));
        registry.register("cloud", descriptor("read_file"));
        registry.remove_server("fs");
        assert!(registry.get("fs.read_file").is_err());
        assert!(registry.get("cloud.read_file").is_ok());
    }

    #[test]
    fn list_filters_by_server_name() {
        let registry = ToolRegistry::new();
        registry.register("fs", descriptor("read_file"));
        registry.register("fs", descriptor("write_file"));
        registry.register("cloud", descriptor("read_file"));
        assert_eq!(registry.list(Some("fs")).len(), 2);
    }
}
