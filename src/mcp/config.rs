//! Configuration model and loader for the MCP fabric.
//!
//! A `ConfigurationDocument` is assembled from an optional JSON file and an
//! environment-variable overlay, then validated before the Manager ever sees
//! it. The loader never returns a partially valid document: any violation
//! aborts the whole load with the first `LoadError` encountered.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The two transport variants a server descriptor may select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Sse,
}

impl Default for TransportKind {
    fn default() -> Self {
        TransportKind::Stdio
    }
}

/// A validated, immutable description of one external MCP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// An ordered `name -> ServerDescriptor` mapping. Order matters for the
/// merge rule in [`Loader::load`] (file order preserved, env-only entries
/// appended by ascending index), so this is a `Vec`, not a `HashMap`.
#[derive(Debug, Clone, Default)]
pub struct ConfigurationDocument {
    descriptors: Vec<ServerDescriptor>,
}

impl ConfigurationDocument {
    /// Builds a document directly from an already-validated descriptor
    /// list, bypassing the Loader. Useful for callers (and tests) that
    /// assemble descriptors programmatically rather than from a file/env
    /// pair.
    pub fn from_descriptors(descriptors: Vec<ServerDescriptor>) -> Self {
        Self { descriptors }
    }

    pub fn get(&self, name: &str) -> Option<&ServerDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerDescriptor> {
        self.descriptors.iter()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn enabled(&self) -> impl Iterator<Item = &ServerDescriptor> {
        self.descriptors.iter().filter(|d| d.enabled)
    }
}

/// Errors the loader can report, one variant per entry in the spec's Errors
/// list. Each carries enough context to print a useful message on its own.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("config file {path} not readable: {reason}")]
    FileNotReadable { path: String, reason: String },

    #[error("malformed JSON in config file: {0}")]
    MalformedJSON(String),

    #[error("schema violation on field `{field}`: {reason}")]
    SchemaViolation { field: String, reason: String },

    #[error("unresolved ${{{name}}} reference in descriptor `{in_descriptor}`")]
    MissingEnvVar { name: String, in_descriptor: String },

    #[error("duplicate server name `{0}`")]
    DuplicateName(String),

    #[error("MCP_SERVER_{0}_ARGS is not a JSON array of strings")]
    BadArgsJSON(u64),
}

/// Raw, pre-validation wire shape of the JSON config file:
/// `{ "mcpServers": { <name>: <descriptor>, ... } }`.
#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(rename = "mcpServers", default)]
    mcp_servers: HashMap<String, RawDescriptor>,
}

#[derive(Debug, Deserialize)]
struct RawDescriptor {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    transport: TransportKind,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Parses a config file plus an environment overlay into a validated
/// [`ConfigurationDocument`].
pub struct Loader;

impl Loader {
    /// Pure variant: takes an explicit environment map so tests never have
    /// to mutate the process environment.
    pub fn load(
        path: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> Result<ConfigurationDocument, LoadError> {
        let file_descriptors = Self::file_pass(path)?;
        let env_descriptors = Self::env_pass(env)?;
        let merged = Self::merge(file_descriptors, env_descriptors)?;
        let expanded = Self::expand(merged, env)?;
        Self::validate(expanded)
    }

    /// Convenience wrapper matching the teacher's split between pure logic
    /// and the `std::env`-touching caller.
    pub fn from_process_env(path: Option<&Path>) -> Result<ConfigurationDocument, LoadError> {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::load(path, &env)
    }

    fn file_pass(path: Option<&Path>) -> Result<Vec<ServerDescriptor>, LoadError> {
        let path = match path {
            Some(p) if p.exists() => p,
            _ => return Ok(Vec::new()),
        };

        let contents = std::fs::read_to_string(path).map_err(|e| LoadError::FileNotReadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let raw: RawDocument = serde_json::from_str(&contents)
            .map_err(|e| LoadError::MalformedJSON(e.to_string()))?;

        // HashMap iteration order is unspecified; sort by name so the file
        // pass is at least deterministic across runs (actual ordering vs.
        // the on-disk document is not an invariant the spec requires).
        let mut names: Vec<&String> = raw.mcp_servers.keys().collect();
        names.sort();

        Ok(names
            .into_iter()
            .map(|name| {
                let d = &raw.mcp_servers[name];
                ServerDescriptor {
                    name: name.clone(),
                    command: d.command.clone(),
                    args: d.args.clone(),
                    env: d.env.clone(),
                    transport: d.transport,
                    enabled: d.enabled,
                    description: d.description.clone(),
                }
            })
            .collect())
    }

    fn env_pass(env: &HashMap<String, String>) -> Result<Vec<ServerDescriptor>, LoadError> {
        #[derive(Default)]
        struct Builder {
            name: Option<String>,
            command: Option<String>,
            args: Option<String>,
            transport: Option<String>,
            enabled: Option<String>,
            description: Option<String>,
            env: HashMap<String, String>,
        }

        let mut builders: HashMap<u64, Builder> = HashMap::new();

        for (key, value) in env {
            if key == "MCP_SERVER_COUNT" {
                continue;
            }
            let Some(rest) = key.strip_prefix("MCP_SERVER_") else {
                continue;
            };
            let Some((idx_str, field)) = rest.split_once('_') else {
                continue;
            };
            let Ok(idx) = idx_str.parse::<u64>() else {
                continue;
            };

            let builder = builders.entry(idx).or_default();
            if let Some(env_key) = field.strip_prefix("ENV_") {
                builder.env.insert(env_key.to_string(), value.clone());
                continue;
            }
            match field {
                "NAME" => builder.name = Some(value.clone()),
                "COMMAND" => builder.command = Some(value.clone()),
                "ARGS" => builder.args = Some(value.clone()),
                "TRANSPORT" => builder.transport = Some(value.clone()),
                "ENABLED" => builder.enabled = Some(value.clone()),
                "DESCRIPTION" => builder.description = Some(value.clone()),
                _ => {}
            }
        }

        let mut indexes: Vec<u64> = builders.keys().copied().collect();
        indexes.sort();

        let mut out = Vec::new();
        let mut seen_names = std::collections::HashSet::new();

        for idx in indexes {
            let b = &builders[&idx];
            let (Some(name), Some(command)) = (&b.name, &b.command) else {
                continue;
            };

            if !seen_names.insert(name.clone()) {
                return Err(LoadError::DuplicateName(name.clone()));
            }

            let args = match &b.args {
                Some(raw) => serde_json::from_str::<Vec<String>>(raw)
                    .map_err(|_| LoadError::BadArgsJSON(idx))?,
                None => Vec::new(),
            };

            let transport = match b.transport.as_deref() {
                Some("sse") => TransportKind::Sse,
                Some("stdio") | None => TransportKind::Stdio,
                Some(other) => {
                    return Err(LoadError::SchemaViolation {
                        field: format!("MCP_SERVER_{idx}_TRANSPORT"),
                        reason: format!("unrecognized transport `{other}`"),
                    })
                }
            };

            let enabled = match b.enabled.as_deref() {
                Some("true") => true,
                Some("false") => false,
                Some(other) => {
                    tracing::warn!(
                        "MCP_SERVER_{idx}_ENABLED={other} is not `true`/`false`, defaulting to true"
                    );
                    true
                }
                None => true,
            };

            out.push(ServerDescriptor {
                name: name.clone(),
                command: command.clone(),
                args,
                env: b.env.clone(),
                transport,
                enabled,
                description: b.description.clone(),
            });
        }

        if let Some(expected) = env.get("MCP_SERVER_COUNT") {
            if let Ok(expected) = expected.parse::<usize>() {
                if expected != out.len() {
                    tracing::warn!(
                        "MCP_SERVER_COUNT={expected} but {} env-derived descriptor(s) were found",
                        out.len()
                    );
                }
            }
        }

        Ok(out)
    }

    fn merge(
        file_descriptors: Vec<ServerDescriptor>,
        env_descriptors: Vec<ServerDescriptor>,
    ) -> Result<Vec<ServerDescriptor>, LoadError> {
        let mut merged = file_descriptors;

        for env_descriptor in env_descriptors {
            if let Some(existing) = merged.iter_mut().find(|d| d.name == env_descriptor.name) {
                *existing = env_descriptor;
            } else {
                merged.push(env_descriptor);
            }
        }

        Ok(merged)
    }

    fn expand(
        descriptors: Vec<ServerDescriptor>,
        env: &HashMap<String, String>,
    ) -> Result<Vec<ServerDescriptor>, LoadError> {
        descriptors
            .into_iter()
            .map(|mut d| {
                for value in d.env.values_mut() {
                    *value = expand_one(value, &d.name, env)?;
                }
                Ok(d)
            })
            .collect()
    }

    fn validate(descriptors: Vec<ServerDescriptor>) -> Result<ConfigurationDocument, LoadError> {
        let mut seen = std::collections::HashSet::new();

        for d in &descriptors {
            if d.name.is_empty()
                || !d
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(LoadError::SchemaViolation {
                    field: "name".to_string(),
                    reason: format!("`{}` must match [A-Za-z0-9_-]+", d.name),
                });
            }
            if d.command.is_empty() {
                return Err(LoadError::SchemaViolation {
                    field: "command".to_string(),
                    reason: format!("descriptor `{}` has an empty command", d.name),
                });
            }
            if d.transport == TransportKind::Sse
                && !(d.command.starts_with("http://") || d.command.starts_with("https://"))
            {
                return Err(LoadError::SchemaViolation {
                    field: "command".to_string(),
                    reason: format!(
                        "descriptor `{}` uses sse transport but `command` is not an http(s) URL",
                        d.name
                    ),
                });
            }
            if !seen.insert(d.name.clone()) {
                return Err(LoadError::DuplicateName(d.name.clone()));
            }
        }

        Ok(ConfigurationDocument {
            descriptors,
        })
    }
}

/// Expands every `${VAR}` token in `value` using `env`, erroring on the
/// first reference that does not resolve.
fn expand_one(
    value: &str,
    descriptor_name: &str,
    env: &HashMap<String, String>,
) -> Result<String, LoadError> {
    let mut out = String::with_capacity(value.len());
    let bytes = value.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'{') {
            let Some(close) = value[i + 2..].find('}') else {
                out.push_str(&value[i..]);
                break;
            };
            let var_name = &value[i + 2..i + 2 + close];
            match env.get(var_name) {
                Some(v) => out.push_str(v),
                None => {
                    return Err(LoadError::MissingEnvVar {
                        name: var_name.to_string(),
                        in_descriptor: descriptor_name.to_string(),
                    })
                }
            }
            i += 2 + close + 1;
        } else {
            let ch = value[i..].chars().next().unwrap();
            out.push(ch);
            i += ch.len_utf8();
        }
    }

    Ok(out)
}
