//! Tool Registry: manifest-driven discovery of tool specs and handlers.
//!
//! Tools are not dynamically loaded from the handler string a manifest
//! carries (that would mean the registry executing arbitrary code at
//! discovery time). Instead, handlers are registered up front as a
//! compile-time table keyed by tool name — `handler` in the manifest is kept
//! only as descriptive metadata. Discovery is then just validation: every
//! manifest-declared tool must have a matching entry in the table, and every
//! declared schema file must exist and parse.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::gateway::Context;

/// A side-effectful capability the gateway can invoke.
///
/// Implementors perform the actual work; the gateway is responsible for
/// schema validation and policy enforcement around the call, so a handler
/// only needs to worry about its own domain logic and report failures
/// through [`crate::error::ToolError`].
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, input: Value, context: &Context) -> std::result::Result<Value, crate::error::ToolError>;
}

/// Static, immutable metadata describing a discoverable tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    /// Kept as a plain string rather than a closed enum: the Policy Engine's
    /// "unknown mode" deny branch (spec §4.2) must be reachable even for a
    /// hand-built `ToolSpec` in a unit test, not only via a rejected manifest.
    pub mode: String,
    pub handler: String,
    pub description: Option<String>,
    pub input_schema: Value,
    pub output_schema: Option<Value>,
}

/// A resolved tool: static metadata paired with a live handler.
#[derive(Clone)]
pub struct Tool {
    pub spec: ToolSpec,
    pub handler: Arc<dyn ToolHandler>,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    package: String,
    tools: Vec<ManifestTool>,
}

#[derive(Debug, Deserialize)]
struct ManifestTool {
    name: String,
    mode: String,
    handler: String,
    #[serde(default)]
    description: Option<String>,
    schemas: ManifestSchemas,
}

#[derive(Debug, Deserialize)]
struct ManifestSchemas {
    input: String,
    #[serde(default)]
    output: Option<String>,
}

/// Manifest-driven discovery of [`ToolSpec`]s and resolution of their
/// handlers. See module docs for the handler-resolution model.
pub struct ToolRegistry {
    root: PathBuf,
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
    tools: HashMap<String, Tool>,
}

impl ToolRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            handlers: HashMap::new(),
            tools: HashMap::new(),
        }
    }

    /// Register the handler a manifest's `tools[].name` must resolve to.
    /// Must be called before [`Self::discover`].
    pub fn register_handler(&mut self, tool_name: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(tool_name.into(), handler);
    }

    /// Scan `root/*/manifest.json` (one level deep) and resolve every
    /// declared tool. Idempotent: on any failure the registry is left in its
    /// pre-call state — a partially-valid discovery is never committed.
    pub fn discover(&mut self) -> Result<()> {
        let mut discovered = HashMap::new();
        let mut seen_names = HashMap::new();

        let entries = std::fs::read_dir(&self.root)
            .map_err(|e| Error::Manifest(format!("cannot read tools root {}: {e}", self.root.display())))?;

        let mut manifest_paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::Manifest(e.to_string()))?;
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let manifest_path = entry.path().join("manifest.json");
            if manifest_path.is_file() {
                manifest_paths.push(manifest_path);
            }
        }
        manifest_paths.sort();

        for manifest_path in &manifest_paths {
            self.register_from_manifest(manifest_path, &mut discovered, &mut seen_names)?;
        }

        self.tools = discovered;
        Ok(())
    }

    fn register_from_manifest(
        &self,
        manifest_path: &Path,
        discovered: &mut HashMap<String, Tool>,
        seen_names: &mut HashMap<String, PathBuf>,
    ) -> Result<()> {
        let tool_dir = manifest_path.parent().unwrap_or(Path::new("."));
        let raw = std::fs::read_to_string(manifest_path)
            .map_err(|e| Error::Manifest(format!("{}: {e}", manifest_path.display())))?;
        let manifest: Manifest = serde_json::from_str(&raw)
            .map_err(|e| Error::Manifest(format!("{}: {e}", manifest_path.display())))?;

        if manifest.package.is_empty() || manifest.tools.is_empty() {
            return Err(Error::Manifest(format!(
                "invalid manifest format: {}",
                manifest_path.display()
            )));
        }

        for t in &manifest.tools {
            if let Some(prior) = seen_names.get(&t.name) {
                return Err(Error::Manifest(format!(
                    "duplicate tool name '{}' in {} (already declared in {})",
                    t.name,
                    manifest_path.display(),
                    prior.display()
                )));
            }

            let handler = self.handlers.get(&t.name).cloned().ok_or_else(|| {
                Error::Manifest(format!(
                    "no registered handler for tool '{}' (declared handler '{}' in {})",
                    t.name,
                    t.handler,
                    manifest_path.display()
                ))
            })?;

            let input_schema = load_schema(&tool_dir.join(&t.schemas.input))?;
            let output_schema = match &t.schemas.output {
                Some(rel) => Some(load_schema(&tool_dir.join(rel))?),
                None => None,
            };

            let spec = ToolSpec {
                name: t.name.clone(),
                mode: t.mode.clone(),
                handler: t.handler.clone(),
                description: t.description.clone(),
                input_schema,
                output_schema,
            };

            seen_names.insert(t.name.clone(), manifest_path.to_path_buf());
            discovered.insert(t.name.clone(), Tool { spec, handler });
        }

        Ok(())
    }

    /// Look up a resolved tool by name. Never loads new tools lazily.
    pub fn get(&self, name: &str) -> Result<&Tool> {
        self.tools
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("unknown tool '{name}'")))
    }

    pub fn list(&self) -> HashMap<String, ToolSpec> {
        self.tools
            .iter()
            .map(|(name, tool)| (name.clone(), tool.spec.clone()))
            .collect()
    }

    pub fn get_input_schema(&self, name: &str) -> Result<&Value> {
        Ok(&self.get(name)?.spec.input_schema)
    }

    pub fn get_output_schema(&self, name: &str) -> Result<Option<&Value>> {
        Ok(self.get(name)?.spec.output_schema.as_ref())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

fn load_schema(path: &Path) -> Result<Value> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Manifest(format!("missing schema {}: {e}", path.display())))?;
    serde_json::from_str(&raw).map_err(|e| Error::Manifest(format!("invalid schema {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    struct EchoHandler;

    #[async_trait]
    impl ToolHandler for EchoHandler {
        async fn call(&self, input: Value, _context: &Context) -> std::result::Result<Value, crate::error::ToolError> {
            Ok(input)
        }
    }

    fn write_manifest(dir: &Path, tool_name: &str, mode: &str) {
        let tool_dir = dir.join("demo");
        fs::create_dir_all(&tool_dir).unwrap();
        fs::write(
            tool_dir.join("manifest.json"),
            serde_json::json!({
                "package": "demo",
                "tools": [{
                    "name": tool_name,
                    "mode": mode,
                    "handler": "demo:echo",
                    "description": "demo tool",
                    "schemas": { "input": "input.schema.json" }
                }]
            })
            .to_string(),
        )
        .unwrap();
        fs::write(
            tool_dir.join("input.schema.json"),
            serde_json::json!({"type": "object"}).to_string(),
        )
        .unwrap();
    }

    #[test]
    fn discover_resolves_registered_handler() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "demo.echo", "read_only");

        let mut registry = ToolRegistry::new(dir.path());
        registry.register_handler("demo.echo", Arc::new(EchoHandler));
        registry.discover().unwrap();

        assert_eq!(registry.len(), 1);
        let tool = registry.get("demo.echo").unwrap();
        assert_eq!(tool.spec.mode, "read_only");
    }

    #[test]
    fn discover_fails_fatally_on_unresolved_handler() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "demo.echo", "read_only");

        let mut registry = ToolRegistry::new(dir.path());
        // no handler registered
        assert!(registry.discover().is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn discover_fails_fatally_on_duplicate_name() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "demo.echo", "read_only");
        // a second manifest declaring the same tool name
        let tool_dir2 = dir.path().join("demo2");
        fs::create_dir_all(&tool_dir2).unwrap();
        fs::write(
            tool_dir2.join("manifest.json"),
            serde_json::json!({
                "package": "demo2",
                "tools": [{
                    "name": "demo.echo",
                    "mode": "read_only",
                    "handler": "demo2:echo",
                    "schemas": { "input": "input.schema.json" }
                }]
            })
            .to_string(),
        )
        .unwrap();
        fs::write(
            tool_dir2.join("input.schema.json"),
            serde_json::json!({"type": "object"}).to_string(),
        )
        .unwrap();

        let mut registry = ToolRegistry::new(dir.path());
        registry.register_handler("demo.echo", Arc::new(EchoHandler));
        assert!(registry.discover().is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn discover_is_idempotent_and_preserves_state_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "demo.echo", "read_only");

        let mut registry = ToolRegistry::new(dir.path());
        registry.register_handler("demo.echo", Arc::new(EchoHandler));
        registry.discover().unwrap();
        assert_eq!(registry.len(), 1);

        // Corrupt the schema file and re-discover; the prior good state must survive.
        fs::write(dir.path().join("demo").join("input.schema.json"), "not json").unwrap();
        assert!(registry.discover().is_err());
        assert_eq!(registry.len(), 1);
    }
}
