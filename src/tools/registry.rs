//! Tool registry: specs, lazy handler instantiation, and routing.
//!
//! The registry is immutable after initialization. Handlers are
//! constructed on first use, guarded by a per-tool once-guard, so tools
//! with expensive setup cost nothing until a plan actually selects them.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tracing::{debug, warn};

use super::{Tool, ToolContext, ToolError, ToolSpec};

type ToolFactory = Box<dyn Fn() -> Arc<dyn Tool> + Send + Sync>;

struct ToolEntry {
    spec: ToolSpec,
    factory: ToolFactory,
    instance: OnceLock<Arc<dyn Tool>>,
}

/// Maps tool names to handlers and exposes the capability list the
/// planner chooses from.
#[derive(Default)]
pub struct ToolRegistry {
    entries: HashMap<String, ToolEntry>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool spec with the factory that builds its handler.
    ///
    /// The factory runs at most once, on the tool's first invocation.
    pub fn register<F>(&mut self, spec: ToolSpec, factory: F)
    where
        F: Fn() -> Arc<dyn Tool> + Send + Sync + 'static,
    {
        let name = spec.name.clone();
        let replaced = self
            .entries
            .insert(
                name.clone(),
                ToolEntry {
                    spec,
                    factory: Box::new(factory),
                    instance: OnceLock::new(),
                },
            )
            .is_some();
        if replaced {
            warn!(tool = %name, "tool registration replaced an existing entry");
        }
    }

    /// Whether a tool with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// The registered spec for a tool.
    pub fn spec(&self, name: &str) -> Option<&ToolSpec> {
        self.entries.get(name).map(|e| &e.spec)
    }

    /// All registered specs, sorted by name for stable prompt output.
    pub fn specs(&self) -> Vec<&ToolSpec> {
        let mut specs: Vec<&ToolSpec> = self.entries.values().map(|e| &e.spec).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// One line per tool for the planner prompt: name, description,
    /// parameter names.
    pub fn capability_summary(&self) -> String {
        self.specs()
            .iter()
            .map(|spec| {
                let params = spec
                    .parameters
                    .iter()
                    .map(|p| {
                        if p.required {
                            format!("{} ({})", p.name, p.kind)
                        } else {
                            format!("{} ({}, optional)", p.name, p.kind)
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                if params.is_empty() {
                    format!("- {}: {}", spec.name, spec.description)
                } else {
                    format!("- {}: {} [parameters: {params}]", spec.name, spec.description)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Effective deadline for a tool invocation.
    pub fn deadline_for(&self, name: &str, default_ms: u64) -> Duration {
        let ms = self
            .entries
            .get(name)
            .and_then(|e| e.spec.default_deadline_ms)
            .unwrap_or(default_ms);
        Duration::from_millis(ms)
    }

    /// Whether the tool is declared pure (side-effect free).
    pub fn is_pure(&self, name: &str) -> bool {
        self.entries.get(name).is_some_and(|e| e.spec.pure)
    }

    fn instance(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let entry = self.entries.get(name)?;
        let instance = entry.instance.get_or_init(|| {
            debug!(tool = %name, "instantiating tool handler");
            (entry.factory)()
        });
        if instance.name() != entry.spec.name {
            warn!(
                registered = %entry.spec.name,
                reported = %instance.name(),
                "tool handler name does not match its registration"
            );
        }
        Some(Arc::clone(instance))
    }

    /// Route an invocation to the named tool's handler.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::UnknownTool`] for unregistered names, or
    /// whatever the handler itself reports.
    pub async fn execute(
        &self,
        name: &str,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let tool = self
            .instance(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_owned()))?;
        tool.execute(params, ctx).await
    }
}
