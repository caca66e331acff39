//! Pre-compiled template table
//!
//! Thin wrapper over a strict-mode handlebars registry. Strict mode makes a
//! missing variable a render error, which surfaces as the enclosing fragment
//! or template failing; the caller decides what that means for the
//! deployment. When a coordination store is attached, templates can pull live
//! values with `{{gets "some/key"}}`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use handlebars::{
    Context, Handlebars, Helper, HelperDef, HelperResult, Output, RenderContext,
    RenderErrorReason,
};
use tracing::error;

use crate::errors::AgentError;
use crate::kv::{GetOptions, KvStore};

/// `{{gets "key"}}`: fetch a coordination-store string value at render time.
struct KvGetHelper {
    kv: Arc<dyn KvStore>,
}

impl HelperDef for KvGetHelper {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _r: &'reg Handlebars<'reg>,
        _ctx: &'rc Context,
        _rc: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let key = h
            .param(0)
            .and_then(|p| p.value().as_str())
            .ok_or(RenderErrorReason::ParamNotFoundForIndex("gets", 0))?;

        let kv = self.kv.clone();
        let key_owned = key.to_string();
        let result = tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current()
                .block_on(kv.get(&key_owned, GetOptions::default()))
        });

        match result {
            Ok(node) => {
                out.write(&node.value)?;
                Ok(())
            }
            Err(e) => Err(RenderErrorReason::Other(format!("gets {}: {}", key, e)).into()),
        }
    }
}

/// Named, pre-compiled templates belonging to one package.
pub struct TemplateTable {
    registry: Handlebars<'static>,
}

impl Default for TemplateTable {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for TemplateTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateTable").finish_non_exhaustive()
    }
}

impl TemplateTable {
    pub fn new(kv: Option<Arc<dyn KvStore>>) -> Self {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        if let Some(kv) = kv {
            registry.register_helper("gets", Box::new(KvGetHelper { kv }));
        }
        Self { registry }
    }

    /// Compile `source` under `name`. Entries keyed by their own literal text
    /// (fragment commands, watch expressions) may be registered repeatedly;
    /// recompiling the same text is harmless.
    pub fn add(&mut self, name: &str, source: &str) -> Result<(), AgentError> {
        self.registry
            .register_template_string(name, source)
            .map_err(|e| AgentError::Template(format!("{}: {}", name, e)))
    }

    /// Compile a template file from disk under `name`.
    pub fn add_file(&mut self, name: &str, path: &Path) -> Result<(), AgentError> {
        self.registry
            .register_template_file(name, path)
            .map_err(|e| AgentError::Template(format!("{}: {}", path.display(), e)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.registry.has_template(name)
    }

    /// Render the named entry against the variable map. A missing entry or a
    /// variable the caller did not supply is an error.
    pub fn render(
        &self,
        name: &str,
        variables: &HashMap<String, String>,
    ) -> Result<String, AgentError> {
        self.registry.render(name, variables).map_err(|e| {
            error!("Could not render template {}: {}", name, e);
            AgentError::Template(format!("{}: {}", name, e))
        })
    }
}
