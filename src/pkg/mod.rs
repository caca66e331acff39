//! Package model and loader
//!
//! A package is an immutable bundle of file templates and shell fragments,
//! parsed once from the configuration directory. Every templated string the
//! package references (destinations, file bodies, watch keys, fragment
//! commands) is pre-compiled into the package's [`TemplateTable`] at load
//! time; a package whose templates cannot be compiled is excluded entirely.

pub mod fragment;
pub mod loader;
pub mod table;
pub mod template;

use serde::Serialize;

use crate::metrics::Metrics;

pub use fragment::{ExecutionFragment, FragmentDef};
pub use loader::load_packages;
pub use table::TemplateTable;
pub use template::{Template, TemplateDef};

/// An immutable declarative bundle of file templates and shell fragments.
#[derive(Debug, Serialize)]
pub struct Package {
    pub id: String,
    pub tag: String,
    pub name: String,
    pub version: String,
    pub strict: bool,
    pub templates: Vec<Template>,
    #[serde(rename = "template_before")]
    pub templates_before: Vec<ExecutionFragment>,
    #[serde(rename = "template_after")]
    pub templates_after: Vec<ExecutionFragment>,

    /// Pre-compiled template table, keyed as described in the loader.
    #[serde(skip)]
    pub table: TemplateTable,

    /// Whole-deployment wall-clock average, the denominator for progress.
    #[serde(skip)]
    pub metrics: Metrics,
}

impl Package {
    pub fn find_template(&self, src: &str) -> Option<&Template> {
        self.templates.iter().find(|t| t.src == src)
    }
}
