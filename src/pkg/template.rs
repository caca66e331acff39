//! File templates

use serde::{Deserialize, Serialize};

use super::fragment::{ExecutionFragment, FragmentDef};
use crate::metrics::Metrics;

/// A single templated file of a package: where it lands, who owns it, which
/// coordination keys rewrite it, and the fragments that bracket the write.
#[derive(Debug, Serialize)]
pub struct Template {
    pub src: String,
    pub dest: String,
    pub description: String,
    pub owner: String,
    pub group: String,
    pub mode: String,
    pub watch: Vec<String>,
    pub before: Vec<ExecutionFragment>,
    pub after: Vec<ExecutionFragment>,

    #[serde(skip)]
    pub file_mode: u32,
    #[serde(skip)]
    pub uid: u32,
    #[serde(skip)]
    pub gid: u32,
    #[serde(skip)]
    pub metrics: Metrics,
}

/// Fields that accept either a single value or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        }
    }
}

pub fn flatten<T>(field: Option<OneOrMany<T>>) -> Vec<T> {
    field.map(OneOrMany::into_vec).unwrap_or_default()
}

/// Wire shape of a template definition.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateDef {
    pub src: String,
    pub dest: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub before: Option<OneOrMany<FragmentDef>>,
    #[serde(default)]
    pub after: Option<OneOrMany<FragmentDef>>,
    #[serde(default)]
    pub watch: Option<OneOrMany<String>>,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub mode: String,
}
