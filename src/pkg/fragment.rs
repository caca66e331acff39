//! Shell execution fragments

use serde::{Deserialize, Serialize};

use crate::metrics::Metrics;

/// One shell step of a deployment. `check` is an optional predicate command:
/// when it exits non-zero the fragment's `cmd` is skipped (successfully);
/// when it exits zero, `cmd` runs and any failure fails the sequence
/// regardless of the package strict flag. `validate` is parsed and compiled
/// but not yet evaluated.
#[derive(Debug, Serialize)]
pub struct ExecutionFragment {
    pub cmd: String,

    /// Literal (or auto-generated "Command: i of N") status message
    pub status: String,

    /// Templated status expression, rendered per deployment when present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_cmd: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub check: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub validate: Option<String>,

    #[serde(skip)]
    pub metrics: Metrics,
}

/// Wire shape of a fragment: either a bare command string or the full form.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FragmentDef {
    Cmd(String),
    Full {
        cmd: String,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        check: Option<String>,
        #[serde(default)]
        validate: Option<String>,
    },
}

impl ExecutionFragment {
    /// Build a fragment from its definition. `position` and `count` feed the
    /// auto-generated status for fragments that don't carry one.
    pub fn from_def(def: FragmentDef, position: usize, count: usize) -> Self {
        match def {
            FragmentDef::Cmd(cmd) => Self {
                cmd,
                status: format!("Command: {} of {}", position, count),
                status_cmd: None,
                check: None,
                validate: None,
                metrics: Metrics::new(),
            },
            FragmentDef::Full {
                cmd,
                status,
                check,
                validate,
            } => Self {
                cmd,
                status: match &status {
                    Some(s) => s.clone(),
                    None => format!("Command: {} of {}", position, count),
                },
                status_cmd: status,
                check,
                validate,
                metrics: Metrics::new(),
            },
        }
    }
}
