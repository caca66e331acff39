//! Application options

use std::path::PathBuf;

/// Runtime options, resolved from the command line.
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Directory searched for deployd.json, cluster.json and packages
    pub config_dir: PathBuf,

    /// Configuration backend location, `<type>,<host>,<path>`
    pub config_from: Option<String>,

    /// Advertised host:port override for the membership record
    pub endpoint: Option<String>,

    /// Disable clustering entirely
    pub no_cluster: bool,

    /// Disable the deployment journal
    pub no_journal: bool,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("/etc/deployd"),
            config_from: None,
            endpoint: None,
            no_cluster: false,
            no_journal: false,
        }
    }
}
