//! Utility functions

use serde::{Deserialize, Serialize};

/// Version information for the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Get version information
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
    }
}

/// Parse a form-style boolean flag ("1", "t", "true", case-insensitive)
pub fn parse_bool_flag(value: &str, default: bool) -> bool {
    match value.trim().to_lowercase().as_str() {
        "1" | "t" | "true" | "yes" => true,
        "0" | "f" | "false" | "no" => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_flag() {
        assert!(parse_bool_flag("true", false));
        assert!(parse_bool_flag("1", false));
        assert!(parse_bool_flag("T", false));
        assert!(!parse_bool_flag("false", true));
        assert!(!parse_bool_flag("0", true));
        assert!(parse_bool_flag("bogus", true));
        assert!(!parse_bool_flag("bogus", false));
    }
}
