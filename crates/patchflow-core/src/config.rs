//! Workflow configuration.
//!
//! Defaults suit a GitHub repository with an `origin` remote and a `main`
//! base branch. [`WorkflowConfig::from_env`] overlays `PATCHFLOW_*`
//! environment variables; the CLI overlays its flags on top of that.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkflowError};

pub const ENV_REMOTE: &str = "PATCHFLOW_REMOTE";
pub const ENV_BASE_BRANCH: &str = "PATCHFLOW_BASE_BRANCH";
pub const ENV_VERSION_FILE: &str = "PATCHFLOW_VERSION_FILE";
pub const ENV_POLL_INTERVAL_SECS: &str = "PATCHFLOW_POLL_INTERVAL_SECS";
pub const ENV_MAX_WAIT_MINUTES: &str = "PATCHFLOW_MAX_WAIT_MINUTES";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Remote of the current (contributor) repository.
    pub remote: String,

    /// Branch patches start from and release PRs target.
    pub base_branch: String,

    /// Version file, relative to the working tree root.
    pub version_file: PathBuf,

    /// Interval between PR state polls while waiting for a release merge.
    #[serde(with = "secs")]
    pub poll_interval: Duration,

    /// Default merge wait deadline for releases.
    #[serde(with = "secs")]
    pub max_wait: Duration,

    /// Prefix of stash labels created by workflows.
    pub stash_prefix: String,

    /// Head-branch prefix of rolling consolidation PRs.
    pub consolidation_prefix: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            base_branch: "main".to_string(),
            version_file: PathBuf::from("VERSION"),
            poll_interval: Duration::from_secs(30),
            max_wait: Duration::from_secs(30 * 60),
            stash_prefix: "patchflow".to_string(),
            consolidation_prefix: "consolidation/".to_string(),
        }
    }
}

impl WorkflowConfig {
    /// Defaults overlaid with `PATCHFLOW_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(remote) = non_empty(ENV_REMOTE) {
            config.remote = remote;
        }
        if let Some(base) = non_empty(ENV_BASE_BRANCH) {
            config.base_branch = base;
        }
        if let Some(path) = non_empty(ENV_VERSION_FILE) {
            config.version_file = PathBuf::from(path);
        }
        if let Some(raw) = non_empty(ENV_POLL_INTERVAL_SECS) {
            config.poll_interval = Duration::from_secs(parse_u64(ENV_POLL_INTERVAL_SECS, &raw)?);
        }
        if let Some(raw) = non_empty(ENV_MAX_WAIT_MINUTES) {
            config.max_wait = Duration::from_secs(parse_u64(ENV_MAX_WAIT_MINUTES, &raw)? * 60);
        }
        Ok(config)
    }
}

fn parse_u64(key: &str, raw: &str) -> Result<u64> {
    raw.trim().parse::<u64>().map_err(|_| {
        WorkflowError::MissingParameter(format!("{key} must be a non-negative integer, got '{raw}'"))
    })
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = WorkflowConfig::default();
        assert_eq!(config.remote, "origin");
        assert_eq!(config.base_branch, "main");
        assert_eq!(config.version_file, PathBuf::from("VERSION"));
        assert_eq!(config.max_wait, Duration::from_secs(1800));
    }

    #[test]
    fn test_env_overrides() {
        let config = WorkflowConfig::from_lookup(lookup(&[
            (ENV_REMOTE, "fork"),
            (ENV_BASE_BRANCH, "develop"),
            (ENV_POLL_INTERVAL_SECS, "5"),
            (ENV_MAX_WAIT_MINUTES, "2"),
            (ENV_VERSION_FILE, ""),
        ]))
        .unwrap();
        assert_eq!(config.remote, "fork");
        assert_eq!(config.base_branch, "develop");
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.max_wait, Duration::from_secs(120));
        assert_eq!(config.version_file, PathBuf::from("VERSION"));
    }

    #[test]
    fn test_invalid_number_rejected() {
        let err = WorkflowConfig::from_lookup(lookup(&[(ENV_MAX_WAIT_MINUTES, "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_MAX_WAIT_MINUTES));
    }

    #[test]
    fn test_serde_roundtrip_uses_seconds() {
        let config = WorkflowConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["poll_interval"], 30);
        let back: WorkflowConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }
}
