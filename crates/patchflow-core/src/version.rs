//! Semantic versions and the repository version file.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkflowError};

/// `MAJOR.MINOR.PATCH`. Ordering compares the numeric triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse `x.y.z`, tolerating a leading `v` and surrounding whitespace.
    /// Pre-release and build suffixes are rejected.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let bare = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let invalid = || WorkflowError::InvalidVersion(format!("'{trimmed}' is not MAJOR.MINOR.PATCH"));

        let parts: Vec<&str> = bare.split('.').collect();
        if parts.len() != 3 {
            return Err(invalid());
        }
        let number = |s: &str| {
            if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            s.parse::<u64>().map_err(|_| invalid())
        };

        Ok(Self {
            major: number(parts[0])?,
            minor: number(parts[1])?,
            patch: number(parts[2])?,
        })
    }

    /// Next version for `bump`; `InvalidVersion` when a component is already
    /// at `u64::MAX`.
    pub fn bump(self, bump: BumpType) -> Result<Self> {
        let next = |n: u64| {
            n.checked_add(1).ok_or_else(|| {
                WorkflowError::InvalidVersion(format!("cannot bump {self}: component overflow"))
            })
        };
        Ok(match bump {
            BumpType::Patch => Self::new(self.major, self.minor, next(self.patch)?),
            BumpType::Minor => Self::new(self.major, next(self.minor)?, 0),
            BumpType::Major => Self::new(next(self.major)?, 0, 0),
        })
    }

    /// Tag name for this version, e.g. `v1.2.3`.
    pub fn tag(&self) -> String {
        format!("v{self}")
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BumpType {
    Patch,
    Minor,
    Major,
}

impl FromStr for BumpType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "patch" => Ok(BumpType::Patch),
            "minor" => Ok(BumpType::Minor),
            "major" => Ok(BumpType::Major),
            other => Err(format!("unknown bump type '{other}' (expected patch, minor or major)")),
        }
    }
}

/// How the next version is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionRequest {
    Bump(BumpType),
    Explicit(Version),
}

impl VersionRequest {
    /// Compute the version following `current`.
    ///
    /// Explicit versions must be strictly greater than `current`.
    pub fn next(self, current: Version) -> Result<Version> {
        match self {
            VersionRequest::Bump(bump) => current.bump(bump),
            VersionRequest::Explicit(version) if version > current => Ok(version),
            VersionRequest::Explicit(version) => Err(WorkflowError::InvalidVersion(format!(
                "{version} is not greater than the current version {current}"
            ))),
        }
    }
}

/// Parse the contents of a version file; `source` names where it was read
/// from in error messages.
pub fn parse_version_file(raw: &str, source: &str) -> Result<Version> {
    Version::parse(raw).map_err(|e| match e {
        WorkflowError::InvalidVersion(msg) => WorkflowError::InvalidVersion(format!("{source}: {msg}")),
        other => other,
    })
}

/// Overwrite the version file with `version` and a trailing newline.
pub fn write_version_file(path: &Path, version: Version) -> Result<()> {
    std::fs::write(path, format!("{version}\n"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_bare_and_prefixed() {
        assert_eq!(Version::parse("1.2.3").unwrap(), Version::new(1, 2, 3));
        assert_eq!(Version::parse(" v0.10.0\n").unwrap(), Version::new(0, 10, 0));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for input in ["", "1.2", "1.2.3.4", "1.x.3", "1.2.3-rc1", "+1.2.3", "1..3"] {
            let err = Version::parse(input).unwrap_err();
            assert!(matches!(err, WorkflowError::InvalidVersion(_)), "{input}");
        }
    }

    #[test]
    fn test_bump_from_1_2_3() {
        let v = Version::new(1, 2, 3);
        assert_eq!(v.bump(BumpType::Patch).unwrap().to_string(), "1.2.4");
        assert_eq!(v.bump(BumpType::Minor).unwrap().to_string(), "1.3.0");
        assert_eq!(v.bump(BumpType::Major).unwrap().to_string(), "2.0.0");
    }

    #[test]
    fn test_bump_overflow_is_invalid_version() {
        let max = u64::MAX.to_string();
        let v = Version::parse(&format!("1.2.{max}")).unwrap();
        let err = v.bump(BumpType::Patch).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidVersion(_)));
        assert_eq!(v.bump(BumpType::Minor).unwrap(), Version::new(1, 3, 0));

        let top = Version::new(u64::MAX, 0, 0);
        assert!(VersionRequest::Bump(BumpType::Major).next(top).is_err());
    }

    #[test]
    fn test_explicit_must_increase() {
        let current = Version::new(1, 2, 3);
        let next = VersionRequest::Explicit(Version::new(1, 3, 0)).next(current).unwrap();
        assert_eq!(next.tag(), "v1.3.0");

        assert!(VersionRequest::Explicit(current).next(current).is_err());
        assert!(VersionRequest::Explicit(Version::new(1, 2, 2)).next(current).is_err());
    }

    #[test]
    fn test_version_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("VERSION");
        write_version_file(&path, Version::new(0, 4, 10)).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw, "0.4.10\n");
        assert_eq!(parse_version_file(&raw, "VERSION").unwrap(), Version::new(0, 4, 10));
    }

    #[test]
    fn test_bad_version_file_names_its_source() {
        let err = parse_version_file("release-1\n", "origin/main:VERSION").unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidVersion(_)));
        assert!(err.to_string().contains("origin/main:VERSION"));
    }
}
