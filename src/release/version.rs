//! Kubernetes version parsing, ordering and upgrade compatibility.
//!
//! Versions look like `v1.21.2+vmware.1`: a semver core followed by an
//! optional integer build number. Ordering compares the core first and the
//! build number second.

use std::cmp::Ordering;

use semver::Version;

use crate::error::{CapupError, Result};

const BUILD_SEPARATOR: &str = "+vmware.";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KubernetesVersion {
    pub core: Version,
    pub build: u64,
}

impl KubernetesVersion {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim().trim_start_matches('v');
        let (core, build) = match trimmed.split_once(BUILD_SEPARATOR) {
            Some((core, build)) => {
                let build = build
                    .parse()
                    .map_err(|_| CapupError::InvalidVersion(raw.to_string()))?;
                (core, build)
            }
            None => (trimmed, 0),
        };
        let core = Version::parse(core).map_err(|_| CapupError::InvalidVersion(raw.to_string()))?;
        Ok(Self { core, build })
    }
}

impl PartialOrd for KubernetesVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KubernetesVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.core
            .cmp_precedence(&other.core)
            .then(self.build.cmp(&other.build))
    }
}

/// Compare two version strings.
pub fn compare_versions(a: &str, b: &str) -> Result<Ordering> {
    Ok(KubernetesVersion::parse(a)?.cmp(&KubernetesVersion::parse(b)?))
}

/// Same major, and the minor moves forward by at most one. Within the same
/// minor the patch must not go backwards.
pub fn is_upgrade_compatible(from: &KubernetesVersion, to: &KubernetesVersion) -> bool {
    if from.core.major != to.core.major {
        return false;
    }
    match to.core.minor.checked_sub(from.core.minor) {
        Some(0) => to.core.patch >= from.core.patch,
        Some(1) => true,
        _ => false,
    }
}

/// Reject downgrades and unsupported upgrade paths before anything is mutated.
pub fn verify_upgrade(current: &str, target: &str) -> Result<()> {
    let from = KubernetesVersion::parse(current)?;
    let to = KubernetesVersion::parse(target)?;
    if to < from {
        return Err(CapupError::Precondition(format!(
            "attempted to upgrade kubernetes from {current} to {target}: downgrade is not allowed"
        )));
    }
    if !is_upgrade_compatible(&from, &to) {
        return Err(CapupError::Precondition(format!(
            "upgrading kubernetes from {current} to {target} is not supported"
        )));
    }
    Ok(())
}

/// Version with `.` and `+` replaced so it fits in an object name.
pub fn sanitize_version(version: &str) -> String {
    version.replace(['.', '+'], "-")
}
