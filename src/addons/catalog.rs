//! Known add-ons and how each one is upgraded.

/// Namespace the cluster metadata add-on is rendered into.
pub const PUBLIC_NAMESPACE: &str = "capup-system-public";

/// Namespace of the release controller.
pub const RELEASE_NAMESPACE: &str = "release-system";

pub const METADATA: &str = "metadata/capup";
pub const KAPP_CONTROLLER: &str = "addons-management/kapp-controller";
pub const ADDONS_MANAGER: &str = "addons-management/addons-manager";
pub const RELEASE_CONTROLLER: &str = "release/release-controller";
pub const CORE_PACKAGE_REPO: &str = "addons-management/core-package-repo";
pub const MANAGEMENT_PACKAGE_REPO: &str = "packages/management-package-repo";
pub const MANAGEMENT_PACKAGE: &str = "packages/management-package";
pub const STANDARD_PACKAGE_REPO: &str = "addons-management/standard-package-repo";

/// Edition that ships without the standard package repository.
pub const COMMUNITY_EDITION: &str = "community";

/// How the rendered manifest reaches the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyMode {
    /// Applied as rendered.
    Direct,
    /// Wrapped into a ConfigMap and an `ApplyOnce` ClusterResourceSet on the
    /// management cluster.
    Declarative,
}

/// Which cluster the manifest is applied to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyTarget {
    Management,
    /// The cluster being upgraded.
    Current,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddonPolicy {
    pub name: &'static str,
    pub management_only: bool,
    pub mode: ApplyMode,
    pub target: ApplyTarget,
    /// Overrides the namespace the add-on is rendered into.
    pub namespace: Option<&'static str>,
}

const fn direct(name: &'static str, management_only: bool) -> AddonPolicy {
    AddonPolicy {
        name,
        management_only,
        mode: ApplyMode::Direct,
        target: ApplyTarget::Management,
        namespace: None,
    }
}

const POLICIES: &[AddonPolicy] = &[
    AddonPolicy {
        name: METADATA,
        management_only: false,
        mode: ApplyMode::Direct,
        target: ApplyTarget::Current,
        namespace: Some(PUBLIC_NAMESPACE),
    },
    direct(KAPP_CONTROLLER, false),
    direct(ADDONS_MANAGER, true),
    AddonPolicy {
        namespace: Some(RELEASE_NAMESPACE),
        ..direct(RELEASE_CONTROLLER, true)
    },
    direct(CORE_PACKAGE_REPO, true),
    direct(MANAGEMENT_PACKAGE_REPO, true),
    direct(MANAGEMENT_PACKAGE, true),
    AddonPolicy {
        name: STANDARD_PACKAGE_REPO,
        management_only: false,
        mode: ApplyMode::Declarative,
        target: ApplyTarget::Management,
        namespace: None,
    },
];

pub fn policy(name: &str) -> Option<&'static AddonPolicy> {
    POLICIES.iter().find(|p| p.name == name)
}

/// Add-ons that must tolerate the new version before any node rolls.
pub fn pre_node_addons(is_management: bool) -> Vec<&'static str> {
    let mut addons = vec![KAPP_CONTROLLER];
    if is_management {
        addons.extend([
            ADDONS_MANAGER,
            RELEASE_CONTROLLER,
            CORE_PACKAGE_REPO,
            MANAGEMENT_PACKAGE_REPO,
            MANAGEMENT_PACKAGE,
        ]);
    }
    addons
}

/// Add-ons applied once every node runs the new version.
pub fn post_node_addons(edition: &str) -> Vec<&'static str> {
    let mut addons = vec![METADATA];
    if edition != COMMUNITY_EDITION {
        addons.push(STANDARD_PACKAGE_REPO);
    }
    addons
}
