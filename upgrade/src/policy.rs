//! Decides whether a control-plane upgrade path is permitted.
//!
//! Violations are split into two kinds. Mandatory violations always abort the upgrade. Skippable
//! violations abort unless the operator forces the upgrade, since the path is possible but only
//! partially tested.
use models::constants::MINIMUM_CONTROL_PLANE_VERSION;
use models::version::{
    is_prerelease, is_release_candidate, kubernetes_version_string, parse_kubernetes_version,
    Version,
};

use snafu::ensure;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{event, Level};

/// Kubelet version strings reported by the cluster's nodes, mapped to the number of nodes running each.
pub type KubeletVersions = BTreeMap<String, u32>;

/// The versions involved in one upgrade.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VersionTriple {
    pub cluster: Version,
    pub tool: Version,
    pub target: Version,
}

/// Opt-ins for upgrading into pre-release builds.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PrereleaseGates {
    pub allow_experimental: bool,
    pub allow_release_candidate: bool,
}

/// Every policy violation found for an upgrade path.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VersionSkewErrors {
    pub mandatory: Vec<String>,
    pub skippable: Vec<String>,
}

impl VersionSkewErrors {
    pub fn is_empty(&self) -> bool {
        self.mandatory.is_empty() && self.skippable.is_empty()
    }

    /// Decides whether the upgrade may go ahead given these violations.
    ///
    /// Mandatory violations always fail. Skippable violations fail unless `force` is set, in which case
    /// they are logged and ignored.
    pub fn enforce(&self, force: bool) -> Result<()> {
        ensure!(
            self.mandatory.is_empty(),
            policy_error::MandatoryViolationsSnafu {
                errors: self.clone()
            }
        );
        if self.skippable.is_empty() {
            return Ok(());
        }
        ensure!(
            force,
            policy_error::SkippableViolationsSnafu {
                errors: self.clone()
            }
        );
        for violation in &self.skippable {
            event!(
                Level::WARN,
                %violation,
                "Ignoring version policy violation because the upgrade was forced."
            );
        }
        Ok(())
    }
}

impl fmt::Display for VersionSkewErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for violation in &self.mandatory {
            writeln!(f, "\t- [mandatory] {}", violation)?;
        }
        for violation in &self.skippable {
            writeln!(f, "\t- [skippable] {}", violation)?;
        }
        Ok(())
    }
}

/// Returns true if `newer` is more than one minor release ahead of `older`.
fn skips_minor_release(older: &Version, newer: &Version) -> bool {
    match newer.major.cmp(&older.major) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => newer.minor > older.minor + 1,
    }
}

fn major_minor(version: &Version) -> String {
    format!("v{}.{}", version.major, version.minor)
}

/// Evaluates every version policy rule for an upgrade path.
///
/// `kubelet_versions` is `None` when the kubelet versions could not be determined. Returns `None` if the
/// path violates no rule.
pub fn evaluate_upgrade(
    versions: &VersionTriple,
    kubelet_versions: Option<&KubeletVersions>,
    gates: PrereleaseGates,
) -> Option<VersionSkewErrors> {
    let VersionTriple {
        cluster,
        tool,
        target,
    } = versions;
    let mut errors = VersionSkewErrors::default();

    // The minimum is a compiled-in constant, but stay total rather than panic if it were malformed.
    match parse_kubernetes_version(MINIMUM_CONTROL_PLANE_VERSION) {
        Ok(minimum) if target.cmp_precedence(&minimum).is_lt() => errors.mandatory.push(format!(
            "Specified version to upgrade to {} is lower than the minimum supported version {}. \
             Please specify a higher version to upgrade to",
            kubernetes_version_string(target),
            MINIMUM_CONTROL_PLANE_VERSION
        )),
        Ok(_) => {}
        Err(err) => errors.mandatory.push(err.to_string()),
    }

    // Build metadata does not order releases.
    if target.cmp_precedence(cluster).is_lt() {
        errors.mandatory.push(format!(
            "Specified version to upgrade to {} is lower than the cluster version {}. \
             Downgrades are not supported",
            kubernetes_version_string(target),
            kubernetes_version_string(cluster)
        ));
    } else if skips_minor_release(cluster, target) {
        errors.mandatory.push(format!(
            "Specified version to upgrade to {} is too high; the cluster is at {}, and upgrades \
             may only move one minor release at a time",
            kubernetes_version_string(target),
            kubernetes_version_string(cluster)
        ));
    }

    if is_prerelease(target) {
        let permitted = if is_release_candidate(target) {
            gates.allow_release_candidate || gates.allow_experimental
        } else {
            gates.allow_experimental
        };
        if !permitted {
            let flag = if is_release_candidate(target) {
                "--allow-release-candidate-upgrades"
            } else {
                "--allow-experimental-upgrades"
            };
            errors.mandatory.push(format!(
                "Specified version to upgrade to {} is a pre-release version; pass {} to opt in",
                kubernetes_version_string(target),
                flag
            ));
        }
    }

    if skips_minor_release(tool, target) {
        errors.skippable.push(format!(
            "This version of the upgrade tool ({}) is more than one minor release behind the target \
             version {}",
            kubernetes_version_string(tool),
            kubernetes_version_string(target)
        ));
    } else if tool.cmp_precedence(target).is_lt() {
        errors.skippable.push(format!(
            "Specified version to upgrade to {} is higher than the upgrade tool version {}. \
             Upgrade the upgrade tool first",
            kubernetes_version_string(target),
            kubernetes_version_string(tool)
        ));
    }

    match kubelet_versions {
        Some(kubelet_versions) => {
            let too_old: Vec<&str> = kubelet_versions
                .keys()
                .filter(|kubelet| match parse_kubernetes_version(kubelet) {
                    Ok(kubelet) => skips_minor_release(&kubelet, target),
                    Err(_) => true,
                })
                .map(String::as_str)
                .collect();
            if !too_old.is_empty() {
                errors.skippable.push(format!(
                    "There are kubelets in this cluster that are too old for {}. Kubelets must be \
                     at least {}.{}.0 before upgrading; found {}",
                    major_minor(target),
                    target.major,
                    target.minor.saturating_sub(1),
                    too_old.join(", ")
                ));
            }
        }
        None => errors
            .skippable
            .push("Unable to fetch kubelet version information from the cluster".to_string()),
    }

    if errors.is_empty() {
        None
    } else {
        Some(errors)
    }
}

type Result<T> = std::result::Result<T, policy_error::Error>;

pub mod policy_error {
    use super::VersionSkewErrors;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display(
            "The upgrade path is not supported and cannot be forced:\n{}",
            errors
        ))]
        MandatoryViolations { errors: VersionSkewErrors },

        #[snafu(display(
            "The upgrade path is not supported; use --force to proceed anyway:\n{}",
            errors
        ))]
        SkippableViolations { errors: VersionSkewErrors },
    }
}
