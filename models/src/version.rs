//! Kubernetes-style semantic versions.
//!
//! Kubernetes release strings carry a leading `v` (`v1.9.0-alpha.3`), which `semver` does not accept.
pub use semver::Version;

use snafu::ResultExt;

/// Parses a Kubernetes version string, with or without the leading `v`.
pub fn parse_kubernetes_version(version: &str) -> Result<Version, VersionParseError> {
    let trimmed = version.trim();
    let bare = trimmed.strip_prefix('v').unwrap_or(trimmed);
    Version::parse(bare).context(error::InvalidVersionSnafu {
        version: version.to_string(),
    })
}

/// Formats a version the way Kubernetes release tooling does, with the leading `v`.
pub fn kubernetes_version_string(version: &Version) -> String {
    format!("v{}", version)
}

/// Returns true if the version carries a pre-release tag (alpha, beta, rc).
pub fn is_prerelease(version: &Version) -> bool {
    !version.pre.is_empty()
}

/// Returns true if the version is a release candidate.
pub fn is_release_candidate(version: &Version) -> bool {
    version.pre.as_str().starts_with("rc")
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum VersionParseError {
        #[snafu(display("Unable to parse '{}' as a semantic version: '{}'", version, source))]
        InvalidVersion {
            version: String,
            source: semver::Error,
        },
    }
}

pub use error::VersionParseError;
