use crate::policy::KubeletVersions;
use models::cluster::ClusterClient;
use models::constants::TOOL_VERSION;
use models::version::{parse_kubernetes_version, Version};

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use snafu::{ensure, ResultExt};
use std::time::Duration;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::{event, instrument, Level};

#[cfg(test)]
use mockall::mock;

/// Base URL of the Kubernetes release channel files, e.g. `<base>/stable-1.8.txt`.
pub const DEFAULT_RELEASE_URL: &str = "https://dl.k8s.io/release";

// Release lookups use exponential backoff.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(10);
const NUM_RETRIES: usize = 5;
const RELEASE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

lazy_static! {
    static ref RELEASE_LABEL: Regex = Regex::new(r"^(stable|latest)(-[0-9]+(\.[0-9]+)?)?$").unwrap();
}

fn retry_strategy() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(RETRY_BASE_DELAY.as_millis() as u64)
        .max_delay(RETRY_MAX_DELAY)
        .map(jitter)
        .take(NUM_RETRIES)
}

/// Resolves the versions an upgrade needs to reason about.
#[async_trait]
pub trait VersionGetter: Send + Sync {
    /// The version the control plane currently runs.
    async fn cluster_version(&self) -> Result<Version>;
    /// The version of this upgrade tool.
    async fn tool_version(&self) -> Result<Version>;
    /// Resolves either a literal version or a release label such as `stable` or `stable-1.8`.
    async fn version_from_label(&self, label: &str) -> Result<Version>;
    /// The kubelet versions running in the cluster and how many nodes run each.
    async fn kubelet_versions(&self) -> Result<KubeletVersions>;
}

#[cfg(test)]
mock! {
    /// A Mock VersionGetter for use in tests.
    pub VersionGetter {}
    #[async_trait]
    impl VersionGetter for VersionGetter {
        async fn cluster_version(&self) -> Result<Version>;
        async fn tool_version(&self) -> Result<Version>;
        async fn version_from_label(&self, label: &str) -> Result<Version>;
        async fn kubelet_versions(&self) -> Result<KubeletVersions>;
    }
}

/// A `VersionGetter` backed by the cluster and the public Kubernetes release channels.
pub struct KubeVersionGetter<T: ClusterClient> {
    cluster_client: T,
    http_client: reqwest::Client,
    release_url: String,
}

impl<T: ClusterClient> KubeVersionGetter<T> {
    pub fn new(cluster_client: T) -> Self {
        Self::with_release_url(cluster_client, DEFAULT_RELEASE_URL)
    }

    pub fn with_release_url<S: Into<String>>(cluster_client: T, release_url: S) -> Self {
        KubeVersionGetter {
            cluster_client,
            http_client: reqwest::Client::new(),
            release_url: release_url.into(),
        }
    }

    async fn fetch_release(&self, label: &str) -> Result<String> {
        let url = format!("{}/{}.txt", self.release_url.trim_end_matches('/'), label);
        Retry::spawn(retry_strategy(), || async {
            let response = self
                .http_client
                .get(&url)
                .timeout(RELEASE_REQUEST_TIMEOUT)
                .send()
                .await
                .and_then(|response| response.error_for_status())
                .context(versions_error::FetchReleaseSnafu { url: url.clone() })?;
            response
                .text()
                .await
                .context(versions_error::FetchReleaseSnafu { url: url.clone() })
        })
        .await
    }
}

#[async_trait]
impl<T: ClusterClient> VersionGetter for KubeVersionGetter<T> {
    #[instrument(skip(self), err)]
    async fn cluster_version(&self) -> Result<Version> {
        let git_version = self
            .cluster_client
            .server_version()
            .await
            .context(versions_error::ClusterVersionSnafu)?;
        parse_kubernetes_version(&git_version).context(versions_error::ParseVersionSnafu)
    }

    async fn tool_version(&self) -> Result<Version> {
        parse_kubernetes_version(TOOL_VERSION).context(versions_error::ParseVersionSnafu)
    }

    #[instrument(skip(self), err)]
    async fn version_from_label(&self, label: &str) -> Result<Version> {
        if let Ok(version) = parse_kubernetes_version(label) {
            return Ok(version);
        }
        ensure!(
            RELEASE_LABEL.is_match(label),
            versions_error::InvalidLabelSnafu { label }
        );

        let body = self.fetch_release(label).await?;
        let version = parse_kubernetes_version(&body).context(versions_error::ParseVersionSnafu)?;
        event!(Level::INFO, %label, %version, "Resolved release label.");
        Ok(version)
    }

    #[instrument(skip(self), err)]
    async fn kubelet_versions(&self) -> Result<KubeletVersions> {
        let nodes = self
            .cluster_client
            .list_nodes()
            .await
            .context(versions_error::KubeletVersionsSnafu)?;

        let mut versions = KubeletVersions::new();
        for node in nodes {
            let kubelet_version = node
                .status
                .and_then(|status| status.node_info)
                .map(|info| info.kubelet_version);
            match kubelet_version {
                Some(kubelet_version) => *versions.entry(kubelet_version).or_insert(0) += 1,
                None => event!(
                    Level::WARN,
                    node = ?node.metadata.name,
                    "Node does not report a kubelet version."
                ),
            }
        }
        Ok(versions)
    }
}

type Result<T> = std::result::Result<T, versions_error::Error>;

pub mod versions_error {
    use models::cluster::ClusterClientError;
    use models::version::VersionParseError;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to get the cluster version: '{}'", source))]
        ClusterVersion { source: ClusterClientError },

        #[snafu(display("Unable to get kubelet versions: '{}'", source))]
        KubeletVersions { source: ClusterClientError },

        #[snafu(display("'{}' is neither a version nor a release label", label))]
        InvalidLabel { label: String },

        #[snafu(display("Unable to fetch release version from '{}': '{}'", url, source))]
        FetchRelease { url: String, source: reqwest::Error },

        #[snafu(display("{}", source))]
        ParseVersion { source: VersionParseError },
    }
}
