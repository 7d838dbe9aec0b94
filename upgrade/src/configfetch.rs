use crate::prompt::{require_confirmation, Confirmer};
use crate::versions::VersionGetter;
use models::cluster::ClusterClient;
use models::config::{InternalMasterConfiguration, MasterConfiguration};
use models::version::kubernetes_version_string;

use snafu::ResultExt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{event, instrument, Level};

/// Where and how to load the cluster configuration from.
#[derive(Clone, Debug, Default)]
pub struct FetchOptions {
    /// Explicit configuration file; takes precedence over the cluster-stored record.
    pub config_path: Option<PathBuf>,
    /// Proceed with defaults without asking when no configuration can be found.
    pub non_interactive: bool,
    /// Node name used when the configuration does not set one.
    pub hostname: String,
}

/// Returns this host's name as Kubernetes expects node names, lowercased.
pub fn local_hostname() -> Result<String> {
    let hostname = gethostname::gethostname().into_string().map_err(|hostname| {
        configfetch_error::Error::InvalidHostname {
            hostname: hostname.to_string_lossy().into_owned(),
        }
    })?;
    Ok(hostname.trim().to_lowercase())
}

/// Loads, defaults and validates the cluster configuration.
///
/// The configuration comes from `options.config_path` if set, otherwise from the cluster. If neither
/// exists, built-in defaults are used after the operator agrees (or silently when non-interactive).
#[instrument(skip(cluster_client, version_getter, confirmer), err)]
pub async fn fetch_configuration<T, V, C>(
    cluster_client: &T,
    version_getter: &V,
    confirmer: &mut C,
    options: &FetchOptions,
) -> Result<InternalMasterConfiguration>
where
    T: ClusterClient,
    V: VersionGetter,
    C: Confirmer + ?Sized,
{
    let external = match &options.config_path {
        Some(path) => read_config_file(path)?,
        None => match fetch_cluster_config(cluster_client).await? {
            Some(external) => external,
            None => {
                event!(
                    Level::WARN,
                    "No configuration file was given and the cluster has no stored configuration."
                );
                if !options.non_interactive {
                    require_confirmation(
                        confirmer,
                        "Proceed with the default configuration?",
                    )
                    .context(configfetch_error::ConfirmSnafu)?;
                }
                MasterConfiguration::default()
            }
        },
    };

    let mut external = external;
    external.set_defaults();
    let mut internal = external.to_internal();
    apply_dynamic_defaults(&mut internal, version_getter, &options.hostname).await?;
    internal
        .validate_config()
        .context(configfetch_error::InvalidConfigSnafu)?;
    Ok(internal)
}

fn read_config_file(path: &Path) -> Result<MasterConfiguration> {
    event!(Level::INFO, path = %path.display(), "Reading configuration from file.");
    let yaml = fs::read_to_string(path).context(configfetch_error::ReadConfigFileSnafu { path })?;
    MasterConfiguration::from_yaml(yaml).context(configfetch_error::DecodeConfigFileSnafu { path })
}

async fn fetch_cluster_config<T: ClusterClient>(
    cluster_client: &T,
) -> Result<Option<MasterConfiguration>> {
    let config_map = cluster_client
        .get_config_map()
        .await
        .context(configfetch_error::FetchClusterConfigSnafu)?;
    match config_map {
        Some(config_map) => {
            event!(Level::INFO, "Reading configuration from the cluster.");
            MasterConfiguration::from_config_map(&config_map)
                .map(Some)
                .context(configfetch_error::DecodeClusterConfigSnafu)
        }
        None => Ok(None),
    }
}

/// Fills in defaults that depend on the environment: release labels become concrete versions and
/// the node name falls back to the host name.
async fn apply_dynamic_defaults<V: VersionGetter>(
    config: &mut InternalMasterConfiguration,
    version_getter: &V,
    hostname: &str,
) -> Result<()> {
    let version = version_getter
        .version_from_label(&config.kubernetes_version)
        .await
        .context(configfetch_error::ResolveVersionSnafu {
            label: config.kubernetes_version.clone(),
        })?;
    config.kubernetes_version = kubernetes_version_string(&version);

    if config.node_name.is_empty() {
        config.node_name = hostname.to_string();
    }
    Ok(())
}

type Result<T> = std::result::Result<T, configfetch_error::Error>;

pub mod configfetch_error {
    use crate::prompt::prompt_error;
    use crate::versions::versions_error;
    use models::cluster::ClusterClientError;
    use models::config::config_error;
    use snafu::Snafu;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to read configuration file '{}': '{}'", path.display(), source))]
        ReadConfigFile {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("Unable to decode configuration file '{}': '{}'", path.display(), source))]
        DecodeConfigFile {
            path: PathBuf,
            source: config_error::Error,
        },

        #[snafu(display("Unable to fetch the cluster configuration: '{}'", source))]
        FetchClusterConfig { source: ClusterClientError },

        #[snafu(display("Unable to decode the cluster configuration: '{}'", source))]
        DecodeClusterConfig { source: config_error::Error },

        #[snafu(display("{}", source))]
        Confirm { source: prompt_error::Error },

        #[snafu(display("Unable to resolve Kubernetes version '{}': '{}'", label, source))]
        ResolveVersion {
            label: String,
            source: versions_error::Error,
        },

        #[snafu(display("{}", source))]
        InvalidConfig { source: config_error::Error },

        #[snafu(display("The host name '{}' is not valid UTF-8", hostname))]
        InvalidHostname { hostname: String },
    }

    impl Error {
        pub fn is_user_declined(&self) -> bool {
            matches!(
                self,
                Error::Confirm {
                    source: prompt_error::Error::UserDeclined
                }
            )
        }
    }
}
