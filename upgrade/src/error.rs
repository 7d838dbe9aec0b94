use crate::configfetch::configfetch_error;
use crate::health::health_error;
use crate::policy::policy_error;
use crate::postupgrade::postupgrade_error;
use crate::prepull::prepull_error;
use crate::prompt::prompt_error;
use crate::staticpod::StaticPodError;
use crate::versions::versions_error;

use snafu::Snafu;

pub type Result<T> = std::result::Result<T, Error>;

/// Why an upgrade run stopped.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to load the cluster configuration: {}", source))]
    Config { source: configfetch_error::Error },

    #[snafu(display("The cluster is not healthy: {}", source))]
    Health { source: health_error::Error },

    #[snafu(display(
        "Upgrading a self-hosted control plane is not supported by this tool; only static pod \
         hosted control planes can be upgraded"
    ))]
    SelfHostedUnsupported,

    #[snafu(display("Unable to determine versions: {}", source))]
    Versions { source: versions_error::Error },

    #[snafu(display("Unable to resolve the target version '{}': {}", version, source))]
    TargetVersion {
        version: String,
        source: versions_error::Error,
    },

    #[snafu(display("{}", source))]
    Policy { source: policy_error::Error },

    #[snafu(display("{}", source))]
    Confirm { source: prompt_error::Error },

    #[snafu(display("Unable to pre-pull control plane images: {}", source))]
    Prepull { source: prepull_error::Error },

    #[snafu(display("Unable to upgrade the static pod control plane: {}", source))]
    StaticPod { source: StaticPodError },

    #[snafu(display("The control plane was upgraded, but {}", source))]
    PostUpgrade { source: postupgrade_error::Error },
}

impl Error {
    /// Whether the run stopped because the operator declined to continue.
    pub fn is_user_declined(&self) -> bool {
        match self {
            Error::Confirm {
                source: prompt_error::Error::UserDeclined,
            } => true,
            Error::Config { source } => source.is_user_declined(),
            _ => false,
        }
    }
}
