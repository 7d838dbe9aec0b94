use models::component::ControlPlaneComponent;

use crate::waiter::waiter_error;
use snafu::Snafu;
use std::fmt;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// A component whose live manifest could not be put back during rollback.
#[derive(Debug)]
pub struct RestoreFailure {
    pub component: ControlPlaneComponent,
    pub backup_path: PathBuf,
    pub source: std::io::Error,
}

/// Every restore failure of one rollback.
#[derive(Debug, Default)]
pub struct RestoreFailures(pub Vec<RestoreFailure>);

impl fmt::Display for RestoreFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failures: Vec<String> = self
            .0
            .iter()
            .map(|failure| {
                format!(
                    "{} (backup at '{}'): {}",
                    failure.component,
                    failure.backup_path.display(),
                    failure.source
                )
            })
            .collect();
        write!(f, "{}", failures.join("; "))
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to create scratch directory '{}': '{}'", path.display(), source))]
    CreateScratchDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Unable to read the current {} manifest hash: '{}'", component, source))]
    ReadHash {
        component: ControlPlaneComponent,
        source: waiter_error::Error,
    },

    #[snafu(display("Unable to read {} manifest '{}': '{}'", component, path.display(), source))]
    ReadManifest {
        component: ControlPlaneComponent,
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Unable to decode {} manifest '{}': '{}'", component, path.display(), source))]
    DecodeManifest {
        component: ControlPlaneComponent,
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[snafu(display("The {} manifest has no pod spec", component))]
    MissingPodSpec { component: ControlPlaneComponent },

    #[snafu(display("The {} manifest has no {} container to upgrade", component, component))]
    MissingContainer { component: ControlPlaneComponent },

    #[snafu(display("Unable to encode the upgraded {} manifest: '{}'", component, source))]
    EncodeManifest {
        component: ControlPlaneComponent,
        source: serde_yaml::Error,
    },

    #[snafu(display("Unable to write {} manifest '{}': '{}'", component, path.display(), source))]
    WriteManifest {
        component: ControlPlaneComponent,
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display(
        "Unable to back up the {} manifest to '{}': '{}'",
        component,
        path.display(),
        source
    ))]
    BackupManifest {
        component: ControlPlaneComponent,
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display(
        "Unable to move the upgraded {} manifest into '{}': '{}'",
        component,
        path.display(),
        source
    ))]
    InstallManifest {
        component: ControlPlaneComponent,
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("The kubelet did not pick up the new {} manifest: '{}'", component, source))]
    HashChange {
        component: ControlPlaneComponent,
        source: waiter_error::Error,
    },

    #[snafu(display("The upgraded {} pod did not start: '{}'", component, source))]
    PodRunning {
        component: ControlPlaneComponent,
        source: waiter_error::Error,
    },

    #[snafu(display(
        "The upgrade failed and all touched manifests were restored: '{}'",
        source
    ))]
    RolledBack { source: Box<Error> },

    #[snafu(display(
        "The upgrade failed: '{}'. Rollback could not restore these manifests, which need manual \
         intervention: {}",
        source,
        failures
    ))]
    RollbackFailed {
        source: Box<Error>,
        failures: RestoreFailures,
    },
}
