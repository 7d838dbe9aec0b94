use super::error::{self, Result};
use models::component::ControlPlaneComponent;

use snafu::ResultExt;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const SCRATCH_PARENT_DIR: &str = "tmp";
const SCRATCH_PREFIX: &str = "kubeadm-upgraded-manifests";
const RENDERED_DIR: &str = "manifests";
const BACKUP_DIR: &str = "backup";

/// Locates the live static pod manifests and one upgrade's scratch directory.
///
/// The scratch directory holds the freshly rendered manifests and the backups of the live ones. It is
/// created next to the live manifest directory so moves between them are renames within one
/// filesystem, and it is removed when the `PathManager` is dropped.
pub struct PathManager {
    real_manifest_dir: PathBuf,
    scratch_dir: TempDir,
}

impl PathManager {
    pub fn new<P: AsRef<Path>>(real_manifest_dir: P) -> Result<Self> {
        let real_manifest_dir = real_manifest_dir.as_ref().to_path_buf();
        let scratch_parent = real_manifest_dir
            .parent()
            .unwrap_or(&real_manifest_dir)
            .join(SCRATCH_PARENT_DIR);
        fs::create_dir_all(&scratch_parent).context(error::CreateScratchDirSnafu {
            path: &scratch_parent,
        })?;

        let scratch_dir = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(&scratch_parent)
            .context(error::CreateScratchDirSnafu {
                path: &scratch_parent,
            })?;
        for subdir in [RENDERED_DIR, BACKUP_DIR] {
            let path = scratch_dir.path().join(subdir);
            fs::create_dir(&path).context(error::CreateScratchDirSnafu { path })?;
        }

        Ok(PathManager {
            real_manifest_dir,
            scratch_dir,
        })
    }

    pub fn real_manifest_path(&self, component: ControlPlaneComponent) -> PathBuf {
        self.real_manifest_dir.join(component.manifest_file_name())
    }

    pub fn scratch_dir(&self) -> &Path {
        self.scratch_dir.path()
    }

    pub fn rendered_manifest_path(&self, component: ControlPlaneComponent) -> PathBuf {
        self.scratch_dir
            .path()
            .join(RENDERED_DIR)
            .join(component.manifest_file_name())
    }

    pub fn backup_manifest_path(&self, component: ControlPlaneComponent) -> PathBuf {
        self.scratch_dir
            .path()
            .join(BACKUP_DIR)
            .join(component.manifest_file_name())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use models::component::ControlPlaneComponent::KubeScheduler;

    #[test]
    fn test_scratch_dir_lifecycle() {
        let root = TempDir::new().unwrap();
        let manifests = root.path().join("manifests");
        fs::create_dir(&manifests).unwrap();

        let paths = PathManager::new(&manifests).unwrap();
        let scratch = paths.scratch_dir().to_path_buf();
        assert!(scratch.starts_with(root.path().join("tmp")));
        assert_eq!(
            paths.real_manifest_path(KubeScheduler),
            manifests.join("kube-scheduler.yaml")
        );
        assert!(paths.rendered_manifest_path(KubeScheduler).parent().unwrap().is_dir());
        assert!(paths.backup_manifest_path(KubeScheduler).parent().unwrap().is_dir());

        drop(paths);
        assert!(!scratch.exists());
    }
}
