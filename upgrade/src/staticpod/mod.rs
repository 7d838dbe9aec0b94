//! Upgrades a static pod-hosted control plane in place.
//!
//! Components are upgraded one at a time in canonical order. For each one the live manifest is backed
//! up, the upgraded manifest is moved into place, and the upgrade waits for the kubelet to restart the
//! component. Any failure restores every manifest touched so far.
mod error;
mod paths;
mod renderer;

pub use self::error::{Error as StaticPodError, RestoreFailure, RestoreFailures};
pub use self::paths::PathManager;
pub use self::renderer::{ImageRewriteRenderer, ManifestRenderer};

#[cfg(test)]
pub use self::renderer::MockManifestRenderer;

use self::error::Result;
use crate::waiter::Waiter;
use models::component::{ControlPlaneComponent, CONTROL_PLANE_COMPONENTS};
use models::config::InternalMasterConfiguration;

use snafu::ResultExt;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{event, instrument, Level};

/// The rollback journal: the backup location of every component whose live manifest may have been
/// touched.
pub type RecoverManifests = BTreeMap<ControlPlaneComponent, PathBuf>;

type ManifestHashes = BTreeMap<ControlPlaneComponent, Option<String>>;

pub struct StaticPodUpgrader<W: Waiter, R: ManifestRenderer> {
    waiter: W,
    renderer: R,
}

impl<W: Waiter, R: ManifestRenderer> StaticPodUpgrader<W, R> {
    pub fn new(waiter: W, renderer: R) -> Self {
        StaticPodUpgrader { waiter, renderer }
    }

    /// Renders every upgraded manifest without touching the live ones, returning their contents.
    #[instrument(skip(self, config), err)]
    pub fn render_manifests(
        &self,
        config: &InternalMasterConfiguration,
        manifests_dir: &Path,
    ) -> Result<BTreeMap<ControlPlaneComponent, String>> {
        let paths = PathManager::new(manifests_dir)?;
        self.render_all(config, &paths)?;

        let mut rendered = BTreeMap::new();
        for component in CONTROL_PLANE_COMPONENTS {
            let path = paths.rendered_manifest_path(component);
            let manifest = fs::read_to_string(&path)
                .context(error::ReadManifestSnafu { component, path })?;
            rendered.insert(component, manifest);
        }
        Ok(rendered)
    }

    /// Upgrades every control-plane component to the version in `config`.
    ///
    /// On failure every touched manifest is restored, and the returned error describes both the failure
    /// and any manifest that could not be restored.
    #[instrument(skip(self, config), fields(version = %config.kubernetes_version), err)]
    pub async fn upgrade(
        &self,
        config: &InternalMasterConfiguration,
        manifests_dir: &Path,
    ) -> Result<()> {
        // Dropping `paths` removes the scratch directory on every return path.
        let paths = PathManager::new(manifests_dir)?;

        let mut before = ManifestHashes::new();
        for component in CONTROL_PLANE_COMPONENTS {
            let hash = self
                .waiter
                .static_pod_hash(&config.node_name, component)
                .await
                .context(error::ReadHashSnafu { component })?;
            before.insert(component, hash);
        }

        // Nothing live has been touched yet, so a rendering failure needs no rollback.
        self.render_all(config, &paths)?;

        let mut recover = RecoverManifests::new();
        match self
            .upgrade_components(config, &paths, &before, &mut recover)
            .await
        {
            Ok(()) => {
                event!(Level::INFO, "All control plane components were upgraded.");
                Ok(())
            }
            Err(err) => Err(rollback(err, &recover, &paths)),
        }
    }

    fn render_all(&self, config: &InternalMasterConfiguration, paths: &PathManager) -> Result<()> {
        for component in CONTROL_PLANE_COMPONENTS {
            self.renderer.render(
                component,
                config,
                &paths.real_manifest_path(component),
                &paths.rendered_manifest_path(component),
            )?;
        }
        Ok(())
    }

    async fn upgrade_components(
        &self,
        config: &InternalMasterConfiguration,
        paths: &PathManager,
        before: &ManifestHashes,
        recover: &mut RecoverManifests,
    ) -> Result<()> {
        for component in CONTROL_PLANE_COMPONENTS {
            let previous_hash = before.get(&component).cloned().flatten();
            self.upgrade_component(component, config, paths, previous_hash, recover)
                .await?;
        }
        Ok(())
    }

    async fn upgrade_component(
        &self,
        component: ControlPlaneComponent,
        config: &InternalMasterConfiguration,
        paths: &PathManager,
        previous_hash: Option<String>,
        recover: &mut RecoverManifests,
    ) -> Result<()> {
        event!(Level::INFO, %component, "Upgrading component.");
        let live = paths.real_manifest_path(component);
        let backup = paths.backup_manifest_path(component);

        // Journal first: a failure at any later step must be able to find the backup.
        recover.insert(component, backup.clone());

        fs::rename(&live, &backup).context(error::BackupManifestSnafu {
            component,
            path: &backup,
        })?;
        fs::rename(paths.rendered_manifest_path(component), &live).context(
            error::InstallManifestSnafu {
                component,
                path: &live,
            },
        )?;

        self.waiter
            .wait_for_static_pod_hash_change(&config.node_name, component, previous_hash)
            .await
            .context(error::HashChangeSnafu { component })?;
        self.waiter
            .wait_for_pods_with_label(&component.label_selector())
            .await
            .context(error::PodRunningSnafu { component })?;

        event!(Level::INFO, %component, "Component upgraded.");
        Ok(())
    }
}

/// Restores every journaled manifest and folds any restore failures into the triggering error.
fn rollback(cause: StaticPodError, recover: &RecoverManifests, paths: &PathManager) -> StaticPodError {
    event!(Level::ERROR, error = %cause, "Upgrade failed, rolling back.");

    let mut failures = Vec::new();
    for (&component, backup_path) in recover {
        // The failure may have happened before this component's live manifest was moved.
        if !backup_path.exists() {
            continue;
        }
        if let Err(source) = fs::rename(backup_path, paths.real_manifest_path(component)) {
            event!(Level::ERROR, %component, error = %source, "Unable to restore manifest.");
            failures.push(RestoreFailure {
                component,
                backup_path: backup_path.clone(),
                source,
            });
        } else {
            event!(Level::INFO, %component, "Restored manifest.");
        }
    }

    if failures.is_empty() {
        StaticPodError::RolledBack {
            source: Box::new(cause),
        }
    } else {
        StaticPodError::RollbackFailed {
            source: Box::new(cause),
            failures: RestoreFailures(failures),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::waiter::{waiter_error, MockWaiter};
    use models::config::MasterConfiguration;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;
    use ControlPlaneComponent::*;

    /// Writes "<component> <version>" as the rendered manifest.
    struct FakeRenderer;

    impl ManifestRenderer for FakeRenderer {
        fn render(
            &self,
            component: ControlPlaneComponent,
            config: &InternalMasterConfiguration,
            _live: &Path,
            output: &Path,
        ) -> Result<()> {
            fs::write(
                output,
                format!("{} {}\n", component, config.kubernetes_version),
            )
            .context(error::WriteManifestSnafu {
                component,
                path: output,
            })
        }
    }

    struct Fixture {
        root: TempDir,
        manifests: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let root = TempDir::new().unwrap();
            let manifests = root.path().join("manifests");
            fs::create_dir(&manifests).unwrap();
            for component in CONTROL_PLANE_COMPONENTS {
                fs::write(
                    manifests.join(component.manifest_file_name()),
                    Self::original(component),
                )
                .unwrap();
            }
            Fixture { root, manifests }
        }

        fn original(component: ControlPlaneComponent) -> String {
            format!("{} v1.7.3\n", component)
        }

        fn live(&self, component: ControlPlaneComponent) -> String {
            fs::read_to_string(self.manifests.join(component.manifest_file_name())).unwrap()
        }

        fn scratch_entries(&self) -> usize {
            fs::read_dir(self.root.path().join("tmp")).unwrap().count()
        }
    }

    fn config() -> InternalMasterConfiguration {
        let mut config = MasterConfiguration::default().to_internal();
        config.kubernetes_version = "v1.7.5".to_string();
        config.node_name = "master-0".to_string();
        config
    }

    fn timeout() -> waiter_error::Error {
        waiter_error::Error::Timeout {
            condition: "test".to_string(),
            timeout: Duration::from_secs(60),
        }
    }

    /// A waiter whose hash-change wait fails for `failing`, recording the components it saw.
    fn waiter(
        failing: Option<ControlPlaneComponent>,
        seen: Arc<Mutex<Vec<ControlPlaneComponent>>>,
    ) -> MockWaiter {
        let mut waiter = MockWaiter::new();
        waiter
            .expect_static_pod_hash()
            .returning(|_, component| Ok(Some(format!("{}-before", component))));
        waiter
            .expect_wait_for_static_pod_hash_change()
            .returning(move |_, component, previous| {
                assert_eq!(previous, Some(format!("{}-before", component)));
                seen.lock().unwrap().push(component);
                if Some(component) == failing {
                    Err(timeout())
                } else {
                    Ok(())
                }
            });
        waiter
            .expect_wait_for_pods_with_label()
            .returning(|_| Ok(()));
        waiter
    }

    #[tokio::test]
    async fn test_successful_upgrade() {
        let fixture = Fixture::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let upgrader = StaticPodUpgrader::new(waiter(None, seen.clone()), FakeRenderer);

        upgrader.upgrade(&config(), &fixture.manifests).await.unwrap();

        for component in CONTROL_PLANE_COMPONENTS {
            assert_eq!(fixture.live(component), format!("{} v1.7.5\n", component));
        }
        assert_eq!(
            *seen.lock().unwrap(),
            vec![KubeApiServer, KubeControllerManager, KubeScheduler]
        );
        assert_eq!(fixture.scratch_entries(), 0);
    }

    #[tokio::test]
    async fn test_rollback_restores_every_touched_manifest() {
        let fixture = Fixture::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        // The first two components swap fine; the third never comes back.
        let upgrader = StaticPodUpgrader::new(waiter(Some(KubeScheduler), seen), FakeRenderer);

        let result = upgrader.upgrade(&config(), &fixture.manifests).await;

        match result {
            Err(StaticPodError::RolledBack { source }) => {
                assert!(matches!(
                    *source,
                    StaticPodError::HashChange {
                        component: KubeScheduler,
                        ..
                    }
                ))
            }
            other => panic!("unexpected result: {:?}", other),
        }
        for component in CONTROL_PLANE_COMPONENTS {
            assert_eq!(fixture.live(component), Fixture::original(component));
        }
        assert_eq!(fixture.scratch_entries(), 0);
    }

    #[tokio::test]
    async fn test_recover_map_tracks_touched_components() {
        for (index, &failing) in CONTROL_PLANE_COMPONENTS.iter().enumerate() {
            let fixture = Fixture::new();
            let seen = Arc::new(Mutex::new(Vec::new()));
            let upgrader = StaticPodUpgrader::new(waiter(Some(failing), seen), FakeRenderer);
            let config = config();

            let paths = PathManager::new(&fixture.manifests).unwrap();
            upgrader.render_all(&config, &paths).unwrap();

            let mut recover = RecoverManifests::new();
            assert!(upgrader
                .upgrade_components(&config, &paths, &before_hashes(), &mut recover)
                .await
                .is_err());

            let touched: Vec<ControlPlaneComponent> = recover.keys().copied().collect();
            assert_eq!(touched, CONTROL_PLANE_COMPONENTS[..=index].to_vec());
            for (component, backup) in &recover {
                assert_eq!(*backup, paths.backup_manifest_path(*component));
                assert!(backup.exists());
            }
        }
    }

    #[tokio::test]
    async fn test_failed_backup_is_not_restored() {
        let fixture = Fixture::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let upgrader = StaticPodUpgrader::new(waiter(None, seen), FakeRenderer);
        let config = config();

        let paths = PathManager::new(&fixture.manifests).unwrap();
        upgrader.render_all(&config, &paths).unwrap();
        // The controller manager's manifest vanishes after rendering, so its backup move fails.
        fs::remove_file(paths.real_manifest_path(KubeControllerManager)).unwrap();

        let mut recover = RecoverManifests::new();
        let err = upgrader
            .upgrade_components(&config, &paths, &before_hashes(), &mut recover)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StaticPodError::BackupManifest {
                component: KubeControllerManager,
                ..
            }
        ));
        assert!(recover.contains_key(&KubeControllerManager));

        let err = rollback(err, &recover, &paths);
        assert!(matches!(err, StaticPodError::RolledBack { .. }), "{:?}", err);
        assert_eq!(fixture.live(KubeApiServer), Fixture::original(KubeApiServer));
        assert!(!paths.real_manifest_path(KubeControllerManager).exists());
    }

    #[tokio::test]
    async fn test_render_failure_touches_nothing() {
        let fixture = Fixture::new();
        let mut renderer = MockManifestRenderer::new();
        renderer
            .expect_render()
            .times(2)
            .returning(|component, _, _, output| {
                if component == KubeControllerManager {
                    return Err(StaticPodError::MissingPodSpec { component });
                }
                fs::write(output, "rendered").unwrap();
                Ok(())
            });
        let mut waiter = MockWaiter::new();
        waiter
            .expect_static_pod_hash()
            .returning(|_, _| Ok(None));
        waiter.expect_wait_for_static_pod_hash_change().times(0);
        let upgrader = StaticPodUpgrader::new(waiter, renderer);

        let result = upgrader.upgrade(&config(), &fixture.manifests).await;

        assert!(matches!(
            result,
            Err(StaticPodError::MissingPodSpec {
                component: KubeControllerManager
            })
        ));
        for component in CONTROL_PLANE_COMPONENTS {
            assert_eq!(fixture.live(component), Fixture::original(component));
        }
        assert_eq!(fixture.scratch_entries(), 0);
    }

    fn before_hashes() -> ManifestHashes {
        CONTROL_PLANE_COMPONENTS
            .iter()
            .map(|&component| (component, Some(format!("{}-before", component))))
            .collect()
    }

    #[tokio::test]
    async fn test_rollback_failures_are_all_reported() {
        let fixture = Fixture::new();
        let paths = PathManager::new(&fixture.manifests).unwrap();

        let mut recover = RecoverManifests::new();
        for component in [KubeApiServer, KubeControllerManager] {
            let backup = paths.backup_manifest_path(component);
            fs::write(&backup, Fixture::original(component)).unwrap();
            recover.insert(component, backup);
        }
        // Make both live paths impossible to rename onto by turning them into non-empty directories.
        for component in [KubeApiServer, KubeControllerManager] {
            let live = paths.real_manifest_path(component);
            fs::remove_file(&live).unwrap();
            fs::create_dir(&live).unwrap();
            fs::write(live.join("blocker"), "").unwrap();
        }

        let err = rollback(timeout_error(), &recover, &paths);
        match err {
            StaticPodError::RollbackFailed { failures, source } => {
                let components: Vec<ControlPlaneComponent> =
                    failures.0.iter().map(|failure| failure.component).collect();
                assert_eq!(components, vec![KubeApiServer, KubeControllerManager]);
                assert!(matches!(*source, StaticPodError::HashChange { .. }));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    fn timeout_error() -> StaticPodError {
        StaticPodError::HashChange {
            component: KubeApiServer,
            source: timeout(),
        }
    }
}
