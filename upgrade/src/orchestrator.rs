//! Sequences a whole control-plane upgrade.
//!
//! `apply` runs: configuration, cluster health, version policy, confirmation, image pre-pull, static
//! pod upgrade, post-upgrade tasks. The first failing step ends the run; nothing is retried here.
use crate::configfetch::{fetch_configuration, FetchOptions};
use crate::error::{self, Result};
use crate::health::{ClusterHealthChecker, HostingType};
use crate::policy::{
    evaluate_upgrade, KubeletVersions, PrereleaseGates, VersionSkewErrors, VersionTriple,
};
use crate::postupgrade::{run_post_upgrade_tasks, PostUpgradeTask};
use crate::prepull::{prepull_images_in_parallel, Prepuller, TimeoutCleanupPolicy};
use crate::prompt::{prompt_error, require_confirmation, Confirmer};
use crate::staticpod::{ManifestRenderer, StaticPodUpgrader};
use crate::versions::VersionGetter;
use crate::waiter::Waiter;
use models::cluster::ClusterClient;
use models::component::{ControlPlaneComponent, CONTROL_PLANE_COMPONENTS};
use models::config::InternalMasterConfiguration;
use models::version::{is_prerelease, is_release_candidate, kubernetes_version_string, Version};

use snafu::{ensure, ResultExt};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tabled::settings::Style;
use tabled::{Table, Tabled};
use tracing::{event, instrument, Level};

/// Options for `upgrade apply`.
#[derive(Clone, Debug)]
pub struct ApplyOptions {
    /// The version or release label to upgrade to.
    pub version: String,
    pub assume_yes: bool,
    pub force: bool,
    pub dry_run: bool,
    pub pull_timeout: Duration,
    pub gates: PrereleaseGates,
    pub config_path: Option<PathBuf>,
    pub manifests_dir: PathBuf,
    pub prepull_cleanup_policy: TimeoutCleanupPolicy,
    pub skip_prepull: bool,
}

impl ApplyOptions {
    /// Dry runs and forced upgrades never stop to ask.
    fn non_interactive(&self) -> bool {
        self.assume_yes || self.force || self.dry_run
    }
}

/// Options for `upgrade plan`.
#[derive(Clone, Debug)]
pub struct PlanOptions {
    pub gates: PrereleaseGates,
    pub config_path: Option<PathBuf>,
    pub manifests_dir: PathBuf,
}

/// What a successful `apply` did.
#[derive(Debug)]
pub enum ApplyOutcome {
    Upgraded { from: Version, to: Version },
    /// The manifests that would have been installed.
    DryRun {
        target: Version,
        manifests: BTreeMap<ControlPlaneComponent, String>,
    },
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upgraded { from, to } => write!(
                f,
                "[upgrade/successful] SUCCESS! Your cluster was upgraded from \"{}\" to \"{}\". Enjoy!",
                kubernetes_version_string(from),
                kubernetes_version_string(to)
            ),
            Self::DryRun { target, manifests } => {
                writeln!(
                    f,
                    "[dryrun] Would upgrade the control plane to \"{}\" with these manifests:",
                    kubernetes_version_string(target)
                )?;
                for (component, manifest) in manifests {
                    writeln!(f, "[dryrun] {}:", component.manifest_file_name())?;
                    for line in manifest.lines() {
                        writeln!(f, "\t{}", line)?;
                    }
                }
                Ok(())
            }
        }
    }
}

/// One upgrade target offered by `plan`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AvailableUpgrade {
    pub description: String,
    pub target: Version,
    /// Policy violations `apply` would report for this target.
    pub violations: Option<VersionSkewErrors>,
}

/// The result of `upgrade plan`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UpgradePlan {
    pub cluster: Version,
    pub tool: Version,
    pub kubelet_versions: Option<KubeletVersions>,
    pub upgrades: Vec<AvailableUpgrade>,
}

impl fmt::Display for UpgradePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cluster = kubernetes_version_string(&self.cluster);
        writeln!(f, "[upgrade/versions] Cluster version: {}", cluster)?;
        writeln!(
            f,
            "[upgrade/versions] kubeadm-upgrade version: {}",
            kubernetes_version_string(&self.tool)
        )?;

        if self.upgrades.is_empty() {
            return writeln!(f, "\nAwesome, you're up-to-date! Enjoy!");
        }

        for upgrade in &self.upgrades {
            let target = kubernetes_version_string(&upgrade.target);
            writeln!(f, "\n{}:\n", upgrade.description)?;
            let mut table = Table::new(self.component_rows(&cluster, &target));
            table.with(Style::blank());
            writeln!(f, "{}", table)?;
            if let Some(violations) = &upgrade.violations {
                writeln!(f, "\nThis upgrade would violate the version policy:")?;
                write!(f, "{}", violations)?;
            }
            writeln!(
                f,
                "\nYou can now apply the upgrade by executing the following command:\n\n\tkubeadm-upgrade apply --version {}",
                target
            )?;
        }
        Ok(())
    }
}

/// Row of the per-target component table printed by `upgrade plan`.
#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "COMPONENT")]
    component: String,
    #[tabled(rename = "CURRENT")]
    current: String,
    #[tabled(rename = "AVAILABLE")]
    available: String,
}

impl UpgradePlan {
    fn component_rows(&self, cluster: &str, target: &str) -> Vec<ComponentRow> {
        let row = |component: &str, current: String| ComponentRow {
            component: component.to_string(),
            current,
            available: target.to_string(),
        };
        let mut rows: Vec<ComponentRow> = match &self.kubelet_versions {
            Some(kubelet_versions) => kubelet_versions
                .iter()
                .map(|(version, count)| row("kubelet", format!("{} x {}", count, version)))
                .collect(),
            None => vec![row("kubelet", "unknown".to_string())],
        };
        rows.extend(
            CONTROL_PLANE_COMPONENTS
                .iter()
                .map(|component| row(component.name(), cluster.to_string())),
        );
        rows
    }
}

/// Never agrees; used where no prompt may be shown.
struct NoConfirmation;

impl Confirmer for NoConfirmation {
    fn confirm(&mut self, _question: &str) -> std::result::Result<bool, prompt_error::Error> {
        Ok(false)
    }
}

pub struct UpgradeOrchestrator<T, V, P, W, R>
where
    T: ClusterClient,
    V: VersionGetter,
    P: Prepuller + 'static,
    W: Waiter,
    R: ManifestRenderer,
{
    cluster_client: T,
    version_getter: V,
    prepuller: Arc<P>,
    static_pod_upgrader: StaticPodUpgrader<W, R>,
    post_upgrade_tasks: Vec<Box<dyn PostUpgradeTask>>,
    hostname: String,
}

impl<T, V, P, W, R> UpgradeOrchestrator<T, V, P, W, R>
where
    T: ClusterClient,
    V: VersionGetter,
    P: Prepuller + 'static,
    W: Waiter,
    R: ManifestRenderer,
{
    pub fn new(
        cluster_client: T,
        version_getter: V,
        prepuller: Arc<P>,
        static_pod_upgrader: StaticPodUpgrader<W, R>,
        post_upgrade_tasks: Vec<Box<dyn PostUpgradeTask>>,
        hostname: String,
    ) -> Self {
        UpgradeOrchestrator {
            cluster_client,
            version_getter,
            prepuller,
            static_pod_upgrader,
            post_upgrade_tasks,
            hostname,
        }
    }

    /// Upgrades the control plane to `options.version`.
    #[instrument(skip(self, confirmer), err)]
    pub async fn apply<C: Confirmer + ?Sized>(
        &self,
        options: &ApplyOptions,
        confirmer: &mut C,
    ) -> Result<ApplyOutcome> {
        let mut config = self
            .load_config(options.config_path.clone(), options.non_interactive(), confirmer)
            .await?;
        self.verify_static_pod_hosted(&options.manifests_dir).await?;

        let target = self
            .version_getter
            .version_from_label(&options.version)
            .await
            .context(error::TargetVersionSnafu {
                version: &options.version,
            })?;
        let (versions, kubelet_versions) = self.current_versions(target).await?;
        event!(
            Level::INFO,
            cluster = %versions.cluster,
            tool = %versions.tool,
            target = %versions.target,
            "Resolved upgrade versions."
        );
        if let Some(violations) =
            evaluate_upgrade(&versions, kubelet_versions.as_ref(), options.gates)
        {
            violations
                .enforce(options.force)
                .context(error::PolicySnafu)?;
        }

        let target_string = kubernetes_version_string(&versions.target);
        config.kubernetes_version = target_string.clone();

        if !options.non_interactive() {
            require_confirmation(
                confirmer,
                &format!(
                    "Are you sure you want to proceed with the upgrade to {}?",
                    target_string
                ),
            )
            .context(error::ConfirmSnafu)?;
        }

        if options.dry_run {
            let manifests = self
                .static_pod_upgrader
                .render_manifests(&config, &options.manifests_dir)
                .context(error::StaticPodSnafu)?;
            return Ok(ApplyOutcome::DryRun {
                target: versions.target,
                manifests,
            });
        }

        if options.skip_prepull {
            event!(Level::WARN, "Skipping image pre-pull.");
        } else {
            prepull_images_in_parallel(
                self.prepuller.clone(),
                &config.image_repository,
                &target_string,
                options.pull_timeout,
                options.prepull_cleanup_policy,
            )
            .await
            .context(error::PrepullSnafu)?;
        }

        self.static_pod_upgrader
            .upgrade(&config, &options.manifests_dir)
            .await
            .context(error::StaticPodSnafu)?;

        run_post_upgrade_tasks(&self.post_upgrade_tasks, &config)
            .await
            .context(error::PostUpgradeSnafu)?;

        Ok(ApplyOutcome::Upgraded {
            from: versions.cluster,
            to: versions.target,
        })
    }

    /// Lists the versions the cluster could be upgraded to. Changes nothing.
    #[instrument(skip(self), err)]
    pub async fn plan(&self, options: &PlanOptions) -> Result<UpgradePlan> {
        self.load_config(options.config_path.clone(), true, &mut NoConfirmation)
            .await?;
        self.verify_static_pod_hosted(&options.manifests_dir).await?;

        let cluster = self.cluster_version().await?;
        let (tool, kubelet_versions) = self.tool_and_kubelet_versions().await?;
        let mut upgrades = Vec::new();
        let mut offer = |description: String, target: Version| {
            let versions = VersionTriple {
                cluster: cluster.clone(),
                tool: tool.clone(),
                target: target.clone(),
            };
            let violations = evaluate_upgrade(&versions, kubelet_versions.as_ref(), options.gates);
            upgrades.push(AvailableUpgrade {
                description,
                target,
                violations,
            });
        };

        let patch = self
            .resolve_label(&format!("stable-{}.{}", cluster.major, cluster.minor))
            .await?;
        if patch.cmp_precedence(&cluster).is_gt() {
            offer(
                format!(
                    "Upgrade to the latest version in the v{}.{} series",
                    cluster.major, cluster.minor
                ),
                patch.clone(),
            );
        }

        let stable = self.resolve_label("stable").await?;
        let new_minor = (stable.major, stable.minor) > (cluster.major, cluster.minor);
        if stable.cmp_precedence(&cluster).is_gt() && new_minor {
            offer("Upgrade to the latest stable version".to_string(), stable.clone());
        }

        let experimental = if options.gates.allow_experimental {
            Some(self.resolve_label("latest").await?)
        } else if options.gates.allow_release_candidate {
            let next_minor = format!("latest-{}.{}", stable.major, stable.minor + 1);
            Some(self.resolve_label(&next_minor).await?)
        } else {
            None
        };
        if let Some(experimental) = experimental {
            let allowed = options.gates.allow_experimental || is_release_candidate(&experimental);
            if experimental.cmp_precedence(&stable).is_gt()
                && experimental.cmp_precedence(&cluster).is_gt()
                && allowed
            {
                let description = if is_release_candidate(&experimental) {
                    "Upgrade to the latest release candidate version"
                } else if is_prerelease(&experimental) {
                    "Upgrade to the latest experimental version"
                } else {
                    "Upgrade to the latest version"
                };
                offer(description.to_string(), experimental);
            }
        }

        Ok(UpgradePlan {
            cluster,
            tool,
            kubelet_versions,
            upgrades,
        })
    }

    async fn load_config<C: Confirmer + ?Sized>(
        &self,
        config_path: Option<PathBuf>,
        non_interactive: bool,
        confirmer: &mut C,
    ) -> Result<InternalMasterConfiguration> {
        let fetch_options = FetchOptions {
            config_path,
            non_interactive,
            hostname: self.hostname.clone(),
        };
        fetch_configuration(
            &self.cluster_client,
            &self.version_getter,
            confirmer,
            &fetch_options,
        )
        .await
        .context(error::ConfigSnafu)
    }

    async fn verify_static_pod_hosted(&self, manifests_dir: &std::path::Path) -> Result<()> {
        let hosting_type = ClusterHealthChecker::new(&self.cluster_client, manifests_dir)
            .verify_cluster_health()
            .await
            .context(error::HealthSnafu)?;
        ensure!(
            hosting_type == HostingType::StaticPod,
            error::SelfHostedUnsupportedSnafu
        );
        Ok(())
    }

    async fn cluster_version(&self) -> Result<Version> {
        self.version_getter
            .cluster_version()
            .await
            .context(error::VersionsSnafu)
    }

    /// The tool version, plus the kubelet versions if they can be determined.
    async fn tool_and_kubelet_versions(&self) -> Result<(Version, Option<KubeletVersions>)> {
        let tool = self
            .version_getter
            .tool_version()
            .await
            .context(error::VersionsSnafu)?;
        let kubelet_versions = match self.version_getter.kubelet_versions().await {
            Ok(kubelet_versions) => Some(kubelet_versions),
            Err(err) => {
                event!(Level::WARN, error = %err, "Unable to determine kubelet versions.");
                None
            }
        };
        Ok((tool, kubelet_versions))
    }

    async fn current_versions(
        &self,
        target: Version,
    ) -> Result<(VersionTriple, Option<KubeletVersions>)> {
        let cluster = self.cluster_version().await?;
        let (tool, kubelet_versions) = self.tool_and_kubelet_versions().await?;
        Ok((
            VersionTriple {
                cluster,
                tool,
                target,
            },
            kubelet_versions,
        ))
    }

    async fn resolve_label(&self, label: &str) -> Result<Version> {
        self.version_getter
            .version_from_label(label)
            .await
            .context(error::TargetVersionSnafu { version: label })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::Error;
    use crate::policy::policy_error;
    use crate::postupgrade::UploadConfiguration;
    use crate::prepull::prepull_error;
    use crate::prompt::test::ScriptedConfirmer;
    use crate::staticpod::ImageRewriteRenderer;
    use crate::versions::{versions_error, MockVersionGetter};
    use crate::waiter::MockWaiter;
    use async_trait::async_trait;
    use kube::api::ObjectMeta;
    use maplit::btreemap;
    use models::cluster::{fake_node, MockClusterClient};
    use models::config::MasterConfiguration;
    use models::constants::KUBEADM_CONFIG_MAP_KEY;
    use models::version::parse_kubernetes_version;
    use std::fs;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use ControlPlaneComponent::*;

    /// Pre-pulls instantly, recording each step.
    #[derive(Default)]
    struct RecordingPrepuller {
        steps: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Prepuller for RecordingPrepuller {
        async fn create_func(
            &self,
            _component: ControlPlaneComponent,
            image: &str,
        ) -> std::result::Result<(), prepull_error::Error> {
            self.steps.lock().unwrap().push(format!("create {}", image));
            Ok(())
        }

        async fn wait_func(
            &self,
            _component: ControlPlaneComponent,
        ) -> std::result::Result<(), prepull_error::Error> {
            Ok(())
        }

        async fn delete_func(
            &self,
            component: ControlPlaneComponent,
        ) -> std::result::Result<(), prepull_error::Error> {
            self.steps
                .lock()
                .unwrap()
                .push(format!("delete {}", component));
            Ok(())
        }
    }

    fn manifest(component: ControlPlaneComponent, version: &str) -> String {
        format!(
            "apiVersion: v1\nkind: Pod\nmetadata:\n  name: {name}\n  namespace: kube-system\nspec:\n  containers:\n  - name: {name}\n    image: gcr.io/google_containers/{name}-amd64:{version}\n",
            name = component.name(),
            version = version
        )
    }

    struct Fixture {
        root: TempDir,
        manifests_dir: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let root = TempDir::new().unwrap();
            let manifests_dir = root.path().join("manifests");
            fs::create_dir(&manifests_dir).unwrap();
            for component in CONTROL_PLANE_COMPONENTS {
                fs::write(
                    manifests_dir.join(component.manifest_file_name()),
                    manifest(component, "v1.7.3"),
                )
                .unwrap();
            }
            Fixture {
                root,
                manifests_dir,
            }
        }

        fn live(&self, component: ControlPlaneComponent) -> String {
            fs::read_to_string(self.manifests_dir.join(component.manifest_file_name())).unwrap()
        }

        fn options(&self, version: &str) -> ApplyOptions {
            ApplyOptions {
                version: version.to_string(),
                assume_yes: false,
                force: false,
                dry_run: false,
                pull_timeout: Duration::from_secs(60),
                gates: PrereleaseGates::default(),
                config_path: None,
                manifests_dir: self.manifests_dir.clone(),
                prepull_cleanup_policy: TimeoutCleanupPolicy::Leave,
                skip_prepull: false,
            }
        }

        fn scratch_is_empty(&self) -> bool {
            fs::read_dir(self.root.path().join("tmp"))
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(true)
        }
    }

    /// A healthy static pod-hosted cluster storing a v1.7.3 configuration.
    fn healthy_cluster() -> MockClusterClient {
        let mut cluster_client = MockClusterClient::new();
        cluster_client
            .expect_get_config_map()
            .returning(|| {
                let mut config = MasterConfiguration::default().to_internal();
                config.kubernetes_version = "v1.7.3".to_string();
                config.node_name = "master-0".to_string();
                Ok(Some(config.to_config_map().unwrap()))
            });
        cluster_client
            .expect_api_server_health()
            .returning(|| Ok(200));
        cluster_client
            .expect_list_nodes()
            .returning(|| {
                Ok(vec![
                    fake_node("master-0", "True"),
                    fake_node("worker-0", "True"),
                ])
            });
        cluster_client
            .expect_get_daemonset()
            .returning(|_| Ok(None));
        cluster_client
    }

    fn version_getter(
        cluster: &'static str,
        labels: BTreeMap<&'static str, &'static str>,
    ) -> MockVersionGetter {
        let mut version_getter = MockVersionGetter::new();
        version_getter
            .expect_cluster_version()
            .returning(move || Ok(parse_kubernetes_version(cluster).unwrap()));
        version_getter
            .expect_tool_version()
            .returning(|| Ok(parse_kubernetes_version("v1.8.1").unwrap()));
        version_getter
            .expect_kubelet_versions()
            .returning(|| Ok(btreemap! { "v1.7.3".to_string() => 2 }));
        version_getter
            .expect_version_from_label()
            .returning(move |label| {
                let version = labels.get(label).copied().unwrap_or(label);
                parse_kubernetes_version(version).map_err(|_| versions_error::Error::InvalidLabel {
                    label: label.to_string(),
                })
            });
        version_getter
    }

    fn waiter(seen: Arc<Mutex<Vec<ControlPlaneComponent>>>) -> MockWaiter {
        let mut waiter = MockWaiter::new();
        waiter
            .expect_static_pod_hash()
            .returning(|_, _| Ok(Some("before".to_string())));
        waiter
            .expect_wait_for_static_pod_hash_change()
            .returning(move |node_name, component, _| {
                assert_eq!(node_name, "master-0");
                seen.lock().unwrap().push(component);
                Ok(())
            });
        waiter
            .expect_wait_for_pods_with_label()
            .returning(|_| Ok(()));
        waiter
    }

    type TestOrchestrator = UpgradeOrchestrator<
        Arc<MockClusterClient>,
        MockVersionGetter,
        RecordingPrepuller,
        MockWaiter,
        ImageRewriteRenderer,
    >;

    fn orchestrator(
        cluster_client: MockClusterClient,
        version_getter: MockVersionGetter,
        waiter: MockWaiter,
        prepuller: Arc<RecordingPrepuller>,
    ) -> TestOrchestrator {
        let cluster_client = Arc::new(cluster_client);
        let upload: Box<dyn PostUpgradeTask> =
            Box::new(UploadConfiguration::new(cluster_client.clone()));
        UpgradeOrchestrator::new(
            cluster_client,
            version_getter,
            prepuller,
            StaticPodUpgrader::new(waiter, ImageRewriteRenderer),
            vec![upload],
            "master-0".to_string(),
        )
    }

    fn assert_untouched(fixture: &Fixture) {
        for component in CONTROL_PLANE_COMPONENTS {
            assert_eq!(fixture.live(component), manifest(component, "v1.7.3"));
        }
    }

    #[tokio::test]
    async fn test_patch_upgrade_end_to_end() {
        let fixture = Fixture::new();
        let mut cluster_client = healthy_cluster();
        cluster_client
            .expect_apply_config_map()
            .times(1)
            .returning(|config_map| {
                let stored = &config_map.data.as_ref().unwrap()[KUBEADM_CONFIG_MAP_KEY];
                let stored = MasterConfiguration::from_yaml(stored).unwrap();
                assert_eq!(stored.kubernetes_version.as_deref(), Some("v1.7.5"));
                Ok(())
            });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let prepuller = Arc::new(RecordingPrepuller::default());
        let orchestrator = orchestrator(
            cluster_client,
            version_getter("v1.7.3", BTreeMap::new()),
            waiter(seen.clone()),
            prepuller.clone(),
        );
        let mut confirmer = ScriptedConfirmer::answering(&[true]);

        let outcome = orchestrator
            .apply(&fixture.options("v1.7.5"), &mut confirmer)
            .await
            .unwrap();

        match outcome {
            ApplyOutcome::Upgraded { from, to } => {
                assert_eq!(from, Version::new(1, 7, 3));
                assert_eq!(to, Version::new(1, 7, 5));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(confirmer.questions.len(), 1);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![KubeApiServer, KubeControllerManager, KubeScheduler]
        );
        for component in CONTROL_PLANE_COMPONENTS {
            assert!(fixture
                .live(component)
                .contains(&format!("{}-amd64:v1.7.5", component.name())));
        }
        let steps = prepuller.steps.lock().unwrap();
        assert_eq!(steps.len(), 6);
        assert!(steps
            .contains(&"create gcr.io/google_containers/kube-apiserver-amd64:v1.7.5".to_string()));
        assert!(steps.contains(&"delete kube-scheduler".to_string()));
        assert!(fixture.scratch_is_empty());
    }

    #[tokio::test]
    async fn test_declined_confirmation_changes_nothing() {
        let fixture = Fixture::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let prepuller = Arc::new(RecordingPrepuller::default());
        let orchestrator = orchestrator(
            healthy_cluster(),
            version_getter("v1.7.3", BTreeMap::new()),
            waiter(seen.clone()),
            prepuller.clone(),
        );
        let mut confirmer = ScriptedConfirmer::answering(&[false]);

        let err = orchestrator
            .apply(&fixture.options("v1.7.5"), &mut confirmer)
            .await
            .unwrap_err();

        assert!(err.is_user_declined());
        assert!(prepuller.steps.lock().unwrap().is_empty());
        assert!(seen.lock().unwrap().is_empty());
        assert_untouched(&fixture);
    }

    #[tokio::test]
    async fn test_downgrade_is_refused_even_when_forced() {
        let fixture = Fixture::new();
        let prepuller = Arc::new(RecordingPrepuller::default());
        let orchestrator = orchestrator(
            healthy_cluster(),
            version_getter("v1.7.3", BTreeMap::new()),
            waiter(Arc::new(Mutex::new(Vec::new()))),
            prepuller.clone(),
        );
        let mut options = fixture.options("v1.7.1");
        options.force = true;

        let err = orchestrator
            .apply(&options, &mut ScriptedConfirmer::answering(&[]))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Policy {
                source: policy_error::Error::MandatoryViolations { .. }
            }
        ));
        assert!(!err.is_user_declined());
        assert!(prepuller.steps.lock().unwrap().is_empty());
        assert_untouched(&fixture);
    }

    #[tokio::test]
    async fn test_dry_run_renders_without_side_effects() {
        let fixture = Fixture::new();
        let prepuller = Arc::new(RecordingPrepuller::default());
        let orchestrator = orchestrator(
            healthy_cluster(),
            version_getter("v1.7.3", btreemap! { "stable-1.7" => "v1.7.5" }),
            waiter(Arc::new(Mutex::new(Vec::new()))),
            prepuller.clone(),
        );
        let mut options = fixture.options("stable-1.7");
        options.dry_run = true;

        let outcome = orchestrator
            .apply(&options, &mut ScriptedConfirmer::answering(&[]))
            .await
            .unwrap();

        match &outcome {
            ApplyOutcome::DryRun { target, manifests } => {
                assert_eq!(*target, Version::new(1, 7, 5));
                assert_eq!(manifests.len(), CONTROL_PLANE_COMPONENTS.len());
                assert!(manifests[&KubeScheduler].contains("kube-scheduler-amd64:v1.7.5"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(outcome.to_string().contains("kube-apiserver.yaml"));
        assert!(prepuller.steps.lock().unwrap().is_empty());
        assert_untouched(&fixture);
        assert!(fixture.scratch_is_empty());
    }

    #[tokio::test]
    async fn test_self_hosted_cluster_is_refused() {
        let fixture = Fixture::new();
        let mut cluster_client = MockClusterClient::new();
        cluster_client
            .expect_get_config_map()
            .returning(|| Ok(None));
        cluster_client
            .expect_api_server_health()
            .returning(|| Ok(200));
        cluster_client
            .expect_list_nodes()
            .returning(|| Ok(vec![fake_node("master-0", "True")]));
        cluster_client.expect_get_daemonset().returning(|name| {
            Ok(Some(k8s_openapi::api::apps::v1::DaemonSet {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                status: Some(k8s_openapi::api::apps::v1::DaemonSetStatus {
                    current_number_scheduled: 1,
                    desired_number_scheduled: 1,
                    number_available: Some(1),
                    number_ready: 1,
                    ..Default::default()
                }),
                ..Default::default()
            }))
        });
        let orchestrator = orchestrator(
            cluster_client,
            version_getter("v1.7.3", btreemap! { "stable-1.8" => "v1.8.1" }),
            waiter(Arc::new(Mutex::new(Vec::new()))),
            Arc::new(RecordingPrepuller::default()),
        );
        let mut options = fixture.options("v1.7.5");
        options.assume_yes = true;

        let err = orchestrator
            .apply(&options, &mut ScriptedConfirmer::answering(&[]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SelfHostedUnsupported), "{:?}", err);
    }

    #[tokio::test]
    async fn test_plan_lists_patch_and_minor_upgrades() {
        let fixture = Fixture::new();
        let orchestrator = orchestrator(
            healthy_cluster(),
            version_getter(
                "v1.7.3",
                btreemap! {
                    "stable-1.7" => "v1.7.5",
                    "stable" => "v1.8.1",
                },
            ),
            waiter(Arc::new(Mutex::new(Vec::new()))),
            Arc::new(RecordingPrepuller::default()),
        );
        let options = PlanOptions {
            gates: PrereleaseGates::default(),
            config_path: None,
            manifests_dir: fixture.manifests_dir.clone(),
        };

        let plan = orchestrator.plan(&options).await.unwrap();

        let targets: Vec<Version> = plan.upgrades.iter().map(|u| u.target.clone()).collect();
        assert_eq!(targets, vec![Version::new(1, 7, 5), Version::new(1, 8, 1)]);
        assert!(plan.upgrades.iter().all(|u| u.violations.is_none()));
        let output = plan.to_string();
        assert!(output.contains("kubeadm-upgrade apply --version v1.7.5"));
        assert!(output.contains("kubeadm-upgrade apply --version v1.8.1"));
        assert!(output.contains("2 x v1.7.3"));
        let header = output
            .lines()
            .find(|line| line.contains("COMPONENT"))
            .unwrap();
        assert!(header.contains("CURRENT") && header.contains("AVAILABLE"));
        assert!(output.lines().any(|line| {
            line.contains("kube-scheduler") && line.contains("v1.7.3") && line.contains("v1.8.1")
        }));
        assert_untouched(&fixture);
    }

    #[tokio::test]
    async fn test_plan_when_up_to_date() {
        let fixture = Fixture::new();
        let orchestrator = orchestrator(
            healthy_cluster(),
            version_getter(
                "v1.8.1",
                btreemap! {
                    "stable-1.8" => "v1.8.1",
                    "stable" => "v1.8.1",
                },
            ),
            waiter(Arc::new(Mutex::new(Vec::new()))),
            Arc::new(RecordingPrepuller::default()),
        );
        let options = PlanOptions {
            gates: PrereleaseGates::default(),
            config_path: None,
            manifests_dir: fixture.manifests_dir.clone(),
        };

        let plan = orchestrator.plan(&options).await.unwrap();
        assert!(plan.upgrades.is_empty());
        assert!(plan.to_string().contains("up-to-date"));
    }

    #[test]
    fn test_non_interactive_flags() {
        let base = ApplyOptions {
            version: "v1.7.5".to_string(),
            assume_yes: false,
            force: false,
            dry_run: false,
            pull_timeout: Duration::from_secs(1),
            gates: PrereleaseGates::default(),
            config_path: None,
            manifests_dir: Path::new("/etc/kubernetes/manifests").to_path_buf(),
            prepull_cleanup_policy: TimeoutCleanupPolicy::Leave,
            skip_prepull: false,
        };
        assert!(!base.non_interactive());
        assert!(ApplyOptions { assume_yes: true, ..base.clone() }.non_interactive());
        assert!(ApplyOptions { force: true, ..base.clone() }.non_interactive());
        assert!(ApplyOptions { dry_run: true, ..base }.non_interactive());
    }
}
