use models::cluster::K8SClusterClient;
use models::constants::{DEFAULT_KUBECONFIG_PATH, DEFAULT_MANIFESTS_DIR};
use models::telemetry;
use upgrade::configfetch::local_hostname;
use upgrade::policy::PrereleaseGates;
use upgrade::postupgrade::{PostUpgradeTask, UploadConfiguration};
use upgrade::prepull::{DaemonSetPrepuller, TimeoutCleanupPolicy, DEFAULT_PREPULL_TIMEOUT};
use upgrade::prompt::TerminalPrompt;
use upgrade::staticpod::{ImageRewriteRenderer, StaticPodUpgrader};
use upgrade::versions::KubeVersionGetter;
use upgrade::waiter::{KubeWaiter, DEFAULT_STATIC_POD_TIMEOUT};
use upgrade::{ApplyOptions, PlanOptions, UpgradeOrchestrator};

use argh::FromArgs;
use kube::config::{Config, KubeConfigOptions, Kubeconfig};
use snafu::ResultExt;
use std::convert::TryFrom;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{event, Level};

type Result<T> = std::result::Result<T, cli_error::Error>;

/// Exit code used when the operator declines to continue.
const EXIT_USER_DECLINED: i32 = 2;

#[derive(FromArgs, Debug)]
/// Upgrade a kubeadm-managed control plane in place.
struct Args {
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Command {
    Plan(PlanArgs),
    Apply(ApplyArgs),
}

#[derive(FromArgs, Debug)]
/// Check which versions are available to upgrade to and validate whether the cluster is upgradeable.
#[argh(subcommand, name = "plan")]
struct PlanArgs {
    /// path to a kubeadm configuration file; the cluster-stored configuration is used otherwise
    #[argh(option)]
    config: Option<PathBuf>,

    /// the kubeconfig file to use when talking to the cluster
    #[argh(option, default = "PathBuf::from(DEFAULT_KUBECONFIG_PATH)")]
    kubeconfig: PathBuf,

    /// directory holding the static pod manifests of the control plane
    #[argh(option, default = "PathBuf::from(DEFAULT_MANIFESTS_DIR)")]
    manifests_dir: PathBuf,

    /// show unstable versions of Kubernetes as an upgrade alternative
    #[argh(switch)]
    allow_experimental_upgrades: bool,

    /// show release candidate versions of Kubernetes as an upgrade alternative
    #[argh(switch)]
    allow_release_candidate_upgrades: bool,
}

#[derive(FromArgs, Debug)]
/// Upgrade the control plane to a specified version.
#[argh(subcommand, name = "apply")]
struct ApplyArgs {
    /// the version or release label (e.g. stable-1.8) to upgrade to
    #[argh(option)]
    version: String,

    /// perform the upgrade without prompting for confirmation
    #[argh(switch, short = 'y')]
    yes: bool,

    /// force the upgrade even though some requirements might not be met; implies --yes
    #[argh(switch, short = 'f')]
    force: bool,

    /// render the upgraded manifests without changing the cluster
    #[argh(switch)]
    dry_run: bool,

    /// how long to wait for control plane images to be pre-pulled, e.g. 15m or 90s
    #[argh(option, default = "DEFAULT_PREPULL_TIMEOUT", from_str_fn(parse_duration))]
    pull_timeout: Duration,

    /// how long to wait for each control plane component to restart after its manifest changes
    #[argh(option, default = "DEFAULT_STATIC_POD_TIMEOUT", from_str_fn(parse_duration))]
    static_pod_timeout: Duration,

    /// delete pre-pull DaemonSets that are still outstanding when the pre-pull times out
    #[argh(switch)]
    prepull_cleanup_on_timeout: bool,

    /// do not pre-pull control plane images before upgrading
    #[argh(switch)]
    skip_prepull: bool,

    /// allow upgrading to an alpha or beta release of Kubernetes
    #[argh(switch)]
    allow_experimental_upgrades: bool,

    /// allow upgrading to a release candidate of Kubernetes
    #[argh(switch)]
    allow_release_candidate_upgrades: bool,

    /// path to a kubeadm configuration file; the cluster-stored configuration is used otherwise
    #[argh(option)]
    config: Option<PathBuf>,

    /// the kubeconfig file to use when talking to the cluster
    #[argh(option, default = "PathBuf::from(DEFAULT_KUBECONFIG_PATH)")]
    kubeconfig: PathBuf,

    /// directory holding the static pod manifests of the control plane
    #[argh(option, default = "PathBuf::from(DEFAULT_MANIFESTS_DIR)")]
    manifests_dir: PathBuf,
}

/// Parses durations such as `90s`, `15m`, `1h30m` or `500ms`. A bare number is seconds.
fn parse_duration(value: &str) -> std::result::Result<Duration, String> {
    let value = value.trim();
    let invalid = || format!("invalid duration '{}'", value);
    if value.is_empty() {
        return Err(invalid());
    }
    if let Ok(seconds) = value.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }

    let mut total = Duration::ZERO;
    let mut rest = value;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        let amount: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = match &rest[..unit_len] {
            "h" => Duration::from_secs(60 * 60),
            "m" => Duration::from_secs(60),
            "s" => Duration::from_secs(1),
            "ms" => Duration::from_millis(1),
            _ => return Err(invalid()),
        };
        total += unit * u32::try_from(amount).map_err(|_| invalid())?;
        rest = &rest[unit_len..];
    }
    Ok(total)
}

#[tokio::main]
async fn main() {
    let args: Args = argh::from_env();

    if let Err(e) = run(args).await {
        eprintln!("{}", e);
        process::exit(e.exit_code());
    }
}

async fn run(args: Args) -> Result<()> {
    telemetry::init_telemetry_from_env().context(cli_error::TelemetryInitSnafu)?;

    match args.command {
        Command::Plan(plan_args) => {
            let orchestrator =
                build_orchestrator(&plan_args.kubeconfig, DEFAULT_STATIC_POD_TIMEOUT).await?;
            let options = PlanOptions {
                gates: PrereleaseGates {
                    allow_experimental: plan_args.allow_experimental_upgrades,
                    allow_release_candidate: plan_args.allow_release_candidate_upgrades,
                },
                config_path: plan_args.config,
                manifests_dir: plan_args.manifests_dir,
            };
            let plan = orchestrator
                .plan(&options)
                .await
                .context(cli_error::UpgradeSnafu)?;
            print!("{}", plan);
        }
        Command::Apply(apply_args) => {
            let orchestrator =
                build_orchestrator(&apply_args.kubeconfig, apply_args.static_pod_timeout).await?;
            let options = ApplyOptions {
                version: apply_args.version,
                assume_yes: apply_args.yes,
                force: apply_args.force,
                dry_run: apply_args.dry_run,
                pull_timeout: apply_args.pull_timeout,
                gates: PrereleaseGates {
                    allow_experimental: apply_args.allow_experimental_upgrades,
                    allow_release_candidate: apply_args.allow_release_candidate_upgrades,
                },
                config_path: apply_args.config,
                manifests_dir: apply_args.manifests_dir,
                prepull_cleanup_policy: if apply_args.prepull_cleanup_on_timeout {
                    TimeoutCleanupPolicy::Delete
                } else {
                    TimeoutCleanupPolicy::Leave
                },
                skip_prepull: apply_args.skip_prepull,
            };
            let outcome = orchestrator
                .apply(&options, &mut TerminalPrompt)
                .await
                .context(cli_error::UpgradeSnafu)?;
            println!("{}", outcome);
        }
    }
    Ok(())
}

type KubeOrchestrator = UpgradeOrchestrator<
    K8SClusterClient,
    KubeVersionGetter<K8SClusterClient>,
    DaemonSetPrepuller<K8SClusterClient, KubeWaiter<K8SClusterClient>>,
    KubeWaiter<K8SClusterClient>,
    ImageRewriteRenderer,
>;

async fn build_orchestrator(
    kubeconfig_path: &Path,
    static_pod_timeout: Duration,
) -> Result<KubeOrchestrator> {
    let kubeconfig =
        Kubeconfig::read_from(kubeconfig_path).context(cli_error::ReadKubeConfigSnafu {
            path: kubeconfig_path,
        })?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context(cli_error::LoadKubeConfigSnafu)?;
    let k8s_client =
        kube::client::Client::try_from(config).context(cli_error::ClientCreateSnafu)?;
    let cluster_client = K8SClusterClient::new(k8s_client);

    let hostname = local_hostname().context(cli_error::HostnameSnafu)?;
    event!(Level::DEBUG, %hostname, "Determined local host name.");

    // Pre-pull waits are bounded by the pre-pull timeout as a whole, so their waiter has none.
    let prepuller = DaemonSetPrepuller::new(
        cluster_client.clone(),
        KubeWaiter::new(cluster_client.clone(), None),
    );
    let static_pod_upgrader = StaticPodUpgrader::new(
        KubeWaiter::new(cluster_client.clone(), Some(static_pod_timeout)),
        ImageRewriteRenderer,
    );
    let post_upgrade_tasks: Vec<Box<dyn PostUpgradeTask>> =
        vec![Box::new(UploadConfiguration::new(cluster_client.clone()))];

    Ok(UpgradeOrchestrator::new(
        cluster_client.clone(),
        KubeVersionGetter::new(cluster_client),
        Arc::new(prepuller),
        static_pod_upgrader,
        post_upgrade_tasks,
        hostname,
    ))
}

pub mod cli_error {
    use super::EXIT_USER_DECLINED;
    use models::telemetry;
    use snafu::Snafu;
    use std::path::PathBuf;
    use upgrade::configfetch::configfetch_error;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Error configuring telemetry: '{}'", source))]
        TelemetryInit {
            source: telemetry::TelemetryConfigError,
        },

        #[snafu(display("Unable to read kubeconfig '{}': '{}'", path.display(), source))]
        ReadKubeConfig {
            path: PathBuf,
            source: kube::config::KubeconfigError,
        },

        #[snafu(display("Unable to load kubeconfig: '{}'", source))]
        LoadKubeConfig {
            source: kube::config::KubeconfigError,
        },

        #[snafu(display("Unable to create Kubernetes client: '{}'", source))]
        ClientCreate { source: kube::Error },

        #[snafu(display("{}", source))]
        Hostname { source: configfetch_error::Error },

        #[snafu(display("[upgrade] FATAL: {}", source))]
        Upgrade { source: upgrade::Error },
    }

    impl Error {
        pub fn exit_code(&self) -> i32 {
            match self {
                Error::Upgrade { source } if source.is_user_declined() => EXIT_USER_DECLINED,
                _ => 1,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_duration() {
        let test_cases = vec![
            ("90", Some(Duration::from_secs(90))),
            ("90s", Some(Duration::from_secs(90))),
            ("15m", Some(Duration::from_secs(15 * 60))),
            ("1h30m", Some(Duration::from_secs(90 * 60))),
            ("15m0s", Some(Duration::from_secs(15 * 60))),
            ("500ms", Some(Duration::from_millis(500))),
            ("", None),
            ("m", None),
            ("10", Some(Duration::from_secs(10))),
            ("10d", None),
            ("ten", None),
        ];
        for (input, expected) in test_cases {
            assert_eq!(parse_duration(input).ok(), expected, "input: '{}'", input);
        }
    }

    #[test]
    fn test_apply_args() {
        let args = Args::from_args(
            &["kubeadm-upgrade"],
            &["apply", "--version", "v1.7.5", "-y", "--pull-timeout", "5m"],
        )
        .unwrap();
        match args.command {
            Command::Apply(apply) => {
                assert_eq!(apply.version, "v1.7.5");
                assert!(apply.yes);
                assert!(!apply.force);
                assert_eq!(apply.pull_timeout, Duration::from_secs(5 * 60));
                assert_eq!(apply.static_pod_timeout, DEFAULT_STATIC_POD_TIMEOUT);
                assert_eq!(apply.manifests_dir, PathBuf::from(DEFAULT_MANIFESTS_DIR));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_apply_requires_version() {
        assert!(Args::from_args(&["kubeadm-upgrade"], &["apply", "--yes"]).is_err());
    }
}
