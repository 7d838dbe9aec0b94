use snafu::Snafu;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to reach the API server health endpoint: '{}'", source))]
    ApiServerHealth { source: kube::Error },

    #[snafu(display("Unable to build request for '{}': '{}'", route, source))]
    BuildRequest { route: String, source: http::Error },

    #[snafu(display("Unable to fetch the API server version: '{}'", source))]
    ServerVersion { source: kube::Error },

    #[snafu(display("Unable to list nodes: '{}'", source))]
    ListNodes { source: kube::Error },

    #[snafu(display("Unable to get DaemonSet '{}': '{}'", name, source))]
    GetDaemonSet { name: String, source: kube::Error },

    #[snafu(display("Unable to create DaemonSet '{}': '{}'", name, source))]
    CreateDaemonSet { name: String, source: kube::Error },

    #[snafu(display("Unable to update DaemonSet '{}': '{}'", name, source))]
    UpdateDaemonSet { name: String, source: kube::Error },

    #[snafu(display("Unable to delete DaemonSet '{}': '{}'", name, source))]
    DeleteDaemonSet { name: String, source: kube::Error },

    #[snafu(display("Attempted to apply a DaemonSet without a name"))]
    DaemonSetWithoutName,

    #[snafu(display("Unable to get ConfigMap '{}': '{}'", name, source))]
    GetConfigMap { name: String, source: kube::Error },

    #[snafu(display("Unable to write ConfigMap '{}': '{}'", name, source))]
    WriteConfigMap { name: String, source: kube::Error },

    #[snafu(display("Unable to list pods matching '{}': '{}'", selector, source))]
    ListPods { selector: String, source: kube::Error },

    #[snafu(display("Unable to get mirror pod '{}': '{}'", name, source))]
    GetMirrorPod { name: String, source: kube::Error },
}
