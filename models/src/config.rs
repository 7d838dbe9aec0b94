//! kubeadm's master configuration.
//!
//! The configuration exists in two forms. The external form (`MasterConfiguration`) is what operators
//! write and what is stored in the cluster; every field is optional. The internal form
//! (`InternalMasterConfiguration`) is produced after defaulting and is what the upgrade acts upon.
use crate::constants::{
    DEFAULT_API_BIND_PORT, DEFAULT_IMAGE_REPOSITORY, DEFAULT_KUBERNETES_VERSION,
    KUBEADM_CONFIG_MAP, KUBEADM_CONFIG_MAP_KEY, NAMESPACE,
};
use crate::version::parse_kubernetes_version;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use lazy_static::lazy_static;
use maplit::btreemap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::net::IpAddr;
use validator::{Validate, ValidationError};

lazy_static! {
    // RFC 1123 subdomain, which is what Kubernetes requires of node names.
    pub(crate) static ref DNS_1123_SUBDOMAIN: Regex = Regex::new(
        r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$"
    )
    .unwrap();
}

/// The module-wide result type.
type Result<T> = std::result::Result<T, config_error::Error>;

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEndpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertise_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_port: Option<i32>,
}

/// The external, versioned kubeadm master configuration.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<ApiEndpoint>,
    /// Either a concrete version (`v1.8.1`) or a release label (`stable`, `stable-1.8`, `latest`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

impl MasterConfiguration {
    pub fn from_yaml<S: AsRef<str>>(yaml: S) -> Result<Self> {
        serde_yaml::from_str(yaml.as_ref()).context(config_error::DecodeSnafu)
    }

    /// Decodes the configuration stored in the cluster's `kubeadm-config` ConfigMap.
    pub fn from_config_map(config_map: &ConfigMap) -> Result<Self> {
        let yaml = config_map
            .data
            .as_ref()
            .and_then(|data| data.get(KUBEADM_CONFIG_MAP_KEY))
            .ok_or(config_error::Error::MissingConfigMapKey {
                key: KUBEADM_CONFIG_MAP_KEY.to_string(),
            })?;
        Self::from_yaml(yaml)
    }

    /// Fills in static defaults for any unset field.
    pub fn set_defaults(&mut self) {
        let api = self.api.get_or_insert_with(ApiEndpoint::default);
        api.bind_port.get_or_insert(DEFAULT_API_BIND_PORT);
        self.kubernetes_version
            .get_or_insert_with(|| DEFAULT_KUBERNETES_VERSION.to_string());
        self.image_repository
            .get_or_insert_with(|| DEFAULT_IMAGE_REPOSITORY.to_string());
    }

    /// Converts a defaulted configuration to its internal form.
    pub fn to_internal(&self) -> InternalMasterConfiguration {
        let api = self.api.clone().unwrap_or_default();
        InternalMasterConfiguration {
            api: ApiEndpointConfig {
                advertise_address: api.advertise_address.unwrap_or_default(),
                bind_port: api.bind_port.unwrap_or(DEFAULT_API_BIND_PORT),
            },
            kubernetes_version: self
                .kubernetes_version
                .clone()
                .unwrap_or_else(|| DEFAULT_KUBERNETES_VERSION.to_string()),
            image_repository: self
                .image_repository
                .clone()
                .unwrap_or_else(|| DEFAULT_IMAGE_REPOSITORY.to_string()),
            node_name: self.node_name.clone().unwrap_or_default(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Validate)]
pub struct ApiEndpointConfig {
    #[validate(custom = "validate_advertise_address")]
    pub advertise_address: String,
    #[validate(range(min = 1, max = 65535))]
    pub bind_port: i32,
}

/// The internal kubeadm master configuration, as acted upon by an upgrade.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Validate)]
pub struct InternalMasterConfiguration {
    #[validate]
    pub api: ApiEndpointConfig,
    #[validate(custom = "validate_kubernetes_version")]
    pub kubernetes_version: String,
    #[validate(length(min = 1))]
    pub image_repository: String,
    #[validate(regex = "DNS_1123_SUBDOMAIN")]
    pub node_name: String,
}

impl InternalMasterConfiguration {
    /// Converts back to the external form, e.g. for storing in the cluster.
    pub fn to_external(&self) -> MasterConfiguration {
        MasterConfiguration {
            api: Some(ApiEndpoint {
                advertise_address: Some(self.api.advertise_address.clone())
                    .filter(|address| !address.is_empty()),
                bind_port: Some(self.api.bind_port),
            }),
            kubernetes_version: Some(self.kubernetes_version.clone()),
            image_repository: Some(self.image_repository.clone()),
            node_name: Some(self.node_name.clone()),
        }
    }

    /// Wraps the configuration in the `kubeadm-config` ConfigMap.
    pub fn to_config_map(&self) -> Result<ConfigMap> {
        let yaml = serde_yaml::to_string(&self.to_external()).context(config_error::EncodeSnafu)?;
        Ok(ConfigMap {
            metadata: ObjectMeta {
                name: Some(KUBEADM_CONFIG_MAP.to_string()),
                namespace: Some(NAMESPACE.to_string()),
                ..Default::default()
            },
            data: Some(btreemap! {
                KUBEADM_CONFIG_MAP_KEY.to_string() => yaml,
            }),
            ..Default::default()
        })
    }

    pub fn validate_config(&self) -> Result<()> {
        self.validate().context(config_error::ValidationSnafu)
    }
}

fn validate_kubernetes_version(version: &str) -> std::result::Result<(), ValidationError> {
    parse_kubernetes_version(version)
        .map(|_| ())
        .map_err(|_| ValidationError::new("kubernetes_version_not_semantic"))
}

fn validate_advertise_address(address: &str) -> std::result::Result<(), ValidationError> {
    // An empty advertise address means "use the default route's address".
    if address.is_empty() || address.parse::<IpAddr>().is_ok() {
        Ok(())
    } else {
        Err(ValidationError::new("advertise_address_not_ip"))
    }
}

pub mod config_error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to decode kubeadm configuration: '{}'", source))]
        Decode { source: serde_yaml::Error },

        #[snafu(display("Unable to encode kubeadm configuration: '{}'", source))]
        Encode { source: serde_yaml::Error },

        #[snafu(display("The kubeadm-config ConfigMap has no '{}' key", key))]
        MissingConfigMapKey { key: String },

        #[snafu(display("Invalid kubeadm configuration: '{}'", source))]
        Validation { source: validator::ValidationErrors },
    }
}
