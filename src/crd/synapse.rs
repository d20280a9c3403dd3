//! Synapse Custom Resource Definition
//!
//! A `Synapse` describes one Matrix homeserver deployment. The homeserver
//! configuration comes either from a user-provided ConfigMap or from a small
//! set of values the operator renders into a `homeserver.yaml`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const STATE_RUNNING: &str = "RUNNING";
pub const STATE_FAILED: &str = "FAILED";

pub const DATABASE_READY: &str = "READY";
pub const DATABASE_NOT_READY: &str = "NOT READY";

/// The Synapse CRD represents a managed Matrix homeserver.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "synapse.opdev.io",
    version = "v1alpha1",
    kind = "Synapse",
    namespaced,
    status = "SynapseStatus",
    shortname = "synapse",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.reason"}"#,
    printcolumn = r#"{"name":"ServerName","type":"string","jsonPath":".status.homeserverConfiguration.serverName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SynapseSpec {
    /// Source of the homeserver configuration. Exactly one of `configMap`
    /// and `values` must be set.
    pub homeserver: SynapseHomeserver,

    /// Provision a PostgreSQL cluster through the postgres-operator and point
    /// the homeserver at it.
    #[serde(default, rename = "createNewPostgreSQL")]
    pub create_new_postgresql: bool,

    /// Optional bridges deployed next to the homeserver
    #[serde(default)]
    pub bridges: SynapseBridges,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SynapseHomeserver {
    /// Existing ConfigMap holding a complete `homeserver.yaml`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ConfigMapReference>,

    /// Values the operator renders into a default `homeserver.yaml`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<HomeserverValues>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ConfigMapReference {
    #[serde(default)]
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HomeserverValues {
    /// Public hostname of the server, e.g. `example.com`
    #[serde(default)]
    pub server_name: String,

    /// Whether to report anonymized usage statistics
    #[serde(default)]
    pub report_stats: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SynapseBridges {
    #[serde(default)]
    pub heisenbridge: HeisenbridgeSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeisenbridgeSpec {
    /// Deploy the Heisenbridge IRC bridge
    #[serde(default)]
    pub enabled: bool,

    /// User-provided `heisenbridge.yaml`. When empty the operator generates one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ConfigMapReference>,
}

/// Where the homeserver configuration for a `Synapse` comes from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum HomeserverSource<'a> {
    ConfigMap(&'a str),
    Values(&'a HomeserverValues),
}

impl SynapseHomeserver {
    fn config_map_name(&self) -> Option<&str> {
        self.config_map
            .as_ref()
            .map(|cm| cm.name.as_str())
            .filter(|name| !name.is_empty())
    }

    fn populated_values(&self) -> Option<&HomeserverValues> {
        self.values.as_ref().filter(|v| !v.server_name.is_empty())
    }

    /// The configured source, when exactly one is populated.
    pub fn source(&self) -> Option<HomeserverSource<'_>> {
        match (self.config_map_name(), self.populated_values()) {
            (Some(name), None) => Some(HomeserverSource::ConfigMap(name)),
            (None, Some(values)) => Some(HomeserverSource::Values(values)),
            _ => None,
        }
    }
}

impl HeisenbridgeSpec {
    /// Name of the user-provided bridge ConfigMap, if any.
    pub fn user_config_map(&self) -> Option<&str> {
        self.config_map
            .as_ref()
            .map(|cm| cm.name.as_str())
            .filter(|name| !name.is_empty())
    }
}

impl SynapseSpec {
    /// Admission-time validation.
    ///
    /// The same message is returned whether both sources or neither are set.
    pub fn validate(&self) -> Result<(), String> {
        match self.homeserver.source() {
            Some(_) => Ok(()),
            None => Err("error validating Synapse config".to_string()),
        }
    }
}

/// Status subresource for Synapse
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SynapseStatus {
    /// `RUNNING`, `FAILED`, or empty before the first pass
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,

    /// Explanation for a `FAILED` state
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Cluster IP of the homeserver Service
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,

    /// ConfigMap mounted by the homeserver Deployment
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub homeserver_config_map_name: String,

    #[serde(default)]
    pub homeserver_configuration: HomeserverConfigurationStatus,

    #[serde(default)]
    pub database_connection_info: DatabaseConnectionInfo,

    #[serde(default)]
    pub bridges_configuration: BridgesConfigurationStatus,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HomeserverConfigurationStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server_name: String,
    #[serde(default)]
    pub report_stats: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConnectionInfo {
    /// `READY`, `NOT READY`, or empty when no database is managed
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
    /// `host:port` of the database
    #[serde(default, rename = "connectionURL", skip_serializing_if = "String::is_empty")]
    pub connection_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub database_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    /// Base64 encoded, like the Secret it was read from
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct BridgesConfigurationStatus {
    #[serde(default)]
    pub heisenbridge: HeisenbridgeStatus,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeisenbridgeStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub config_map_name: String,
}

impl SynapseStatus {
    pub fn is_running(&self) -> bool {
        self.state == STATE_RUNNING
    }

    pub fn set_running(&mut self) {
        self.state = STATE_RUNNING.to_string();
        self.reason.clear();
    }

    pub fn set_failed(&mut self, reason: impl Into<String>) {
        self.state = STATE_FAILED.to_string();
        self.reason = reason.into();
    }
}
