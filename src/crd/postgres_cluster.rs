//! Crunchy Data `PostgresCluster` (postgres-operator v5)
//!
//! Only the fields the operator writes or reads are modelled.

use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "postgres-operator.crunchydata.com",
    version = "v1beta1",
    kind = "PostgresCluster",
    namespaced,
    status = "PostgresClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterSpec {
    pub postgres_version: i32,
    #[serde(rename = "databaseInitSQL", skip_serializing_if = "Option::is_none")]
    pub database_init_sql: Option<DatabaseInitSql>,
    #[serde(default)]
    pub instances: Vec<PostgresInstanceSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backups: Option<PostgresBackups>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<PostgresUser>,
}

/// SQL run once against the new cluster, read from a ConfigMap key
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct DatabaseInitSql {
    pub name: String,
    pub key: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PostgresInstanceSet {
    #[serde(default)]
    pub name: String,
    /// Defaults to 1 on the postgres-operator side when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default)]
    #[schemars(with = "serde_json::Value")]
    pub data_volume_claim_spec: PersistentVolumeClaimSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct PostgresBackups {
    pub pgbackrest: PgBackRest,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct PgBackRest {
    #[serde(default)]
    pub repos: Vec<PgBackRestRepo>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct PgBackRestRepo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<RepoVolume>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepoVolume {
    #[schemars(with = "serde_json::Value")]
    pub volume_claim_spec: PersistentVolumeClaimSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct PostgresUser {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub databases: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct PostgresClusterStatus {
    #[serde(default)]
    pub instances: Vec<PostgresInstanceSetStatus>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PostgresInstanceSetStatus {
    pub name: String,
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub updated_replicas: i32,
}
