//! Resource templates for the children of a `Synapse`
//!
//! Every template is a pure function of the `Synapse` (spec and working
//! status), the child's `ObjectMeta` and the operator configuration. Calling
//! a template twice with the same inputs yields equal objects.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec,
    Service, ServiceAccount, ServicePort, ServiceSpec, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::OperatorConfig;
use crate::crd::{
    DatabaseInitSql, PgBackRest, PgBackRestRepo, PostgresBackups, PostgresCluster,
    PostgresClusterSpec, PostgresInstanceSet, PostgresUser, RepoVolume, Synapse,
};
use crate::error::{Error, Result};

use super::homeserver_config::{bridge_url, HEISENBRIDGE_KEY, HEISENBRIDGE_PORT, HOMESERVER_KEY};

pub const SYNAPSE_PORT: i32 = 8008;

pub const HOMESERVER_MOUNT_PATH: &str = "/data-homeserver";
pub const DATA_MOUNT_PATH: &str = "/data";
pub const HEISENBRIDGE_MOUNT_PATH: &str = "/data-heisenbridge";

/// Key of the SQL script in the PostgreSQL auxiliary ConfigMap
pub const CREATEDB_KEY: &str = "createdb.sql";

/// Database and role created in the managed PostgreSQL cluster
pub const SYNAPSE_DATABASE: &str = "synapse";

const PVC_SIZE: &str = "5Gi";
const POSTGRES_VOLUME_SIZE: &str = "1Gi";
const POSTGRES_VERSION: i32 = 14;

const COMPONENT_LABEL: &str = "synapse_component";

// ============================================================================
// Naming and metadata
// ============================================================================

/// Name shared by the Heisenbridge Service, Deployment and generated ConfigMap.
pub fn heisenbridge_name(synapse: &Synapse) -> String {
    format!("{}-heisenbridge", synapse.name_any())
}

/// Name of the ConfigMap holding `createdb.sql` for the PostgresCluster.
pub fn postgres_config_map_name(synapse: &Synapse) -> String {
    format!("{}-pgsql", synapse.name_any())
}

/// Secret the postgres-operator writes for the `synapse` user.
pub fn postgres_secret_name(synapse: &Synapse) -> String {
    format!("{}-pguser-{}", synapse.name_any(), SYNAPSE_DATABASE)
}

/// Path at which the bridge registration is visible to the homeserver.
pub fn heisenbridge_registration_path() -> String {
    format!("{HEISENBRIDGE_MOUNT_PATH}/{HEISENBRIDGE_KEY}")
}

pub fn standard_labels(synapse: &Synapse) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), "synapse".to_string()),
        ("synapse_cr".to_string(), synapse.name_any()),
    ])
}

fn component_labels(synapse: &Synapse, component: &str) -> BTreeMap<String, String> {
    let mut labels = standard_labels(synapse);
    labels.insert(COMPONENT_LABEL.to_string(), component.to_string());
    labels
}

pub fn owner_reference(synapse: &Synapse) -> Result<OwnerReference> {
    synapse
        .controller_owner_ref(&())
        .ok_or_else(|| Error::MissingOwnerReference(synapse.name_any()))
}

/// Metadata for a child named `name` in the Synapse's namespace.
pub fn object_meta(synapse: &Synapse, name: impl Into<String>) -> Result<ObjectMeta> {
    Ok(ObjectMeta {
        name: Some(name.into()),
        namespace: synapse.namespace(),
        labels: Some(standard_labels(synapse)),
        owner_references: Some(vec![owner_reference(synapse)?]),
        ..Default::default()
    })
}

fn meta_name(meta: &ObjectMeta) -> String {
    meta.name.clone().unwrap_or_default()
}

fn storage_request(size: &str) -> VolumeResourceRequirements {
    VolumeResourceRequirements {
        requests: Some(BTreeMap::from([(
            "storage".to_string(),
            Quantity(size.to_string()),
        )])),
        ..Default::default()
    }
}

fn config_map_volume(volume: &str, config_map: &str) -> Volume {
    Volume {
        name: volume.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(volume: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: volume.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

/// ConfigMap name of the bridge registration: status first, canonical otherwise.
fn heisenbridge_config_map(synapse: &Synapse) -> String {
    synapse
        .status
        .as_ref()
        .map(|s| s.bridges_configuration.heisenbridge.config_map_name.clone())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| heisenbridge_name(synapse))
}

// ============================================================================
// Homeserver
// ============================================================================

#[derive(Serialize)]
struct HomeserverDocument<'a> {
    server_name: &'a str,
    report_stats: bool,
    pid_file: String,
    listeners: Vec<Listener>,
    database: SqliteDatabase,
    log_config: String,
    media_store_path: String,
    signing_key_path: String,
    trusted_key_servers: Vec<TrustedKeyServer>,
}

#[derive(Serialize)]
struct Listener {
    port: i32,
    tls: bool,
    #[serde(rename = "type")]
    type_: &'static str,
    x_forwarded: bool,
    resources: Vec<ListenerResource>,
}

#[derive(Serialize)]
struct ListenerResource {
    names: Vec<&'static str>,
    compress: bool,
}

#[derive(Serialize)]
struct SqliteDatabase {
    name: &'static str,
    args: BTreeMap<&'static str, String>,
}

#[derive(Serialize)]
struct TrustedKeyServer {
    server_name: &'static str,
}

/// ConfigMap with a default `homeserver.yaml` rendered from `spec.homeserver.values`.
pub fn homeserver_config_map(synapse: &Synapse, meta: ObjectMeta) -> Result<ConfigMap> {
    let values = synapse.spec.homeserver.values.as_ref().ok_or_else(|| {
        Error::ConfigError(format!(
            "Synapse {} has no homeserver values to render",
            synapse.name_any()
        ))
    })?;
    let server_name = values.server_name.as_str();

    let document = HomeserverDocument {
        server_name,
        report_stats: values.report_stats,
        pid_file: format!("{DATA_MOUNT_PATH}/homeserver.pid"),
        listeners: vec![Listener {
            port: SYNAPSE_PORT,
            tls: false,
            type_: "http",
            x_forwarded: true,
            resources: vec![ListenerResource {
                names: vec!["client", "federation"],
                compress: false,
            }],
        }],
        database: SqliteDatabase {
            name: "sqlite3",
            args: BTreeMap::from([("database", format!("{DATA_MOUNT_PATH}/homeserver.db"))]),
        },
        log_config: format!("{DATA_MOUNT_PATH}/{server_name}.log.config"),
        media_store_path: format!("{DATA_MOUNT_PATH}/media_store"),
        signing_key_path: format!("{DATA_MOUNT_PATH}/{server_name}.signing.key"),
        trusted_key_servers: vec![TrustedKeyServer {
            server_name: "matrix.org",
        }],
    };

    Ok(ConfigMap {
        metadata: meta,
        data: Some(BTreeMap::from([(
            HOMESERVER_KEY.to_string(),
            serde_yaml::to_string(&document)?,
        )])),
        ..Default::default()
    })
}

pub fn persistent_volume_claim(_synapse: &Synapse, meta: ObjectMeta) -> Result<PersistentVolumeClaim> {
    Ok(PersistentVolumeClaim {
        metadata: meta,
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(storage_request(PVC_SIZE)),
            ..Default::default()
        }),
        ..Default::default()
    })
}

pub fn service(synapse: &Synapse, meta: ObjectMeta) -> Result<Service> {
    Ok(Service {
        metadata: meta,
        spec: Some(ServiceSpec {
            selector: Some(component_labels(synapse, "homeserver")),
            ports: Some(vec![ServicePort {
                name: Some("synapse-unsecure".to_string()),
                protocol: Some("TCP".to_string()),
                port: SYNAPSE_PORT,
                target_port: Some(IntOrString::Int(SYNAPSE_PORT)),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

pub fn service_account(_synapse: &Synapse, meta: ObjectMeta) -> Result<ServiceAccount> {
    Ok(ServiceAccount {
        metadata: meta,
        ..Default::default()
    })
}

pub fn role_binding(
    synapse: &Synapse,
    meta: ObjectMeta,
    config: &OperatorConfig,
) -> Result<RoleBinding> {
    Ok(RoleBinding {
        metadata: meta,
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: config.synapse_cluster_role.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: synapse.name_any(),
            namespace: synapse.namespace(),
            ..Default::default()
        }]),
    })
}

pub fn deployment(synapse: &Synapse, meta: ObjectMeta, config: &OperatorConfig) -> Result<Deployment> {
    let pod_labels = component_labels(synapse, "homeserver");
    let status = synapse.status.clone().unwrap_or_default();
    let config_map_name = if status.homeserver_config_map_name.is_empty() {
        meta_name(&meta)
    } else {
        status.homeserver_config_map_name.clone()
    };
    let config_path = format!("{HOMESERVER_MOUNT_PATH}/{HOMESERVER_KEY}");

    let mut volume_mounts = vec![
        mount("homeserver", HOMESERVER_MOUNT_PATH),
        mount("data-pv", DATA_MOUNT_PATH),
    ];
    let mut volumes = vec![
        config_map_volume("homeserver", &config_map_name),
        Volume {
            name: "data-pv".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: synapse.name_any(),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];

    let generate = Container {
        name: "synapse-generate".to_string(),
        image: Some(config.synapse_image.clone()),
        args: Some(vec!["generate".to_string()]),
        env: Some(vec![
            env("SYNAPSE_CONFIG_PATH", config_path.clone()),
            env(
                "SYNAPSE_SERVER_NAME",
                status.homeserver_configuration.server_name.clone(),
            ),
            env(
                "SYNAPSE_REPORT_STATS",
                yes_no(status.homeserver_configuration.report_stats),
            ),
        ]),
        volume_mounts: Some(volume_mounts.clone()),
        ..Default::default()
    };

    if synapse.spec.bridges.heisenbridge.enabled {
        volume_mounts.push(mount("data-heisenbridge", HEISENBRIDGE_MOUNT_PATH));
        volumes.push(config_map_volume(
            "data-heisenbridge",
            &heisenbridge_config_map(synapse),
        ));
    }

    let homeserver = Container {
        name: "synapse".to_string(),
        image: Some(config.synapse_image.clone()),
        env: Some(vec![env("SYNAPSE_CONFIG_PATH", config_path)]),
        ports: Some(vec![ContainerPort {
            container_port: SYNAPSE_PORT,
            ..Default::default()
        }]),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    };

    Ok(Deployment {
        metadata: meta,
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(pod_labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    init_containers: Some(vec![generate]),
                    containers: vec![homeserver],
                    service_account_name: Some(synapse.name_any()),
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

// ============================================================================
// Heisenbridge
// ============================================================================

#[derive(Serialize)]
struct HeisenbridgeRegistration {
    id: &'static str,
    url: String,
    as_token: String,
    hs_token: String,
    rate_limited: bool,
    sender_localpart: &'static str,
    namespaces: RegistrationNamespaces,
}

#[derive(Serialize)]
struct RegistrationNamespaces {
    users: Vec<NamespaceRule>,
    aliases: Vec<NamespaceRule>,
    rooms: Vec<NamespaceRule>,
}

#[derive(Serialize)]
struct NamespaceRule {
    regex: &'static str,
    exclusive: bool,
}

/// Appservice token derived from the Synapse UID, stable across passes.
fn appservice_token(synapse: &Synapse, purpose: &str) -> Result<String> {
    let uid = synapse
        .uid()
        .ok_or_else(|| Error::MissingOwnerReference(synapse.name_any()))?;
    let mut hasher = Sha256::new();
    hasher.update(uid.as_bytes());
    hasher.update(b":heisenbridge:");
    hasher.update(purpose.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// ConfigMap with a generated `heisenbridge.yaml` appservice registration.
pub fn heisenbridge_config_map_template(synapse: &Synapse, meta: ObjectMeta) -> Result<ConfigMap> {
    let bridge_ip = synapse
        .status
        .as_ref()
        .map(|s| s.bridges_configuration.heisenbridge.ip.clone())
        .unwrap_or_default();

    let registration = HeisenbridgeRegistration {
        id: "heisenbridge",
        url: bridge_url(&bridge_ip),
        as_token: appservice_token(synapse, "as_token")?,
        hs_token: appservice_token(synapse, "hs_token")?,
        rate_limited: false,
        sender_localpart: "heisenbridge",
        namespaces: RegistrationNamespaces {
            users: vec![NamespaceRule {
                regex: "@irc_.*",
                exclusive: true,
            }],
            aliases: vec![],
            rooms: vec![],
        },
    };

    Ok(ConfigMap {
        metadata: meta,
        data: Some(BTreeMap::from([(
            HEISENBRIDGE_KEY.to_string(),
            serde_yaml::to_string(&registration)?,
        )])),
        ..Default::default()
    })
}

pub fn heisenbridge_service(synapse: &Synapse, meta: ObjectMeta) -> Result<Service> {
    Ok(Service {
        metadata: meta,
        spec: Some(ServiceSpec {
            selector: Some(component_labels(synapse, "heisenbridge")),
            ports: Some(vec![ServicePort {
                name: Some("heisenbridge".to_string()),
                protocol: Some("TCP".to_string()),
                port: HEISENBRIDGE_PORT,
                target_port: Some(IntOrString::Int(HEISENBRIDGE_PORT)),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

pub fn heisenbridge_deployment(
    synapse: &Synapse,
    meta: ObjectMeta,
    config: &OperatorConfig,
) -> Result<Deployment> {
    let pod_labels = component_labels(synapse, "heisenbridge");
    let homeserver_ip = synapse
        .status
        .as_ref()
        .map(|s| s.ip.clone())
        .unwrap_or_default();

    let bridge = Container {
        name: "heisenbridge".to_string(),
        image: Some(config.heisenbridge_image.clone()),
        args: Some(vec![
            "-c".to_string(),
            heisenbridge_registration_path(),
            "-l".to_string(),
            "0.0.0.0".to_string(),
            format!("http://{homeserver_ip}:{SYNAPSE_PORT}"),
        ]),
        ports: Some(vec![ContainerPort {
            container_port: HEISENBRIDGE_PORT,
            ..Default::default()
        }]),
        volume_mounts: Some(vec![mount("data-heisenbridge", HEISENBRIDGE_MOUNT_PATH)]),
        ..Default::default()
    };

    Ok(Deployment {
        metadata: meta,
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(pod_labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![bridge],
                    volumes: Some(vec![config_map_volume(
                        "data-heisenbridge",
                        &heisenbridge_config_map(synapse),
                    )]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

// ============================================================================
// PostgreSQL
// ============================================================================

/// ConfigMap with the SQL that creates the `synapse` database with the
/// encoding and collation Synapse requires.
pub fn postgres_config_map(_synapse: &Synapse, meta: ObjectMeta) -> Result<ConfigMap> {
    let sql = format!(
        "CREATE DATABASE {db}\n ENCODING 'UTF8'\n LOCALE 'C'\n TEMPLATE template0\n OWNER {db};\n",
        db = SYNAPSE_DATABASE
    );
    Ok(ConfigMap {
        metadata: meta,
        data: Some(BTreeMap::from([(CREATEDB_KEY.to_string(), sql)])),
        ..Default::default()
    })
}

fn volume_claim_spec(size: &str) -> PersistentVolumeClaimSpec {
    PersistentVolumeClaimSpec {
        access_modes: Some(vec!["ReadWriteOnce".to_string()]),
        resources: Some(storage_request(size)),
        ..Default::default()
    }
}

pub fn postgres_cluster(synapse: &Synapse, meta: ObjectMeta) -> Result<PostgresCluster> {
    let mut cluster = PostgresCluster::new(
        &meta_name(&meta),
        PostgresClusterSpec {
            postgres_version: POSTGRES_VERSION,
            database_init_sql: Some(DatabaseInitSql {
                name: postgres_config_map_name(synapse),
                key: CREATEDB_KEY.to_string(),
            }),
            instances: vec![PostgresInstanceSet {
                name: "instance1".to_string(),
                replicas: Some(1),
                data_volume_claim_spec: volume_claim_spec(POSTGRES_VOLUME_SIZE),
            }],
            backups: Some(PostgresBackups {
                pgbackrest: PgBackRest {
                    repos: vec![PgBackRestRepo {
                        name: "repo1".to_string(),
                        volume: Some(RepoVolume {
                            volume_claim_spec: volume_claim_spec(POSTGRES_VOLUME_SIZE),
                        }),
                    }],
                },
            }),
            users: vec![PostgresUser {
                name: SYNAPSE_DATABASE.to_string(),
                databases: vec![SYNAPSE_DATABASE.to_string()],
            }],
        },
    );
    cluster.metadata = meta;
    Ok(cluster)
}
