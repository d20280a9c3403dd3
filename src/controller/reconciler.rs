//! Core reconciliation loop for Synapse
//!
//! A pass walks the phases below in order, any of which may end the pass
//! early with a requeue or an error:
//!
//! 1. load the Synapse
//! 2. resolve the homeserver configuration source
//! 3. provision PostgreSQL (optional)
//! 4. ensure the homeserver Service and capture its IP
//! 5. provision Heisenbridge (optional)
//! 6. ensure the homeserver workload
//! 7. mark the Synapse as running

use std::ops::ControlFlow;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolumeClaim, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::RoleBinding;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, ListParams, PostParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use crate::config::OperatorConfig;
use crate::crd::{
    DatabaseConnectionInfo, HomeserverSource, PostgresCluster, Synapse, SynapseStatus,
    DATABASE_NOT_READY, DATABASE_READY,
};
use crate::error::{Error, Result, DATABASE_NOT_READY_REQUEUE};

use super::child::{reconcile_resource, DriftPolicy, OwnedChild};
use super::homeserver_config::{apply_edit, parse_homeserver, DocumentEdit, HOMESERVER_KEY};
use super::postgres::is_postgres_cluster_ready;
use super::resources::{self, SYNAPSE_DATABASE};
use super::status::project_status;

/// Shared state for the Synapse controller
pub struct ControllerState {
    /// Kubernetes client for API interactions
    pub client: Client,
    /// Images and roles used by the templates
    pub config: OperatorConfig,
}

fn scoped_api<K: OwnedChild>(client: &Client, namespace: Option<&str>) -> Api<K> {
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Main entry point to start the Synapse controller
///
/// Watches `Synapse` objects in `namespace`, or cluster-wide when `None`,
/// until a termination signal is received.
pub async fn run_controller(state: Arc<ControllerState>, namespace: Option<String>) -> Result<()> {
    let client = state.client.clone();
    let ns = namespace.as_deref();
    let synapses: Api<Synapse> = match ns {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    info!(namespace = ns.unwrap_or("<all>"), "Starting Synapse controller");

    // Verify CRD exists
    match synapses.list(&ListParams::default().limit(1)).await {
        Ok(_) => info!("Synapse CRD is available"),
        Err(e) => {
            error!("Synapse CRD not found: {:?}", e);
            return Err(Error::ConfigError("Synapse CRD not installed".to_string()));
        }
    }

    Controller::new(synapses, Config::default())
        .owns::<ConfigMap>(scoped_api(&client, ns), Config::default())
        .owns::<Service>(scoped_api(&client, ns), Config::default())
        .owns::<Deployment>(scoped_api(&client, ns), Config::default())
        .owns::<PersistentVolumeClaim>(scoped_api(&client, ns), Config::default())
        .owns::<ServiceAccount>(scoped_api(&client, ns), Config::default())
        .owns::<RoleBinding>(scoped_api(&client, ns), Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok((obj, _action)) => debug!("Reconciled Synapse {}", obj.name),
                Err(e) => warn!("Reconcile error: {}", e),
            }
        })
        .await;

    info!("Synapse controller stopped");
    Ok(())
}

#[instrument(skip(obj, ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<Synapse>, ctx: Arc<ControllerState>) -> Result<Action> {
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    reconcile_synapse(&ctx, &namespace, &obj.name_any()).await
}

fn error_policy(synapse: Arc<Synapse>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    if error.is_conflict() {
        debug!("Synapse {} changed during reconcile, retrying", synapse.name_any());
    } else if error.is_retriable() {
        warn!("Reconciliation error for {}: {}", synapse.name_any(), error);
    } else {
        error!("Reconciliation error for {}: {}", synapse.name_any(), error);
    }
    Action::requeue(error.requeue_after())
}

/// Run one pass for the Synapse `namespace/name`.
///
/// Reads the latest object from the API server rather than trusting the
/// watch cache, so it can be driven directly as well as by the controller.
pub async fn reconcile_synapse(ctx: &ControllerState, namespace: &str, name: &str) -> Result<Action> {
    let api: Api<Synapse> = Api::namespaced(ctx.client.clone(), namespace);

    let Some(synapse) = api.get_opt(name).await? else {
        debug!(%namespace, %name, "Synapse no longer exists");
        return Ok(Action::await_change());
    };

    info!("Reconciling Synapse {}/{}", namespace, name);
    let mut pass = Pass::new(ctx, api, synapse);

    if let ControlFlow::Break(action) = pass.resolve_homeserver().await? {
        return Ok(action);
    }
    if let ControlFlow::Break(action) = pass.reconcile_database().await? {
        return Ok(action);
    }
    pass.reconcile_homeserver_service().await?;
    pass.reconcile_heisenbridge().await?;
    pass.reconcile_homeserver_workload().await?;
    pass.finish().await
}

/// State carried between the phases of one pass.
///
/// `synapse.status` is the working copy: phases record facts into it and
/// templates read them back.
struct Pass<'a> {
    ctx: &'a ControllerState,
    api: Api<Synapse>,
    namespace: String,
    name: String,
    synapse: Synapse,
}

impl<'a> Pass<'a> {
    fn new(ctx: &'a ControllerState, api: Api<Synapse>, mut synapse: Synapse) -> Self {
        synapse.status.get_or_insert_with(SynapseStatus::default);
        Self {
            ctx,
            api,
            namespace: synapse.namespace().unwrap_or_else(|| "default".to_string()),
            name: synapse.name_any(),
            synapse,
        }
    }

    fn status(&mut self) -> &mut SynapseStatus {
        self.synapse.status.get_or_insert_with(SynapseStatus::default)
    }

    async fn project(&mut self) -> Result<()> {
        let working = self.status().clone();
        project_status(&self.api, &self.name, &working).await?;
        Ok(())
    }

    /// Record a FAILED state and write it out before the pass ends.
    async fn fail(&mut self, reason: String) -> Result<()> {
        warn!(reason = %reason, "Synapse {}/{} failed", self.namespace, self.name);
        self.status().set_failed(reason);
        self.project().await
    }

    async fn ensure<K, F>(&self, child_name: String, template: F) -> Result<K>
    where
        K: OwnedChild,
        F: FnOnce(&Synapse, ObjectMeta) -> Result<K>,
    {
        let meta = resources::object_meta(&self.synapse, child_name)?;
        reconcile_resource(
            &self.ctx.client,
            &self.synapse,
            meta,
            DriftPolicy::Ignore,
            template,
        )
        .await
    }

    fn config_maps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.ctx.client.clone(), &self.namespace)
    }

    /// Apply `edit` to the latest copy of ConfigMap `name` and write it back
    /// if anything changed.
    async fn edit_config_map(&self, name: &str, edit: DocumentEdit<'_>) -> Result<bool> {
        let api = self.config_maps();
        let Some(mut cm) = api.get_opt(name).await? else {
            return Err(Error::ConfigMapMissing {
                name: name.to_string(),
                namespace: self.namespace.clone(),
            });
        };

        let changed = apply_edit(&mut cm, edit)
            .map_err(|source| Error::config_document(name, edit.document_key(), source))?;
        if changed {
            // `replace` carries the resourceVersion we read, so a concurrent
            // writer turns this into a conflict instead of a lost update.
            api.replace(name, &PostParams::default(), &cm).await?;
            info!(config_map = %name, document = edit.document_key(), "Updated configuration document");
        }
        Ok(changed)
    }

    /// Cluster IP of Service `name`, read from the API server.
    async fn service_ip(&self, name: &str) -> Result<String> {
        let api: Api<Service> = Api::namespaced(self.ctx.client.clone(), &self.namespace);
        let service = api.get(name).await?;
        cluster_ip(&service).ok_or_else(|| Error::ServiceIpMissing(name.to_string()))
    }

    async fn resolve_homeserver(&mut self) -> Result<ControlFlow<Action>> {
        // `Some(name)` for a user ConfigMap, `None` for rendered values.
        let source = self.synapse.spec.homeserver.source().map(|source| match source {
            HomeserverSource::ConfigMap(cm) => Some(cm.to_string()),
            HomeserverSource::Values(_) => None,
        });
        let Some(user_config_map) = source else {
            // Admission rejects this, but objects created while the webhook
            // was down can still get here.
            self.fail("error validating Synapse config".to_string()).await?;
            return Ok(ControlFlow::Break(Action::await_change()));
        };

        match user_config_map {
            Some(cm_name) => {
                let Some(cm) = self.config_maps().get_opt(&cm_name).await? else {
                    let err = Error::ConfigMapMissing {
                        name: cm_name,
                        namespace: self.namespace.clone(),
                    };
                    self.fail(err.to_string()).await?;
                    return Err(err);
                };

                let (server_name, report_stats) =
                    parse_homeserver(cm.data.as_ref().unwrap_or(&Default::default())).map_err(
                        |source| Error::config_document(&cm_name, HOMESERVER_KEY, source),
                    )?;

                let status = self.status();
                status.homeserver_configuration.server_name = server_name;
                status.homeserver_configuration.report_stats = report_stats;
                status.homeserver_config_map_name = cm_name;
            }
            None => {
                let name = self.name.clone();
                self.ensure(name.clone(), resources::homeserver_config_map)
                    .await
                    .map(|_: ConfigMap| ())?;

                let values = self.synapse.spec.homeserver.values.clone().unwrap_or_default();
                let status = self.status();
                status.homeserver_configuration.server_name = values.server_name;
                status.homeserver_configuration.report_stats = values.report_stats;
                status.homeserver_config_map_name = name;
            }
        }

        Ok(ControlFlow::Continue(()))
    }

    async fn reconcile_database(&mut self) -> Result<ControlFlow<Action>> {
        if !self.synapse.spec.create_new_postgresql {
            return Ok(ControlFlow::Continue(()));
        }

        let clusters: Api<PostgresCluster> =
            Api::namespaced(self.ctx.client.clone(), &self.namespace);
        if let Err(e) = clusters.list(&ListParams::default().limit(1)).await {
            debug!(error = %e, "Listing PostgresClusters failed");
            self.fail(
                "Cannot create PostgreSQL cluster: the PostgresCluster CRD is not installed, \
                 is the postgres-operator deployed?"
                    .to_string(),
            )
            .await?;
            return Ok(ControlFlow::Break(Action::await_change()));
        }

        let pgsql_name = resources::postgres_config_map_name(&self.synapse);
        self.ensure(pgsql_name, resources::postgres_config_map)
            .await
            .map(|_: ConfigMap| ())?;
        let cluster: PostgresCluster = self
            .ensure(self.name.clone(), resources::postgres_cluster)
            .await?;

        // The create response carries no status; read the live object.
        let cluster = clusters.get(&cluster.name_any()).await?;
        if !is_postgres_cluster_ready(&cluster) {
            return self.database_not_ready("PostgresCluster is not ready").await;
        }

        let secret_name = resources::postgres_secret_name(&self.synapse);
        let secrets: Api<Secret> = Api::namespaced(self.ctx.client.clone(), &self.namespace);
        let Some(secret) = secrets.get_opt(&secret_name).await? else {
            return self
                .database_not_ready("PostgreSQL user Secret not created yet")
                .await;
        };

        let info = match connection_info(&secret) {
            Ok(info) => info,
            Err(err) => {
                self.fail(err.to_string()).await?;
                return Err(err);
            }
        };

        let cm_name = self.status().homeserver_config_map_name.clone();
        self.edit_config_map(&cm_name, DocumentEdit::Database(&info))
            .await?;
        self.status().database_connection_info = info;

        Ok(ControlFlow::Continue(()))
    }

    async fn database_not_ready(&mut self, why: &str) -> Result<ControlFlow<Action>> {
        info!("{}, requeueing", why);
        let status = self.status();
        status.database_connection_info.state = DATABASE_NOT_READY.to_string();
        status.set_failed(format!("PostgreSQL database not ready yet: {why}"));
        self.project().await?;
        Ok(ControlFlow::Break(Action::requeue(DATABASE_NOT_READY_REQUEUE)))
    }

    async fn reconcile_homeserver_service(&mut self) -> Result<()> {
        let _: Service = self.ensure(self.name.clone(), resources::service).await?;
        let ip = self.service_ip(&self.name).await?;
        self.status().ip = ip;
        Ok(())
    }

    async fn reconcile_heisenbridge(&mut self) -> Result<()> {
        let heisenbridge = self.synapse.spec.bridges.heisenbridge.clone();
        if !heisenbridge.enabled {
            return Ok(());
        }

        let bridge_name = resources::heisenbridge_name(&self.synapse);
        let _: Service = self
            .ensure(bridge_name.clone(), resources::heisenbridge_service)
            .await?;
        let bridge_ip = self.service_ip(&bridge_name).await?;

        let user_config_map = heisenbridge.user_config_map().map(str::to_string);
        let config_map_name = user_config_map.clone().unwrap_or_else(|| bridge_name.clone());
        {
            let status = &mut self.status().bridges_configuration.heisenbridge;
            status.ip = bridge_ip.clone();
            status.config_map_name = config_map_name.clone();
        }

        match user_config_map {
            Some(_) => {
                if self.config_maps().get_opt(&config_map_name).await?.is_none() {
                    let err = Error::ConfigMapMissing {
                        name: config_map_name,
                        namespace: self.namespace.clone(),
                    };
                    self.fail(err.to_string()).await?;
                    return Err(err);
                }
            }
            None => {
                self.ensure(bridge_name.clone(), resources::heisenbridge_config_map_template)
                    .await
                    .map(|_: ConfigMap| ())?;
            }
        }
        // A no-op for a freshly generated ConfigMap; keeps a user-supplied
        // or outdated one pointing at the current Service.
        if let Err(err) = self
            .edit_config_map(&config_map_name, DocumentEdit::BridgeUrl(&bridge_ip))
            .await
        {
            if matches!(err, Error::ConfigDocument { .. }) {
                self.fail(err.to_string()).await?;
            }
            return Err(err);
        }

        let config = &self.ctx.config;
        let _: Deployment = self
            .ensure(bridge_name, |s, meta| {
                resources::heisenbridge_deployment(s, meta, config)
            })
            .await?;

        let homeserver_cm = self.status().homeserver_config_map_name.clone();
        let registration = resources::heisenbridge_registration_path();
        self.edit_config_map(
            &homeserver_cm,
            DocumentEdit::AppserviceRegistration(&registration),
        )
        .await?;

        Ok(())
    }

    async fn reconcile_homeserver_workload(&mut self) -> Result<()> {
        let config = &self.ctx.config;
        let name = self.name.clone();

        let _: ServiceAccount = self.ensure(name.clone(), resources::service_account).await?;
        let _: RoleBinding = self
            .ensure(name.clone(), |s, meta| resources::role_binding(s, meta, config))
            .await?;
        let _: PersistentVolumeClaim = self
            .ensure(name.clone(), resources::persistent_volume_claim)
            .await?;
        let _: Deployment = self
            .ensure(name, |s, meta| resources::deployment(s, meta, config))
            .await?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<Action> {
        if !self.status().is_running() {
            info!("Synapse {}/{} is running", self.namespace, self.name);
        }
        self.status().set_running();
        self.project().await?;
        Ok(Action::await_change())
    }
}

/// Cluster IP of a Service, if one has been allocated.
fn cluster_ip(service: &Service) -> Option<String> {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.cluster_ip.as_deref())
        .filter(|ip| !ip.is_empty() && *ip != "None")
        .map(str::to_string)
}

/// Connection facts from the Secret the postgres-operator writes for the
/// `synapse` user.
fn connection_info(secret: &Secret) -> Result<DatabaseConnectionInfo> {
    let secret_name = secret.name_any();
    let value = |key: &'static str| -> Result<&[u8]> {
        secret
            .data
            .as_ref()
            .and_then(|data| data.get(key))
            .map(|bytes| bytes.0.as_slice())
            .ok_or_else(|| Error::SecretKeyMissing {
                secret: secret_name.clone(),
                key,
            })
    };
    let text = |key: &'static str| -> Result<String> {
        Ok(String::from_utf8_lossy(value(key)?).into_owned())
    };

    let host = text("host")?;
    let port = text("port")?;
    // Required, but the database name is pinned to `synapse` because the
    // postgres-operator does not create the database it advertises here.
    value("dbname")?;
    let user = text("user")?;
    let password = STANDARD.encode(value("password")?);

    Ok(DatabaseConnectionInfo {
        state: DATABASE_READY.to_string(),
        connection_url: format!("{host}:{port}"),
        database_name: SYNAPSE_DATABASE.to_string(),
        user,
        password,
    })
}
