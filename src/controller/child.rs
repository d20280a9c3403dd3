//! Create-or-get for objects owned by a `Synapse`

use std::fmt::Debug;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, PostParams},
    client::Client,
    Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

use crate::crd::Synapse;
use crate::error::{Error, Result};

use super::resources::owner_reference;

/// What to do with a child that already exists.
///
/// Only `Ignore` exists today: existing children are returned untouched even
/// if their template has changed since they were created. Deployments and
/// Services could be updated safely; PersistentVolumeClaims could not.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DriftPolicy {
    #[default]
    Ignore,
}

/// Capabilities every child kind shares: fetch by name, create, and carry
/// an owner reference.
pub trait OwnedChild:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> OwnedChild for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Make `synapse` the sole controller of `child`.
pub fn set_owner_reference<K: Resource>(child: &mut K, synapse: &Synapse) -> Result<()> {
    let owner = owner_reference(synapse)?;
    let refs = child.meta_mut().owner_references.get_or_insert_with(Vec::new);
    refs.retain(|r| r.uid != owner.uid && r.controller != Some(true));
    refs.push(owner);
    Ok(())
}

fn labels_drifted<K: Resource>(desired: &ObjectMeta, existing: &K) -> bool {
    let actual = existing.labels();
    desired
        .labels
        .iter()
        .flatten()
        .any(|(key, value)| actual.get(key) != Some(value))
}

/// Fetch the child named by `meta`; when it does not exist, build it with
/// `template`, set the owner reference and create it.
///
/// Existing children are handled according to `drift`. Errors other than
/// "not found" are returned to the caller.
pub async fn reconcile_resource<K, F>(
    client: &Client,
    synapse: &Synapse,
    meta: ObjectMeta,
    drift: DriftPolicy,
    template: F,
) -> Result<K>
where
    K: OwnedChild,
    F: FnOnce(&Synapse, ObjectMeta) -> Result<K>,
{
    let name = meta
        .name
        .clone()
        .ok_or_else(|| Error::ConfigError(format!("{} template without a name", K::kind(&()))))?;
    let namespace = meta
        .namespace
        .clone()
        .or_else(|| synapse.namespace())
        .unwrap_or_else(|| "default".to_string());
    let api: Api<K> = Api::namespaced(client.clone(), &namespace);

    if let Some(existing) = api.get_opt(&name).await? {
        match drift {
            DriftPolicy::Ignore => {
                if labels_drifted(&meta, &existing) {
                    debug!(kind = %K::kind(&()), %namespace, %name, "Child labels drifted from template, ignoring");
                }
            }
        }
        return Ok(existing);
    }

    let mut child = template(synapse, meta)?;
    set_owner_reference(&mut child, synapse)?;

    info!(kind = %K::kind(&()), %namespace, %name, "Creating child resource");
    match api.create(&PostParams::default(), &child).await {
        Ok(created) => Ok(created),
        // Created by a concurrent pass between our get and create.
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(api.get(&name).await?),
        Err(e) => Err(Error::KubeError(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::SynapseSpec;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn synapse(uid: Option<&str>) -> Synapse {
        let mut s = Synapse::new("my-synapse", SynapseSpec::default());
        s.metadata.namespace = Some("matrix".to_string());
        s.metadata.uid = uid.map(String::from);
        s
    }

    #[test]
    fn test_set_owner_reference_is_idempotent() {
        let owner = synapse(Some("uid-1"));
        let mut cm = ConfigMap::default();
        set_owner_reference(&mut cm, &owner).unwrap();
        set_owner_reference(&mut cm, &owner).unwrap();

        let refs = cm.owner_references();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].uid, "uid-1");
        assert_eq!(refs[0].kind, "Synapse");
        assert_eq!(refs[0].controller, Some(true));
    }

    #[test]
    fn test_set_owner_reference_replaces_foreign_controller() {
        let owner = synapse(Some("uid-1"));
        let mut cm = ConfigMap::default();
        cm.metadata.owner_references = Some(vec![
            OwnerReference {
                api_version: "synapse.opdev.io/v1alpha1".to_string(),
                kind: "Synapse".to_string(),
                name: "other".to_string(),
                uid: "uid-2".to_string(),
                controller: Some(true),
                ..Default::default()
            },
            OwnerReference {
                api_version: "v1".to_string(),
                kind: "ConfigMap".to_string(),
                name: "plain-owner".to_string(),
                uid: "uid-3".to_string(),
                ..Default::default()
            },
        ]);
        set_owner_reference(&mut cm, &owner).unwrap();

        let uids: Vec<&str> = cm.owner_references().iter().map(|r| r.uid.as_str()).collect();
        assert_eq!(uids, vec!["uid-3", "uid-1"]);
    }

    #[test]
    fn test_labels_drifted() {
        let desired = ObjectMeta {
            labels: Some([("app".to_string(), "synapse".to_string())].into()),
            ..Default::default()
        };
        let mut cm = ConfigMap::default();
        assert!(labels_drifted(&desired, &cm));

        cm.metadata.labels = Some(
            [
                ("app".to_string(), "synapse".to_string()),
                ("extra".to_string(), "kept".to_string()),
            ]
            .into(),
        );
        assert!(!labels_drifted(&desired, &cm));
    }

    #[test]
    fn test_set_owner_reference_requires_uid() {
        let owner = synapse(None);
        let mut cm = ConfigMap::default();
        assert!(matches!(
            set_owner_reference(&mut cm, &owner),
            Err(Error::MissingOwnerReference(_))
        ));
    }
}
