//! Status projection for `Synapse`
//!
//! The reconciler mutates a working copy of the status during a pass. This
//! module writes that copy back as a JSON merge patch against the latest
//! observed object, touching only fields that differ and never `spec`.

use kube::{
    api::{Api, Patch, PatchParams},
    ResourceExt,
};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::crd::{Synapse, SynapseStatus};
use crate::error::Result;

/// Write `working` to the status subresource of `name` if it differs from
/// what the API server holds.
///
/// Returns `true` when a patch was sent. The patch carries the observed
/// `resourceVersion`, so a concurrent write surfaces as a 409 conflict that
/// the next pass resolves.
pub async fn project_status(api: &Api<Synapse>, name: &str, working: &SynapseStatus) -> Result<bool> {
    let Some(latest) = api.get_opt(name).await? else {
        debug!(%name, "Synapse deleted before status could be written");
        return Ok(false);
    };

    if latest.status.as_ref() == Some(working) {
        return Ok(false);
    }

    let patch = status_patch(&latest, working)?;
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    debug!(%name, state = %working.state, "Synapse status updated");
    Ok(true)
}

/// Merge patch turning `latest.status` into `working`.
pub fn status_patch(latest: &Synapse, working: &SynapseStatus) -> Result<Value> {
    let observed = serde_json::to_value(&latest.status)?;
    let desired = serde_json::to_value(working)?;

    let mut patch = Map::new();
    if let Some(resource_version) = latest.resource_version() {
        patch.insert(
            "metadata".to_string(),
            json!({ "resourceVersion": resource_version }),
        );
    }
    patch.insert("status".to_string(), merge_diff(&observed, &desired));
    Ok(Value::Object(patch))
}

/// RFC 7386 merge patch from `from` to `to`.
fn merge_diff(from: &Value, to: &Value) -> Value {
    match (from, to) {
        (Value::Object(old), Value::Object(new)) => {
            let mut diff = Map::new();
            for (key, value) in new {
                match old.get(key) {
                    Some(previous) if previous == value => {}
                    Some(previous) => {
                        diff.insert(key.clone(), merge_diff(previous, value));
                    }
                    None => {
                        diff.insert(key.clone(), value.clone());
                    }
                }
            }
            for key in old.keys() {
                if !new.contains_key(key) {
                    diff.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(diff)
        }
        _ => to.clone(),
    }
}
