//! Readiness of a managed PostgresCluster

use crate::crd::PostgresCluster;

/// A cluster is ready when every instance set declared in its spec has a
/// status entry whose replica counts all equal the desired replica count.
///
/// Status entries for instance sets that are no longer in the spec are
/// ignored.
pub fn is_postgres_cluster_ready(cluster: &PostgresCluster) -> bool {
    let statuses = cluster
        .status
        .as_ref()
        .map(|s| s.instances.as_slice())
        .unwrap_or_default();

    cluster.spec.instances.iter().all(|instance| {
        let desired = instance.replicas.unwrap_or(1);
        statuses
            .iter()
            .find(|status| status.name == instance.name)
            .is_some_and(|status| {
                status.replicas == desired
                    && status.ready_replicas == desired
                    && status.updated_replicas == desired
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        PostgresClusterSpec, PostgresClusterStatus, PostgresInstanceSet, PostgresInstanceSetStatus,
    };
    use proptest::prelude::*;

    fn cluster(spec: &[(&str, i32)], status: Option<&[(&str, i32, i32, i32)]>) -> PostgresCluster {
        let mut cluster = PostgresCluster::new(
            "my-synapse",
            PostgresClusterSpec {
                postgres_version: 14,
                instances: spec
                    .iter()
                    .map(|(name, replicas)| PostgresInstanceSet {
                        name: name.to_string(),
                        replicas: Some(*replicas),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            },
        );
        cluster.status = status.map(|entries| PostgresClusterStatus {
            instances: entries
                .iter()
                .map(|(name, replicas, ready, updated)| PostgresInstanceSetStatus {
                    name: name.to_string(),
                    replicas: *replicas,
                    ready_replicas: *ready,
                    updated_replicas: *updated,
                })
                .collect(),
        });
        cluster
    }

    #[test]
    fn test_ready_when_all_counts_match() {
        let c = cluster(&[("instance1", 2)], Some(&[("instance1", 2, 2, 2)]));
        assert!(is_postgres_cluster_ready(&c));
    }

    #[test]
    fn test_not_ready_without_status() {
        let c = cluster(&[("instance1", 1)], None);
        assert!(!is_postgres_cluster_ready(&c));
    }

    #[test]
    fn test_not_ready_when_instance_missing_from_status() {
        let c = cluster(
            &[("instance1", 1), ("instance2", 1)],
            Some(&[("instance1", 1, 1, 1)]),
        );
        assert!(!is_postgres_cluster_ready(&c));
    }

    #[test]
    fn test_not_ready_while_rolling() {
        let c = cluster(&[("instance1", 1)], Some(&[("instance1", 1, 1, 0)]));
        assert!(!is_postgres_cluster_ready(&c));
    }

    #[test]
    fn test_extra_status_entries_are_ignored() {
        let c = cluster(
            &[("instance1", 1)],
            Some(&[("instance1", 1, 1, 1), ("retired", 3, 0, 0)]),
        );
        assert!(is_postgres_cluster_ready(&c));
    }

    #[test]
    fn test_unset_replicas_default_to_one() {
        let mut c = cluster(&[("instance1", 1)], Some(&[("instance1", 1, 1, 1)]));
        c.spec.instances[0].replicas = None;
        assert!(is_postgres_cluster_ready(&c));
    }

    proptest! {
        #[test]
        fn prop_ready_iff_counts_match(
            desired in 0i32..4,
            replicas in 0i32..4,
            ready in 0i32..4,
            updated in 0i32..4,
        ) {
            let c = cluster(&[("instance1", desired)], Some(&[("instance1", replicas, ready, updated)]));
            let expected = replicas == desired && ready == desired && updated == desired;
            prop_assert_eq!(is_postgres_cluster_ready(&c), expected);
        }
    }
}
