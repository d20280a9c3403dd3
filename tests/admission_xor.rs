//! Property tests for the homeserver source check performed at admission.

use proptest::prelude::*;
use synapse_operator::crd::{
    ConfigMapReference, HomeserverSource, HomeserverValues, SynapseHomeserver, SynapseSpec,
};

fn config_map_strategy() -> impl Strategy<Value = Option<ConfigMapReference>> {
    prop_oneof![
        Just(None),
        Just(Some(ConfigMapReference { name: String::new() })),
        "[a-z][a-z0-9-]{0,20}".prop_map(|name| Some(ConfigMapReference { name })),
    ]
}

fn values_strategy() -> impl Strategy<Value = Option<HomeserverValues>> {
    prop_oneof![
        Just(None),
        any::<bool>().prop_map(|report_stats| Some(HomeserverValues {
            server_name: String::new(),
            report_stats,
        })),
        ("[a-z]{1,10}\\.[a-z]{2,4}", any::<bool>()).prop_map(|(server_name, report_stats)| {
            Some(HomeserverValues {
                server_name,
                report_stats,
            })
        }),
    ]
}

proptest! {
    #[test]
    fn prop_exactly_one_source_is_admitted(
        config_map in config_map_strategy(),
        values in values_strategy(),
        create_new_postgresql in any::<bool>(),
    ) {
        let has_config_map = config_map.as_ref().is_some_and(|cm| !cm.name.is_empty());
        let has_values = values.as_ref().is_some_and(|v| !v.server_name.is_empty());

        let spec = SynapseSpec {
            homeserver: SynapseHomeserver { config_map, values },
            create_new_postgresql,
            ..Default::default()
        };

        match spec.validate() {
            Ok(()) => prop_assert!(has_config_map ^ has_values),
            Err(message) => {
                prop_assert!(!(has_config_map ^ has_values));
                prop_assert_eq!(message, "error validating Synapse config");
            }
        }

        match spec.homeserver.source() {
            Some(HomeserverSource::ConfigMap(name)) => {
                prop_assert!(has_config_map && !has_values);
                prop_assert!(!name.is_empty());
            }
            Some(HomeserverSource::Values(values)) => {
                prop_assert!(has_values && !has_config_map);
                prop_assert!(!values.server_name.is_empty());
            }
            None => prop_assert!(has_config_map == has_values),
        }
    }
}
