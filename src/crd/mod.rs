//! Custom Resource Definitions used by the Synapse operator
//!
//! `Synapse` is owned by this operator. `PostgresCluster` belongs to the
//! Crunchy Data postgres-operator and is only created and read here.

mod postgres_cluster;
mod synapse;

pub use postgres_cluster::{
    DatabaseInitSql, PgBackRest, PgBackRestRepo, PostgresBackups, PostgresCluster,
    PostgresClusterSpec, PostgresClusterStatus, PostgresInstanceSet, PostgresInstanceSetStatus,
    PostgresUser, RepoVolume,
};
pub use synapse::{
    BridgesConfigurationStatus, ConfigMapReference, DatabaseConnectionInfo, HeisenbridgeSpec,
    HeisenbridgeStatus, HomeserverConfigurationStatus, HomeserverSource, HomeserverValues,
    Synapse, SynapseBridges, SynapseHomeserver, SynapseSpec, SynapseStatus, DATABASE_NOT_READY,
    DATABASE_READY, STATE_FAILED, STATE_RUNNING,
};
