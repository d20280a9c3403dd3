//! Controller module for Synapse reconciliation
//!
//! This module contains the main controller loop, reconciliation logic,
//! and the templates and document edits for the objects a Synapse owns.

mod child;
mod homeserver_config;
mod postgres;
mod reconciler;
pub mod resources;
mod status;


pub use child::{reconcile_resource, set_owner_reference, DriftPolicy};
pub use homeserver_config::{
    apply_edit, bridge_url, load_document, merge_appservice_registration, merge_database_section,
    parse_homeserver, rewrite_bridge_url, split_connection_url, DocumentEdit,
    HomeserverConfigError, HEISENBRIDGE_KEY, HEISENBRIDGE_PORT, HOMESERVER_KEY,
};
pub use postgres::is_postgres_cluster_ready;
pub use reconciler::{reconcile_synapse, run_controller, ControllerState};
pub use status::{project_status, status_patch};
