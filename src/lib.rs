//! Kubernetes operator for Matrix Synapse homeservers
//!
//! Reconciles `Synapse` custom resources into a homeserver Deployment and
//! its supporting objects, optionally backed by a PostgreSQL cluster from
//! the postgres-operator and accompanied by the Heisenbridge IRC bridge.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;

#[cfg(feature = "admission-webhook")]
pub mod webhook;

pub use error::{Error, Result};
