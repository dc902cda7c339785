//! Dependency-aware declarative resource application for Kubernetes.
//!
//! Given a set of desired manifests and a named, durable *inventory* of
//! what earlier runs applied, the [`Applier`] drives the cluster toward
//! the desired state: it creates or updates present objects in dependency
//! order, prunes absent ones in reverse order, waits for reconciliation,
//! and keeps the inventory crash-safe throughout. The [`Destroyer`] tears
//! a whole inventory down again.
//!
//! Both facades stream a strongly-typed [`event::Event`] log; per-object
//! failures ride inside the events and never abort a run.

pub mod annotations;
pub mod applier;
pub mod client;
pub mod destroyer;
pub mod event;
pub mod filter;
pub mod graph;
pub mod inventory;
pub mod mutate;
pub mod object;
pub mod options;
pub mod plan;
pub mod poll;
pub mod run;
pub mod testing;
pub mod validate;

pub use applier::Applier;
pub use client::{DryRunStrategy, KubeClusterClient, PropagationPolicy};
pub use destroyer::Destroyer;
pub use inventory::{InventoryPolicy, InventoryRef};
pub use object::{ObjMetadata, ObjMetadataSet};
pub use options::{ApplierOptions, DestroyerOptions, ServerSideOptions};
pub use run::RunStats;
pub use validate::ValidationPolicy;

// External re-exports
pub use k8s_openapi;
pub use kube;
