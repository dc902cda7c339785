//! Per-run configuration of the applier and destroyer facades.

use std::time::Duration;

use crate::{
    client::{DryRunStrategy, PropagationPolicy},
    inventory::InventoryPolicy,
    validate::ValidationPolicy,
};

/// Server-side apply configuration.
#[derive(Clone, Debug)]
pub struct ServerSideOptions {
    /// Use server-side apply instead of client-side patching.
    pub enabled: bool,
    /// Take over fields owned by other field managers on conflict.
    pub force_conflicts: bool,
    /// The field manager recorded for applied fields.
    pub field_manager: String,
}

impl Default for ServerSideOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            force_conflicts: false,
            field_manager: "applyset".to_owned(),
        }
    }
}

/// Options of one apply run.
#[derive(Clone, Debug)]
pub struct ApplierOptions {
    pub server_side: ServerSideOptions,
    pub dry_run: DryRunStrategy,
    /// Per wait group: how long objects get to reconcile.
    pub reconcile_timeout: Duration,
    pub prune_propagation: PropagationPolicy,
    pub inventory_policy: InventoryPolicy,
    pub validation_policy: ValidationPolicy,
    /// Forward raw status observations as `Status` events.
    pub emit_status_events: bool,
    /// Concurrent object operations within one task group.
    pub concurrency: usize,
}

impl Default for ApplierOptions {
    fn default() -> Self {
        Self {
            server_side: ServerSideOptions::default(),
            dry_run: DryRunStrategy::None,
            reconcile_timeout: Duration::from_secs(300),
            prune_propagation: PropagationPolicy::Background,
            inventory_policy: InventoryPolicy::default(),
            validation_policy: ValidationPolicy::default(),
            emit_status_events: false,
            concurrency: 1,
        }
    }
}

/// Options of one destroy run.
#[derive(Clone, Debug)]
pub struct DestroyerOptions {
    pub dry_run: DryRunStrategy,
    /// Per wait group: how long deletions get to finish.
    pub delete_timeout: Duration,
    pub delete_propagation: PropagationPolicy,
    pub emit_status_events: bool,
    pub concurrency: usize,
}

impl Default for DestroyerOptions {
    fn default() -> Self {
        Self {
            dry_run: DryRunStrategy::None,
            delete_timeout: Duration::from_secs(300),
            delete_propagation: PropagationPolicy::Background,
            emit_status_events: false,
            concurrency: 1,
        }
    }
}
