//! The strongly-typed event log of a run.
//!
//! A run emits exactly one stream of [`Event`]s over a bounded channel:
//! single producer (the runner), single consumer (the caller). Per-object
//! failures ride inside their Apply/Prune/Delete/Wait events and never
//! abort the run; a terminal [`Event::Error`] is reserved for cancellation,
//! inventory persistence failure and validation under the exit-early
//! policy.

use snafu::Snafu;
use strum::Display;

use crate::{
    client, filter::FilterError, inventory, mutate, object::ObjMetadata, plan::Action,
    poll::StatusEvent, run::RunStats, validate,
};

/// Everything a run can tell its consumer.
#[derive(Debug)]
pub enum Event {
    /// First event of a run (after validation events), announcing the plan.
    Init(InitEvent),
    /// A validation finding; the named objects were dropped from the run.
    Validation(ValidationEvent),
    /// A task group started or finished.
    ActionGroup(ActionGroupEvent),
    Apply(ApplyEvent),
    Prune(PruneEvent),
    Delete(DeleteEvent),
    Wait(WaitEvent),
    /// A raw status observation, forwarded when status events are enabled.
    Status(StatusEvent),
    /// Terminal failure; no further events follow.
    Error(ErrorEvent),
}

#[derive(Debug)]
pub struct InitEvent {
    pub action_groups: Vec<ActionGroupSummary>,
}

/// One planned task group, as announced by [`InitEvent`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionGroupSummary {
    pub name: String,
    pub action: Action,
    pub identifiers: Vec<ObjMetadata>,
}

#[derive(Debug)]
pub struct ValidationEvent {
    pub identifiers: Vec<ObjMetadata>,
    pub error: validate::Error,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum GroupStatus {
    Started,
    Finished,
}

#[derive(Debug)]
pub struct ActionGroupEvent {
    pub group_name: String,
    pub action: Action,
    pub status: GroupStatus,
    /// Cumulative counters, attached when the group finishes.
    pub stats: Option<RunStats>,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum ApplyStatus {
    Successful,
    Skipped,
    Failed,
}

#[derive(Debug)]
pub struct ApplyEvent {
    pub group_name: String,
    pub id: ObjMetadata,
    pub status: ApplyStatus,
    pub error: Option<ApplyError>,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum PruneStatus {
    Successful,
    Skipped,
    Failed,
}

#[derive(Debug)]
pub struct PruneEvent {
    pub group_name: String,
    pub id: ObjMetadata,
    pub status: PruneStatus,
    pub error: Option<PruneError>,
}

#[derive(Debug)]
pub struct DeleteEvent {
    pub group_name: String,
    pub id: ObjMetadata,
    pub status: PruneStatus,
    pub error: Option<PruneError>,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum WaitStatus {
    Pending,
    Successful,
    Skipped,
    Failed,
    Timeout,
}

#[derive(Debug)]
pub struct WaitEvent {
    pub group_name: String,
    pub id: ObjMetadata,
    pub status: WaitStatus,
    pub error: Option<WaitError>,
}

#[derive(Debug)]
pub struct ErrorEvent {
    pub error: RunError,
}

/// Why one apply did not go through.
#[derive(Debug, Snafu)]
pub enum ApplyError {
    #[snafu(display("apply was skipped"), context(false))]
    Filtered { source: FilterError },

    #[snafu(display("apply-time mutation failed"), context(false))]
    Mutation { source: mutate::Error },

    #[snafu(display("apply request failed"), context(false))]
    Run { source: client::Error },
}

/// Why one prune or deletion did not go through.
#[derive(Debug, Snafu)]
pub enum PruneError {
    #[snafu(display("prune was skipped"), context(false))]
    Filtered { source: FilterError },

    #[snafu(display("delete request failed"), context(false))]
    Run { source: client::Error },
}

/// Why one wait did not end in success.
#[derive(Debug, PartialEq, Snafu)]
pub enum WaitError {
    #[snafu(display("object did not reconcile within the wait timeout"))]
    ReconcileTimeout,

    #[snafu(display("object reached a failed state"))]
    ReconcileFailed,

    #[snafu(display("a dependency failed to reconcile"))]
    DependencySkipped,
}

/// Terminal failures.
#[derive(Debug, Snafu)]
pub enum RunError {
    #[snafu(display("run was cancelled"))]
    Cancelled,

    #[snafu(display("validation failed"), context(false))]
    Validation { source: validate::Error },

    #[snafu(display("inventory persistence failed"), context(false))]
    Inventory { source: inventory::Error },
}

impl Event {
    /// Terminal events end the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}
