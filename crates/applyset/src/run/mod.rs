//! Task execution.
//!
//! The runner walks the plan's groups strictly in order. Within a group,
//! object operations run with a bounded fan-out; between groups there is a
//! hard barrier: every event of a group is on the stream before the next
//! group starts. Per-object failures become event payloads and the run
//! carries on; only cancellation and inventory persistence failures abort.

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt, TryStreamExt, channel::mpsc, stream};
use kube::core::DynamicObject;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    annotations,
    client::{
        ClusterClient, DryRunStrategy, PatchOptions, PatchStrategy, PropagationPolicy,
        default_patch_strategy,
    },
    event::{
        ActionGroupEvent, ApplyError, ApplyEvent, ApplyStatus, DeleteEvent, Event, GroupStatus,
        PruneError, PruneEvent, PruneStatus, RunError, WaitError, WaitEvent, WaitStatus,
    },
    filter::{FilterChain, FilterContext},
    graph::ObjectGraph,
    inventory::{
        ActuationStatus, Inventory, InventoryClient, InventoryStorage, ReconcileStatus, Strategy,
    },
    mutate::ApplyTimeMutator,
    object::{ObjMetadata, ObjMetadataSet},
    options::ServerSideOptions,
    plan::{Action, TaskGroup, TaskPlan},
    poll::{StatusPhase, StatusPoller, WaitGoal, reconciles},
};

mod stats;

pub use stats::{ActionStats, RunStats};

pub(crate) struct RunnerOptions {
    pub dry_run: DryRunStrategy,
    pub server_side: ServerSideOptions,
    pub prune_propagation: PropagationPolicy,
    pub reconcile_timeout: Duration,
    pub concurrency: usize,
    pub emit_status_events: bool,
}

/// Executes one plan against the cluster.
pub(crate) struct TaskRunner {
    pub client: Arc<dyn ClusterClient>,
    pub poller: Arc<dyn StatusPoller>,
    pub mutator: ApplyTimeMutator,
    pub apply_filters: FilterChain,
    pub prune_filters: FilterChain,
    pub options: RunnerOptions,
}

/// What one object operation produced, merged into the run state after the
/// group's barrier.
struct ActuationOutcome {
    id: ObjMetadata,
    actuation: ActuationStatus,
    uid: Option<String>,
    abandoned: bool,
}

impl TaskRunner {
    /// Runs the plan to completion, streaming events and returning the
    /// final stats. `working` is updated in place so the caller can still
    /// persist a best-effort record when the run aborts.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn run<'a, S: InventoryStorage>(
        &'a self,
        plan: &'a TaskPlan,
        objects: &'a HashMap<ObjMetadata, DynamicObject>,
        graph: &'a ObjectGraph,
        previous: &'a Inventory,
        working: &'a mut Inventory,
        inventory_client: &'a InventoryClient<S>,
        mut events: mpsc::Sender<Event>,
        cancel: &'a CancellationToken,
    ) -> Result<RunStats, RunError> {
        let apply_ids: ObjMetadataSet = working
            .entries
            .iter()
            .filter(|entry| entry.strategy == Strategy::Apply)
            .map(|entry| entry.id.clone())
            .collect();
        let prune_ids: ObjMetadataSet = working
            .entries
            .iter()
            .filter(|entry| entry.strategy == Strategy::Delete)
            .map(|entry| entry.id.clone())
            .collect();

        let mut stats = RunStats::default();
        // Objects whose waits return immediately because a transitive
        // dependency failed or timed out.
        let mut skip_waits = ObjMetadataSet::new();
        // Objects detached from management instead of deleted.
        let mut abandoned = ObjMetadataSet::new();
        let dry_run = self.options.dry_run.is_dry_run();

        for group in &plan.groups {
            if cancel.is_cancelled() {
                return Err(RunError::Cancelled);
            }

            send(
                &mut events,
                Event::ActionGroup(ActionGroupEvent {
                    group_name: group.name.clone(),
                    action: group.action,
                    status: GroupStatus::Started,
                    stats: None,
                }),
            )
            .await?;
            debug!(group = group.name, action = %group.action, "task group started");

            match group.action {
                Action::InventoryAdd => {
                    if !dry_run {
                        inventory_client.save(working).await?;
                    }
                }
                Action::Apply => {
                    let outcomes = self
                        .actuation_group(
                            group, Strategy::Apply, objects, graph, previous, &apply_ids,
                            &prune_ids, &events, cancel,
                        )
                        .await?;
                    for outcome in outcomes {
                        stats.count_apply(apply_status(outcome.actuation));
                        merge_outcome(working, &mut abandoned, outcome);
                    }
                }
                Action::Prune | Action::Delete => {
                    let outcomes = self
                        .actuation_group(
                            group, Strategy::Delete, objects, graph, previous, &apply_ids,
                            &prune_ids, &events, cancel,
                        )
                        .await?;
                    for outcome in outcomes {
                        let status = prune_status(outcome.actuation);
                        if group.action == Action::Delete {
                            stats.count_delete(status);
                        } else {
                            stats.count_prune(status);
                        }
                        merge_outcome(working, &mut abandoned, outcome);
                    }
                }
                Action::Wait => {
                    self.wait_group(
                        group, graph, working, &mut skip_waits, &mut stats, &mut events,
                        cancel,
                    )
                    .await?;
                }
                Action::InventorySet => {
                    finalize_entries(working, &abandoned);
                    if !dry_run {
                        inventory_client.save(working).await?;
                    }
                }
                Action::InventoryDelete => {
                    finalize_entries(working, &abandoned);
                    if !dry_run {
                        if working.entries.is_empty() || working.is_teardown_complete() {
                            inventory_client.delete(working).await?;
                        } else {
                            // Something survived; keep the record so the
                            // destroy can be re-attempted.
                            inventory_client.save(working).await?;
                        }
                    }
                }
            }

            send(
                &mut events,
                Event::ActionGroup(ActionGroupEvent {
                    group_name: group.name.clone(),
                    action: group.action,
                    status: GroupStatus::Finished,
                    stats: Some(stats),
                }),
            )
            .await?;
        }

        info!(
            applied = stats.apply.total(),
            pruned = stats.prune.total(),
            deleted = stats.delete.total(),
            success = stats.is_success(),
            "run finished"
        );
        Ok(stats)
    }

    #[allow(clippy::too_many_arguments)]
    async fn actuation_group<'a>(
        &'a self,
        group: &'a TaskGroup,
        strategy: Strategy,
        objects: &'a HashMap<ObjMetadata, DynamicObject>,
        graph: &'a ObjectGraph,
        previous: &'a Inventory,
        apply_ids: &'a ObjMetadataSet,
        prune_ids: &'a ObjMetadataSet,
        events: &'a mpsc::Sender<Event>,
        cancel: &'a CancellationToken,
    ) -> Result<Vec<ActuationOutcome>, RunError> {
        let operations = group.objects.iter().map(|id| {
            let mut events = events.clone();
            async move {
                if cancel.is_cancelled() {
                    return Err(RunError::Cancelled);
                }
                match strategy {
                    Strategy::Apply => {
                        self.apply_object(
                            &group.name,
                            id,
                            objects.get(id),
                            graph,
                            previous,
                            apply_ids,
                            prune_ids,
                            &mut events,
                        )
                        .await
                    }
                    Strategy::Delete => {
                        self.prune_object(
                            group.action,
                            &group.name,
                            id,
                            graph,
                            previous,
                            apply_ids,
                            prune_ids,
                            &mut events,
                        )
                        .await
                    }
                }
            }
        });

        stream::iter(operations)
            .buffer_unordered(self.options.concurrency.max(1))
            .try_collect()
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_object(
        &self,
        group_name: &str,
        id: &ObjMetadata,
        desired: Option<&DynamicObject>,
        graph: &ObjectGraph,
        previous: &Inventory,
        apply_ids: &ObjMetadataSet,
        prune_ids: &ObjMetadataSet,
        events: &mut mpsc::Sender<Event>,
    ) -> Result<ActuationOutcome, RunError> {
        let emit = |status, error| {
            Event::Apply(ApplyEvent {
                group_name: group_name.to_owned(),
                id: id.clone(),
                status,
                error,
            })
        };
        let Some(desired) = desired else {
            // The planner never emits an apply for an object it has no
            // manifest for; treat it as a failed actuation if it happens.
            send(events, emit(ApplyStatus::Failed, None)).await?;
            return Ok(ActuationOutcome::new(id, ActuationStatus::Failed));
        };

        let live = match self.client.get(id).await {
            Ok(live) => live,
            Err(source) => {
                send(events, emit(ApplyStatus::Failed, Some(ApplyError::Run { source }))).await?;
                return Ok(ActuationOutcome::new(id, ActuationStatus::Failed));
            }
        };

        let context = FilterContext {
            live: live.as_ref(),
            inventory: previous,
            apply_ids,
            prune_ids,
            graph,
        };
        if let Err(reason) = self.apply_filters.evaluate(id, desired, &context) {
            debug!(%id, %reason, "apply filtered");
            let error = (!reason.is_silent()).then_some(ApplyError::Filtered { source: reason });
            send(events, emit(ApplyStatus::Skipped, error)).await?;
            return Ok(ActuationOutcome::new(id, ActuationStatus::Skipped));
        }

        let mut object = desired.clone();
        if let Err(source) = self.mutator.mutate(&mut object).await {
            send(
                events,
                emit(ApplyStatus::Failed, Some(ApplyError::Mutation { source })),
            )
            .await?;
            return Ok(ActuationOutcome::new(id, ActuationStatus::Failed));
        }
        annotations::set_owning_inventory(&mut object, &previous.reference.id);

        if self.options.dry_run.client_dry_run() {
            send(events, emit(ApplyStatus::Successful, None)).await?;
            let mut outcome = ActuationOutcome::new(id, ActuationStatus::Succeeded);
            outcome.uid = live.and_then(|live| live.metadata.uid);
            return Ok(outcome);
        }

        let server_dry_run = self.options.dry_run.server_dry_run();
        let result = if self.options.server_side.enabled {
            self.client
                .patch(
                    id,
                    &serde_json::to_value(&object).unwrap_or_default(),
                    PatchStrategy::ServerSideApply,
                    &PatchOptions {
                        field_manager: self.options.server_side.field_manager.clone(),
                        force_conflicts: self.options.server_side.force_conflicts,
                        server_dry_run,
                    },
                )
                .await
        } else if live.is_none() {
            self.client.create(&object, server_dry_run).await
        } else {
            self.client
                .patch(
                    id,
                    &serde_json::to_value(&object).unwrap_or_default(),
                    default_patch_strategy(&id.group_kind),
                    &PatchOptions {
                        server_dry_run,
                        ..PatchOptions::default()
                    },
                )
                .await
        };

        match result {
            Ok(applied) => {
                send(events, emit(ApplyStatus::Successful, None)).await?;
                let mut outcome = ActuationOutcome::new(id, ActuationStatus::Succeeded);
                outcome.uid = applied.metadata.uid;
                Ok(outcome)
            }
            Err(source) => {
                send(events, emit(ApplyStatus::Failed, Some(ApplyError::Run { source }))).await?;
                Ok(ActuationOutcome::new(id, ActuationStatus::Failed))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn prune_object(
        &self,
        action: Action,
        group_name: &str,
        id: &ObjMetadata,
        graph: &ObjectGraph,
        previous: &Inventory,
        apply_ids: &ObjMetadataSet,
        prune_ids: &ObjMetadataSet,
        events: &mut mpsc::Sender<Event>,
    ) -> Result<ActuationOutcome, RunError> {
        let emit = |status, error| match action {
            Action::Delete => Event::Delete(DeleteEvent {
                group_name: group_name.to_owned(),
                id: id.clone(),
                status,
                error,
            }),
            _ => Event::Prune(PruneEvent {
                group_name: group_name.to_owned(),
                id: id.clone(),
                status,
                error,
            }),
        };

        let live = match self.client.get(id).await {
            Ok(live) => live,
            Err(source) => {
                send(events, emit(PruneStatus::Failed, Some(PruneError::Run { source }))).await?;
                return Ok(ActuationOutcome::new(id, ActuationStatus::Failed));
            }
        };
        let Some(live) = live else {
            // Already gone; the wait will observe NotFound immediately.
            send(events, emit(PruneStatus::Successful, None)).await?;
            return Ok(ActuationOutcome::new(id, ActuationStatus::Succeeded));
        };

        let context = FilterContext {
            live: Some(&live),
            inventory: previous,
            apply_ids,
            prune_ids,
            graph,
        };
        if let Err(reason) = self.prune_filters.evaluate(id, &live, &context) {
            debug!(%id, %reason, "prune filtered");
            let abandons = reason.abandons_object();
            if abandons && !self.options.dry_run.is_dry_run() {
                self.abandon_object(id).await;
            }
            let error = (!reason.is_silent()).then_some(PruneError::Filtered { source: reason });
            send(events, emit(PruneStatus::Skipped, error)).await?;
            let mut outcome = ActuationOutcome::new(id, ActuationStatus::Skipped);
            outcome.abandoned = abandons;
            return Ok(outcome);
        }

        if self.options.dry_run.client_dry_run() {
            send(events, emit(PruneStatus::Successful, None)).await?;
            return Ok(ActuationOutcome::new(id, ActuationStatus::Succeeded));
        }

        match self
            .client
            .delete(
                id,
                self.options.prune_propagation,
                self.options.dry_run.server_dry_run(),
            )
            .await
        {
            Ok(()) => {
                send(events, emit(PruneStatus::Successful, None)).await?;
                Ok(ActuationOutcome::new(id, ActuationStatus::Succeeded))
            }
            Err(source) => {
                send(events, emit(PruneStatus::Failed, Some(PruneError::Run { source }))).await?;
                Ok(ActuationOutcome::new(id, ActuationStatus::Failed))
            }
        }
    }

    /// Strips the owning-inventory annotation so the object stays in the
    /// cluster but leaves management.
    async fn abandon_object(&self, id: &ObjMetadata) {
        let patch = json!({
            "metadata": {
                "annotations": {
                    annotations::OWNING_INVENTORY_ANNOTATION: null,
                }
            }
        });
        if let Err(error) = self
            .client
            .patch(id, &patch, PatchStrategy::JsonMerge, &PatchOptions::default())
            .await
        {
            // Losing the annotation is not worth failing the prune skip
            // over; the next run's policy filter will sort it out.
            tracing::warn!(%id, %error, "failed to detach abandoned object");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn wait_group(
        &self,
        group: &TaskGroup,
        graph: &ObjectGraph,
        working: &mut Inventory,
        skip_waits: &mut ObjMetadataSet,
        stats: &mut RunStats,
        events: &mut mpsc::Sender<Event>,
        cancel: &CancellationToken,
    ) -> Result<(), RunError> {
        let Some(goal) = group.wait_goal else {
            return Ok(());
        };
        let emit = |id: &ObjMetadata, status, error| {
            Event::Wait(WaitEvent {
                group_name: group.name.clone(),
                id: id.clone(),
                status,
                error,
            })
        };

        let mut pending = ObjMetadataSet::new();
        for id in &group.objects {
            let actuated = working
                .entry(id)
                .map(|entry| entry.actuation == ActuationStatus::Succeeded)
                .unwrap_or(false);

            if skip_waits.contains(id) {
                set_reconcile(working, id, ReconcileStatus::Skipped);
                send(
                    events,
                    emit(id, WaitStatus::Skipped, Some(WaitError::DependencySkipped)),
                )
                .await?;
                stats.count_wait(WaitStatus::Skipped);
            } else if !actuated {
                set_reconcile(working, id, ReconcileStatus::Skipped);
                send(events, emit(id, WaitStatus::Skipped, None)).await?;
                stats.count_wait(WaitStatus::Skipped);
            } else {
                send(events, emit(id, WaitStatus::Pending, None)).await?;
                pending.insert(id.clone());
            }
        }

        if pending.is_empty() {
            return Ok(());
        }

        let poll_cancel = cancel.child_token();
        let mut statuses = self.poller.poll(&pending, poll_cancel.clone());
        let deadline = tokio::time::Instant::now() + self.options.reconcile_timeout;
        let mut remaining = pending;

        while !remaining.is_empty() {
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(RunError::Cancelled);
                }
                () = tokio::time::sleep_until(deadline) => {
                    for id in remaining.iter() {
                        set_reconcile(working, id, ReconcileStatus::Timeout);
                        send(
                            events,
                            emit(id, WaitStatus::Timeout, Some(WaitError::ReconcileTimeout)),
                        )
                        .await?;
                        stats.count_wait(WaitStatus::Timeout);
                    }
                    skip_waits.extend(graph.transitive_dependents(&remaining));
                    break;
                }
                status = statuses.next() => {
                    let Some(status) = status else { break };
                    let reconciled = reconciles(goal, status.phase);
                    let failed = goal == WaitGoal::Current && status.phase == StatusPhase::Failed;

                    if self.options.emit_status_events {
                        send(events, Event::Status(status.clone())).await?;
                    }
                    if !remaining.contains(&status.id) {
                        continue;
                    }

                    if reconciled {
                        remaining.remove(&status.id);
                        set_reconcile(working, &status.id, ReconcileStatus::Succeeded);
                        send(events, emit(&status.id, WaitStatus::Successful, None)).await?;
                        stats.count_wait(WaitStatus::Successful);
                    } else if failed {
                        remaining.remove(&status.id);
                        set_reconcile(working, &status.id, ReconcileStatus::Failed);
                        send(
                            events,
                            emit(&status.id, WaitStatus::Failed, Some(WaitError::ReconcileFailed)),
                        )
                        .await?;
                        stats.count_wait(WaitStatus::Failed);
                        let roots: ObjMetadataSet = [status.id.clone()].into_iter().collect();
                        skip_waits.extend(graph.transitive_dependents(&roots));
                    }
                }
            }
        }

        poll_cancel.cancel();
        Ok(())
    }
}

fn apply_status(actuation: ActuationStatus) -> ApplyStatus {
    match actuation {
        ActuationStatus::Succeeded => ApplyStatus::Successful,
        ActuationStatus::Skipped => ApplyStatus::Skipped,
        ActuationStatus::Failed | ActuationStatus::Pending => ApplyStatus::Failed,
    }
}

fn prune_status(actuation: ActuationStatus) -> PruneStatus {
    match actuation {
        ActuationStatus::Succeeded => PruneStatus::Successful,
        ActuationStatus::Skipped => PruneStatus::Skipped,
        ActuationStatus::Failed | ActuationStatus::Pending => PruneStatus::Failed,
    }
}

impl ActuationOutcome {
    fn new(id: &ObjMetadata, actuation: ActuationStatus) -> Self {
        Self {
            id: id.clone(),
            actuation,
            uid: None,
            abandoned: false,
        }
    }
}

fn merge_outcome(working: &mut Inventory, abandoned: &mut ObjMetadataSet, outcome: ActuationOutcome) {
    if outcome.abandoned {
        abandoned.insert(outcome.id.clone());
    }
    if let Some(entry) = working.entry_mut(&outcome.id) {
        entry.actuation = outcome.actuation;
        if let Some(uid) = outcome.uid {
            entry.uid = uid;
        }
    }
}

fn set_reconcile(working: &mut Inventory, id: &ObjMetadata, status: ReconcileStatus) {
    if let Some(entry) = working.entry_mut(id) {
        entry.reconcile = status;
    }
}

/// Drops entries the run is done with: pruned objects that are confirmed
/// gone, and abandoned objects that left management. Everything else stays
/// so a later run can pick it up again.
fn finalize_entries(working: &mut Inventory, abandoned: &ObjMetadataSet) {
    working.entries.retain(|entry| {
        if abandoned.contains(&entry.id) {
            return false;
        }
        let pruned_and_gone = entry.strategy == Strategy::Delete
            && entry.actuation == ActuationStatus::Succeeded
            && matches!(
                entry.reconcile,
                ReconcileStatus::Succeeded | ReconcileStatus::Skipped
            );
        !pruned_and_gone
    });
}

async fn send(events: &mut mpsc::Sender<Event>, event: Event) -> Result<(), RunError> {
    // A dropped receiver means nobody is listening anymore; treat it like
    // a cancellation so the run stops cleanly.
    events.send(event).await.map_err(|_| RunError::Cancelled)
}
