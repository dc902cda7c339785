//! The apply-run facade.

use std::sync::Arc;

use futures::channel::mpsc;
use kube::core::DynamicObject;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    client::ClusterClient,
    event::{ErrorEvent, Event, InitEvent, RunError, ValidationEvent},
    filter::FilterChain,
    graph::ObjectGraph,
    inventory::{InventoryClient, InventoryRef, InventoryStorage},
    mutate::ApplyTimeMutator,
    options::ApplierOptions,
    plan,
    poll::StatusPoller,
    run::{RunnerOptions, TaskRunner},
    validate::{self, Finding},
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Drives a cluster toward a desired object set, pruning what the
/// inventory remembers but the set no longer contains.
///
/// An applier is cheap to construct and holds no per-run state; every
/// [`run`](Self::run) owns its plan, its graph and its event channel.
pub struct Applier<S> {
    client: Arc<dyn ClusterClient>,
    poller: Arc<dyn StatusPoller>,
    inventory: Arc<InventoryClient<S>>,
}

impl<S: InventoryStorage + 'static> Applier<S> {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        poller: Arc<dyn StatusPoller>,
        storage: S,
    ) -> Self {
        Self {
            client,
            poller,
            inventory: Arc::new(InventoryClient::new(storage)),
        }
    }

    /// Starts an apply run and returns its event stream.
    ///
    /// The stream ends when the run finishes; a terminal [`Event::Error`]
    /// is emitted only for cancellation, inventory persistence failure or
    /// validation under the exit-early policy.
    pub fn run(
        &self,
        reference: &InventoryRef,
        manifests: Vec<DynamicObject>,
        options: ApplierOptions,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Event> {
        let (events, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let client = Arc::clone(&self.client);
        let poller = Arc::clone(&self.poller);
        let inventory = Arc::clone(&self.inventory);
        let reference = reference.clone();

        tokio::spawn(async move {
            let run = ApplyRun {
                client,
                poller,
                inventory,
                reference,
                options,
                cancel,
            };
            run.execute(manifests, events).await;
        });

        receiver
    }
}

struct ApplyRun<S> {
    client: Arc<dyn ClusterClient>,
    poller: Arc<dyn StatusPoller>,
    inventory: Arc<InventoryClient<S>>,
    reference: InventoryRef,
    options: ApplierOptions,
    cancel: CancellationToken,
}

impl<S: InventoryStorage> ApplyRun<S> {
    async fn execute(self, manifests: Vec<DynamicObject>, mut events: mpsc::Sender<Event>) {
        if let Err(error) = self.try_execute(manifests, &mut events).await {
            let _ = futures::SinkExt::send(&mut events, Event::Error(ErrorEvent { error })).await;
        }
    }

    async fn try_execute<'a>(
        &'a self,
        manifests: Vec<DynamicObject>,
        events: &'a mut mpsc::Sender<Event>,
    ) -> Result<(), RunError> {
        let policy = self.options.validation_policy;

        // Stage one: per-object validation.
        let (mut objects, desired_order, mut findings) =
            validate::check_objects(manifests, policy)?;

        // The previous inventory decides what becomes a prune candidate.
        // Objects that failed validation are excluded from pruning: they
        // are still wanted, just not applicable this run.
        let previous = self.inventory.load(&self.reference).await?;
        let mut excluded = desired_order.clone();
        for finding in &findings {
            excluded.extend(finding.identifiers.iter().cloned());
        }
        let prune_ids = previous.ids().difference(&excluded);

        // Stage two: graph validation over the combined vertex set.
        let graph = ObjectGraph::build(&objects, &prune_ids);
        let (removed, graph_findings) =
            validate::check_graph(&graph, &self.client, policy).await?;
        findings.extend(graph_findings);

        emit_validation_events(events, findings).await?;

        let desired = desired_order.difference(&removed);
        for id in removed.iter() {
            objects.remove(id);
        }

        // The planning graph must not carry edges of removed objects.
        let graph = ObjectGraph::build(&objects, &prune_ids);
        let layers = graph.sort_layers().map_err(validate::Error::from)?;

        let dry_run = self.options.dry_run.is_dry_run();
        let plan = plan::build_apply_plan(&layers, &desired, &prune_ids, dry_run);
        send(events, Event::Init(InitEvent {
            action_groups: plan.summaries(),
        }))
        .await?;

        let mut working = previous.merge(&desired, &prune_ids);
        let runner = TaskRunner {
            client: Arc::clone(&self.client),
            poller: Arc::clone(&self.poller),
            mutator: ApplyTimeMutator::new(Arc::clone(&self.client)),
            apply_filters: FilterChain::for_apply(
                self.reference.id.clone(),
                self.options.inventory_policy,
            ),
            prune_filters: FilterChain::for_prune(),
            options: RunnerOptions {
                dry_run: self.options.dry_run,
                server_side: self.options.server_side.clone(),
                prune_propagation: self.options.prune_propagation,
                reconcile_timeout: self.options.reconcile_timeout,
                concurrency: self.options.concurrency,
                emit_status_events: self.options.emit_status_events,
            },
        };

        let result = runner
            .run(
                &plan,
                &objects,
                &graph,
                &previous,
                &mut working,
                &self.inventory,
                events.clone(),
                &self.cancel,
            )
            .await;

        match result {
            Ok(_stats) => Ok(()),
            Err(error) => {
                // Crash safety: whatever already happened must be on
                // record, even though the run is aborting.
                if !dry_run && let Err(save_error) = self.inventory.save(&working).await {
                    warn!(%save_error, "best-effort inventory save after abort failed");
                }
                Err(error)
            }
        }
    }
}

pub(crate) async fn emit_validation_events(
    events: &mut mpsc::Sender<Event>,
    findings: Vec<Finding>,
) -> Result<(), RunError> {
    for finding in findings {
        send(
            events,
            Event::Validation(ValidationEvent {
                identifiers: finding.identifiers,
                error: finding.error,
            }),
        )
        .await?;
    }
    Ok(())
}

pub(crate) async fn send(
    events: &mut mpsc::Sender<Event>,
    event: Event,
) -> Result<(), RunError> {
    futures::SinkExt::send(events, event)
        .await
        .map_err(|_| RunError::Cancelled)
}
