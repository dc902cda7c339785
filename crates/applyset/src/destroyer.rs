//! The destroy-run facade.

use std::{collections::HashMap, sync::Arc};

use futures::channel::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    applier::send,
    client::ClusterClient,
    event::{ErrorEvent, Event, InitEvent, RunError},
    filter::FilterChain,
    graph::ObjectGraph,
    inventory::{InventoryClient, InventoryPolicy, InventoryRef, InventoryStorage},
    mutate::ApplyTimeMutator,
    object::ObjMetadataSet,
    options::DestroyerOptions,
    plan,
    poll::StatusPoller,
    run::{RunnerOptions, TaskRunner},
    validate,
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Deletes every object an inventory remembers, then the record itself.
pub struct Destroyer<S> {
    client: Arc<dyn ClusterClient>,
    poller: Arc<dyn StatusPoller>,
    inventory: Arc<InventoryClient<S>>,
}

impl<S: InventoryStorage + 'static> Destroyer<S> {
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

    /// Starts a destroy run and returns its event stream. The final event
    /// of a successful run is the `inventory-delete` group finishing.
    pub fn run(
        &self,
        reference: &InventoryRef,
        options: DestroyerOptions,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Event> {
        let (events, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let client = Arc::clone(&self.client);
        let poller = Arc::clone(&self.poller);
        let inventory = Arc::clone(&self.inventory);
        let reference = reference.clone();

        tokio::spawn(async move {
            let run = DestroyRun {
                client,
                poller,
                inventory,
                reference,
                options,
                cancel,
            };
            run.execute(events).await;
        });

        receiver
    }
}

struct DestroyRun<S> {
    client: Arc<dyn ClusterClient>,
    poller: Arc<dyn StatusPoller>,
    inventory: Arc<InventoryClient<S>>,
    reference: InventoryRef,
    options: DestroyerOptions,
    cancel: CancellationToken,
}

impl<S: InventoryStorage> DestroyRun<S> {
    async fn execute(self, mut events: mpsc::Sender<Event>) {
        if let Err(error) = self.try_execute(&mut events).await {
            let _ = futures::SinkExt::send(&mut events, Event::Error(ErrorEvent { error })).await;
        }
    }

    async fn try_execute(&self, events: &mut mpsc::Sender<Event>) -> Result<(), RunError> {
        let previous = self.inventory.load(&self.reference).await?;
        let targets = previous.ids();

        // Deletion order comes from the dependency annotations of the live
        // objects; whatever no longer exists simply has no edges.
        let mut live_objects = HashMap::new();
        for id in &targets {
            match self.client.get(id).await {
                Ok(Some(object)) => {
                    live_objects.insert(id.clone(), object);
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(%id, %error, "failed to read object for destroy planning");
                }
            }
        }

        let live_ids: ObjMetadataSet = live_objects.keys().cloned().collect();
        let missing = targets.difference(&live_ids);
        let graph = ObjectGraph::build(&live_objects, &missing);
        let layers = graph.sort_layers().map_err(validate::Error::from)?;

        let dry_run = self.options.dry_run.is_dry_run();
        let plan = plan::build_destroy_plan(&layers, &targets, dry_run);
        send(events, Event::Init(InitEvent {
            action_groups: plan.summaries(),
        }))
        .await?;

        let mut working = previous.merge(&ObjMetadataSet::new(), &targets);
        let runner = TaskRunner {
            client: Arc::clone(&self.client),
            poller: Arc::clone(&self.poller),
            mutator: ApplyTimeMutator::new(Arc::clone(&self.client)),
            apply_filters: FilterChain::for_apply(
                self.reference.id.clone(),
                InventoryPolicy::MustMatch,
            ),
            prune_filters: FilterChain::for_prune(),
            options: RunnerOptions {
                dry_run: self.options.dry_run,
                server_side: Default::default(),
                prune_propagation: self.options.delete_propagation,
                reconcile_timeout: self.options.delete_timeout,
                concurrency: self.options.concurrency,
                emit_status_events: self.options.emit_status_events,
            },
        };

        let result = runner
            .run(
                &plan,
                &live_objects,
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
                if !dry_run && let Err(save_error) = self.inventory.save(&working).await {
                    warn!(%save_error, "best-effort inventory save after abort failed");
                }
                Err(error)
            }
        }
    }
}
