//! Object status polling.
//!
//! The runner's wait tasks consume a lazy sequence of [`StatusEvent`]s and
//! decide reconciliation verdicts from it; where the events come from is
//! behind the [`StatusPoller`] trait. The bundled [`PollingStatusPoller`]
//! derives phases from periodic GETs using the readiness rules in
//! [`status`].

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::stream::BoxStream;
use strum::Display;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    client::ClusterClient,
    object::{ObjMetadata, ObjMetadataSet},
};

pub mod status;

/// Where an object stands relative to its desired state.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum StatusPhase {
    /// The object exists but has not reached its desired state yet.
    InProgress,
    /// The object matches its desired state.
    Current,
    /// The object reached a state it cannot recover from on its own.
    Failed,
    /// Deletion has started but finalizers are still running.
    Terminating,
    /// The object does not exist.
    NotFound,
    /// The status could not be determined.
    Unknown,
}

/// One readiness observation for one object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusEvent {
    pub id: ObjMetadata,
    pub phase: StatusPhase,
    pub message: String,
}

/// Produces status observations for a set of objects until cancelled.
///
/// Implementations emit an event whenever an object's phase changes; they
/// may re-emit unchanged phases, the consumer only acts on the latest one
/// per object.
pub trait StatusPoller: Send + Sync {
    fn poll(
        &self,
        ids: &ObjMetadataSet,
        cancel: CancellationToken,
    ) -> BoxStream<'static, StatusEvent>;
}

/// Polls object status through a [`ClusterClient`] on a fixed interval.
pub struct PollingStatusPoller {
    client: Arc<dyn ClusterClient>,
    interval: Duration,
}

impl PollingStatusPoller {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self {
            client,
            interval: Duration::from_secs(2),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl StatusPoller for PollingStatusPoller {
    fn poll(
        &self,
        ids: &ObjMetadataSet,
        cancel: CancellationToken,
    ) -> BoxStream<'static, StatusEvent> {
        let client = Arc::clone(&self.client);
        let interval = self.interval;
        let ids: Vec<ObjMetadata> = ids.iter().cloned().collect();

        let (tx, rx) = futures::channel::mpsc::channel(ids.len().max(1) * 2);

        tokio::spawn(async move {
            let mut tx = tx;
            let mut last_seen: HashMap<ObjMetadata, StatusPhase> = HashMap::new();
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                for id in &ids {
                    let (phase, message) = match client.get(id).await {
                        Ok(Some(object)) => status::compute(&object),
                        Ok(None) => (StatusPhase::NotFound, String::new()),
                        Err(error) => {
                            warn!(%id, %error, "status poll failed");
                            (StatusPhase::Unknown, error.to_string())
                        }
                    };

                    if last_seen.insert(id.clone(), phase) == Some(phase) {
                        continue;
                    }
                    let event = StatusEvent {
                        id: id.clone(),
                        phase,
                        message,
                    };
                    if futures::SinkExt::send(&mut tx, event).await.is_err() {
                        return;
                    }
                }
            }
        });

        Box::pin(rx)
    }
}

pub use self::verdict::{WaitGoal, reconciles};

mod verdict {
    use super::StatusPhase;

    /// What a wait task considers done.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum WaitGoal {
        /// Applied objects must become current.
        Current,
        /// Pruned or deleted objects must disappear.
        NotFound,
    }

    /// Whether `phase` satisfies `goal`.
    pub fn reconciles(goal: WaitGoal, phase: StatusPhase) -> bool {
        match goal {
            WaitGoal::Current => phase == StatusPhase::Current,
            WaitGoal::NotFound => phase == StatusPhase::NotFound,
        }
    }
}
