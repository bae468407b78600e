/// Change watchers over the store's raw event feed.
///
/// A watcher converts the continuous stream of per-document change events
/// into discrete, deduplicated changesets delivered to one subscriber on its
/// own cadence. Each subscription runs as an independent tokio task that owns
/// its pending set and delivery channel and never shares mutable state with
/// other subscriptions.
///
/// Filtering happens twice: at ingestion (coarse — is this collection and
/// marker relevant at all) and at emission (fine — does this local id match
/// the subscriber's predicate). The coarse stage keeps irrelevant collections
/// from ever touching the pending set; the fine stage lets many subscribers
/// share one collection with different interests.
///
/// If the raw feed closes or the subscription lags behind it, the loop
/// reports [`StateError::StreamTerminated`] exactly once and exits. A
/// terminated watcher means "state unknown, re-synchronize by direct read",
/// never "no further changes".
use crate::error::{StateError, StateResult};
use crate::ids::EnvIds;
use crate::store::{DocumentStore, StoreChange, StoreEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};

/// Capacity of each subscriber's delivery channel.
const DELIVERY_CHANNEL_CAPACITY: usize = 16;

/// Net state of one document since the last delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// The local (environment-stripped) document id
    pub id: String,
    /// Whether the document now exists (`true`) or was removed (`false`)
    pub present: bool,
}

/// An ordered sequence of net per-document changes, first-seen order.
pub type Changeset = Vec<Change>;

/// Merge raw updates into a pending changeset.
///
/// An id already present is updated in place; a new id is appended. Repeated
/// events for one id within a delivery interval collapse to the latest
/// state, so the merge is idempotent, and events for distinct ids commute.
pub fn merge_ids(pending: &mut Changeset, updates: impl IntoIterator<Item = (String, bool)>) {
    for (id, present) in updates {
        match pending.iter_mut().find(|change| change.id == id) {
            Some(change) => change.present = present,
            None => pending.push(Change { id, present }),
        }
    }
}

/// Fine per-subscriber predicate over local document ids.
pub type IdFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// What one subscription is interested in.
#[derive(Clone)]
pub struct WatchParams {
    /// The collection to watch (coarse filter)
    pub collection: String,
    /// Marker the local id must contain (coarse filter), e.g. `"_ar_"`
    pub marker: Option<String>,
    /// Per-id predicate applied at changeset emission (fine filter)
    pub filter: Option<IdFilter>,
}

impl WatchParams {
    /// Watch every document in a collection.
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            marker: None,
            filter: None,
        }
    }

    /// Require local ids to contain the given marker.
    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = Some(marker.into());
        self
    }

    /// Narrow emission to ids matching the predicate.
    pub fn with_filter(mut self, filter: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }
}

impl std::fmt::Debug for WatchParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchParams")
            .field("collection", &self.collection)
            .field("marker", &self.marker)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

/// Spawns and configures watcher subscriptions over one store.
#[derive(Debug, Clone)]
pub struct WatcherHub {
    store: Arc<DocumentStore>,
    ids: EnvIds,
    tick_interval: Duration,
}

impl WatcherHub {
    /// Create a hub delivering changesets every `tick_interval`.
    pub fn new(store: Arc<DocumentStore>, ids: EnvIds, tick_interval: Duration) -> Self {
        Self {
            store,
            ids,
            tick_interval,
        }
    }

    /// Register a subscription and spawn its watcher loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn watch(&self, params: WatchParams) -> ChangeWatcher {
        let events = self.store.events();
        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_CHANNEL_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);

        let loop_state = WatcherLoop {
            params,
            ids: self.ids.clone(),
            tick_interval: self.tick_interval,
        };
        tokio::spawn(loop_state.run(events, delivery_tx, stop_rx));

        ChangeWatcher {
            changes: delivery_rx,
            stop: stop_tx,
        }
    }
}

/// A live subscription handle.
///
/// Dropping the handle stops the underlying loop; [`stop`](Self::stop) does
/// so explicitly and cooperatively: the loop finishes its current tick,
/// closes the delivery channel, and exits.
#[derive(Debug)]
pub struct ChangeWatcher {
    changes: mpsc::Receiver<StateResult<Changeset>>,
    stop: watch::Sender<bool>,
}

impl ChangeWatcher {
    /// Receive the next changeset.
    ///
    /// Returns `None` once the subscription has stopped, or
    /// `Some(Err(StreamTerminated))` exactly once if the raw feed ended;
    /// after that the channel closes. Callers waiting for a specific change
    /// should wrap this in their own timeout.
    pub async fn recv(&mut self) -> Option<StateResult<Changeset>> {
        self.changes.recv().await
    }

    /// Request a cooperative stop. Idempotent.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

/// State owned by one watcher task.
struct WatcherLoop {
    params: WatchParams,
    ids: EnvIds,
    tick_interval: Duration,
}

impl WatcherLoop {
    /// Coarse ingestion filter: collection, environment and marker relevance.
    ///
    /// Returns the local id to merge, or `None` to drop the event.
    fn ingest(&self, event: &StoreEvent) -> Option<(String, bool)> {
        if event.collection != self.params.collection {
            return None;
        }
        // Foreign-environment documents are never this watcher's business.
        let local = self.ids.strict_local_id(&event.id).ok()?;
        if let Some(marker) = &self.params.marker {
            if !local.contains(marker.as_str()) {
                return None;
            }
        }
        Some((local, event.change == StoreChange::Put))
    }

    /// Fine emission filter, applied while draining the pending set.
    fn emit(&self, pending: &mut Changeset) -> Changeset {
        let drained = std::mem::take(pending);
        match &self.params.filter {
            Some(filter) => drained
                .into_iter()
                .filter(|change| filter(&change.id))
                .collect(),
            None => drained,
        }
    }

    async fn run(
        self,
        mut events: broadcast::Receiver<StoreEvent>,
        delivery: mpsc::Sender<StateResult<Changeset>>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut pending: Changeset = Vec::new();

        loop {
            tokio::select! {
                biased;

                changed = stop.changed() => {
                    let stopped = changed.is_err() || *stop.borrow();
                    if stopped {
                        // Finish the current tick: drain what we have, then go.
                        let out = self.emit(&mut pending);
                        if !out.is_empty() {
                            let _ = delivery.send(Ok(out)).await;
                        }
                        tracing::trace!(collection = %self.params.collection, "watcher stopped");
                        return;
                    }
                }

                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if let Some(update) = self.ingest(&event) {
                                merge_ids(&mut pending, [update]);
                            }
                        }
                        Err(RecvError::Lagged(missed)) => {
                            tracing::warn!(
                                collection = %self.params.collection,
                                missed,
                                "watcher lagged behind the change feed"
                            );
                            let _ = delivery
                                .send(Err(StateError::StreamTerminated(format!(
                                    "lagged behind the change feed by {missed} events"
                                ))))
                                .await;
                            return;
                        }
                        Err(RecvError::Closed) => {
                            let _ = delivery
                                .send(Err(StateError::StreamTerminated(
                                    "change feed closed".to_string(),
                                )))
                                .await;
                            return;
                        }
                    }
                }

                _ = interval.tick() => {
                    if pending.is_empty() {
                        // No-op ticks are suppressed.
                        continue;
                    }
                    let out = self.emit(&mut pending);
                    if !out.is_empty() && delivery.send(Ok(out)).await.is_err() {
                        // Subscriber went away.
                        return;
                    }
                }
            }
        }
    }
}
