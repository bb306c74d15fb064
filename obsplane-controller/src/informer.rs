//! Watch/informer multiplexer.
//!
//! One task per subscribed kind: take an initial full listing (which marks
//! the kind hydrated in the cache), then consume the watch subscription,
//! updating the cache before forwarding each event into the single merged
//! stream. When the subscription drops, re-list and re-subscribe; the
//! re-list replays as an idempotent batch. On shutdown every subscription
//! is dropped before the merged stream closes.

use std::sync::Arc;
use std::time::Duration;

use obsplane_cloud::convergence::{sleep_unless_shutdown, wait_for_shutdown};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterApi, ClusterKind, WatchEvent};
use crate::state::SharedState;

const RELIST_BACKOFF: Duration = Duration::from_secs(3);

/// Runs informers for every kind until shutdown. Returns only after every
/// per-kind task has stopped; dropping the merged sender then closes the
/// event stream, so no event is delivered after this function returns.
pub async fn run_informers(
    api: Arc<dyn ClusterApi>,
    state: SharedState,
    kinds: &[ClusterKind],
    events: mpsc::Sender<WatchEvent>,
    shutdown: watch::Receiver<bool>,
) {
    info!(kinds = kinds.len(), "starting informers");

    let mut tasks = JoinSet::new();
    for &kind in kinds {
        tasks.spawn(informer_loop(
            api.clone(),
            state.clone(),
            kind,
            events.clone(),
            shutdown.clone(),
        ));
    }
    drop(events);

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "informer task panicked");
        }
    }
    info!("all informers stopped");
}

async fn informer_loop(
    api: Arc<dyn ClusterApi>,
    state: SharedState,
    kind: ClusterKind,
    events: mpsc::Sender<WatchEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        match api.list(kind).await {
            Ok(objects) => {
                debug!(kind = %kind, count = objects.len(), "initial listing");
                state.write().await.replace_kind(kind, objects);
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "listing failed (will retry)");
                if !sleep_unless_shutdown(RELIST_BACKOFF, &mut shutdown).await {
                    return;
                }
                continue;
            }
        }

        let mut subscription = match api.watch(kind).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(kind = %kind, error = %e, "watch subscription failed (will retry)");
                if !sleep_unless_shutdown(RELIST_BACKOFF, &mut shutdown).await {
                    return;
                }
                continue;
            }
        };

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => {
                    // Dropping the receiver unsubscribes before the merged
                    // stream can close.
                    debug!(kind = %kind, "informer stopping");
                    return;
                }
                event = subscription.recv() => match event {
                    Some(event) => {
                        apply_to_cache(&state, &event).await;
                        if events.send(event).await.is_err() {
                            return;
                        }
                    }
                    None => {
                        info!(kind = %kind, "watch ended, re-listing");
                        break;
                    }
                }
            }
        }
    }
}

async fn apply_to_cache(state: &SharedState, event: &WatchEvent) {
    let mut state = state.write().await;
    match event {
        WatchEvent::Added(object) | WatchEvent::Modified(object) => {
            state.upsert(object.clone());
        }
        WatchEvent::Deleted(object) => {
            state.remove(&object.key());
        }
    }
}

/// Blocks until every subscribed kind has delivered its initial listing.
/// Returns false if shutdown arrives first.
pub async fn wait_until_hydrated(
    state: &SharedState,
    kinds: &[ClusterKind],
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let mut last_reported = usize::MAX;
    loop {
        let hydrated = {
            let state = state.read().await;
            if state.is_hydrated(kinds) {
                return true;
            }
            state.hydrated_count(kinds)
        };
        if hydrated != last_reported {
            info!(hydrated, total = kinds.len(), "waiting for cache hydration");
            last_reported = hydrated;
        }
        if !sleep_unless_shutdown(Duration::from_secs(1), shutdown).await {
            return false;
        }
    }
}
