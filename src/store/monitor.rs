//! Idle-shard monitor
//!
//! Every ten seconds: shards with no recent writes get their caches freed;
//! everything else gets compactions re-enabled, undoing the pause a cold
//! period put in place.

use super::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const TICK: Duration = Duration::from_secs(10);

pub(super) async fn run(store: Arc<Store>, closing: CancellationToken) {
    let start = tokio::time::Instant::now() + TICK;
    let mut ticker = tokio::time::interval_at(start, TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = closing.cancelled() => return,
            _ = ticker.tick() => {
                let shards = store.state.read().filter_shards(|_| true);
                for sh in shards {
                    if sh.is_idle() {
                        if let Err(e) = sh.free().await {
                            warn!(shard = sh.id(), error = %e, "error while freeing cold shard resources");
                        }
                    } else {
                        sh.set_compactions_enabled(true);
                    }
                }
            }
        }
    }
}
