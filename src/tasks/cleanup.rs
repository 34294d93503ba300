//! TTL Sweep Task
//!
//! Background task that periodically removes expired cache entries and then
//! purges the allocator's dirty pointers.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::TtlCache;

/// Spawns a background task that periodically sweeps expired cache entries.
///
/// The task runs in an infinite loop, sleeping for the specified interval
/// between runs. Each run takes the cache's write permit, so it is moved onto
/// the blocking pool instead of stalling the async worker.
///
/// # Arguments
/// * `cache` - Shared reference to the cache
/// * `interval` - Time between sweep runs
///
/// # Returns
/// A JoinHandle for the spawned task, which can be used to abort the task
/// during shutdown.
///
/// # Example
/// ```ignore
/// let cache = Arc::new(TtlCache::<String>::new(1000, None));
/// let sweeper = spawn_sweep_task(cache.clone(), Duration::from_secs(1));
/// // Later, during shutdown:
/// sweeper.abort();
/// ```
pub fn spawn_sweep_task<K>(cache: Arc<TtlCache<K>>, interval: Duration) -> JoinHandle<()>
where
    K: Ord + Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        info!(interval_ms = interval.as_millis() as u64, "starting TTL sweep task");

        loop {
            tokio::time::sleep(interval).await;

            let cache = Arc::clone(&cache);
            let run = tokio::task::spawn_blocking(move || {
                let removed = cache.sweep_expired();
                let purged = cache.allocator().autoclean_dirty_pointers();
                (removed, purged)
            })
            .await;

            match run {
                Ok((removed, purged)) if removed > 0 || purged > 0 => {
                    info!(removed, purged, "TTL sweep finished");
                }
                Ok(_) => debug!("TTL sweep: nothing to reclaim"),
                Err(err) => warn!(error = %err, "TTL sweep run did not complete"),
            }
        }
    })
}
