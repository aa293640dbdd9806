use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use super::{CacheContents, CacheError, TieredCache};

/// Number of distinct keys that can be in flight at the same time.
const MAX_FLIGHTS: u64 = 100_000;

type InFlight = moka::future::Cache<String, Option<PathBuf>>;

/// Coalesces concurrent operations on the same output.
///
/// All requests touching the same key while an operation for it is running join that operation
/// and receive its result, including its error. Once it has finished the key is forgotten again,
/// so this is not a cache of results, the [`TieredCache`] is.
///
/// Fetches and stores of an output use distinct keys, they are not coalesced with each other.
/// Resolving an action is not coalesced at all.
#[derive(Debug)]
pub struct Cacher {
    cache: Arc<TieredCache>,
    flights: InFlight,
}

impl Cacher {
    pub fn new(cache: Arc<TieredCache>) -> Self {
        Self {
            cache,
            flights: InFlight::new(MAX_FLIGHTS),
        }
    }

    pub fn tiered(&self) -> &TieredCache {
        &self.cache
    }

    /// Runs `init` unless an operation for `key` is already running, in which case its result
    /// is shared.
    async fn run_flight<F>(&self, key: String, init: F) -> CacheContents<Option<PathBuf>>
    where
        F: Future<Output = CacheContents<Option<PathBuf>>>,
    {
        let entry = self
            .flights
            .entry_by_ref(&key)
            .or_try_insert_with(init)
            .await
            .map_err(|err: Arc<CacheError>| (*err).clone())?;

        if entry.is_fresh() {
            // The initiator ends the flight, callers arriving later start a new one.
            self.flights.invalidate(&key).await;
        } else {
            tracing::debug!(key = %key, "Joined running cache operation");
            metric!(counter("cache.flight.shared") += 1);
        }

        Ok(entry.into_value())
    }

    /// Looks up the output of `action_id`, returning the local path of its content.
    ///
    /// `Ok(None)` is a miss.
    #[tracing::instrument(skip(self))]
    pub async fn get(&self, action_id: &str) -> CacheContents<Option<PathBuf>> {
        let Some(output_id) = self.cache.resolve_action(action_id).await? else {
            return Ok(None);
        };

        let cache = &self.cache;
        self.run_flight(format!("get{output_id}"), async {
            cache.fetch_output(&output_id).await
        })
        .await
    }

    /// Stores `body` as the output of `action_id`, returning the local path of the blob.
    #[tracing::instrument(skip(self, body), fields(size = body.len()))]
    pub async fn put(
        &self,
        action_id: &str,
        output_id: &str,
        body: &[u8],
    ) -> CacheContents<PathBuf> {
        let cache = &self.cache;
        let path = self
            .run_flight(format!("put{output_id}"), async {
                let mut body = body;
                cache.store_output(output_id, &mut body).await.map(Some)
            })
            .await?
            .ok_or(CacheError::InternalError)?;

        cache.link_action(action_id, output_id).await?;
        Ok(path)
    }

    /// Waits until all pending uploads are done.
    pub async fn close(&self) {
        self.cache.close().await;
    }
}
