use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::InfoHash;
use crate::tracker_scraper::{
    ResultCallback, ScrapeResults, ScrapeStats, SessionCommon, TrackerKind,
};

/// How long a DHT lookup may take before the infohash is reported as
/// having no peers.
pub const DHT_QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Interface to the local DHT layer: resolve an infohash to swarm counts.
/// `None` is the timeout signal.
pub trait SwarmMetainfoSource: Send + Sync {
    fn seeds_and_leechers(
        &self,
        info_hash: InfoHash,
        timeout: Duration,
    ) -> BoxFuture<'static, Option<ScrapeStats>>;
}

/// Tracker-less fallback session. Every added infohash is looked up in the
/// DHT right away and reported through the result callback on its own;
/// there is no batching and no batch cap.
pub struct DhtSession {
    common: SessionCommon,
    source: Arc<dyn SwarmMetainfoSource>,
    pending: Vec<JoinHandle<()>>,
}

impl DhtSession {
    pub fn new(source: Arc<dyn SwarmMetainfoSource>, on_result: ResultCallback) -> DhtSession {
        DhtSession {
            common: SessionCommon::new(TrackerKind::Dht, "DHT".to_owned(), on_result),
            source,
            pending: Vec::new(),
        }
    }

    pub(crate) fn common(&self) -> &SessionCommon {
        &self.common
    }

    pub(crate) fn common_mut(&mut self) -> &mut SessionCommon {
        &mut self.common
    }

    /// Fires off the lookup task for one infohash. A timed out lookup
    /// reports zero counts; a cancelled session reports nothing.
    pub(crate) fn dispatch(&mut self, info_hash: InfoHash) {
        let source = self.source.clone();
        let on_result = self.common.on_result.clone();
        let cancel = self.common.cancel.clone();
        trace!(?info_hash, "dispatching DHT lookup");
        self.pending.push(tokio::spawn(async move {
            let lookup = source.seeds_and_leechers(info_hash, DHT_QUERY_TIMEOUT);
            tokio::select! {
                _ = cancel.cancelled() => {}
                stats = lookup => {
                    let stats = stats.unwrap_or_default();
                    (on_result.as_ref())(ScrapeResults::from([(info_hash, stats)]));
                }
            }
        }));
    }

    pub(crate) fn last_contact(&self) -> Instant {
        Instant::now()
    }

    pub(crate) async fn abort_pending(&mut self) {
        for handle in self.pending.drain(..) {
            handle.abort();
            let _ = handle.await;
        }
    }
}
