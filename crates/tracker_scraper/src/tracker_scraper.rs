use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::tracker_scraper_dht::DhtSession;
use crate::tracker_scraper_http::HttpSession;
use crate::tracker_scraper_udp::{TransactionIdRegistry, UdpSession};
use crate::{Error, InfoHash, Result};

/// Cap on infohashes per scrape request. A UDP scrape response carries 12
/// bytes per infohash and has to fit a single datagram; 74 keeps the reply
/// below the common 1500-byte MTU. The same cap is applied to HTTP.
pub const MAX_MULTI_SCRAPE: usize = 74;

pub const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const HTTP_RECHECK_INTERVAL: Duration = Duration::from_secs(60);
pub const HTTP_MAX_RETRIES: u32 = 0;

pub const UDP_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(15);
pub const UDP_RECHECK_INTERVAL: Duration = Duration::from_secs(15);
pub const UDP_MAX_RETRIES: u32 = 8;

pub const DHT_RECHECK_INTERVAL: Duration = Duration::from_secs(60);
pub const DHT_MAX_RETRIES: u32 = 8;

/// Seeder and leecher counts for one infohash as reported by a tracker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScrapeStats {
    pub seeders: u32,
    pub leechers: u32,
}

/// Scrape outcome, keyed by exactly the infohashes the session was asked
/// about. Hashes the tracker doesn't know come back as zero entries.
pub type ScrapeResults = HashMap<InfoHash, ScrapeStats>;

/// Invoked with the full result map when a scrape succeeds. Failures don't
/// go through here, they surface from [`TrackerSession::connect_to_tracker`].
/// DHT sessions are the exception: they call this once per infohash as
/// answers arrive.
pub type ResultCallback = Arc<dyn Fn(ScrapeResults) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackerKind {
    Http,
    Udp,
    Dht,
}

/// Protocol phase the session is in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionAction {
    #[default]
    None,
    Connect,
    Scrape,
}

/// A tracker URL broken into the parts sessions need.
#[derive(Clone, Debug)]
pub struct TrackerUrl {
    pub kind: TrackerKind,
    pub host: String,
    pub port: u16,
    /// Path plus any query the announce URL carried (passkeys and such).
    pub announce_path: String,
    url: Url,
}

impl TrackerUrl {
    pub fn parse(tracker_url: &str) -> anyhow::Result<TrackerUrl> {
        let url = Url::parse(tracker_url)
            .with_context(|| format!("error parsing tracker URL {tracker_url}"))?;
        let kind = match url.scheme() {
            "http" | "https" => TrackerKind::Http,
            "udp" => TrackerKind::Udp,
            other => anyhow::bail!("unsupported tracker scheme {other:?}"),
        };
        let host = url.host_str().context("missing host")?.to_owned();
        let port = url.port_or_known_default().context("missing port")?;
        let announce_path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_owned(),
        };
        Ok(TrackerUrl {
            kind,
            host,
            port,
            announce_path,
            url,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

/// State every session kind carries.
pub(crate) struct SessionCommon {
    pub(crate) kind: TrackerKind,
    pub(crate) tracker_url: String,
    pub(crate) infohash_list: Vec<InfoHash>,
    pub(crate) retries: u32,
    pub(crate) last_contact: Instant,
    pub(crate) action: SessionAction,
    pub(crate) is_initiated: bool,
    pub(crate) is_finished: bool,
    pub(crate) is_failed: bool,
    pub(crate) is_timed_out: bool,
    pub(crate) cancel: CancellationToken,
    pub(crate) on_result: ResultCallback,
}

impl SessionCommon {
    pub(crate) fn new(kind: TrackerKind, tracker_url: String, on_result: ResultCallback) -> Self {
        Self {
            kind,
            tracker_url,
            infohash_list: Vec::new(),
            retries: 0,
            last_contact: Instant::now(),
            action: SessionAction::None,
            is_initiated: false,
            is_finished: false,
            is_failed: false,
            is_timed_out: false,
            cancel: CancellationToken::new(),
            on_result,
        }
    }

    pub(crate) fn deliver(&self, results: ScrapeResults) {
        (self.on_result.as_ref())(results);
    }

    fn request_cap(&self) -> usize {
        match self.kind {
            TrackerKind::Dht => usize::MAX,
            _ => MAX_MULTI_SCRAPE,
        }
    }
}

/// One tracker endpoint plus one batch of infohashes. Built empty, filled
/// through [`add_request`](Self::add_request), then driven to exactly one
/// terminal outcome by [`connect_to_tracker`](Self::connect_to_tracker).
pub enum TrackerSession {
    Http(HttpSession),
    Udp(UdpSession),
    Dht(DhtSession),
}

impl TrackerSession {
    fn common(&self) -> &SessionCommon {
        match self {
            TrackerSession::Http(s) => s.common(),
            TrackerSession::Udp(s) => s.common(),
            TrackerSession::Dht(s) => s.common(),
        }
    }

    fn common_mut(&mut self) -> &mut SessionCommon {
        match self {
            TrackerSession::Http(s) => s.common_mut(),
            TrackerSession::Udp(s) => s.common_mut(),
            TrackerSession::Dht(s) => s.common_mut(),
        }
    }

    pub fn kind(&self) -> TrackerKind {
        self.common().kind
    }

    pub fn tracker_url(&self) -> &str {
        &self.common().tracker_url
    }

    pub fn infohash_list(&self) -> &[InfoHash] {
        &self.common().infohash_list
    }

    pub fn action(&self) -> SessionAction {
        self.common().action
    }

    pub fn retries(&self) -> u32 {
        self.common().retries
    }

    pub fn increase_retries(&mut self) {
        self.common_mut().retries += 1;
    }

    pub fn is_initiated(&self) -> bool {
        self.common().is_initiated
    }

    pub fn is_finished(&self) -> bool {
        self.common().is_finished
    }

    pub fn is_failed(&self) -> bool {
        self.common().is_failed
    }

    pub fn is_timed_out(&self) -> bool {
        self.common().is_timed_out
    }

    /// Instant of the last outbound activity. DHT sessions always report
    /// "now" so schedulers never garbage-collect them.
    pub fn last_contact(&self) -> Instant {
        match self {
            TrackerSession::Dht(s) => s.last_contact(),
            _ => self.common().last_contact,
        }
    }

    /// Cancelling this token is the universal kill switch: in-flight work
    /// is aborted and the session resolves to [`Error::Cancelled`] without
    /// invoking the result callback.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.common().cancel
    }

    pub fn can_add_request(&self) -> bool {
        let common = self.common();
        !common.is_initiated && common.infohash_list.len() < common.request_cap()
    }

    pub fn has_request(&self, info_hash: InfoHash) -> bool {
        self.common().infohash_list.contains(&info_hash)
    }

    /// Appends an infohash to the batch. Only legal before the session is
    /// initiated and while the batch has room; duplicates are rejected.
    /// A DHT session kicks off the lookup right away.
    pub fn add_request(&mut self, info_hash: InfoHash) -> anyhow::Result<()> {
        let common = self.common();
        anyhow::ensure!(
            !common.is_initiated,
            "can't add requests to an initiated session"
        );
        anyhow::ensure!(
            common.infohash_list.len() < common.request_cap(),
            "scrape batch is full ({} infohashes)",
            common.infohash_list.len()
        );
        anyhow::ensure!(
            !self.has_request(info_hash),
            "duplicate infohash {:?}",
            info_hash
        );
        self.common_mut().infohash_list.push(info_hash);
        if let TrackerSession::Dht(s) = self {
            s.dispatch(info_hash);
        }
        Ok(())
    }

    pub fn max_retries(&self) -> u32 {
        match self.kind() {
            TrackerKind::Http => HTTP_MAX_RETRIES,
            TrackerKind::Udp => UDP_MAX_RETRIES,
            TrackerKind::Dht => DHT_MAX_RETRIES,
        }
    }

    /// How long the caller should wait before the next attempt. UDP backs
    /// off exponentially with the retry count, the others are constant.
    pub fn retry_interval(&self) -> Duration {
        match self.kind() {
            TrackerKind::Http => HTTP_RECHECK_INTERVAL,
            TrackerKind::Udp => UDP_RECHECK_INTERVAL * 2u32.saturating_pow(self.retries()),
            TrackerKind::Dht => DHT_RECHECK_INTERVAL,
        }
    }

    /// Runs the scrape against the tracker. Resolves with the result map
    /// (also delivered through the callback) or with exactly one typed
    /// failure. DHT sessions resolve immediately with an empty map, their
    /// answers stream through the callback per infohash instead.
    pub async fn connect_to_tracker(&mut self) -> Result<ScrapeResults> {
        if let TrackerSession::Dht(_) = self {
            return Ok(ScrapeResults::new());
        }

        let cancel = self.common().cancel.clone();
        let outcome = cancel
            .run_until_cancelled(async {
                match self {
                    TrackerSession::Http(s) => s.scrape().await,
                    TrackerSession::Udp(s) => s.scrape().await,
                    TrackerSession::Dht(_) => Ok(ScrapeResults::new()),
                }
            })
            .await;
        let result = match outcome {
            Some(result) => result,
            None => {
                self.cleanup().await;
                return Err(Error::Cancelled);
            }
        };

        self.release_io();
        let common = self.common_mut();
        match result {
            Ok(results) => {
                common.is_finished = true;
                common.deliver(results.clone());
                Ok(results)
            }
            Err(e) => {
                if matches!(e, Error::Timeout) {
                    common.is_timed_out = true;
                } else {
                    common.is_failed = true;
                }
                Err(e)
            }
        }
    }

    fn release_io(&mut self) {
        if let TrackerSession::Udp(s) = self {
            s.release();
        }
    }

    /// Cancels any in-flight work and releases owned resources: the UDP
    /// socket, pending DHT lookups, the transaction-id registry entry and
    /// the batch itself. Idempotent, callable from any state.
    pub async fn cleanup(&mut self) {
        self.common().cancel.cancel();
        match self {
            TrackerSession::Udp(s) => s.release(),
            TrackerSession::Dht(s) => s.abort_pending().await,
            TrackerSession::Http(_) => {}
        }
        self.common_mut().infohash_list.clear();
    }
}

impl fmt::Display for TrackerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tracker[{:?}, {}]", self.kind(), self.tracker_url())
    }
}

/// Builds protocol sessions out of tracker URLs. Owns the shared HTTP
/// client and the transaction-id registry every UDP session draws from.
pub struct SessionFactory {
    http_client: reqwest::Client,
    transaction_ids: TransactionIdRegistry,
}

impl SessionFactory {
    pub fn new() -> anyhow::Result<SessionFactory> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()
            .context("error building HTTP client")?;
        Ok(SessionFactory {
            http_client,
            transaction_ids: TransactionIdRegistry::default(),
        })
    }

    pub fn transaction_ids(&self) -> &TransactionIdRegistry {
        &self.transaction_ids
    }

    /// Dispatches on the URL scheme: `udp` builds a UDP session, `http`
    /// and `https` an HTTP one. DHT sessions have no URL; construct them
    /// with [`DhtSession::new`].
    pub fn create_session(
        &self,
        tracker_url: &str,
        on_result: ResultCallback,
    ) -> anyhow::Result<TrackerSession> {
        let url = TrackerUrl::parse(tracker_url)?;
        Ok(match url.kind {
            TrackerKind::Udp => TrackerSession::Udp(UdpSession::new(
                url,
                self.transaction_ids.clone(),
                on_result,
            )),
            _ => TrackerSession::Http(HttpSession::new(url, self.http_client.clone(), on_result)),
        })
    }
}
