//! Scrape client for BitTorrent trackers: given a tracker URL and a batch
//! of infohashes, fetch per-infohash seeder/leecher counts over HTTP(S) or
//! UDP (BEP 15), or fall back to the local DHT layer.

mod error;
mod hash_id;
mod tracker_scraper;
mod tracker_scraper_dht;
mod tracker_scraper_http;
mod tracker_scraper_udp;

pub use error::{Error, Result};
pub use hash_id::InfoHash;
pub use tracker_scraper::*;
pub use tracker_scraper_dht::{DHT_QUERY_TIMEOUT, DhtSession, SwarmMetainfoSource};
pub use tracker_scraper_http::HttpSession;
pub use tracker_scraper_udp::{TransactionIdRegistry, UdpSession};
