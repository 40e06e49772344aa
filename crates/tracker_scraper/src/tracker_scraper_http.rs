use std::collections::HashMap;
use std::time::Instant;

use buffers::ByteBuf;
use serde::Deserialize;
use tracing::{debug, trace, warn};
use url::Url;

use crate::tracker_scraper::{
    ResultCallback, ScrapeResults, ScrapeStats, SessionAction, SessionCommon, TrackerKind,
    TrackerUrl,
};
use crate::{Error, InfoHash, Result};

/// Per-infohash entry of the `files` dictionary in a scrape response.
/// Trackers may add more keys (`downloaded` notably); they are ignored.
#[derive(Deserialize, Debug, Default, Clone, Copy)]
pub struct ScrapeFileEntry {
    #[serde(default)]
    pub complete: u32,
    #[serde(default)]
    pub incomplete: u32,
}

#[derive(Deserialize, Debug)]
struct ScrapeResponse<'a> {
    files: Option<HashMap<InfoHash, ScrapeFileEntry>>,
    #[serde(rename = "failure reason", borrow)]
    failure_reason: Option<ByteBuf<'a>>,
}

/// Projects a bencoded scrape body onto the queried infohashes. Hashes the
/// tracker doesn't track come back as zero entries, so the result covers
/// the queried set exactly.
fn decode_scrape_response(body: &[u8], info_hashes: &[InfoHash]) -> Result<ScrapeResults> {
    let response = match bencode::from_bytes::<ScrapeResponse>(body) {
        Ok(response) => response,
        Err(e) => {
            warn!("undecodable scrape response: {e:#}");
            return Err(Error::MalformedResponse(format!("{e:#}")));
        }
    };
    if let Some(files) = response.files {
        trace!(num_files = files.len(), "decoded scrape response");
        return Ok(info_hashes
            .iter()
            .map(|h| {
                let entry = files.get(h).copied().unwrap_or_default();
                (
                    *h,
                    ScrapeStats {
                        seeders: entry.complete,
                        leechers: entry.incomplete,
                    },
                )
            })
            .collect());
    }
    if let Some(reason) = response.failure_reason {
        debug!(
            "tracker reported failure: {}",
            String::from_utf8_lossy(reason.0)
        );
        return Err(Error::TrackerFailure {
            reason: reason.0.to_vec(),
        });
    }
    // neither files nor a failure: the tracker knows none of the hashes
    Ok(info_hashes
        .iter()
        .map(|h| (*h, ScrapeStats::default()))
        .collect())
}

/// Scrapes an HTTP(S) tracker: one GET against the scrape URL, bencoded
/// response projected onto the queried batch.
pub struct HttpSession {
    common: SessionCommon,
    url: TrackerUrl,
    client: reqwest::Client,
}

impl HttpSession {
    pub fn new(url: TrackerUrl, client: reqwest::Client, on_result: ResultCallback) -> HttpSession {
        HttpSession {
            common: SessionCommon::new(
                TrackerKind::Http,
                url.url().as_str().to_owned(),
                on_result,
            ),
            url,
            client,
        }
    }

    pub(crate) fn common(&self) -> &SessionCommon {
        &self.common
    }

    pub(crate) fn common_mut(&mut self) -> &mut SessionCommon {
        &mut self.common
    }

    /// The scrape endpoint is the announce URL with "announce" rewritten
    /// to "scrape" (BEP 48), one `info_hash` parameter per batched hash.
    /// Query parameters already present (passkeys and such) are kept.
    pub fn scrape_url(&self) -> Url {
        let mut url = self.url.url().clone();
        url.set_path(&self.url.url().path().replace("announce", "scrape"));
        let mut query = String::new();
        for info_hash in &self.common.infohash_list {
            if !query.is_empty() {
                query.push('&');
            }
            query.push_str("info_hash=");
            query.push_str(urlencoding::encode_binary(&info_hash.0).as_ref());
        }
        if let Some(existing) = self.url.url().query() {
            if !query.is_empty() {
                query.push('&');
            }
            query.push_str(existing);
        }
        url.set_query(if query.is_empty() { None } else { Some(&query) });
        url
    }

    pub(crate) async fn scrape(&mut self) -> Result<ScrapeResults> {
        self.common.is_initiated = true;
        self.common.action = SessionAction::Scrape;
        self.common.last_contact = Instant::now();

        let url = self.scrape_url();
        debug!(%url, "sending scrape request");
        let response = self.client.get(url).send().await.map_err(Error::network)?;
        let status = response.status();
        debug!(%status, "received scrape response");
        if status != reqwest::StatusCode::OK {
            warn!(%status, "tracker rejected the scrape");
            return Err(Error::TrackerRejected {
                status: status.as_u16(),
                phrase: status.canonical_reason().unwrap_or("").to_owned(),
            });
        }
        let body = response.bytes().await.map_err(Error::network)?;
        if body.is_empty() {
            warn!("empty scrape response body");
            return Err(Error::MalformedResponse("empty response body".to_owned()));
        }
        decode_scrape_response(&body, &self.common.infohash_list)
    }
}
