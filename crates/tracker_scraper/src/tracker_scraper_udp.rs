use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::tracker_scraper::{
    ResultCallback, ScrapeResults, ScrapeStats, SessionAction, SessionCommon, TrackerKind,
    TrackerUrl, UDP_INACTIVITY_TIMEOUT,
};
use crate::{Error, InfoHash, Result};

pub const ACTION_CONNECT: u32 = 0;
pub const ACTION_SCRAPE: u32 = 2;

pub type ConnectionId = u64;
const CONNECTION_ID_MAGIC: ConnectionId = 0x41727101980;

pub type TransactionId = u32;

/// Set of transaction ids in use by live UDP sessions. Cloned into every
/// UDP session so a response arriving on a shared endpoint can never be
/// bound to the wrong session.
#[derive(Clone, Default)]
pub struct TransactionIdRegistry {
    active: Arc<Mutex<HashSet<TransactionId>>>,
}

impl TransactionIdRegistry {
    /// Draws a fresh 32-bit id, retrying until it collides with no live
    /// session, and registers it.
    pub fn generate(&self) -> TransactionId {
        let mut active = self.active.lock();
        loop {
            let id = rand::random();
            if active.insert(id) {
                return id;
            }
        }
    }

    pub fn release(&self, id: TransactionId) {
        self.active.lock().remove(&id);
    }

    pub fn contains(&self, id: TransactionId) -> bool {
        self.active.lock().contains(&id)
    }

    pub fn len(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.lock().is_empty()
    }
}

#[derive(Debug)]
pub enum Request<'a> {
    Connect,
    Scrape {
        connection_id: ConnectionId,
        info_hashes: &'a [InfoHash],
    },
}

impl Request<'_> {
    pub fn serialize(&self, transaction_id: TransactionId, buf: &mut Vec<u8>) -> usize {
        let cur_len = buf.len();
        match self {
            Request::Connect => {
                buf.extend_from_slice(&CONNECTION_ID_MAGIC.to_be_bytes());
                buf.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
                buf.extend_from_slice(&transaction_id.to_be_bytes());
            }
            Request::Scrape {
                connection_id,
                info_hashes,
            } => {
                buf.extend_from_slice(&connection_id.to_be_bytes());
                buf.extend_from_slice(&ACTION_SCRAPE.to_be_bytes());
                buf.extend_from_slice(&transaction_id.to_be_bytes());
                for info_hash in *info_hashes {
                    buf.extend_from_slice(&info_hash.0);
                }
            }
        }
        buf.len() - cur_len
    }
}

fn split_slice(s: &[u8], first_len: usize) -> Option<(&[u8], &[u8])> {
    if s.len() < first_len {
        return None;
    }
    Some(s.split_at(first_len))
}

fn s_to_arr<const T: usize>(buf: &[u8]) -> [u8; T] {
    let mut arr = [0u8; T];
    arr.copy_from_slice(buf);
    arr
}

trait ParseNum: Sized {
    fn parse_num(buf: &[u8]) -> Result<(Self, &[u8])>;
}

macro_rules! parse_impl {
    ($ty:tt, $size:expr) => {
        impl ParseNum for $ty {
            fn parse_num(buf: &[u8]) -> Result<($ty, &[u8])> {
                let (bytes, rest) = split_slice(buf, $size).ok_or_else(|| {
                    Error::MalformedResponse(format!("expected {} more bytes", $size))
                })?;
                let num = $ty::from_be_bytes(s_to_arr(bytes));
                Ok((num, rest))
            }
        }
    };
}

parse_impl!(u32, 4);
parse_impl!(u64, 8);

/// The 8-byte header every tracker response starts with.
#[derive(Debug, Clone, Copy)]
pub struct ResponseHeader {
    pub action: u32,
    pub transaction_id: TransactionId,
}

impl ResponseHeader {
    pub fn parse(buf: &[u8]) -> Result<(ResponseHeader, &[u8])> {
        let (action, buf) = u32::parse_num(buf)?;
        let (transaction_id, buf) = u32::parse_num(buf)?;
        Ok((
            ResponseHeader {
                action,
                transaction_id,
            },
            buf,
        ))
    }
}

fn parse_connect_body(buf: &[u8]) -> Result<ConnectionId> {
    let (connection_id, _) = u64::parse_num(buf)?;
    Ok(connection_id)
}

/// Decodes the N `(seeders, downloaded, leechers)` tuples of a scrape
/// response body. The body length must match the batch exactly; the
/// `downloaded` word is discarded.
fn parse_scrape_body(buf: &[u8], num_hashes: usize) -> Result<Vec<ScrapeStats>> {
    if buf.len() != num_hashes * 12 {
        warn!(
            len = buf.len(),
            num_hashes, "SCRAPE response length mismatch"
        );
        return Err(Error::MalformedResponse(format!(
            "scrape body must be {} bytes for {} infohashes, got {}",
            num_hashes * 12,
            num_hashes,
            buf.len()
        )));
    }
    let mut stats = Vec::with_capacity(num_hashes);
    let mut buf = buf;
    for _ in 0..num_hashes {
        let (seeders, b) = u32::parse_num(buf)?;
        let (_downloaded, b) = u32::parse_num(b)?;
        let (leechers, b) = u32::parse_num(b)?;
        buf = b;
        stats.push(ScrapeStats { seeders, leechers });
    }
    Ok(stats)
}

/// Picks the first resolved address for the tracker host.
async fn resolve_tracker_addr(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(Error::network)?;
    addrs
        .next()
        .ok_or_else(|| Error::network(format!("zero addresses returned looking up {host}")))
}

/// Owns the datagram endpoint for one session. Every receive runs under
/// the inactivity timeout; the timer firing kills the session.
struct UdpScraper {
    sock: tokio::net::UdpSocket,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
}

impl UdpScraper {
    async fn connect(addr: SocketAddr) -> Result<Self> {
        let bind_addr = match addr {
            SocketAddr::V4(_) => "0.0.0.0:0",
            SocketAddr::V6(_) => "[::]:0",
        };
        let sock = tokio::net::UdpSocket::bind(bind_addr)
            .await
            .map_err(Error::network)?;
        sock.connect(addr).await.map_err(Error::network)?;
        Ok(Self {
            sock,
            read_buf: vec![0u8; 4096],
            write_buf: Vec::new(),
        })
    }

    async fn send(&mut self, request: &Request<'_>, transaction_id: TransactionId) -> Result<()> {
        self.write_buf.clear();
        let size = request.serialize(transaction_id, &mut self.write_buf);
        trace!(?request, transaction_id, "sending");
        self.sock
            .send(&self.write_buf[..size])
            .await
            .map_err(Error::network)?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<&[u8]> {
        let size =
            match tokio::time::timeout(UDP_INACTIVITY_TIMEOUT, self.sock.recv(&mut self.read_buf))
                .await
            {
                Ok(Ok(size)) => size,
                Ok(Err(e)) => return Err(Error::network(e)),
                Err(_) => return Err(Error::Timeout),
            };
        Ok(&self.read_buf[..size])
    }
}

/// Scrapes a UDP tracker (BEP 15): a CONNECT round trip to obtain the
/// tracker-issued connection id, then one SCRAPE carrying the whole batch.
pub struct UdpSession {
    common: SessionCommon,
    url: TrackerUrl,
    connection_id: ConnectionId,
    transaction_id: TransactionId,
    transaction_ids: TransactionIdRegistry,
    scraper: Option<UdpScraper>,
}

impl UdpSession {
    pub fn new(
        url: TrackerUrl,
        transaction_ids: TransactionIdRegistry,
        on_result: ResultCallback,
    ) -> UdpSession {
        UdpSession {
            common: SessionCommon::new(
                TrackerKind::Udp,
                url.url().as_str().to_owned(),
                on_result,
            ),
            url,
            connection_id: CONNECTION_ID_MAGIC,
            transaction_id: 0,
            transaction_ids,
            scraper: None,
        }
    }

    pub(crate) fn common(&self) -> &SessionCommon {
        &self.common
    }

    pub(crate) fn common_mut(&mut self) -> &mut SessionCommon {
        &mut self.common
    }

    pub(crate) async fn scrape(&mut self) -> Result<ScrapeResults> {
        self.common.is_initiated = true;
        self.common.last_contact = Instant::now();
        self.common.action = SessionAction::Connect;
        self.connection_id = CONNECTION_ID_MAGIC;
        self.transaction_id = self.transaction_ids.generate();

        let addr = resolve_tracker_addr(&self.url.host, self.url.port).await?;
        trace!(%addr, "resolved tracker");
        let scraper = self.scraper.insert(UdpScraper::connect(addr).await?);

        scraper.send(&Request::Connect, self.transaction_id).await?;
        let data = scraper.recv().await?;
        trace!(len = data.len(), "received CONNECT response");
        if data.len() < 16 {
            warn!(len = data.len(), "CONNECT response too short");
            return Err(Error::MalformedResponse(format!(
                "CONNECT response too short: {} bytes",
                data.len()
            )));
        }
        let (header, body) = ResponseHeader::parse(data)?;
        if header.action != ACTION_CONNECT || header.transaction_id != self.transaction_id {
            warn!(
                action = header.action,
                transaction_id = header.transaction_id,
                "unexpected CONNECT response: {}",
                String::from_utf8_lossy(body)
            );
            return Err(Error::TrackerProtocol {
                payload: body.to_vec(),
            });
        }
        let connection_id = parse_connect_body(body)?;
        trace!(connection_id, "connected");
        self.connection_id = connection_id;

        // fresh id for the scrape round trip; the connect id is dead now
        self.common.action = SessionAction::Scrape;
        let prev = self.transaction_id;
        self.transaction_id = self.transaction_ids.generate();
        self.transaction_ids.release(prev);

        let request = Request::Scrape {
            connection_id: self.connection_id,
            info_hashes: &self.common.infohash_list,
        };
        scraper.send(&request, self.transaction_id).await?;
        self.common.last_contact = Instant::now();

        let data = scraper.recv().await?;
        trace!(len = data.len(), "received SCRAPE response");
        if data.len() < 8 {
            warn!(len = data.len(), "SCRAPE response too short");
            return Err(Error::MalformedResponse(format!(
                "SCRAPE response too short: {} bytes",
                data.len()
            )));
        }
        let (header, body) = ResponseHeader::parse(data)?;
        if header.action != ACTION_SCRAPE || header.transaction_id != self.transaction_id {
            warn!(
                action = header.action,
                transaction_id = header.transaction_id,
                "unexpected SCRAPE response: {}",
                String::from_utf8_lossy(body)
            );
            return Err(Error::TrackerProtocol {
                payload: body.to_vec(),
            });
        }
        let stats = parse_scrape_body(body, self.common.infohash_list.len())?;
        trace!(num_hashes = stats.len(), "scrape complete");
        Ok(self.common.infohash_list.iter().copied().zip(stats).collect())
    }

    /// Drops the socket (closing it) and forgets the transaction id. A
    /// session that was never initiated has no id to forget.
    pub(crate) fn release(&mut self) {
        self.scraper = None;
        if self.common.is_initiated {
            self.transaction_ids.release(self.transaction_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::net::UdpSocket;

    use super::*;
    use crate::tracker_scraper::{ResultCallback, SessionFactory};

    fn hash(fill: u8) -> InfoHash {
        InfoHash([fill; 20])
    }

    fn noop() -> ResultCallback {
        Arc::new(|_| {})
    }

    #[test]
    fn test_serialize_connect() {
        let mut buf = Vec::new();
        let size = Request::Connect.serialize(0xcafe, &mut buf);
        assert_eq!(size, 16);
        assert_eq!(&buf[0..8], &0x41727101980u64.to_be_bytes());
        assert_eq!(&buf[8..12], &ACTION_CONNECT.to_be_bytes());
        assert_eq!(&buf[12..16], &0xcafeu32.to_be_bytes());
    }

    #[test]
    fn test_serialize_scrape() {
        let hashes = [hash(1), hash(2)];
        let mut buf = Vec::new();
        let size = Request::Scrape {
            connection_id: 0xdead_beef,
            info_hashes: &hashes,
        }
        .serialize(42, &mut buf);
        assert_eq!(size, 16 + 40);
        assert_eq!(&buf[0..8], &0xdead_beefu64.to_be_bytes());
        assert_eq!(&buf[8..12], &ACTION_SCRAPE.to_be_bytes());
        assert_eq!(&buf[12..16], &42u32.to_be_bytes());
        assert_eq!(&buf[16..36], &[1u8; 20]);
        assert_eq!(&buf[36..56], &[2u8; 20]);
    }

    #[test]
    fn test_serialize_scrape_empty_batch() {
        let mut buf = Vec::new();
        let size = Request::Scrape {
            connection_id: 1,
            info_hashes: &[],
        }
        .serialize(1, &mut buf);
        assert_eq!(size, 16);
    }

    #[test]
    fn test_connect_request_roundtrip() {
        let mut buf = Vec::new();
        Request::Connect.serialize(77, &mut buf);
        let (connection_id, rest) = u64::parse_num(&buf).unwrap();
        let (action, rest) = u32::parse_num(rest).unwrap();
        let (transaction_id, rest) = u32::parse_num(rest).unwrap();
        assert_eq!(connection_id, 0x41727101980);
        assert_eq!(action, ACTION_CONNECT);
        assert_eq!(transaction_id, 77);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_parse_scrape_body_positional() {
        let mut body = Vec::new();
        for i in 0u32..3 {
            body.extend_from_slice(&i.to_be_bytes());
            body.extend_from_slice(&0u32.to_be_bytes());
            body.extend_from_slice(&(2 * i).to_be_bytes());
        }
        let stats = parse_scrape_body(&body, 3).unwrap();
        assert_eq!(stats.len(), 3);
        for (i, s) in stats.iter().enumerate() {
            assert_eq!(s.seeders, i as u32);
            assert_eq!(s.leechers, 2 * i as u32);
        }
    }

    #[test]
    fn test_parse_scrape_body_length_mismatch() {
        let body = vec![0u8; 12 * 2 + 1];
        assert!(matches!(
            parse_scrape_body(&body, 2),
            Err(Error::MalformedResponse(_))
        ));
        let body = vec![0u8; 12 * 2 - 1];
        assert!(matches!(
            parse_scrape_body(&body, 2),
            Err(Error::MalformedResponse(_))
        ));
        assert!(parse_scrape_body(&[], 0).unwrap().is_empty());
    }

    #[test]
    fn test_transaction_id_registry() {
        let registry = TransactionIdRegistry::default();
        let mut ids = HashSet::new();
        for _ in 0..100 {
            let id = registry.generate();
            assert!(registry.contains(id));
            ids.insert(id);
        }
        assert_eq!(ids.len(), 100);
        assert_eq!(registry.len(), 100);
        for id in ids {
            registry.release(id);
        }
        assert!(registry.is_empty());
    }

    /// In-process tracker for the happy path: answers CONNECT with a fixed
    /// connection id, then SCRAPE with the given tuples.
    async fn fake_tracker(sock: UdpSocket, tuples: Vec<(u32, u32, u32)>) {
        let mut buf = vec![0u8; 4096];
        let (len, peer) = sock.recv_from(&mut buf).await.unwrap();
        assert_eq!(len, 16);
        assert_eq!(&buf[..8], &0x41727101980u64.to_be_bytes());
        assert_eq!(&buf[8..12], &ACTION_CONNECT.to_be_bytes());
        let txid: [u8; 4] = buf[12..16].try_into().unwrap();

        let mut reply = Vec::new();
        reply.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        reply.extend_from_slice(&txid);
        reply.extend_from_slice(&0xdead_beef_cafe_babe_u64.to_be_bytes());
        sock.send_to(&reply, peer).await.unwrap();

        let (len, peer) = sock.recv_from(&mut buf).await.unwrap();
        assert_eq!(len, 16 + 20 * tuples.len());
        assert_eq!(&buf[..8], &0xdead_beef_cafe_babe_u64.to_be_bytes());
        assert_eq!(&buf[8..12], &ACTION_SCRAPE.to_be_bytes());
        let txid: [u8; 4] = buf[12..16].try_into().unwrap();

        let mut reply = Vec::new();
        reply.extend_from_slice(&ACTION_SCRAPE.to_be_bytes());
        reply.extend_from_slice(&txid);
        for (seeders, downloaded, leechers) in tuples {
            reply.extend_from_slice(&seeders.to_be_bytes());
            reply.extend_from_slice(&downloaded.to_be_bytes());
            reply.extend_from_slice(&leechers.to_be_bytes());
        }
        sock.send_to(&reply, peer).await.unwrap();
    }

    async fn bind_server() -> (UdpSocket, u16) {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = sock.local_addr().unwrap().port();
        (sock, port)
    }

    #[tokio::test]
    async fn test_udp_scrape_happy_path() {
        let _ = tracing_subscriber::fmt::try_init();
        let (server, port) = bind_server().await;
        let server = tokio::spawn(fake_tracker(server, vec![(10, 100, 5), (0, 0, 0)]));

        let delivered: Arc<Mutex<Vec<ScrapeResults>>> = Default::default();
        let delivered2 = delivered.clone();
        let factory = SessionFactory::new().unwrap();
        let mut session = factory
            .create_session(
                &format!("udp://127.0.0.1:{port}"),
                Arc::new(move |results| delivered2.lock().push(results)),
            )
            .unwrap();
        session.add_request(hash(1)).unwrap();
        session.add_request(hash(2)).unwrap();

        let results = session.connect_to_tracker().await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(
            results[&hash(1)],
            ScrapeStats {
                seeders: 10,
                leechers: 5
            }
        );
        assert_eq!(
            results[&hash(2)],
            ScrapeStats {
                seeders: 0,
                leechers: 0
            }
        );
        assert!(session.is_finished());
        assert!(!session.is_failed());
        assert!(!session.is_timed_out());
        assert_eq!(delivered.lock().len(), 1);
        assert!(factory.transaction_ids().is_empty());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_udp_scrape_empty_batch() {
        let (server, port) = bind_server().await;
        let server = tokio::spawn(fake_tracker(server, vec![]));

        let factory = SessionFactory::new().unwrap();
        let mut session = factory
            .create_session(&format!("udp://127.0.0.1:{port}"), noop())
            .unwrap();
        let results = session.connect_to_tracker().await.unwrap();
        assert!(results.is_empty());
        assert!(session.is_finished());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_udp_connect_transaction_id_mismatch() {
        let (server, port) = bind_server().await;
        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let (_, peer) = server.recv_from(&mut buf).await.unwrap();
            let wrong = u32::from_be_bytes(buf[12..16].try_into().unwrap()).wrapping_add(1);
            let mut reply = Vec::new();
            reply.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
            reply.extend_from_slice(&wrong.to_be_bytes());
            reply.extend_from_slice(&1u64.to_be_bytes());
            server.send_to(&reply, peer).await.unwrap();
            // the session must fail without ever sending a SCRAPE
            match tokio::time::timeout(Duration::from_millis(250), server.recv_from(&mut buf))
                .await
            {
                Err(_) => {}
                Ok(_) => panic!("tracker received an unexpected second datagram"),
            }
        });

        let factory = SessionFactory::new().unwrap();
        let mut session = factory
            .create_session(&format!("udp://127.0.0.1:{port}"), noop())
            .unwrap();
        session.add_request(hash(1)).unwrap();

        let err = session.connect_to_tracker().await.unwrap_err();
        assert!(matches!(err, Error::TrackerProtocol { .. }), "got {err:?}");
        assert!(session.is_failed());
        assert!(!session.is_finished());
        assert!(factory.transaction_ids().is_empty());
        server.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_udp_connect_timeout() {
        // bound but mute: the inactivity timer has to fire
        let (_server, port) = bind_server().await;

        let factory = SessionFactory::new().unwrap();
        let mut session = factory
            .create_session(&format!("udp://127.0.0.1:{port}"), noop())
            .unwrap();
        session.add_request(hash(1)).unwrap();

        let err = session.connect_to_tracker().await.unwrap_err();
        assert!(matches!(err, Error::Timeout), "got {err:?}");
        assert!(session.is_timed_out());
        assert!(!session.is_failed());
        assert!(!session.is_finished());
        assert!(factory.transaction_ids().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_cleans_up() {
        let (_server, port) = bind_server().await;

        let delivered: Arc<Mutex<Vec<ScrapeResults>>> = Default::default();
        let delivered2 = delivered.clone();
        let factory = SessionFactory::new().unwrap();
        let mut session = factory
            .create_session(
                &format!("udp://127.0.0.1:{port}"),
                Arc::new(move |results| delivered2.lock().push(results)),
            )
            .unwrap();
        session.add_request(hash(7)).unwrap();

        let cancel = session.cancellation_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let err = session.connect_to_tracker().await.unwrap_err();
        assert!(matches!(err, Error::Cancelled), "got {err:?}");
        assert!(!session.is_finished());
        assert!(!session.is_failed());
        assert!(session.infohash_list().is_empty());
        assert!(delivered.lock().is_empty());
        assert!(factory.transaction_ids().is_empty());
    }

    #[tokio::test]
    async fn test_udp_scrape_response_wrong_length() {
        let (server, port) = bind_server().await;
        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let (_, peer) = server.recv_from(&mut buf).await.unwrap();
            let txid: [u8; 4] = buf[12..16].try_into().unwrap();
            let mut reply = Vec::new();
            reply.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
            reply.extend_from_slice(&txid);
            reply.extend_from_slice(&2u64.to_be_bytes());
            server.send_to(&reply, peer).await.unwrap();

            let (_, peer) = server.recv_from(&mut buf).await.unwrap();
            let txid: [u8; 4] = buf[12..16].try_into().unwrap();
            let mut reply = Vec::new();
            reply.extend_from_slice(&ACTION_SCRAPE.to_be_bytes());
            reply.extend_from_slice(&txid);
            // one tuple for a two-hash batch
            reply.extend_from_slice(&[0u8; 12]);
            server.send_to(&reply, peer).await.unwrap();
        });

        let factory = SessionFactory::new().unwrap();
        let mut session = factory
            .create_session(&format!("udp://127.0.0.1:{port}"), noop())
            .unwrap();
        session.add_request(hash(1)).unwrap();
        session.add_request(hash(2)).unwrap();

        let err = session.connect_to_tracker().await.unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(_)), "got {err:?}");
        assert!(session.is_failed());
        server.await.unwrap();
    }
}
