use std::time::{Duration, Instant};
use bytes::{Buf, BufMut, BytesMut};
use tokio::{net::UdpSocket, time};
use url::Url;
use super::{resolve_host, Announce, AnnounceParams, Event, Result, TrackerError, DEFAULT_NUM_WANT};

// Reference: BEP-15.

const PROTOCOL_MAGIC: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

const ATTEMPTS: usize = 3;
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

// Connection ids are valid for one minute after the connect exchange.
const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

pub struct UdpTracker {

    url: Url,

    connection: Option<(i64, Instant)>,

}

impl UdpTracker {

    pub fn new(url: Url) -> Self {
        Self {
            url,
            connection: None,
        }
    }

    pub async fn announce(&mut self, params: AnnounceParams) -> Result<Announce> {

        let host = self.url.host_str().ok_or(TrackerError::InvalidUrl)?;
        let port = self.url.port().ok_or(TrackerError::InvalidUrl)?;
        let addr = resolve_host(host, port).await?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;

        let connection_id = self.connection_id(&socket).await?;

        let trans_id: u32 = rand::random();
        let mut frame = BytesMut::with_capacity(98);
        frame.put_i64(connection_id);
        frame.put_u32(ACTION_ANNOUNCE);
        frame.put_u32(trans_id);
        frame.put_slice(&params.info_hash);
        frame.put_slice(&params.client_id);
        frame.put_u64(params.downloaded);
        frame.put_u64(params.left);
        frame.put_u64(params.uploaded);
        frame.put_u32(match params.event {
            None => 0,
            Some(Event::Completed) => 1,
            Some(Event::Started) => 2,
            Some(Event::Stopped) => 3,
        });
        frame.put_u32(0); // IP address: default.
        frame.put_u32(params.key);
        frame.put_i32(match params.num_want {
            Some(n) => n as i32,
            None => DEFAULT_NUM_WANT as i32,
        });
        frame.put_u16(params.port);
        debug_assert_eq!(frame.len(), 98);

        let payload = exchange(&socket, &frame, ACTION_ANNOUNCE, trans_id).await?;
        if payload.len() < 12 {
            return Err(TrackerError::Malformed("short announce response"));
        }

        let mut resp = payload.as_slice();
        let interval = resp.get_u32();
        let leechers = resp.get_u32();
        let seeders = resp.get_u32();
        let peers = super::parse_compact_peers(resp)?;

        Ok(Announce {
            peers,
            interval: Some(Duration::from_secs(interval as u64)),
            min_interval: None,
            tracker_id: None,
            seeders: Some(seeders as u64),
            leechers: Some(leechers as u64),
        })
    }

    // Step one of the protocol; the id is cached across announces
    // within its TTL.
    async fn connection_id(&mut self, socket: &UdpSocket) -> Result<i64> {

        if let Some((id, obtained)) = self.connection {
            if obtained.elapsed() < CONNECTION_ID_TTL {
                return Ok(id);
            }
        }

        let trans_id: u32 = rand::random();
        let mut frame = BytesMut::with_capacity(16);
        frame.put_u64(PROTOCOL_MAGIC);
        frame.put_u32(ACTION_CONNECT);
        frame.put_u32(trans_id);

        let payload = exchange(socket, &frame, ACTION_CONNECT, trans_id).await?;
        if payload.len() < 8 {
            return Err(TrackerError::Malformed("short connect response"));
        }
        let id = payload.as_slice().get_i64();

        tracing::trace!("connected to tracker, id {}", id);
        self.connection = Some((id, Instant::now()));
        Ok(id)
    }
}

// Send a request and wait for the matching response: 5 seconds per
// attempt, three attempts, backing off between them. Datagrams with
// the wrong transaction id or action are discarded, not fatal.
async fn exchange(
    socket: &UdpSocket,
    request: &[u8],
    expected_action: u32,
    trans_id: u32,
) -> Result<Vec<u8>> {

    let mut buf = [0u8; 1500];
    for attempt in 0..ATTEMPTS as u32 {
        if attempt > 0 {
            time::sleep(RETRY_BACKOFF * (1u32 << (attempt - 1))).await;
        }
        socket.send(request).await?;

        let deadline = time::Instant::now() + ATTEMPT_TIMEOUT;
        loop {
            let n = match time::timeout_at(deadline, socket.recv(&mut buf)).await {
                Ok(n) => n?,
                // Attempt timed out; retransmit.
                Err(_) => break,
            };
            if n < 8 {
                continue;
            }
            let mut resp = &buf[..n];
            let action = resp.get_u32();
            let got_trans_id = resp.get_u32();
            if got_trans_id != trans_id {
                tracing::trace!("discarding datagram with stale transaction id");
                continue;
            }
            if action == ACTION_ERROR {
                let text = String::from_utf8_lossy(resp).into_owned();
                return Err(TrackerError::Failure(text));
            }
            if action != expected_action {
                tracing::trace!("discarding datagram with unexpected action {}", action);
                continue;
            }
            return Ok(resp.to_vec());
        }
    }

    Err(TrackerError::NoResponse(ATTEMPTS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket;

    // A scripted tracker: drops the first `drop` datagrams, then plays
    // the connect/announce exchange by the book.
    async fn scripted_tracker(drop: usize, peers: Vec<u8>) -> std::net::SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut dropped = 0;
            let mut buf = [0u8; 1500];
            loop {
                let (n, from) = socket.recv_from(&mut buf).await.unwrap();
                if dropped < drop {
                    dropped += 1;
                    continue;
                }
                let mut req = &buf[..n];
                if n >= 16 && req[..8] == PROTOCOL_MAGIC.to_be_bytes() {
                    // Connect request.
                    req.advance(12);
                    let trans_id = req.get_u32();
                    let mut resp = BytesMut::new();
                    resp.put_u32(ACTION_CONNECT);
                    resp.put_u32(trans_id);
                    resp.put_i64(0x1234_5678);
                    socket.send_to(&resp, from).await.unwrap();
                } else if n >= 98 {
                    // Announce request.
                    let conn_id = req.get_i64();
                    assert_eq!(conn_id, 0x1234_5678);
                    assert_eq!(req.get_u32(), ACTION_ANNOUNCE);
                    let trans_id = req.get_u32();
                    let mut resp = BytesMut::new();
                    resp.put_u32(ACTION_ANNOUNCE);
                    resp.put_u32(trans_id);
                    resp.put_u32(1800);
                    resp.put_u32(3);
                    resp.put_u32(7);
                    resp.extend_from_slice(&peers);
                    socket.send_to(&resp, from).await.unwrap();
                }
            }
        });
        addr
    }

    fn params() -> AnnounceParams {
        AnnounceParams {
            info_hash: [0xaa; 20],
            client_id: [0xbb; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 1024,
            event: Some(Event::Started),
            num_want: None,
            key: 42,
        }
    }

    #[tokio::test]
    async fn test_announce_happy_path() {
        let addr = scripted_tracker(0, vec![10, 0, 0, 1, 0x1a, 0xe1]).await;
        let url = Url::parse(&format!("udp://{}:{}", addr.ip(), addr.port())).unwrap();
        let mut tracker = UdpTracker::new(url);

        let announce = tracker.announce(params()).await.unwrap();
        assert_eq!(announce.interval, Some(Duration::from_secs(1800)));
        assert_eq!(announce.leechers, Some(3));
        assert_eq!(announce.seeders, Some(7));
        assert_eq!(announce.peers, vec!["10.0.0.1:6881".parse().unwrap()]);
        // The connection id is cached for the next announce.
        assert!(tracker.connection.is_some());
    }

    #[tokio::test]
    async fn test_connect_retries_after_dropped_datagram() {
        // The first connect request vanishes; the retry succeeds and
        // the obtained connection id is used for the announce.
        let addr = scripted_tracker(1, vec![]).await;
        let url = Url::parse(&format!("udp://{}:{}", addr.ip(), addr.port())).unwrap();
        let mut tracker = UdpTracker::new(url);

        let announce = tracker.announce(params()).await.unwrap();
        assert!(announce.peers.is_empty());
    }
}
