use std::time::Duration;
use bencode::ErrorKind;
use serde_derive::Serialize;
use serde_bytes::ByteBuf;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time,
};
use url::Url;
use super::{http::HttpResponse, resolve_host, Announce, AnnounceParams, Result, TrackerError, DEFAULT_NUM_WANT};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// Per-read deadline; the overall announce budget is enforced upstream.
const READ_TIMEOUT: Duration = Duration::from_secs(10);

// Bencoded-TCP announce: the HTTP query parameters as a bencoded
// dictionary over a raw TCP connection, answered with the same
// bencoded response body HTTP trackers produce.
pub struct TcpTracker {
    url: Url,
}

// Field names mirror the HTTP query form.
#[derive(Serialize)]
struct TcpAnnounceRequest {

    info_hash: ByteBuf,

    peer_id: ByteBuf,

    port: u16,

    uploaded: u64,

    downloaded: u64,

    left: u64,

    compact: u8,

    no_peer_id: u8,

    key: u32,

    numwant: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<String>,

}

impl TcpTracker {

    pub fn new(url: Url) -> Self {
        Self { url }
    }

    pub async fn announce(&mut self, params: AnnounceParams) -> Result<Announce> {

        let host = self.url.host_str().ok_or(TrackerError::InvalidUrl)?;
        let port = self.url.port().ok_or(TrackerError::InvalidUrl)?;
        let addr = resolve_host(host, port).await?;

        let mut stream = time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(TrackerError::from)??;

        let request = TcpAnnounceRequest {
            info_hash: ByteBuf::from(params.info_hash.to_vec()),
            peer_id: ByteBuf::from(params.client_id.to_vec()),
            port: params.port,
            uploaded: params.uploaded,
            downloaded: params.downloaded,
            left: params.left,
            compact: 1,
            no_peer_id: 1,
            key: params.key,
            numwant: params.num_want.unwrap_or(DEFAULT_NUM_WANT) as u64,
            event: params.event.map(|e| e.to_string()),
        };
        let raw = bencode::encode_to_raw(&request)?;
        stream.write_all(&raw).await?;
        stream.flush().await?;

        // Read until one complete bencoded dictionary parses; an EOF
        // error from the decoder just means more bytes are coming.
        let mut buf = Vec::with_capacity(4096);
        let mut chunk = [0u8; 4096];
        loop {
            match bencode::decode_prefix(&buf) {
                Ok((value, _)) => {
                    let response: HttpResponse = bencode::from_value(&value)?;
                    return Ok(response.into_announce());
                }
                Err(e) if e.kind == ErrorKind::Eof => {}
                Err(e) => return Err(e.into()),
            }

            let n = time::timeout(READ_TIMEOUT, stream.read(&mut chunk))
                .await
                .map_err(TrackerError::from)??;
            if n == 0 {
                return Err(TrackerError::Malformed("connection closed mid-response"));
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }
}
