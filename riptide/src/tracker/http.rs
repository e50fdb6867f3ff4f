use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};
use serde::de;
use serde_derive::Deserialize;
use url::Url;
use super::{parse_compact_peers, Announce, AnnounceParams, HttpOverrides, Result, TrackerError, ANNOUNCE_BUDGET, DEFAULT_NUM_WANT};

pub struct HttpTracker {

    client: reqwest::Client,

    url: Url,

    overrides: HttpOverrides,

}

impl HttpTracker {

    pub fn new(url: Url, overrides: HttpOverrides) -> Self {
        let client = reqwest::Client::builder()
            .timeout(ANNOUNCE_BUDGET)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            url,
            overrides,
        }
    }

    pub async fn announce(
        &mut self,
        params: AnnounceParams,
        tracker_id: Option<&str>,
    ) -> Result<Announce> {

        // info_hash and peer_id are raw bytes; encode_binary keeps the
        // unreserved set (A-Za-z0-9-_.~) literal and escapes the rest.
        let mut url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&no_peer_id=1&key={:08x}&numwant={}",
            self.url.as_str(),
            urlencoding::encode_binary(&params.info_hash),
            urlencoding::encode_binary(&params.client_id),
            params.port,
            params.uploaded,
            params.downloaded,
            params.left,
            params.key,
            params.num_want.unwrap_or(DEFAULT_NUM_WANT),
        );
        if let Some(event) = params.event {
            url.push_str(&format!("&event={}", event));
        }
        if let Some(tracker_id) = tracker_id {
            url.push_str(&format!("&trackerid={}", urlencoding::encode(tracker_id)));
        }
        tracing::debug!("announce url: {}", url);

        let mut request = self.client.get(url);
        for (name, value) in &self.overrides.headers {
            request = request.header(name, value);
        }
        if !self.overrides.cookies.is_empty() {
            let cookie = self
                .overrides
                .cookies
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect::<Vec<_>>()
                .join("; ");
            request = request.header("Cookie", cookie);
        }

        let raw = request
            .send()
            .await?
            // Logical failures (4xx/5xx) are not retried.
            .error_for_status()?
            .bytes()
            .await?;

        let response: HttpResponse = bencode::decode_bytes(&raw)?;
        tracing::trace!("announce response: {:?}", response);
        Ok(response.into_announce())
    }
}

// The bencoded announce response body, shared with the TCP flavour.
#[derive(Deserialize, Debug, Default)]
pub(super) struct HttpResponse {

    // Human-readable error; when present the request logically failed,
    // but any peers that came along are still used.
    #[serde(default)]
    #[serde(rename = "failure reason")]
    pub failure_reason: Option<String>,

    #[serde(default)]
    #[serde(rename = "warning message")]
    pub warning_message: Option<String>,

    // Seconds between regular announces.
    #[serde(default)]
    pub interval: Option<u64>,

    #[serde(default)]
    #[serde(rename = "min interval")]
    pub min_interval: Option<u64>,

    // Echoed back on subsequent announces.
    #[serde(default)]
    #[serde(rename = "tracker id")]
    pub tracker_id: Option<String>,

    // Seeders.
    #[serde(default)]
    pub complete: Option<u64>,

    // Leechers.
    #[serde(default)]
    pub incomplete: Option<u64>,

    #[serde(default)]
    #[serde(deserialize_with = "peers_deserialize")]
    pub peers: Vec<SocketAddr>,

}

impl HttpResponse {
    pub(super) fn into_announce(self) -> Announce {
        if let Some(failure) = &self.failure_reason {
            tracing::warn!("tracker failure: {}", failure);
        }
        if let Some(warning) = &self.warning_message {
            tracing::warn!("tracker warning: {}", warning);
        }
        Announce {
            peers: self.peers,
            interval: self.interval.map(Duration::from_secs),
            min_interval: self.min_interval.map(Duration::from_secs),
            tracker_id: self.tracker_id,
            seeders: self.complete,
            leechers: self.incomplete,
        }
    }
}

// Trackers answer with either the compact byte string or a list of
// dictionaries, regardless of what we asked for.
fn peers_deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct PeerVisitor;

    impl<'de> de::Visitor<'de> for PeerVisitor {

        type Value = Vec<SocketAddr>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a compact peer string or a list of peer dictionaries")
        }

        fn visit_bytes<E>(self, v: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            parse_compact_peers(v).map_err(|e| E::custom(e.to_string()))
        }

        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Deserialize)]
            struct PeerItem {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::new();
            while let Some(peer) = seq.next_element::<PeerItem>()? {
                // Unparseable addresses and the zero port are dropped.
                let Ok(ip) = peer.ip.parse::<IpAddr>() else {
                    continue;
                };
                if peer.port == 0 {
                    continue;
                }
                peers.push(SocketAddr::new(ip, peer.port));
            }
            Ok(peers)
        }
    }

    deserializer.deserialize_any(PeerVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;
    use bencode::Value;

    #[test]
    fn test_parse_compact_response() {
        let raw = "64383a636f6d706c65746569396531303a696e636f6d706c657465693165383a696e74657276616c69313830306531323a6d696e20696e74657276616c693138303065353a706565727336303a52454d051ae1ca2f2a2ec00884937726decc61759ab8138851ab05e8f6bb5062f69770469247493ad4d005879f2ec8d54237ce44ea6043db8806c8d565";
        let response: HttpResponse = bencode::decode_bytes(&hex::decode(raw).unwrap()).unwrap();
        assert_eq!(response.interval, Some(1800));
        assert_eq!(response.min_interval, Some(1800));
        assert_eq!(response.complete, Some(9));
        assert_eq!(response.incomplete, Some(1));
        assert_eq!(response.peers.len(), 10);
        assert!(response
            .peers
            .contains(&SocketAddr::new(Ipv4Addr::new(97, 117, 154, 184).into(), 5000)));
        assert!(response
            .peers
            .contains(&SocketAddr::new(Ipv4Addr::new(5, 135, 159, 46).into(), 51413)));
    }

    #[test]
    fn test_parse_dictionary_peers() {
        let peer = |ip: &str, port: i64| {
            let mut d = BTreeMap::new();
            d.insert(b"ip".to_vec(), ip.into());
            d.insert(b"port".to_vec(), Value::Int(port));
            Value::Dict(d)
        };
        let mut root = BTreeMap::new();
        root.insert(b"interval".to_vec(), Value::Int(900));
        root.insert(
            b"peers".to_vec(),
            Value::List(vec![
                peer("10.1.2.3", 6881),
                peer("not-an-ip", 6881),
                peer("10.1.2.4", 0),
            ]),
        );
        let raw = bencode::encode(&Value::Dict(root));

        let response: HttpResponse = bencode::decode_bytes(&raw).unwrap();
        // The junk entries are dropped, not fatal.
        assert_eq!(response.peers, vec!["10.1.2.3:6881".parse().unwrap()]);
    }

    #[test]
    fn test_failure_reason_still_parses_peers() {
        let mut root = BTreeMap::new();
        root.insert(b"failure reason".to_vec(), "unregistered torrent".into());
        root.insert(
            b"peers".to_vec(),
            Value::Bytes(vec![10, 0, 0, 9, 0x1a, 0xe1]),
        );
        let raw = bencode::encode(&Value::Dict(root));
        let response: HttpResponse = bencode::decode_bytes(&raw).unwrap();
        let announce = response.into_announce();
        assert_eq!(announce.peers, vec!["10.0.0.9:6881".parse().unwrap()]);
    }
}
