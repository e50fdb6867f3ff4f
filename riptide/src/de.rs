use serde::{de, Deserialize};
use url::Url;

// Deserialiser helpers for metainfo fields.

pub fn optional_url<'de, D>(deserializer: D) -> Result<Option<Url>, D::Error>
where
    D: de::Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?;
    match s {
        Some(s) => Url::parse(&s).map(Some).map_err(de::Error::custom),
        None => Ok(None),
    }
}

// Tiers of tracker URLs. Entries that fail to parse are dropped rather
// than failing the whole metainfo; empty tiers vanish with them.
pub fn announce_list<'de, D>(deserializer: D) -> Result<Option<Vec<Vec<Url>>>, D::Error>
where
    D: de::Deserializer<'de>,
{
    let raw = Option::<Vec<Vec<String>>>::deserialize(deserializer)?;
    let Some(raw) = raw else {
        return Ok(None);
    };

    let mut tiers = Vec::new();
    for tier in raw {
        let urls: Vec<Url> = tier
            .iter()
            .filter_map(|u| match Url::parse(u) {
                Ok(url) => Some(url),
                Err(e) => {
                    tracing::warn!("dropping unparseable tracker url {:?}: {}", u, e);
                    None
                }
            })
            .collect();
        if !urls.is_empty() {
            tiers.push(urls);
        }
    }

    if tiers.is_empty() {
        Ok(None)
    } else {
        Ok(Some(tiers))
    }
}

#[cfg(test)]
mod tests {
    use serde_derive::Deserialize;

    #[derive(Deserialize)]
    struct Doc {
        #[serde(default)]
        #[serde(deserialize_with = "super::announce_list")]
        tiers: Option<Vec<Vec<url::Url>>>,
    }

    #[test]
    fn test_announce_list_drops_junk() {
        let raw = b"d5:tiersll9:not a url10:udp://x:80el13:http://y/annoeee";
        let doc: Doc = bencode::decode_bytes(raw).unwrap();
        let tiers = doc.tiers.unwrap();
        assert_eq!(tiers.len(), 2);
        assert_eq!(tiers[0].len(), 1);
        assert_eq!(tiers[0][0].scheme(), "udp");
    }

    #[test]
    fn test_announce_list_empty_is_none() {
        let doc: Doc = bencode::decode_bytes(b"d5:tierslee").unwrap();
        assert!(doc.tiers.is_none());
    }
}
