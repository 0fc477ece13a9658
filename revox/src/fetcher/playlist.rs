//! Manifest fetching and parsing.

use m3u8_rs::parse_playlist_res;
use url::Url;

use crate::error::{Error, Result};

/// Duration assumed for segments whose manifest entry declares none.
pub const DEFAULT_SEGMENT_DURATION: f64 = 2.0;

/// One media-segment entry with its canonical sequence number.
#[derive(Debug, Clone)]
pub struct ManifestEntry {
    /// `media_sequence + index` within the manifest.
    pub sequence: u64,
    pub uri: String,
    pub duration: f64,
}

/// A parsed media playlist plus the URL it was actually served from.
///
/// When the source is a master playlist the URL is the resolved first
/// variant, which callers cache for subsequent polls.
#[derive(Debug, Clone)]
pub struct ManifestSnapshot {
    pub url: Url,
    pub entries: Vec<ManifestEntry>,
}

/// Fetches and parses HLS manifests.
pub struct PlaylistClient {
    http: reqwest::Client,
}

impl PlaylistClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Fetch a manifest. A master playlist is followed to its first variant.
    pub async fn fetch(&self, url: &Url) -> Result<ManifestSnapshot> {
        let body = self.fetch_bytes(url).await?;

        match parse_playlist_res(&body) {
            Ok(m3u8_rs::Playlist::MediaPlaylist(playlist)) => {
                Ok(Self::snapshot(url.clone(), &playlist))
            }
            Ok(m3u8_rs::Playlist::MasterPlaylist(master)) => {
                let variant = master.variants.first().ok_or_else(|| {
                    Error::playlist(format!("Master playlist {url} has no variants"))
                })?;
                let variant_url = resolve_uri(url, &variant.uri)?;
                let body = self.fetch_bytes(&variant_url).await?;
                match parse_playlist_res(&body) {
                    Ok(m3u8_rs::Playlist::MediaPlaylist(playlist)) => {
                        Ok(Self::snapshot(variant_url, &playlist))
                    }
                    Ok(m3u8_rs::Playlist::MasterPlaylist(_)) => Err(Error::playlist(format!(
                        "Variant {variant_url} is itself a master playlist"
                    ))),
                    Err(e) => Err(Error::playlist(format!(
                        "Failed to parse variant playlist {variant_url}: {e}"
                    ))),
                }
            }
            Err(e) => Err(Error::playlist(format!(
                "Failed to parse playlist {url}: {e}"
            ))),
        }
    }

    async fn fetch_bytes(&self, url: &Url) -> Result<Vec<u8>> {
        let response = self.http.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(Error::playlist(format!(
                "Failed to fetch playlist {url}: HTTP {}",
                response.status()
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }

    fn snapshot(url: Url, playlist: &m3u8_rs::MediaPlaylist) -> ManifestSnapshot {
        let entries = playlist
            .segments
            .iter()
            .enumerate()
            .map(|(index, segment)| {
                let duration = f64::from(segment.duration);
                ManifestEntry {
                    sequence: playlist.media_sequence + index as u64,
                    uri: segment.uri.clone(),
                    duration: if duration > 0.0 {
                        duration
                    } else {
                        DEFAULT_SEGMENT_DURATION
                    },
                }
            })
            .collect();
        ManifestSnapshot { url, entries }
    }
}

/// Resolve a possibly-relative segment URI against the manifest URL.
pub fn resolve_uri(base: &Url, uri: &str) -> Result<Url> {
    if let Ok(absolute) = Url::parse(uri) {
        return Ok(absolute);
    }
    base.join(uri)
        .map_err(|e| Error::playlist(format!("Cannot resolve '{uri}' against {base}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_relative_and_absolute() {
        let base = Url::parse("http://example.com/live/playlist.m3u8").unwrap();

        let resolved = resolve_uri(&base, "seg1.ts").unwrap();
        assert_eq!(resolved.as_str(), "http://example.com/live/seg1.ts");

        let resolved = resolve_uri(&base, "http://cdn.example.com/seg1.ts").unwrap();
        assert_eq!(resolved.as_str(), "http://cdn.example.com/seg1.ts");
    }

    #[test]
    fn snapshot_sequences_follow_media_sequence() {
        let manifest = b"#EXTM3U\n\
            #EXT-X-VERSION:3\n\
            #EXT-X-TARGETDURATION:2\n\
            #EXT-X-MEDIA-SEQUENCE:17\n\
            #EXTINF:2.0,\nseg17.ts\n\
            #EXTINF:1.5,\nseg18.ts\n";
        let playlist = match parse_playlist_res(manifest).unwrap() {
            m3u8_rs::Playlist::MediaPlaylist(p) => p,
            _ => panic!("expected media playlist"),
        };
        let url = Url::parse("http://example.com/live/v.m3u8").unwrap();
        let snapshot = PlaylistClient::snapshot(url, &playlist);

        assert_eq!(snapshot.entries.len(), 2);
        assert_eq!(snapshot.entries[0].sequence, 17);
        assert_eq!(snapshot.entries[0].duration, 2.0);
        assert_eq!(snapshot.entries[1].sequence, 18);
        assert_eq!(snapshot.entries[1].duration, 1.5);
    }
}
