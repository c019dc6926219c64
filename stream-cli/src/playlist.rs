//! Turns an HLS playlist into the engine's single-variant manifest.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use m3u8_rs::{KeyMethod, MediaPlaylist, Playlist, parse_playlist_res};
use streaming_engine::config::RetryParameters;
use streaming_engine::media::{
    AesKey, ContentType, InitSegmentReference, Manifest, ManifestKind, PresentationTimeline, SegmentReference,
    StaticSegmentIndex, Stream, Variant,
};
use streaming_engine::{NetworkingEngine, Request, RequestType};
use tracing::{debug, info};
use url::Url;

use crate::error::{AppError, Result};

/// A loaded presentation ready to be handed to the engine.
pub struct Presentation {
    pub manifest: Arc<Manifest>,
    pub variant: Variant,
    /// End of the last listed segment.
    pub end_time: f64,
}

async fn fetch(net: &NetworkingEngine, uri: &Url, retry: &RetryParameters) -> Result<Bytes> {
    let request = Request::new(vec![uri.to_string()], retry.clone());
    let response = net.request(RequestType::Other, request).result().await?;
    Ok(response.data)
}

/// Load `url`, following a master playlist to its highest bandwidth
/// variant.
pub async fn load(net: &NetworkingEngine, url: &Url, retry: &RetryParameters) -> Result<Presentation> {
    let data = fetch(net, url, retry).await?;
    let (media_url, media, codecs, bandwidth) = match parse_playlist_res(&data) {
        Ok(Playlist::MediaPlaylist(media)) => (url.clone(), media, String::new(), None),
        Ok(Playlist::MasterPlaylist(master)) => {
            let variant = master
                .variants
                .iter()
                .filter(|v| !v.is_i_frame)
                .max_by_key(|v| v.bandwidth)
                .ok_or_else(|| AppError::Playlist("master playlist lists no variants".to_string()))?;
            let media_url = resolve(url, &variant.uri)?;
            info!(uri = %media_url, bandwidth = variant.bandwidth, "Selected variant");
            let data = fetch(net, &media_url, retry).await?;
            let media = match parse_playlist_res(&data) {
                Ok(Playlist::MediaPlaylist(media)) => media,
                Ok(Playlist::MasterPlaylist(_)) => {
                    return Err(AppError::Playlist("variant URI points to a master playlist".to_string()));
                }
                Err(e) => return Err(AppError::Playlist(format!("failed to parse media playlist: {e}"))),
            };
            (
                media_url,
                media,
                variant.codecs.clone().unwrap_or_default(),
                Some(variant.bandwidth),
            )
        }
        Err(e) => return Err(AppError::Playlist(format!("failed to parse playlist: {e}"))),
    };

    let mut keys = HashMap::new();
    for key in media.segments.iter().filter_map(|s| s.key.as_ref()) {
        if key.method != KeyMethod::AES128 {
            continue;
        }
        let Some(uri) = key.uri.as_deref() else {
            continue;
        };
        let key_url = resolve(&media_url, uri)?;
        if keys.contains_key(key_url.as_str()) {
            continue;
        }
        let data = fetch(net, &key_url, retry).await?;
        let key: [u8; 16] = data
            .as_ref()
            .try_into()
            .map_err(|_| AppError::Playlist(format!("key {key_url} is {} bytes, expected 16", data.len())))?;
        debug!(uri = %key_url, "Fetched AES-128 key");
        keys.insert(key_url.to_string(), key);
    }

    let stream = build_stream(&media, &media_url, &codecs, bandwidth, &keys)?;
    let end_time = presentation_end(&media);
    let duration = if media.end_list { end_time } else { f64::INFINITY };
    let variant = Variant {
        id: 0,
        audio: None,
        video: Some(stream),
        bandwidth: bandwidth.unwrap_or_default(),
    };
    let mut manifest = Manifest::new(
        ManifestKind::Hls,
        vec![variant.clone()],
        PresentationTimeline::new(duration, media.target_duration as f64),
    );
    manifest.sequence_mode = true;
    info!(
        segments = media.segments.len(),
        duration,
        live = !media.end_list,
        "Loaded media playlist"
    );

    Ok(Presentation {
        manifest: Arc::new(manifest),
        variant,
        end_time,
    })
}

fn resolve(base: &Url, uri: &str) -> Result<Url> {
    base.join(uri)
        .map_err(|e| AppError::Playlist(format!("invalid URI `{uri}`: {e}")))
}

fn parse_iv(iv: &str) -> Result<[u8; 16]> {
    let digits = iv.trim_start_matches("0x").trim_start_matches("0X");
    let mut bytes = [0u8; 16];
    hex::decode_to_slice(digits, &mut bytes)
        .map_err(|e| AppError::Playlist(format!("failed to parse IV '{iv}': {e}")))?;
    Ok(bytes)
}

fn presentation_end(media: &MediaPlaylist) -> f64 {
    media.segments.iter().map(|s| s.duration as f64).sum()
}

/// Build the video stream of a media playlist. `keys` maps resolved key
/// URIs to key bytes.
pub fn build_stream(
    media: &MediaPlaylist,
    base: &Url,
    codecs: &str,
    bandwidth: Option<u64>,
    keys: &HashMap<String, [u8; 16]>,
) -> Result<Arc<Stream>> {
    let mut references = Vec::with_capacity(media.segments.len());
    let mut start_time = 0.0;
    let mut discontinuity = media.discontinuity_sequence as i64;
    let mut current_key: Option<Arc<AesKey>> = None;
    let mut current_init: Option<Arc<InitSegmentReference>> = None;
    // Resource and end offset of the last sub-range, for ranges without offset.
    let mut last_range: Option<(String, u64)> = None;

    for segment in &media.segments {
        if segment.discontinuity {
            discontinuity += 1;
        }
        if let Some(key) = &segment.key {
            current_key = match &key.method {
                KeyMethod::None => None,
                KeyMethod::AES128 => {
                    let uri = key
                        .uri
                        .as_deref()
                        .ok_or_else(|| AppError::Playlist("AES-128 key without URI".to_string()))?;
                    let key_url = resolve(base, uri)?;
                    let bytes = keys
                        .get(key_url.as_str())
                        .ok_or_else(|| AppError::Playlist(format!("key {key_url} was not fetched")))?;
                    Some(Arc::new(AesKey {
                        key: *bytes,
                        iv: key.iv.as_deref().map(parse_iv).transpose()?,
                        first_media_sequence_number: media.media_sequence,
                    }))
                }
                other => {
                    return Err(AppError::Playlist(format!("unsupported key method {other:?}")));
                }
            };
        }
        if let Some(map) = &segment.map {
            let uri = resolve(base, &map.uri)?.to_string();
            let init = match &map.byte_range {
                Some(range) => {
                    let start = range.offset.unwrap_or_default();
                    InitSegmentReference::new(vec![uri], start, Some(start + range.length.saturating_sub(1)))
                }
                None => InitSegmentReference::new(vec![uri], 0, None),
            };
            current_init = Some(Arc::new(init));
        }

        let uri = resolve(base, &segment.uri)?.to_string();
        let end_time = start_time + segment.duration as f64;
        let mut reference = SegmentReference::new(start_time, end_time, vec![uri.clone()])
            .with_discontinuity_sequence(discontinuity);
        if let Some(range) = &segment.byte_range {
            let start = range.offset.unwrap_or_else(|| match &last_range {
                Some((last_uri, end)) if *last_uri == uri => end + 1,
                _ => 0,
            });
            let end = start + range.length.saturating_sub(1);
            reference = reference.with_byte_range(start, Some(end));
            last_range = Some((uri, end));
        }
        if let Some(init) = &current_init {
            reference = reference.with_init_segment(Arc::clone(init));
        }
        if let Some(key) = &current_key {
            reference = reference.with_aes_key(Arc::clone(key));
        }
        references.push(Arc::new(reference));
        start_time = end_time;
    }

    let is_mp4 = current_init.is_some()
        || media
            .segments
            .first()
            .is_some_and(|s| s.uri.ends_with(".m4s") || s.uri.ends_with(".mp4"));
    let mime_type = if is_mp4 { "video/mp4" } else { "video/mp2t" };

    let mut builder = Stream::builder(1, ContentType::Video, Arc::new(StaticSegmentIndex::new(references)))
        .mime_type(mime_type, codecs);
    if let Some(bandwidth) = bandwidth {
        builder = builder.bandwidth(bandwidth);
    }
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use m3u8_rs::parse_media_playlist_res;

    const PLAYLIST: &str = "#EXTM3U
#EXT-X-VERSION:7
#EXT-X-TARGETDURATION:4
#EXT-X-MEDIA-SEQUENCE:100
#EXT-X-MAP:URI=\"init.mp4\",BYTERANGE=\"720@0\"
#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\",IV=0x000102030405060708090a0b0c0d0e0f
#EXTINF:4.0,
#EXT-X-BYTERANGE:1000@720
media.m4s
#EXTINF:4.0,
#EXT-X-BYTERANGE:500
media.m4s
#EXT-X-DISCONTINUITY
#EXT-X-KEY:METHOD=NONE
#EXTINF:2.0,
next.m4s
#EXT-X-ENDLIST
";

    fn media() -> MediaPlaylist {
        parse_media_playlist_res(PLAYLIST.as_bytes()).unwrap()
    }

    fn base() -> Url {
        Url::parse("https://cdn.example/live/index.m3u8").unwrap()
    }

    fn keys() -> HashMap<String, [u8; 16]> {
        HashMap::from([("https://cdn.example/live/key.bin".to_string(), [7u8; 16])])
    }

    #[tokio::test]
    async fn test_build_stream_resolves_ranges_keys_and_discontinuities() {
        let stream = build_stream(&media(), &base(), "avc1.64001f", Some(800_000), &keys()).unwrap();
        assert!(stream.is_mp4());
        assert_eq!(stream.codecs(), "avc1.64001f");
        let index = stream.create_segment_index().await.unwrap();
        assert_eq!(index.len(), 3);

        let first = index.get(0).unwrap();
        assert_eq!(first.uris(), ["https://cdn.example/live/media.m4s"]);
        assert_eq!((first.start_byte(), first.end_byte()), (720, Some(1719)));
        let init = first.init_segment().unwrap();
        assert_eq!((init.start_byte(), init.end_byte()), (0, Some(719)));
        let key = first.aes_key().unwrap();
        assert_eq!(key.key, [7u8; 16]);
        assert_eq!(key.first_media_sequence_number, 100);
        assert_eq!(key.iv.unwrap()[15], 0x0f);

        // Offset omitted: continues after the previous sub-range.
        let second = index.get(1).unwrap();
        assert_eq!((second.start_byte(), second.end_byte()), (1720, Some(2219)));
        assert_eq!(second.start_time(), 4.0);

        let third = index.get(2).unwrap();
        assert!(third.aes_key().is_none());
        assert_eq!(third.discontinuity_sequence(), 1);
        assert_eq!(third.end_time(), 10.0);
    }

    #[test]
    fn test_missing_key_is_an_error() {
        let result = build_stream(&media(), &base(), "", None, &HashMap::new());
        assert!(matches!(result, Err(AppError::Playlist(_))));
    }

    #[test]
    fn test_parse_iv() {
        assert_eq!(parse_iv("0x0000000000000000000000000000002a").unwrap()[15], 42);
        assert!(parse_iv("0x1234").is_err());
    }

    #[test]
    fn test_presentation_end() {
        assert_eq!(presentation_end(&media()), 10.0);
    }
}
