//! HLS playlist parsing into the shapes the ingestion worker needs.

use std::time::Duration;

use m3u8_rs::Playlist;
use url::Url;

use super::error::{IngestError, IngestResult};
use super::ladder::TierCandidate;

/// A variant stream advertised by a master playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantEntry {
    pub uri: Url,
    pub bandwidth: u64,
    pub height: Option<u64>,
}

impl VariantEntry {
    pub fn candidate(&self) -> TierCandidate {
        TierCandidate {
            bandwidth: self.bandwidth,
            height: self.height,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRef {
    pub sequence: u64,
    pub uri: Url,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaManifest {
    pub media_sequence: u64,
    pub target_duration: Duration,
    pub end_list: bool,
    pub segments: Vec<SegmentRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Manifest {
    Master(Vec<VariantEntry>),
    Media(MediaManifest),
}

pub fn parse_manifest(body: &[u8], base: &Url) -> IngestResult<Manifest> {
    let playlist = m3u8_rs::parse_playlist_res(body).map_err(|_| IngestError::Parse {
        url: base.to_string(),
        reason: "not an m3u8 playlist".into(),
    })?;
    match playlist {
        Playlist::MasterPlaylist(master) => {
            let mut variants = Vec::with_capacity(master.variants.len());
            for variant in master.variants.iter().filter(|v| !v.is_i_frame) {
                variants.push(VariantEntry {
                    uri: join(base, &variant.uri)?,
                    bandwidth: variant.bandwidth,
                    height: variant.resolution.as_ref().map(|r| r.height),
                });
            }
            Ok(Manifest::Master(variants))
        }
        Playlist::MediaPlaylist(media) => {
            let first = media.media_sequence;
            if first.checked_add(media.segments.len() as u64).is_none() {
                return Err(IngestError::Parse {
                    url: base.to_string(),
                    reason: format!("media sequence {first} overflows the segment window"),
                });
            }
            let mut segments = Vec::with_capacity(media.segments.len());
            for (offset, segment) in media.segments.iter().enumerate() {
                segments.push(SegmentRef {
                    sequence: first + offset as u64,
                    uri: join(base, &segment.uri)?,
                    duration: seconds(base, "EXTINF", f64::from(segment.duration), 0.0)?,
                });
            }
            Ok(Manifest::Media(MediaManifest {
                media_sequence: first,
                target_duration: seconds(base, "TARGETDURATION", media.target_duration as f64, 1.0)?,
                end_list: media.end_list,
                segments,
            }))
        }
    }
}

pub fn parse_media(body: &[u8], base: &Url) -> IngestResult<MediaManifest> {
    match parse_manifest(body, base)? {
        Manifest::Media(media) => Ok(media),
        Manifest::Master(_) => Err(IngestError::Parse {
            url: base.to_string(),
            reason: "expected a media playlist, found a master playlist".into(),
        }),
    }
}

/// Playlist durations in seconds, floored at `min`. Values past what a
/// `Duration` holds are a parse error.
fn seconds(base: &Url, tag: &str, value: f64, min: f64) -> IngestResult<Duration> {
    let value = if value.is_nan() { value } else { value.max(min) };
    Duration::try_from_secs_f64(value).map_err(|err| IngestError::Parse {
        url: base.to_string(),
        reason: format!("bad {tag} duration {value}: {err}"),
    })
}

fn join(base: &Url, uri: &str) -> IngestResult<Url> {
    base.join(uri.trim()).map_err(|err| IngestError::Parse {
        url: base.to_string(),
        reason: format!("bad uri {uri}: {err}"),
    })
}

impl MediaManifest {
    /// Sequence number one past the newest segment in the window.
    pub fn next_sequence(&self) -> u64 {
        self.media_sequence + self.segments.len() as u64
    }

    /// Newest segment from which at least `sync` of media remains to the end.
    pub fn live_edge_sequence(&self, sync: Duration) -> u64 {
        let mut remaining = Duration::ZERO;
        for segment in self.segments.iter().rev() {
            remaining = remaining.saturating_add(segment.duration);
            if remaining >= sync {
                return segment.sequence;
            }
        }
        self.media_sequence
    }

    /// Where a fresh reader should start: the head for finished playlists, near the edge otherwise.
    pub fn start_sequence(&self, sync: Duration) -> u64 {
        if self.end_list {
            self.media_sequence
        } else {
            self.live_edge_sequence(sync)
        }
    }

    pub fn contains(&self, sequence: u64) -> bool {
        sequence >= self.media_sequence && sequence < self.next_sequence()
    }

    pub fn segments_from(&self, sequence: u64) -> impl Iterator<Item = &SegmentRef> {
        self.segments
            .iter()
            .filter(move |segment| segment.sequence >= sequence)
    }
}
