use bytes::Bytes;

use super::error::{IngestError, IngestResult};

const TS_SYNC_BYTE: u8 = 0x47;
const TS_PACKET_LEN: usize = 188;
const MP4_BOXES: [&[u8; 4]; 5] = [b"ftyp", b"styp", b"moof", b"moov", b"sidx"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentFormat {
    MpegTs,
    Fmp4,
    PackedAudio,
}

/// Identifies the container of a segment from its leading bytes.
pub fn detect_segment_format(data: &[u8]) -> Option<SegmentFormat> {
    if data.len() >= 8 && MP4_BOXES.iter().any(|magic| &data[4..8] == *magic) {
        return Some(SegmentFormat::Fmp4);
    }
    if data.first() == Some(&TS_SYNC_BYTE) {
        let aligned = data
            .iter()
            .step_by(TS_PACKET_LEN)
            .take(4)
            .all(|byte| *byte == TS_SYNC_BYTE);
        return aligned.then_some(SegmentFormat::MpegTs);
    }
    if data.starts_with(b"ID3") || (data.len() >= 2 && data[0] == 0xFF && data[1] & 0xF0 == 0xF0) {
        return Some(SegmentFormat::PackedAudio);
    }
    None
}

/// Receives fetched segments. A rejection is a recoverable media error.
pub trait MediaSink: Send {
    fn accept(&mut self, uri: &str, data: Bytes) -> IngestResult<SegmentFormat>;

    /// Resets decoder state after a rejected segment.
    fn recover(&mut self);
}

/// Default sink: validates container framing and discards the payload.
#[derive(Debug, Default)]
pub struct ContainerProbeSink {
    last_format: Option<SegmentFormat>,
    accepted: u64,
}

impl ContainerProbeSink {
    pub fn accepted(&self) -> u64 {
        self.accepted
    }
}

impl MediaSink for ContainerProbeSink {
    fn accept(&mut self, uri: &str, data: Bytes) -> IngestResult<SegmentFormat> {
        if data.is_empty() {
            return Err(IngestError::Media(format!("{uri}: empty segment")));
        }
        let format = detect_segment_format(&data)
            .ok_or_else(|| IngestError::Media(format!("{uri}: unrecognised container")))?;
        self.last_format = Some(format);
        self.accepted += 1;
        Ok(format)
    }

    fn recover(&mut self) {
        self.last_format = None;
    }
}
