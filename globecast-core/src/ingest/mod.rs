//! Adaptive stream ingestion: manifest parsing, tier ladder, ABR and the
//! segment fetch loop that reports lifecycle events to playback.

pub mod abr;
pub mod buffer;
pub mod error;
pub mod hls;
pub mod ladder;
pub mod manifest;
pub mod sink;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::directory::StreamSource;

pub use abr::{AbrController, AbrDecision, AbrReason, ThroughputEstimator, ThroughputSample};
pub use buffer::RollingBuffer;
pub use error::{FailureClass, IngestError, IngestResult};
pub use hls::{HlsIngestion, HlsIngestionFactory};
pub use ladder::{QualityLadder, QualityTier, TierCandidate, TierIndex, TierSelection, AUTO_LABEL};
pub use manifest::{parse_manifest, parse_media, Manifest, MediaManifest, SegmentRef, VariantEntry};
pub use sink::{detect_segment_format, ContainerProbeSink, MediaSink, SegmentFormat};

/// Identifies one ingestion session. Events carry it so that events from a
/// disposed session can be told apart from the live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    LadderReady { ladder: Arc<QualityLadder> },
    TierSwitched { tier: TierIndex, label: String },
    NetworkError { attempt: u32, detail: String },
    MediaError { attempt: u32, detail: String },
    Fatal { reason: String },
    FrameRendered,
    Ended,
}

impl IngestEvent {
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            IngestEvent::NetworkError { .. } => Some(FailureClass::Network),
            IngestEvent::MediaError { .. } => Some(FailureClass::Media),
            IngestEvent::Fatal { .. } => Some(FailureClass::Fatal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub session: SessionId,
    pub event: IngestEvent,
}

/// Event channel handed to one ingestion session.
#[derive(Debug, Clone)]
pub struct IngestEventSender {
    session: SessionId,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl IngestEventSender {
    pub fn new(session: SessionId, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Returns false once the receiving side is gone.
    pub fn emit(&self, event: IngestEvent) -> bool {
        self.tx
            .send(SessionEvent {
                session: self.session,
                event,
            })
            .is_ok()
    }
}

/// A running ingestion session.
#[async_trait]
pub trait Ingestion: Send {
    fn select_tier(&mut self, selection: TierSelection);

    /// Stops all fetching. Safe to call more than once.
    async fn dispose(&mut self);

    fn is_disposed(&self) -> bool;
}

pub trait IngestionFactory: Send + Sync {
    fn start(&self, source: StreamSource, events: IngestEventSender) -> Box<dyn Ingestion>;
}
