use thiserror::Error;

pub type IngestResult<T> = std::result::Result<T, IngestError>;

/// Failure classes reported to the playback layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Network,
    Media,
    Fatal,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("invalid playlist {url}: {reason}")]
    Parse { url: String, reason: String },
    #[error("manifest advertises no playable tiers")]
    EmptyLadder,
    #[error("segment rejected: {0}")]
    Media(String),
    #[error("network recovery gave up after {attempts} attempts: {last}")]
    NetworkExhausted { attempts: u32, last: String },
    #[error("media recovery gave up after {attempts} attempts: {last}")]
    MediaExhausted { attempts: u32, last: String },
}

impl IngestError {
    pub fn class(&self) -> FailureClass {
        match self {
            IngestError::Transport(_) | IngestError::Status { .. } => FailureClass::Network,
            IngestError::Media(_) => FailureClass::Media,
            IngestError::Parse { .. }
            | IngestError::EmptyLadder
            | IngestError::NetworkExhausted { .. }
            | IngestError::MediaExhausted { .. } => FailureClass::Fatal,
        }
    }
}
