use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use super::sanitize::apply_cors;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Missing 'url' parameter")]
    MissingUrl,
    #[error("Invalid stream URL format: {0}")]
    InvalidUrl(String),
    #[error("Upstream fetch failed: {status_text}")]
    Upstream {
        status: StatusCode,
        status_text: String,
    },
    #[error("{0}")]
    Fetch(String),
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ProxyResult<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MissingUrl | ProxyError::InvalidUrl(_) => StatusCode::BAD_REQUEST,
            ProxyError::Upstream { status, .. } => *status,
            ProxyError::Fetch(_) | ProxyError::Client(_) | ProxyError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub(crate) fn from_fetch(error: &reqwest::Error) -> Self {
        let message = error.to_string();
        if message.is_empty() {
            ProxyError::Fetch("Proxy failed".into())
        } else {
            ProxyError::Fetch(message)
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        apply_cors(&mut headers);
        let body = Json(json!({ "error": self.to_string() }));
        (self.status(), headers, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_variants_to_status_codes() {
        assert_eq!(ProxyError::MissingUrl.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ProxyError::InvalidUrl("ftp://x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyError::Upstream {
                status: StatusCode::FORBIDDEN,
                status_text: "Forbidden".into()
            }
            .status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ProxyError::Fetch("dns error".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn messages_match_wire_format() {
        assert_eq!(ProxyError::MissingUrl.to_string(), "Missing 'url' parameter");
        assert_eq!(
            ProxyError::InvalidUrl("ftp://x.com/a.m3u8".into()).to_string(),
            "Invalid stream URL format: ftp://x.com/a.m3u8"
        );
        assert_eq!(
            ProxyError::Upstream {
                status: StatusCode::NOT_FOUND,
                status_text: "Not Found".into()
            }
            .to_string(),
            "Upstream fetch failed: Not Found"
        );
    }
}
