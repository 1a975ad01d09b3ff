use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use url::Url;

pub const MANIFEST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
pub const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";

const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
];

/// Media kind of a stream request, inferred from the URL's file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Manifest,
    Segment,
    Other,
}

impl MediaKind {
    pub fn from_url(url: &str) -> Self {
        let path = match Url::parse(url) {
            Ok(parsed) => parsed.path().to_ascii_lowercase(),
            Err(_) => url
                .split(['?', '#'])
                .next()
                .unwrap_or(url)
                .to_ascii_lowercase(),
        };
        if path.ends_with(".m3u8") {
            MediaKind::Manifest
        } else if path.ends_with(".ts") {
            MediaKind::Segment
        } else {
            MediaKind::Other
        }
    }

    pub fn content_type(self) -> Option<&'static str> {
        match self {
            MediaKind::Manifest => Some(MANIFEST_CONTENT_TYPE),
            MediaKind::Segment => Some(SEGMENT_CONTENT_TYPE),
            MediaKind::Other => None,
        }
    }
}

pub fn apply_cors(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("*"),
    );
}

/// Builds the downstream header set for a proxied response.
pub fn sanitize(requested_url: &str, upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len() + 3);
    for (name, value) in upstream {
        if is_dropped(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    apply_cors(&mut headers);

    let generic = headers
        .get(header::CONTENT_TYPE)
        .map(|value| {
            let value = String::from_utf8_lossy(value.as_bytes()).to_ascii_lowercase();
            value.contains("text") || value.contains("octet-stream")
        })
        .unwrap_or(true);
    if generic {
        if let Some(content_type) = MediaKind::from_url(requested_url).content_type() {
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
    }
    headers
}

fn is_dropped(name: &HeaderName) -> bool {
    *name == header::SET_COOKIE || HOP_BY_HOP.contains(&name.as_str())
}
