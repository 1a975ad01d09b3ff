pub mod error;
pub mod sanitize;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::body::Body;
use axum::extract::{RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use regex::Regex;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::ProxySection;

pub use error::{ProxyError, ProxyResult};
pub use sanitize::{apply_cors, sanitize, MediaKind, MANIFEST_CONTENT_TYPE, SEGMENT_CONTENT_TYPE};

fn scheme_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)^https?://").expect("valid regex"))
}

/// One validated proxy request; lives until the response body is drained.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub target: Url,
    pub kind: MediaKind,
    pub origin: Option<String>,
}

impl StreamRequest {
    pub fn parse(raw: Option<&str>, origin: Option<String>) -> ProxyResult<Self> {
        let raw = match raw {
            Some(value) if !value.is_empty() => value,
            _ => return Err(ProxyError::MissingUrl),
        };
        if !scheme_pattern().is_match(raw) {
            return Err(ProxyError::InvalidUrl(raw.to_string()));
        }
        let target = Url::parse(raw).map_err(|err| ProxyError::Fetch(err.to_string()))?;
        Ok(Self {
            kind: MediaKind::from_url(raw),
            target,
            origin,
        })
    }

    pub fn referer(&self) -> String {
        self.target.origin().ascii_serialization()
    }
}

#[derive(Debug, Clone)]
pub struct ProxyState {
    client: reqwest::Client,
}

impl ProxyState {
    pub fn new(config: &ProxySection) -> ProxyResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(ProxyError::Client)?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Fetches the upstream resource and streams it back with sanitized headers.
    pub async fn forward(&self, request: &StreamRequest) -> ProxyResult<Response> {
        let upstream = self
            .client
            .get(request.target.clone())
            .header(header::REFERER, request.referer())
            .send()
            .await
            .map_err(|err| ProxyError::from_fetch(&err))?;

        let status = upstream.status();
        info!(target: "proxy", url = %request.target, status = status.as_u16(), "upstream responded");
        if !status.is_success() {
            return Err(ProxyError::Upstream {
                status,
                status_text: status_text(status),
            });
        }

        let headers = sanitize(request.target.as_str(), upstream.headers());
        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Reason phrase for an upstream status, or the bare code when the status
/// has no registered phrase.
fn status_text(status: StatusCode) -> String {
    status
        .canonical_reason()
        .map(str::to_string)
        .unwrap_or_else(|| status.as_str().to_string())
}

/// First `url` pair of the query string. Repeated keys are not an error.
fn url_param(query: Option<&str>) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == "url")
        .map(|(_, value)| value.into_owned())
}

pub fn router(state: ProxyState, route: &str) -> Router {
    Router::new()
        .route(route, get(proxy_get).options(proxy_options))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn proxy_get(
    State(state): State<ProxyState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let target = url_param(query.as_deref());
    let request_id = Uuid::new_v4();
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    debug!(target: "proxy", %request_id, url = ?target, "proxy request");

    let outcome = match StreamRequest::parse(target.as_deref(), origin) {
        Ok(request) => {
            debug!(target: "proxy", %request_id, kind = ?request.kind, origin = ?request.origin, "forwarding");
            state.forward(&request).await
        }
        Err(err) => Err(err),
    };
    match outcome {
        Ok(response) => response,
        Err(err) => {
            warn!(target: "proxy", %request_id, status = err.status().as_u16(), "proxy failed: {err}");
            err.into_response()
        }
    }
}

async fn proxy_options() -> Response {
    let mut headers = HeaderMap::new();
    apply_cors(&mut headers);
    (StatusCode::OK, headers).into_response()
}

async fn healthz() -> &'static str {
    "ok"
}

/// Stream proxy bound to a local socket.
#[derive(Debug)]
pub struct ProxyServer {
    listener: TcpListener,
    router: Router,
}

impl ProxyServer {
    pub async fn bind(config: &ProxySection) -> ProxyResult<Self> {
        let state = ProxyState::new(config)?;
        let listener = TcpListener::bind(config.bind).await?;
        Ok(Self {
            listener,
            router: router(state, &config.route),
        })
    }

    pub fn local_addr(&self) -> ProxyResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run<F>(self, shutdown: F) -> ProxyResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.local_addr()?;
        info!(target: "proxy", %addr, "stream proxy listening");
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;
        info!(target: "proxy", "stream proxy stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_and_empty_urls_are_rejected() {
        assert!(matches!(
            StreamRequest::parse(None, None),
            Err(ProxyError::MissingUrl)
        ));
        assert!(matches!(
            StreamRequest::parse(Some(""), None),
            Err(ProxyError::MissingUrl)
        ));
    }

    #[test]
    fn scheme_check_is_case_insensitive() {
        let request = StreamRequest::parse(Some("HTTPS://cdn.example/live.m3u8"), None).unwrap();
        assert_eq!(request.kind, MediaKind::Manifest);
        assert_eq!(request.referer(), "https://cdn.example");

        for bad in ["ftp://x.com/a.m3u8", "javascript:alert(1)", "//cdn.example/a.ts"] {
            match StreamRequest::parse(Some(bad), None) {
                Err(ProxyError::InvalidUrl(url)) => assert_eq!(url, bad),
                other => panic!("expected invalid url for {bad}, got {other:?}"),
            }
        }
    }

    #[test]
    fn unparseable_urls_surface_as_internal_errors() {
        let err = StreamRequest::parse(Some("http://"), None).unwrap_err();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn first_url_pair_wins() {
        assert_eq!(
            url_param(Some("url=ftp%3A%2F%2Fa%2Fx.m3u8&url=ftp://b/y.m3u8")).as_deref(),
            Some("ftp://a/x.m3u8")
        );
        assert_eq!(url_param(Some("other=1")), None);
        assert_eq!(url_param(None), None);
        assert_eq!(url_param(Some("url=")).as_deref(), Some(""));
    }

    #[test]
    fn unregistered_statuses_fall_back_to_the_code() {
        assert_eq!(status_text(StatusCode::FORBIDDEN), "Forbidden");
        let cloudflare = StatusCode::from_u16(520).unwrap();
        assert_eq!(status_text(cloudflare), "520");
        let err = ProxyError::Upstream {
            status: cloudflare,
            status_text: status_text(cloudflare),
        };
        assert_eq!(err.to_string(), "Upstream fetch failed: 520");
    }

    #[test]
    fn referer_keeps_non_default_ports() {
        let request =
            StreamRequest::parse(Some("http://127.0.0.1:9000/a/b/seg.ts?x=1"), None).unwrap();
        assert_eq!(request.referer(), "http://127.0.0.1:9000");
        assert_eq!(request.kind, MediaKind::Segment);
    }
}
