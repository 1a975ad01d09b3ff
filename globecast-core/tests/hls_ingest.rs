mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use globecast_core::config::{AbrSection, IngestSection};
use globecast_core::{
    HlsIngestionFactory, IngestEvent, IngestEventSender, Ingestion, IngestionFactory, SessionEvent,
    SessionId, StreamSource, TierIndex, TierSelection, DEFAULT_USER_AGENT,
};
use support::{ts_segment, vod_playlist, TestProxy, TestServer, WAIT};
use tokio::sync::mpsc;

const MASTER: &str = "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-STREAM-INF:BANDWIDTH=2500000,RESOLUTION=1280x720
hi/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360
lo/index.m3u8
";

const HOSTILE: &str = "#EXTM3U
#EXT-X-TARGETDURATION:2
#EXT-X-MEDIA-SEQUENCE:0
#EXTINF:9999999999999999999999999999999999999999,
seg0.ts
";

#[derive(Clone, Default)]
struct Counters {
    flaky: Arc<AtomicUsize>,
    live_refreshes: Arc<AtomicUsize>,
    live_segments: Arc<Mutex<Vec<String>>>,
}

fn segment() -> Response {
    ts_segment(8, 0).into_response()
}

/// Large enough for the throughput estimator to count the sample.
fn heavy_segment() -> Response {
    ts_segment(200, 0).into_response()
}

/// Three one-second segments; the window slides by one on every request.
fn sliding_window(first: usize) -> String {
    let mut body = format!(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:1\n#EXT-X-MEDIA-SEQUENCE:{first}\n"
    );
    for sequence in first..first + 3 {
        body.push_str(&format!("#EXTINF:1.0,\nseg{sequence}.ts\n"));
    }
    body
}

async fn origin() -> (TestServer, Counters) {
    let counters = Counters::default();
    let router = Router::new()
        .route("/master.m3u8", get(|| async { MASTER }))
        .route("/lo/index.m3u8", get(|| async { vod_playlist("seg", 3) }))
        .route("/hi/index.m3u8", get(|| async { vod_playlist("seg", 3) }))
        .route("/lo/:segment", get(|| async { segment() }))
        .route("/hi/:segment", get(|| async { segment() }))
        .route("/single/index.m3u8", get(|| async { vod_playlist("seg", 2) }))
        .route("/single/:segment", get(|| async { segment() }))
        .route(
            "/flaky/index.m3u8",
            get(|State(counters): State<Counters>| async move {
                if counters.flaky.fetch_add(1, Ordering::SeqCst) < 2 {
                    StatusCode::SERVICE_UNAVAILABLE.into_response()
                } else {
                    vod_playlist("seg", 1).into_response()
                }
            }),
        )
        .route("/flaky/:segment", get(|| async { segment() }))
        .route("/corrupt/index.m3u8", get(|| async { vod_playlist("seg", 2) }))
        .route(
            "/corrupt/seg0.ts",
            get(|| async { "<html>geo blocked</html>" }),
        )
        .route("/corrupt/seg1.ts", get(|| async { segment() }))
        .route("/garbage/index.m3u8", get(|| async { "<html>not a playlist</html>" }))
        .route("/hostile/index.m3u8", get(|| async { HOSTILE }))
        .route("/abr/master.m3u8", get(|| async { MASTER }))
        .route("/abr/lo/index.m3u8", get(|| async { vod_playlist("seg", 40) }))
        .route("/abr/hi/index.m3u8", get(|| async { vod_playlist("seg", 40) }))
        .route("/abr/lo/:segment", get(|| async { heavy_segment() }))
        .route("/abr/hi/:segment", get(|| async { heavy_segment() }))
        .route(
            "/live/index.m3u8",
            get(|State(counters): State<Counters>| async move {
                sliding_window(100 + counters.live_refreshes.fetch_add(1, Ordering::SeqCst))
            }),
        )
        .route(
            "/live/:segment",
            get(
                |State(counters): State<Counters>, Path(name): Path<String>| async move {
                    counters.live_segments.lock().unwrap().push(name);
                    segment()
                },
            ),
        )
        .with_state(counters.clone());
    (TestServer::spawn(router).await, counters)
}

fn ingest_config() -> IngestSection {
    IngestSection {
        max_network_retries: 3,
        network_retry_delay_ms: 20,
        request_timeout_secs: 5,
        ..IngestSection::default()
    }
}

fn factory() -> HlsIngestionFactory {
    HlsIngestionFactory::new(ingest_config(), DEFAULT_USER_AGENT).unwrap()
}

/// Collects events until the session ends or fails.
async fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<IngestEvent> {
    let mut events = Vec::new();
    loop {
        let next = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("ingestion stalled")
            .expect("event channel closed");
        assert_eq!(next.session, SessionId(1));
        let terminal = matches!(next.event, IngestEvent::Ended | IngestEvent::Fatal { .. });
        events.push(next.event);
        if terminal {
            return events;
        }
    }
}

fn start(
    factory: &HlsIngestionFactory,
    source: StreamSource,
) -> (Box<dyn Ingestion>, mpsc::UnboundedReceiver<SessionEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let ingestion = factory.start(source, IngestEventSender::new(SessionId(1), tx));
    (ingestion, rx)
}

#[tokio::test]
async fn master_playlist_builds_ladder_and_plays_to_end() {
    let (server, _) = origin().await;
    let (mut ingestion, mut rx) = start(
        &factory(),
        StreamSource::direct(server.url("/master.m3u8")),
    );
    let events = drain(&mut rx).await;

    let IngestEvent::LadderReady { ladder } = &events[0] else {
        panic!("expected ladder first, got {events:?}");
    };
    assert_eq!(ladder.menu_labels(), vec!["Auto", "360p", "720p"]);
    assert_eq!(
        events[1],
        IngestEvent::TierSwitched {
            tier: TierIndex(0),
            label: "360p".into()
        }
    );
    assert_eq!(
        events
            .iter()
            .filter(|e| **e == IngestEvent::FrameRendered)
            .count(),
        1
    );
    assert_eq!(events.last(), Some(&IngestEvent::Ended));

    ingestion.dispose().await;
    ingestion.dispose().await;
    assert!(ingestion.is_disposed());
}

#[tokio::test]
async fn pinned_tier_is_honoured() {
    let (server, _) = origin().await;
    let (mut ingestion, mut rx) = start(
        &factory(),
        StreamSource::direct(server.url("/master.m3u8")),
    );
    ingestion.select_tier(TierSelection::Tier(TierIndex(1)));
    let events = drain(&mut rx).await;
    assert!(events.contains(&IngestEvent::TierSwitched {
        tier: TierIndex(1),
        label: "720p".into()
    }));
    assert_eq!(events.last(), Some(&IngestEvent::Ended));
    ingestion.dispose().await;
}

#[tokio::test]
async fn media_playlist_yields_single_source_ladder() {
    let (server, _) = origin().await;
    let (_ingestion, mut rx) = start(
        &factory(),
        StreamSource::direct(server.url("/single/index.m3u8")),
    );
    let events = drain(&mut rx).await;
    let IngestEvent::LadderReady { ladder } = &events[0] else {
        panic!("expected ladder first");
    };
    assert_eq!(ladder.len(), 1);
    assert!(events.contains(&IngestEvent::FrameRendered));
}

#[tokio::test]
async fn network_errors_recover_in_place() {
    let (server, counters) = origin().await;
    let (_ingestion, mut rx) = start(
        &factory(),
        StreamSource::direct(server.url("/flaky/index.m3u8")),
    );
    let events = drain(&mut rx).await;
    let attempts: Vec<u32> = events
        .iter()
        .filter_map(|event| match event {
            IngestEvent::NetworkError { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2]);
    assert!(events.contains(&IngestEvent::FrameRendered));
    assert_eq!(events.last(), Some(&IngestEvent::Ended));
    assert_eq!(counters.flaky.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn rejected_segments_trigger_media_recovery() {
    let (server, _) = origin().await;
    let (_ingestion, mut rx) = start(
        &factory(),
        StreamSource::direct(server.url("/corrupt/index.m3u8")),
    );
    let events = drain(&mut rx).await;
    let media_error = events
        .iter()
        .position(|e| matches!(e, IngestEvent::MediaError { attempt: 1, .. }))
        .expect("media error reported");
    let frame = events
        .iter()
        .position(|e| *e == IngestEvent::FrameRendered)
        .expect("frame after recovery");
    assert!(media_error < frame);
}

#[tokio::test]
async fn unparseable_manifest_is_fatal() {
    let (server, _) = origin().await;
    let (_ingestion, mut rx) = start(
        &factory(),
        StreamSource::direct(server.url("/garbage/index.m3u8")),
    );
    let events = drain(&mut rx).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], IngestEvent::Fatal { .. }));
}

#[tokio::test]
async fn persistent_network_failure_escalates_to_fatal() {
    let (server, _) = origin().await;
    let (_ingestion, mut rx) = start(
        &factory(),
        StreamSource::direct(server.url("/missing/index.m3u8")),
    );
    let events = drain(&mut rx).await;
    let retries = events
        .iter()
        .filter(|e| matches!(e, IngestEvent::NetworkError { .. }))
        .count();
    assert_eq!(retries, 3);
    let Some(IngestEvent::Fatal { reason }) = events.last() else {
        panic!("expected fatal, got {events:?}");
    };
    assert!(reason.contains("gave up"), "{reason}");
}

#[tokio::test]
async fn proxied_sources_resolve_relative_uris_upstream() {
    let (server, _) = origin().await;
    let proxy = TestProxy::spawn().await;
    let source = StreamSource::proxied(server.url("/master.m3u8"), proxy.endpoint());
    let (_ingestion, mut rx) = start(&factory(), source);
    let events = drain(&mut rx).await;
    assert!(events.contains(&IngestEvent::FrameRendered));
    assert_eq!(events.last(), Some(&IngestEvent::Ended));
}

#[tokio::test]
async fn disposal_stops_event_flow() {
    let (server, _) = origin().await;
    let (mut ingestion, mut rx) = start(
        &factory(),
        StreamSource::direct(server.url("/missing/index.m3u8")),
    );
    ingestion.dispose().await;
    assert!(ingestion.is_disposed());
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(event) = rx.try_recv() {
        assert!(
            !matches!(event.event, IngestEvent::Fatal { .. }),
            "disposed session reported {event:?}"
        );
    }
}

#[tokio::test]
async fn overflowing_segment_duration_is_fatal() {
    let (server, _) = origin().await;
    let (_ingestion, mut rx) = start(
        &factory(),
        StreamSource::direct(server.url("/hostile/index.m3u8")),
    );
    let events = drain(&mut rx).await;
    assert_eq!(events.len(), 1, "{events:?}");
    let IngestEvent::Fatal { reason } = &events[0] else {
        panic!("expected fatal, got {events:?}");
    };
    assert!(reason.contains("EXTINF"), "{reason}");
}

/// Waits for the next tier switch, skipping other events.
async fn next_switch(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> TierIndex {
    loop {
        let next = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("no tier switch")
            .expect("event channel closed");
        match next.event {
            IngestEvent::TierSwitched { tier, .. } => return tier,
            IngestEvent::Ended | IngestEvent::Fatal { .. } => {
                panic!("session finished before switching: {:?}", next.event)
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn auto_after_pin_resumes_adaptive_switching() {
    let (server, _) = origin().await;
    let config = IngestSection {
        abr: AbrSection {
            min_switch_interval_secs: 0.0,
            ..AbrSection::default()
        },
        ..ingest_config()
    };
    let factory = HlsIngestionFactory::new(config, DEFAULT_USER_AGENT).unwrap();
    let (mut ingestion, mut rx) = start(
        &factory,
        StreamSource::direct(server.url("/abr/master.m3u8")),
    );
    ingestion.select_tier(TierSelection::Tier(TierIndex(0)));

    assert_eq!(next_switch(&mut rx).await, TierIndex(0));
    let mut before_auto = Vec::new();
    loop {
        let next = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("no frame")
            .expect("event channel closed");
        if next.event == IngestEvent::FrameRendered {
            break;
        }
        before_auto.push(next.event);
    }
    assert!(
        !before_auto
            .iter()
            .any(|event| matches!(event, IngestEvent::TierSwitched { .. })),
        "pinned session switched on its own: {before_auto:?}"
    );

    ingestion.select_tier(TierSelection::Auto);
    assert_eq!(next_switch(&mut rx).await, TierIndex(1));
    ingestion.dispose().await;
}

#[tokio::test]
async fn live_window_starts_near_edge_and_advances_in_order() {
    let (server, counters) = origin().await;
    let config = IngestSection {
        live_sync_secs: 1.5,
        ..ingest_config()
    };
    let factory = HlsIngestionFactory::new(config, DEFAULT_USER_AGENT).unwrap();
    let (mut ingestion, mut rx) = start(
        &factory,
        StreamSource::direct(server.url("/live/index.m3u8")),
    );

    tokio::time::timeout(WAIT, async {
        while counters.live_segments.lock().unwrap().len() < 6 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("live window stopped advancing");
    ingestion.dispose().await;

    let fetched = counters.live_segments.lock().unwrap().clone();
    assert_eq!(fetched[0], "seg101.ts", "start keeps 1.5s behind the edge");
    let sequences: Vec<usize> = fetched
        .iter()
        .map(|name| {
            name.trim_start_matches("seg")
                .trim_end_matches(".ts")
                .parse()
                .unwrap()
        })
        .collect();
    let expected: Vec<usize> = (101..101 + sequences.len()).collect();
    assert_eq!(sequences, expected, "segments skipped or repeated");
    assert!(counters.live_refreshes.load(Ordering::SeqCst) >= 2);

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event.event);
    }
    assert!(events.contains(&IngestEvent::FrameRendered));
    assert!(!events
        .iter()
        .any(|event| matches!(event, IngestEvent::Ended | IngestEvent::Fatal { .. })));
}
