use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use url::Url;

use super::abr::{AbrController, ThroughputSample};
use super::buffer::RollingBuffer;
use super::error::{FailureClass, IngestError, IngestResult};
use super::ladder::{QualityLadder, TierIndex, TierSelection};
use super::manifest::{parse_manifest, parse_media, Manifest, MediaManifest, SegmentRef, VariantEntry};
use super::sink::{ContainerProbeSink, MediaSink};
use super::{IngestEvent, IngestEventSender, Ingestion, IngestionFactory, SessionId};
use crate::config::IngestSection;
use crate::directory::StreamSource;

pub type SinkFactory = Arc<dyn Fn() -> Box<dyn MediaSink> + Send + Sync>;

/// Starts HLS sessions sharing one HTTP client.
#[derive(Clone)]
pub struct HlsIngestionFactory {
    client: reqwest::Client,
    config: Arc<IngestSection>,
    sinks: SinkFactory,
}

impl HlsIngestionFactory {
    pub fn new(config: IngestSection, user_agent: &str) -> IngestResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            config: Arc::new(config),
            sinks: Arc::new(|| Box::new(ContainerProbeSink::default())),
        })
    }

    pub fn with_sink_factory<F>(mut self, sinks: F) -> Self
    where
        F: Fn() -> Box<dyn MediaSink> + Send + Sync + 'static,
    {
        self.sinks = Arc::new(sinks);
        self
    }
}

impl IngestionFactory for HlsIngestionFactory {
    fn start(&self, source: StreamSource, events: IngestEventSender) -> Box<dyn Ingestion> {
        let session = events.session();
        let (selection_tx, selection_rx) = watch::channel(TierSelection::Auto);
        info!(target: "ingest", %session, %source, "starting ingestion");
        let worker = Worker {
            client: self.client.clone(),
            config: Arc::clone(&self.config),
            source,
            events,
            selection: selection_rx,
            sink: (self.sinks)(),
            network_failures: 0,
            media_failures: 0,
        };
        let task = tokio::spawn(worker.run());
        Box::new(HlsIngestion {
            session,
            selection: selection_tx,
            task: Some(task),
        })
    }
}

/// Handle to one running HLS session.
#[derive(Debug)]
pub struct HlsIngestion {
    session: SessionId,
    selection: watch::Sender<TierSelection>,
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl Ingestion for HlsIngestion {
    fn select_tier(&mut self, selection: TierSelection) {
        if self.task.is_some() {
            self.selection.send_replace(selection);
        }
    }

    async fn dispose(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
            debug!(target: "ingest", session = %self.session, "ingestion disposed");
        }
    }

    fn is_disposed(&self) -> bool {
        self.task.is_none()
    }
}

impl Drop for HlsIngestion {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

enum Outcome {
    Ended,
    Detached,
}

struct Worker {
    client: reqwest::Client,
    config: Arc<IngestSection>,
    source: StreamSource,
    events: IngestEventSender,
    selection: watch::Receiver<TierSelection>,
    sink: Box<dyn MediaSink>,
    network_failures: u32,
    media_failures: u32,
}

impl Worker {
    async fn run(mut self) {
        let session = self.events.session();
        match self.drive().await {
            Ok(Outcome::Ended) => {
                info!(target: "ingest", %session, "stream ended");
                self.events.emit(IngestEvent::Ended);
            }
            Ok(Outcome::Detached) => {
                debug!(target: "ingest", %session, "controller went away");
            }
            Err(err) => {
                warn!(target: "ingest", %session, error = %err, "ingestion failed");
                self.events.emit(IngestEvent::Fatal {
                    reason: err.to_string(),
                });
            }
        }
    }

    async fn drive(&mut self) -> IngestResult<Outcome> {
        let top = self.source.upstream().clone();
        let (body, _) = self.fetch(&top).await?;
        let (ladder, playlists, mut prefetched) = match parse_manifest(&body, &top)? {
            Manifest::Master(variants) => {
                if variants.is_empty() {
                    return Err(IngestError::EmptyLadder);
                }
                let candidates: Vec<_> = variants.iter().map(VariantEntry::candidate).collect();
                let (ladder, order) = QualityLadder::build(&candidates);
                let playlists: Vec<Url> = order
                    .iter()
                    .map(|&position| variants[position].uri.clone())
                    .collect();
                (ladder, playlists, None)
            }
            Manifest::Media(media) => (QualityLadder::single_source(), vec![top], Some(media)),
        };
        let ladder = Arc::new(ladder);
        debug!(target: "ingest", tiers = ladder.len(), "ladder ready");
        if !self.events.emit(IngestEvent::LadderReady {
            ladder: Arc::clone(&ladder),
        }) {
            return Ok(Outcome::Detached);
        }

        let mut abr = AbrController::new(&self.config.abr);
        let mut current = match *self.selection.borrow_and_update() {
            TierSelection::Tier(index) if ladder.contains(index) => {
                abr.note_switch(Instant::now());
                index
            }
            _ => abr.fitting_tier(&ladder).unwrap_or(TierIndex(0)),
        };
        self.announce_tier(&ladder, current);

        let mut media = match prefetched.take() {
            Some(media) => media,
            None => self.load_media(&playlists[current.0]).await?,
        };
        let live_sync = self.config.live_sync();
        let mut cursor = media.start_sequence(live_sync);
        let mut buffer = RollingBuffer::new(self.config.max_buffer());
        let mut rendered = false;

        loop {
            if media.end_list && cursor >= media.next_sequence() {
                return Ok(Outcome::Ended);
            }
            if !media.contains(cursor) && cursor != media.next_sequence() {
                let resynced = media.start_sequence(live_sync);
                debug!(target: "ingest", cursor, resynced, "cursor outside playlist window");
                cursor = resynced;
            }

            let pending: Vec<SegmentRef> = media.segments_from(cursor).cloned().collect();
            let fetched_new = !pending.is_empty();
            let mut switched = false;
            for segment in pending {
                let wait = buffer.wait_for_room(Instant::now());
                if !wait.is_zero() {
                    sleep(wait).await;
                }

                let (data, elapsed) = self.fetch(&segment.uri).await?;
                abr.push_sample(ThroughputSample {
                    bytes: data.len() as u64,
                    elapsed,
                });
                cursor = segment.sequence + 1;
                if self.deliver(&segment, data)? {
                    let now = Instant::now();
                    buffer.push(segment.duration, now);
                    if !rendered {
                        rendered = true;
                        buffer.start_draining(now);
                        if !self.events.emit(IngestEvent::FrameRendered) {
                            return Ok(Outcome::Detached);
                        }
                    }
                }

                if let Some(next) = self.next_tier(&ladder, current, &mut abr) {
                    current = next;
                    self.announce_tier(&ladder, current);
                    switched = true;
                    break;
                }
            }

            if switched {
                media = self.load_media(&playlists[current.0]).await?;
                continue;
            }
            if media.end_list {
                continue;
            }

            let wait = if fetched_new {
                media.target_duration
            } else {
                media.target_duration / 2
            };
            tokio::select! {
                _ = sleep(wait) => {}
                changed = self.selection.changed() => {
                    if changed.is_err() {
                        return Ok(Outcome::Detached);
                    }
                }
            }
            if let Some(next) = self.next_tier(&ladder, current, &mut abr) {
                current = next;
                self.announce_tier(&ladder, current);
            }
            media = self.load_media(&playlists[current.0]).await?;
        }
    }

    /// Hands a segment to the sink. Rejections trigger media recovery and
    /// report `false`.
    fn deliver(&mut self, segment: &SegmentRef, data: Bytes) -> IngestResult<bool> {
        match self.sink.accept(segment.uri.as_str(), data) {
            Ok(format) => {
                self.media_failures = 0;
                debug!(target: "ingest", sequence = segment.sequence, ?format, "segment accepted");
                Ok(true)
            }
            Err(err) => {
                self.media_failures += 1;
                if self.media_failures > self.config.max_media_recoveries {
                    return Err(IngestError::MediaExhausted {
                        attempts: self.media_failures,
                        last: err.to_string(),
                    });
                }
                warn!(target: "ingest", attempt = self.media_failures, error = %err, "media error, recovering");
                self.events.emit(IngestEvent::MediaError {
                    attempt: self.media_failures,
                    detail: err.to_string(),
                });
                self.sink.recover();
                Ok(false)
            }
        }
    }

    fn next_tier(
        &mut self,
        ladder: &QualityLadder,
        current: TierIndex,
        abr: &mut AbrController,
    ) -> Option<TierIndex> {
        let now = Instant::now();
        let selection = *self.selection.borrow_and_update();
        let target = match selection {
            TierSelection::Tier(index) if ladder.contains(index) => {
                if index != current {
                    abr.note_switch(now);
                }
                index
            }
            TierSelection::Tier(index) => {
                debug!(target: "ingest", %index, "ignoring out of range tier");
                current
            }
            TierSelection::Auto => abr.decide(ladder, current, now).target,
        };
        (target != current).then_some(target)
    }

    fn announce_tier(&self, ladder: &QualityLadder, tier: TierIndex) {
        let label = ladder
            .get(tier)
            .map(|entry| entry.label.clone())
            .unwrap_or_default();
        info!(target: "ingest", %tier, %label, "tier selected");
        self.events.emit(IngestEvent::TierSwitched { tier, label });
    }

    async fn load_media(&mut self, url: &Url) -> IngestResult<MediaManifest> {
        let (body, _) = self.fetch(url).await?;
        parse_media(&body, url)
    }

    /// GET with network recovery: consecutive transport failures back off
    /// exponentially and give up past the configured limit.
    async fn fetch(&mut self, url: &Url) -> IngestResult<(Bytes, Duration)> {
        loop {
            match Self::fetch_once(&self.client, &self.source, url).await {
                Ok(fetched) => {
                    self.network_failures = 0;
                    return Ok(fetched);
                }
                Err(err) if err.class() == FailureClass::Network => {
                    self.network_failures += 1;
                    let attempt = self.network_failures;
                    if attempt > self.config.max_network_retries {
                        return Err(IngestError::NetworkExhausted {
                            attempts: attempt,
                            last: err.to_string(),
                        });
                    }
                    let delay = self.config.retry_delay(attempt);
                    warn!(target: "ingest", %url, attempt, ?delay, error = %err, "network error, retrying");
                    self.events.emit(IngestEvent::NetworkError {
                        attempt,
                        detail: err.to_string(),
                    });
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn fetch_once(
        client: &reqwest::Client,
        source: &StreamSource,
        url: &Url,
    ) -> IngestResult<(Bytes, Duration)> {
        let started = Instant::now();
        let response = client.get(source.request_url(url)).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await?;
        Ok((body, started.elapsed()))
    }
}
