//! Playback lifecycle as a pure transition function. The machine never
//! performs I/O; it returns the effects its driver must execute, in order.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::directory::StreamSource;
use crate::ingest::{IngestEvent, QualityLadder, SessionId, TierIndex, TierSelection};

pub const OFFLINE_REASON: &str = "Stream Offline";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Idle,
    Loading,
    Playing,
    Error,
}

impl PlaybackState {
    pub fn is_active(self) -> bool {
        matches!(self, PlaybackState::Loading | PlaybackState::Playing)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    SourceSet(StreamSource),
    SourceRejected(String),
    Ingest(SessionId, IngestEvent),
    OfflineTimerExpired(SessionId),
    Retry,
    SelectTier(TierSelection),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    DisposeIngestion(SessionId),
    StartIngestion {
        session: SessionId,
        source: StreamSource,
    },
    ArmOfflineTimer(SessionId),
    CancelOfflineTimer,
    ApplyTier {
        session: SessionId,
        selection: TierSelection,
    },
}

#[derive(Debug, Clone)]
pub struct PlaybackMachine {
    state: PlaybackState,
    source: Option<StreamSource>,
    live_session: Option<SessionId>,
    timer_session: Option<SessionId>,
    generation: u64,
    ladder: Arc<QualityLadder>,
    requested: TierSelection,
    active: Option<TierIndex>,
    quality_label: Option<String>,
    error: Option<String>,
    network_recoveries: u32,
    media_recoveries: u32,
}

impl Default for PlaybackMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackMachine {
    pub fn new() -> Self {
        Self {
            state: PlaybackState::Idle,
            source: None,
            live_session: None,
            timer_session: None,
            generation: 0,
            ladder: Arc::new(QualityLadder::default()),
            requested: TierSelection::Auto,
            active: None,
            quality_label: None,
            error: None,
            network_recoveries: 0,
            media_recoveries: 0,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn source(&self) -> Option<&StreamSource> {
        self.source.as_ref()
    }

    pub fn live_session(&self) -> Option<SessionId> {
        self.live_session
    }

    pub fn ladder(&self) -> &Arc<QualityLadder> {
        &self.ladder
    }

    pub fn requested_tier(&self) -> TierSelection {
        self.requested
    }

    pub fn active_tier(&self) -> Option<TierIndex> {
        self.active
    }

    pub fn quality_label(&self) -> Option<&str> {
        self.quality_label.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn network_recoveries(&self) -> u32 {
        self.network_recoveries
    }

    pub fn media_recoveries(&self) -> u32 {
        self.media_recoveries
    }

    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        let mut effects = Vec::new();
        match input {
            Input::SourceSet(source) => {
                self.teardown(&mut effects);
                self.begin(source, &mut effects);
            }
            Input::SourceRejected(reason) => {
                self.teardown(&mut effects);
                self.source = None;
                self.fail(reason);
            }
            Input::Ingest(session, event) => {
                if self.live_session != Some(session) {
                    debug!(target: "playback", %session, ?event, "dropping stale ingestion event");
                    return effects;
                }
                self.on_ingest(event, &mut effects);
            }
            Input::OfflineTimerExpired(session) => {
                if self.timer_session != Some(session) || self.state != PlaybackState::Loading {
                    return effects;
                }
                self.timer_session = None;
                if let Some(live) = self.live_session.take() {
                    effects.push(Effect::DisposeIngestion(live));
                }
                self.fail(OFFLINE_REASON.to_string());
            }
            Input::Retry => {
                if self.state != PlaybackState::Error {
                    return effects;
                }
                if let Some(source) = self.source.clone() {
                    self.teardown(&mut effects);
                    self.begin(source, &mut effects);
                }
            }
            Input::SelectTier(selection) => {
                let Some(session) = self.live_session else {
                    return effects;
                };
                if !self.state.is_active() {
                    return effects;
                }
                if let TierSelection::Tier(index) = selection {
                    if !self.ladder.contains(index) {
                        debug!(target: "playback", %index, "tier not in ladder");
                        return effects;
                    }
                }
                self.requested = selection;
                effects.push(Effect::ApplyTier { session, selection });
            }
        }
        effects
    }

    /// Tears down the live session, if any. Used for unmount as well as channel changes.
    pub fn dispose(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.teardown(&mut effects);
        effects
    }

    fn on_ingest(&mut self, event: IngestEvent, effects: &mut Vec<Effect>) {
        match event {
            IngestEvent::LadderReady { ladder } => {
                self.ladder = ladder;
                self.requested = TierSelection::Auto;
            }
            IngestEvent::TierSwitched { tier, label } => {
                self.active = Some(tier);
                self.quality_label = Some(label);
            }
            IngestEvent::NetworkError { .. } => self.network_recoveries += 1,
            IngestEvent::MediaError { .. } => self.media_recoveries += 1,
            IngestEvent::Fatal { reason } => {
                if self.state.is_active() {
                    self.teardown(effects);
                    self.fail(reason);
                }
            }
            IngestEvent::FrameRendered => {
                if self.state == PlaybackState::Loading {
                    self.transition(PlaybackState::Playing);
                    if self.timer_session.take().is_some() {
                        effects.push(Effect::CancelOfflineTimer);
                    }
                }
            }
            IngestEvent::Ended => {
                debug!(target: "playback", session = ?self.live_session, "ingestion reached end of stream");
            }
        }
    }

    fn begin(&mut self, source: StreamSource, effects: &mut Vec<Effect>) {
        self.generation += 1;
        let session = SessionId(self.generation);
        self.live_session = Some(session);
        self.timer_session = Some(session);
        self.source = Some(source.clone());
        self.ladder = Arc::new(QualityLadder::default());
        self.requested = TierSelection::Auto;
        self.active = None;
        self.quality_label = None;
        self.error = None;
        self.network_recoveries = 0;
        self.media_recoveries = 0;
        self.transition(PlaybackState::Loading);
        effects.push(Effect::StartIngestion { session, source });
        effects.push(Effect::ArmOfflineTimer(session));
    }

    fn teardown(&mut self, effects: &mut Vec<Effect>) {
        if let Some(session) = self.live_session.take() {
            effects.push(Effect::DisposeIngestion(session));
        }
        if self.timer_session.take().is_some() {
            effects.push(Effect::CancelOfflineTimer);
        }
    }

    fn fail(&mut self, reason: String) {
        self.error = Some(reason);
        self.transition(PlaybackState::Error);
    }

    fn transition(&mut self, next: PlaybackState) {
        if self.state != next {
            info!(
                target: "playback",
                from = ?self.state,
                to = ?next,
                session = ?self.live_session,
                "playback transition"
            );
            self.state = next;
        }
    }
}
