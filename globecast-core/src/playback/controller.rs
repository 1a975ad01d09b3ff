use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::machine::{Effect, Input, PlaybackMachine, PlaybackState};
use super::preferences::{normalize_volume, PreferenceResult, PreferenceStore, Preferences};
use crate::config::{GlobecastConfig, RoutingSection};
use crate::directory::{resolve_channel, ChannelDirectory, StreamSource, STREAM_NOT_FOUND};
use crate::ingest::{
    IngestEventSender, Ingestion, IngestionFactory, QualityLadder, SessionEvent, SessionId,
    TierIndex, TierSelection,
};

/// Everything an observer needs to render the player.
#[derive(Debug, Clone, Serialize)]
pub struct PlayerSnapshot {
    pub state: PlaybackState,
    pub session: Option<SessionId>,
    pub source: Option<String>,
    #[serde(skip)]
    pub ladder: Arc<QualityLadder>,
    pub qualities: Vec<String>,
    pub requested_tier: TierSelection,
    pub active_tier: Option<TierIndex>,
    pub quality_label: Option<String>,
    pub error: Option<String>,
    pub volume: f64,
    pub muted: bool,
    pub paused: bool,
    pub network_recoveries: u32,
    pub media_recoveries: u32,
    pub changed_at: DateTime<Utc>,
}

impl PlayerSnapshot {
    fn capture(machine: &PlaybackMachine, prefs: Preferences, paused: bool) -> Self {
        Self {
            state: machine.state(),
            session: machine.live_session(),
            source: machine.source().map(|source| source.upstream().to_string()),
            ladder: Arc::clone(machine.ladder()),
            qualities: machine.ladder().menu_labels(),
            requested_tier: machine.requested_tier(),
            active_tier: machine.active_tier(),
            quality_label: machine.quality_label().map(str::to_string),
            error: machine.error().map(str::to_string),
            volume: prefs.volume,
            muted: prefs.muted,
            paused,
            network_recoveries: machine.network_recoveries(),
            media_recoveries: machine.media_recoveries(),
            changed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlaybackOptions {
    pub offline_timeout: Duration,
    pub routing: RoutingSection,
    pub proxy_route: String,
}

impl PlaybackOptions {
    pub fn from_config(config: &GlobecastConfig) -> Self {
        Self {
            offline_timeout: config.playback.offline_timeout(),
            routing: config.routing.clone(),
            proxy_route: config.proxy.route.clone(),
        }
    }
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self::from_config(&GlobecastConfig::default())
    }
}

#[derive(Debug)]
enum Command {
    SetSource(Result<StreamSource, String>),
    Retry,
    SelectTier(TierSelection),
    SetVolume(f64),
    ToggleMute,
    TogglePause,
    Shutdown(oneshot::Sender<()>),
}

struct Resolver {
    routing: RoutingSection,
    proxy_route: String,
    directory: Option<Arc<dyn ChannelDirectory>>,
}

/// Cloneable command surface of a running controller. Commands never fail;
/// problems show up as an `Error` state on the snapshot.
#[derive(Clone)]
pub struct PlaybackHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<PlayerSnapshot>,
    resolver: Arc<Resolver>,
}

impl PlaybackHandle {
    /// Looks the channel up in the directory and plays it.
    pub async fn select_channel(&self, country: &str, channel: &str) {
        let resolved = match &self.resolver.directory {
            Some(directory) => resolve_channel(
                directory.as_ref(),
                country,
                channel,
                &self.resolver.routing,
                &self.resolver.proxy_route,
            )
            .await
            .map_err(|err| err.to_string()),
            None => Err(STREAM_NOT_FOUND.to_string()),
        };
        self.send(Command::SetSource(resolved));
    }

    /// Plays an untrusted stream URL after validating its scheme.
    pub fn play_url(&self, raw: &str) {
        let resolved = StreamSource::resolve(raw, &self.resolver.routing, &self.resolver.proxy_route)
            .map_err(|err| err.to_string());
        self.send(Command::SetSource(resolved));
    }

    pub fn play_source(&self, source: StreamSource) {
        self.send(Command::SetSource(Ok(source)));
    }

    pub fn retry(&self) {
        self.send(Command::Retry);
    }

    pub fn select_tier(&self, selection: TierSelection) {
        self.send(Command::SelectTier(selection));
    }

    /// Selects a tier by its menu label (`Auto`, `720p`, ...). Unknown labels are ignored.
    pub fn select_quality(&self, label: &str) {
        let selection = self.snapshots.borrow().ladder.selection_for(label);
        match selection {
            Some(selection) => self.select_tier(selection),
            None => debug!(target: "playback", label, "unknown quality label"),
        }
    }

    pub fn set_volume(&self, volume: f64) {
        self.send(Command::SetVolume(volume));
    }

    pub fn toggle_mute(&self) {
        self.send(Command::ToggleMute);
    }

    pub fn toggle_pause(&self) {
        self.send(Command::TogglePause);
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlayerSnapshot> {
        self.snapshots.clone()
    }

    /// Disposes the live ingestion and stops the controller. Returns once
    /// teardown has completed; later calls return immediately.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!(target: "playback", "controller already shut down");
        }
    }
}

/// Single-writer driver around [`PlaybackMachine`]: user commands, ingestion
/// events and the offline deadline are all serialized through one task.
pub struct PlaybackController {
    machine: PlaybackMachine,
    factory: Arc<dyn IngestionFactory>,
    preferences: Arc<dyn PreferenceStore>,
    prefs: Preferences,
    paused: bool,
    offline_timeout: Duration,
    ingestion: Option<(SessionId, Box<dyn Ingestion>)>,
    deadline: Option<(SessionId, Instant)>,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    snapshots: watch::Sender<PlayerSnapshot>,
}

impl PlaybackController {
    pub fn spawn(
        options: PlaybackOptions,
        factory: Arc<dyn IngestionFactory>,
        preferences: Arc<dyn PreferenceStore>,
        directory: Option<Arc<dyn ChannelDirectory>>,
    ) -> PlaybackHandle {
        let prefs = preferences.load().unwrap_or_else(|err| {
            warn!(target: "playback", error = %err, "failed to load preferences, using defaults");
            Preferences::default()
        });
        let machine = PlaybackMachine::new();
        let (snapshots, snapshot_rx) = watch::channel(PlayerSnapshot::capture(&machine, prefs, false));
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let controller = Self {
            machine,
            factory,
            preferences,
            prefs,
            paused: false,
            offline_timeout: options.offline_timeout,
            ingestion: None,
            deadline: None,
            commands,
            events_tx,
            events_rx,
            snapshots,
        };
        tokio::spawn(controller.run());

        PlaybackHandle {
            commands: commands_tx,
            snapshots: snapshot_rx,
            resolver: Arc::new(Resolver {
                routing: options.routing,
                proxy_route: options.proxy_route,
                directory,
            }),
        }
    }

    async fn run(mut self) {
        info!(target: "playback", "playback controller started");
        loop {
            let timer = self.deadline;
            let wake = timer.map_or_else(Instant::now, |(_, at)| at);
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown(done)) => {
                        self.teardown().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.on_command(command).await,
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
                Some(SessionEvent { session, event }) = self.events_rx.recv() => {
                    self.apply(Input::Ingest(session, event)).await;
                }
                _ = sleep_until(wake), if timer.is_some() => {
                    if let Some((session, _)) = timer {
                        self.deadline = None;
                        debug!(target: "playback", %session, "offline deadline reached");
                        self.apply(Input::OfflineTimerExpired(session)).await;
                    }
                }
            }
            self.publish();
        }
        self.publish();
        info!(target: "playback", "playback controller stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::SetSource(Ok(source)) => self.apply(Input::SourceSet(source)).await,
            Command::SetSource(Err(reason)) => {
                warn!(target: "playback", %reason, "rejected stream source");
                self.apply(Input::SourceRejected(reason)).await;
            }
            Command::Retry => self.apply(Input::Retry).await,
            Command::SelectTier(selection) => self.apply(Input::SelectTier(selection)).await,
            Command::SetVolume(volume) => {
                let Some(volume) = normalize_volume(volume) else {
                    debug!(target: "playback", volume, "ignoring non-finite volume");
                    return;
                };
                self.prefs.volume = volume;
                self.prefs.muted = volume == 0.0;
                self.persist(|store, prefs| {
                    store.save_volume(prefs.volume)?;
                    store.save_muted(prefs.muted)
                });
            }
            Command::ToggleMute => {
                self.prefs.muted = !self.prefs.muted;
                self.persist(|store, prefs| store.save_muted(prefs.muted));
            }
            Command::TogglePause => self.paused = !self.paused,
            Command::Shutdown(_) => {}
        }
    }

    fn persist<F>(&self, write: F)
    where
        F: FnOnce(&dyn PreferenceStore, Preferences) -> PreferenceResult<()>,
    {
        if let Err(err) = write(self.preferences.as_ref(), self.prefs) {
            warn!(target: "playback", error = %err, "failed to persist preferences");
        }
    }

    async fn apply(&mut self, input: Input) {
        let effects = self.machine.handle(input);
        self.execute(effects).await;
    }

    async fn teardown(&mut self) {
        let effects = self.machine.dispose();
        self.execute(effects).await;
    }

    async fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::DisposeIngestion(session) => {
                    if self.ingestion.as_ref().is_some_and(|(live, _)| *live == session) {
                        if let Some((_, mut ingestion)) = self.ingestion.take() {
                            ingestion.dispose().await;
                        }
                    }
                }
                Effect::StartIngestion { session, source } => {
                    if let Some((stale, mut ingestion)) = self.ingestion.take() {
                        warn!(target: "playback", %stale, "disposing leftover ingestion");
                        ingestion.dispose().await;
                    }
                    info!(target: "playback", %session, %source, "starting session");
                    let events = IngestEventSender::new(session, self.events_tx.clone());
                    let ingestion = self.factory.start(source, events);
                    self.ingestion = Some((session, ingestion));
                }
                Effect::ArmOfflineTimer(session) => {
                    self.deadline = Some((session, Instant::now() + self.offline_timeout));
                }
                Effect::CancelOfflineTimer => self.deadline = None,
                Effect::ApplyTier { session, selection } => {
                    if let Some((live, ingestion)) = self.ingestion.as_mut() {
                        if *live == session {
                            ingestion.select_tier(selection);
                        }
                    }
                }
            }
        }
    }

    fn publish(&self) {
        let snapshot = PlayerSnapshot::capture(&self.machine, self.prefs, self.paused);
        self.snapshots.send_replace(snapshot);
    }
}
