use std::sync::Arc;
use std::time::Duration;

use clap::{ArgGroup, Args};
use globecast_core::{
    ChannelDirectory, HlsIngestionFactory, PlaybackController, PlaybackHandle, PlaybackOptions,
    PlaybackState, PlayerSnapshot,
};
use serde::Serialize;
use tracing::info;

use crate::{render, AppContext, AppError, DisplayFallback, OutputFormat, Result};

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("target").required(true).args(["url", "country"])))]
pub struct WatchArgs {
    /// Stream URL to play
    #[arg(long, conflicts_with_all = ["country", "channel"])]
    pub url: Option<String>,
    /// Country from the channel directory
    #[arg(long, requires = "channel")]
    pub country: Option<String>,
    /// Channel name inside --country
    #[arg(long, requires = "country")]
    pub channel: Option<String>,
    /// Quality to pin once the ladder is known (e.g. 720p, Auto)
    #[arg(long)]
    pub quality: Option<String>,
    /// Stop after this many seconds
    #[arg(long)]
    pub seconds: Option<u64>,
}

/// One printed line of player state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotLine {
    pub state: PlaybackState,
    pub source: Option<String>,
    pub quality: Option<String>,
    pub qualities: Vec<String>,
    pub error: Option<String>,
    pub network_recoveries: u32,
    pub media_recoveries: u32,
}

impl From<&PlayerSnapshot> for SnapshotLine {
    fn from(snapshot: &PlayerSnapshot) -> Self {
        Self {
            state: snapshot.state,
            source: snapshot.source.clone(),
            quality: snapshot.quality_label.clone(),
            qualities: snapshot.qualities.clone(),
            error: snapshot.error.clone(),
            network_recoveries: snapshot.network_recoveries,
            media_recoveries: snapshot.media_recoveries,
        }
    }
}

fn state_label(state: PlaybackState) -> &'static str {
    match state {
        PlaybackState::Idle => "idle",
        PlaybackState::Loading => "loading",
        PlaybackState::Playing => "playing",
        PlaybackState::Error => "error",
    }
}

impl DisplayFallback for SnapshotLine {
    fn display(&self) -> String {
        let mut line = state_label(self.state).to_string();
        if let Some(quality) = &self.quality {
            line.push_str(&format!(" quality={quality}"));
        }
        if !self.qualities.is_empty() {
            line.push_str(&format!(" menu=[{}]", self.qualities.join(", ")));
        }
        if self.network_recoveries + self.media_recoveries > 0 {
            line.push_str(&format!(
                " recoveries=net:{}/media:{}",
                self.network_recoveries, self.media_recoveries
            ));
        }
        if let Some(error) = &self.error {
            line.push_str(&format!(" error=\"{error}\""));
        }
        line
    }
}

impl AppContext {
    pub(crate) fn watch(&self, args: &WatchArgs, format: OutputFormat) -> Result<()> {
        let factory = HlsIngestionFactory::new(self.config.ingest.clone(), &self.config.proxy.user_agent)?;
        let directory: Option<Arc<dyn ChannelDirectory>> = match args.country {
            Some(_) => Some(Arc::new(self.directory()?)),
            None => None,
        };
        let options = PlaybackOptions::from_config(&self.config);
        let preferences = self.preference_store();

        crate::runtime()?.block_on(async move {
            let handle =
                PlaybackController::spawn(options, Arc::new(factory), preferences, directory);
            let outcome = follow(&handle, args, format).await;
            handle.shutdown().await;
            outcome
        })
    }
}

async fn follow(handle: &PlaybackHandle, args: &WatchArgs, format: OutputFormat) -> Result<()> {
    let mut snapshots = handle.subscribe();
    match (&args.url, &args.country, &args.channel) {
        (Some(url), _, _) => handle.play_url(url),
        (None, Some(country), Some(channel)) => handle.select_channel(country, channel).await,
        _ => return Err(AppError::MissingResource("--url or --country/--channel".into())),
    }

    let deadline = args.seconds.map(Duration::from_secs);
    let stop = async {
        match deadline {
            Some(after) => tokio::time::sleep(after).await,
            None => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    };
    tokio::pin!(stop);

    let mut pinned = args.quality.is_none();
    let mut last: Option<SnapshotLine> = None;
    loop {
        let snapshot = snapshots.borrow_and_update().clone();
        if !pinned && !snapshot.qualities.is_empty() {
            if let Some(label) = &args.quality {
                info!(target: "globecastctl", %label, "pinning quality");
                handle.select_quality(label);
            }
            pinned = true;
        }

        let line = SnapshotLine::from(&snapshot);
        if last.as_ref() != Some(&line) && line.state != PlaybackState::Idle {
            render(&line, format)?;
            last = Some(line);
        }
        if snapshot.state == PlaybackState::Error {
            let reason = snapshot.error.unwrap_or_else(|| "unknown error".to_string());
            return Err(AppError::Playback(reason));
        }

        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            _ = &mut stop => return Ok(()),
        }
    }
}
