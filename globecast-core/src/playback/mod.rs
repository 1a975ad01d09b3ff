//! Playback lifecycle: the pure state machine, its async driver and the
//! persisted viewer preferences.

pub mod controller;
pub mod machine;
pub mod preferences;

pub use controller::{PlaybackController, PlaybackHandle, PlaybackOptions, PlayerSnapshot};
pub use machine::{Effect, Input, PlaybackMachine, PlaybackState, OFFLINE_REASON};
pub use preferences::{
    normalize_volume, MemoryPreferenceStore, PreferenceError, PreferenceResult, PreferenceStore,
    Preferences, SqlitePreferenceStore, MUTED_KEY, VOLUME_KEY,
};
