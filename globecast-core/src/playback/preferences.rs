use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;

pub const VOLUME_KEY: &str = "player-volume";
pub const MUTED_KEY: &str = "player-muted";

const PREFERENCES_PRAGMAS: &str = "PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;";

const PREFERENCES_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS preferences (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);";

#[derive(Debug, Error)]
pub enum PreferenceError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("preference store lock poisoned")]
    Poisoned,
}

pub type PreferenceResult<T> = std::result::Result<T, PreferenceError>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Preferences {
    pub volume: f64,
    pub muted: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            volume: 1.0,
            muted: false,
        }
    }
}

/// Clamps a requested volume into `[0, 1]`; non-finite input is rejected.
pub fn normalize_volume(volume: f64) -> Option<f64> {
    volume.is_finite().then(|| volume.clamp(0.0, 1.0))
}

/// Last-written volume and mute values, keyed independently.
pub trait PreferenceStore: Send + Sync {
    fn load(&self) -> PreferenceResult<Preferences>;
    fn save_volume(&self, volume: f64) -> PreferenceResult<()>;
    fn save_muted(&self, muted: bool) -> PreferenceResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryPreferenceStore {
    inner: Mutex<Preferences>,
}

impl MemoryPreferenceStore {
    pub fn new(initial: Preferences) -> Self {
        Self {
            inner: Mutex::new(initial),
        }
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn load(&self) -> PreferenceResult<Preferences> {
        self.inner
            .lock()
            .map(|prefs| *prefs)
            .map_err(|_| PreferenceError::Poisoned)
    }

    fn save_volume(&self, volume: f64) -> PreferenceResult<()> {
        let mut prefs = self.inner.lock().map_err(|_| PreferenceError::Poisoned)?;
        if let Some(volume) = normalize_volume(volume) {
            prefs.volume = volume;
        }
        Ok(())
    }

    fn save_muted(&self, muted: bool) -> PreferenceResult<()> {
        let mut prefs = self.inner.lock().map_err(|_| PreferenceError::Poisoned)?;
        prefs.muted = muted;
        Ok(())
    }
}

#[derive(Debug)]
pub struct SqlitePreferenceStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqlitePreferenceStore {
    pub fn open(path: impl AsRef<Path>) -> PreferenceResult<Self> {
        let path = path.as_ref().to_path_buf();
        let open_error = |source| PreferenceError::OpenDatabase {
            path: path.clone(),
            source,
        };
        let conn = Connection::open(&path).map_err(open_error)?;
        conn.execute_batch(PREFERENCES_PRAGMAS)
            .map_err(open_error)?;
        conn.execute_batch(PREFERENCES_SCHEMA)?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self, key: &str) -> PreferenceResult<Option<String>> {
        let conn = self.conn.lock().map_err(|_| PreferenceError::Poisoned)?;
        let value = conn
            .query_row(
                "SELECT value FROM preferences WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn write(&self, key: &str, value: String) -> PreferenceResult<()> {
        let conn = self.conn.lock().map_err(|_| PreferenceError::Poisoned)?;
        conn.execute(
            "INSERT INTO preferences (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

impl PreferenceStore for SqlitePreferenceStore {
    fn load(&self) -> PreferenceResult<Preferences> {
        let defaults = Preferences::default();
        let volume = self
            .read(VOLUME_KEY)?
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .and_then(normalize_volume)
            .unwrap_or(defaults.volume);
        let muted = self
            .read(MUTED_KEY)?
            .and_then(|raw| raw.trim().parse::<bool>().ok())
            .unwrap_or(defaults.muted);
        Ok(Preferences { volume, muted })
    }

    fn save_volume(&self, volume: f64) -> PreferenceResult<()> {
        match normalize_volume(volume) {
            Some(volume) => self.write(VOLUME_KEY, volume.to_string()),
            None => Ok(()),
        }
    }

    fn save_muted(&self, muted: bool) -> PreferenceResult<()> {
        self.write(MUTED_KEY, muted.to_string())
    }
}
