// Engine state: everything guarded by the engine lock
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use crate::audio::PlayerFactory;
use crate::library::{Library, Song};
use crate::playback::{DriftCorrector, LivePlayer, RepeatMode, SessionManager, SessionTimers, TransportState};
use crate::settings::Config;

pub struct EngineState {
    pub config: Config,
    /// Where the config is saved after every change; `None` keeps it in memory
    pub settings_dir: Option<PathBuf>,
    pub library: Library,
    pub current_index: Option<usize>,
    pub sessions: SessionManager,
    pub drift: DriftCorrector,
    pub timers: SessionTimers,
    pub repeat: RepeatMode,
    pub shuffle: bool,
    /// Start playback once the load in flight installs its session
    pub play_after_load: bool,
}

impl EngineState {
    pub fn new(config: Config, settings_dir: Option<PathBuf>, factory: Arc<dyn PlayerFactory>) -> Self {
        let drift = drift_corrector(&config);
        Self {
            config,
            settings_dir,
            library: Library::default(),
            current_index: None,
            sessions: SessionManager::new(factory),
            drift,
            timers: SessionTimers::default(),
            repeat: RepeatMode::Off,
            shuffle: false,
            play_after_load: false,
        }
    }

    pub fn transport_state(&self) -> TransportState {
        self.sessions.state()
    }

    pub fn current_song(&self) -> Option<&Song> {
        self.sessions.current().map(|s| s.song())
    }

    /// Push config changes into everything derived from it
    pub fn config_changed(&mut self) {
        self.drift.reconfigure(
            self.config.drift,
            self.config.reference_policy,
            self.config.priority_label.clone(),
        );
    }

    /// Player whose clock progress and relative seeks follow
    pub fn reference_player(&self) -> Option<&LivePlayer> {
        let session = self.sessions.current()?;
        let index = self.drift.reference_index(&session.sample_positions())?;
        session.player(index)
    }

    /// Write the config to the settings directory. Failures are logged only;
    /// the in-memory config stays authoritative.
    pub fn persist(&self) {
        if let Some(dir) = &self.settings_dir {
            if let Err(e) = self.config.save(dir) {
                warn!("Failed to save settings: {}", e);
            }
        }
    }

    pub fn refresh_current_index(&mut self) {
        self.current_index = self
            .current_song()
            .and_then(|song| self.library.position(&song.grouping_key));
    }
}

fn drift_corrector(config: &Config) -> DriftCorrector {
    DriftCorrector::new(
        config.drift,
        config.reference_policy,
        config.priority_label.clone(),
    )
}
