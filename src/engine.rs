// The engine handle the rendering layer talks to
use parking_lot::{Mutex, MutexGuard};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::audio::PlayerFactory;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::library::grouping::StemGrouper;
use crate::library::{scan_directory, Library, RawFile, Song};
use crate::playback::transport::{self, EndAction};
use crate::playback::volume::apply_saved_volumes;
use crate::playback::{
    open_players, DriftVerdict, LivePlayer, LoadReport, PeriodicTask, RepeatMode, SessionToken,
    TaskControl, TransportState, VolumeChange, VolumeStore,
};
use crate::settings::{Config, FilenameRule, ReferencePolicy};
use crate::state::EngineState;

struct Shared {
    state: Mutex<EngineState>,
    events: EventBus,
}

/// Cheap to clone; every clone drives the same engine.
///
/// Playback starts background timers with `tokio::spawn`, so `play` and
/// anything that resumes playback must be called inside a tokio runtime.
#[derive(Clone)]
pub struct StemEngine {
    shared: Arc<Shared>,
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

impl StemEngine {
    /// Engine with an in-memory config that is never written to disk
    pub fn new(config: Config, factory: Arc<dyn PlayerFactory>) -> Self {
        Self::build(config, None, factory)
    }

    /// Engine whose config lives in `dir` and is saved after every change
    pub fn with_settings_dir(dir: impl Into<PathBuf>, factory: Arc<dyn PlayerFactory>) -> Result<Self> {
        let dir = dir.into();
        let config = Config::load(&dir)?;
        Ok(Self::build(config, Some(dir), factory))
    }

    fn build(config: Config, settings_dir: Option<PathBuf>, factory: Arc<dyn PlayerFactory>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(EngineState::new(config, settings_dir, factory)),
                events: EventBus::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.shared.state.lock()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    // ===== Queries =====

    pub fn config(&self) -> Config {
        self.lock().config.clone()
    }

    pub fn library(&self) -> Library {
        self.lock().library.clone()
    }

    pub fn current_song(&self) -> Option<Song> {
        self.lock().current_song().cloned()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.lock().current_index
    }

    pub fn transport_state(&self) -> TransportState {
        self.lock().transport_state()
    }

    pub fn is_playing(&self) -> bool {
        self.transport_state() == TransportState::Playing
    }

    pub fn repeat_mode(&self) -> RepeatMode {
        self.lock().repeat
    }

    pub fn is_shuffle(&self) -> bool {
        self.lock().shuffle
    }

    /// Current position of every live stem, in song order
    pub fn positions(&self) -> Vec<u64> {
        self.lock()
            .sessions
            .current()
            .map(|s| s.positions())
            .unwrap_or_default()
    }

    /// (position, duration) of the reference stem
    pub fn progress(&self) -> Option<(u64, u64)> {
        let state = self.lock();
        let reference = state.reference_player()?;
        Some((reference.player.position_ms(), reference.player.duration_ms()))
    }

    // ===== Library =====

    /// Regroup the library from a fresh set of files. Stems already known
    /// keep their volume; the saved playlist order is applied and then
    /// replaced by the resulting order, so exports always carry it.
    pub fn scan_files(&self, files: &[RawFile]) -> Library {
        let mut guard = self.lock();
        let state = &mut *guard;

        let mut library = StemGrouper::new(&state.config.filename_rules, state.config.default_volume)
            .with_saved_volumes(&state.config.volume_settings)
            .group(files, Some(&state.library));
        library.apply_order(&state.config.playlist_order);

        let mut order = library.grouping_keys();
        let absent: Vec<String> = state
            .config
            .playlist_order
            .iter()
            .filter(|key| library.position(key).is_none())
            .cloned()
            .collect();
        order.extend(absent);

        state.library = library;
        state.refresh_current_index();
        if state.config.playlist_order != order {
            state.config.playlist_order = order;
            state.persist();
        }
        info!("Library holds {} songs", state.library.len());
        state.library.clone()
    }

    pub fn scan_folder<P: AsRef<Path>>(&self, directory: P) -> anyhow::Result<Library> {
        let files = scan_directory(directory)?;
        Ok(self.scan_files(&files))
    }

    // ===== Session =====

    pub fn load_song(&self, song: &Song) -> Result<()> {
        self.load_with(song, false)
    }

    pub fn load_index(&self, index: usize) -> Result<()> {
        let song = {
            let state = self.lock();
            state
                .library
                .get(index)
                .cloned()
                .ok_or(EngineError::SongIndexOutOfRange {
                    index,
                    len: state.library.len(),
                })?
        };
        self.load_with(&song, false)
    }

    /// Players are opened with the engine unlocked; a load started meanwhile
    /// wins and this one comes back as `LoadSuperseded`.
    fn load_with(&self, song: &Song, autoplay: bool) -> Result<()> {
        let (token, factory) = self.shared.begin_load(&mut self.lock(), autoplay);

        let mut report = LoadReport::default();
        let players = open_players(factory.as_ref(), song, &mut report);

        let mut guard = self.lock();
        self.shared.finish_load(&mut guard, token, song, players, report)
    }

    pub fn play(&self) -> Result<()> {
        let mut guard = self.lock();
        self.shared.play_locked(&mut guard)
    }

    pub fn pause(&self) {
        let mut guard = self.lock();
        self.shared.pause_locked(&mut guard);
    }

    pub fn toggle_play(&self) -> Result<()> {
        let mut guard = self.lock();
        if guard.transport_state() == TransportState::Playing {
            self.shared.pause_locked(&mut guard);
            Ok(())
        } else {
            self.shared.play_locked(&mut guard)
        }
    }

    /// Release every player and go back to idle
    pub fn stop(&self) {
        let mut guard = self.lock();
        self.shared.pause_locked(&mut guard);
        guard.sessions.teardown();
    }

    /// Seek all stems to a fraction of the reference stem's length
    pub fn seek(&self, fraction: f64) -> Result<()> {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };

        let mut guard = self.lock();
        let state = &mut *guard;
        let duration_ms = state
            .reference_player()
            .map(|p| p.player.duration_ms())
            .unwrap_or(0);
        let session = state.sessions.current_mut().ok_or(EngineError::NoSongLoaded)?;

        let position_ms = (fraction * duration_ms as f64).round() as u64;
        for failure in session.set_all_positions(position_ms) {
            warn!("{}", failure);
        }

        self.shared.events.emit(EngineEvent::Progress {
            position_ms,
            duration_ms,
        });
        Ok(())
    }

    /// Move every stem by `seconds` (negative goes back), each clamped to its own length
    pub fn skip(&self, seconds: f64) -> Result<()> {
        let delta_ms = if seconds.is_finite() {
            (seconds * 1000.0).round() as i64
        } else {
            0
        };

        let mut guard = self.lock();
        let state = &mut *guard;
        let session = state.sessions.current_mut().ok_or(EngineError::NoSongLoaded)?;

        for failure in session.skip_by(delta_ms) {
            warn!("{}", failure);
        }
        if let Some(reference) = state.reference_player() {
            self.shared.events.emit(EngineEvent::Progress {
                position_ms: reference.player.position_ms(),
                duration_ms: reference.player.duration_ms(),
            });
        }
        Ok(())
    }

    pub fn skip_forward(&self) -> Result<()> {
        let seconds = self.lock().config.skip_seconds;
        self.skip(seconds)
    }

    pub fn skip_backward(&self) -> Result<()> {
        let seconds = self.lock().config.skip_seconds;
        self.skip(-seconds)
    }

    pub fn next(&self) -> Result<()> {
        let target = {
            let state = self.lock();
            let index = transport::next_index(
                state.current_index,
                state.library.len(),
                state.shuffle,
                &mut rand::thread_rng(),
            );
            Self::target(&state, index)
        };
        self.switch_to(target)
    }

    pub fn previous(&self) -> Result<()> {
        let target = {
            let state = self.lock();
            let index = transport::previous_index(
                state.current_index,
                state.library.len(),
                state.shuffle,
                &mut rand::thread_rng(),
            );
            Self::target(&state, index)
        };
        self.switch_to(target)
    }

    /// The song at `index` and whether playback should carry on into it
    fn target(state: &EngineState, index: Option<usize>) -> Option<(Song, bool)> {
        let song = index.and_then(|i| state.library.get(i)).cloned()?;
        Some((song, state.transport_state() == TransportState::Playing))
    }

    fn switch_to(&self, target: Option<(Song, bool)>) -> Result<()> {
        match target {
            Some((song, was_playing)) => self.load_with(&song, was_playing),
            None => Ok(()),
        }
    }

    // ===== Volume =====

    /// Set a stem's volume (0-100, clamped). Changing the volume unmutes.
    pub fn set_volume(&self, grouping_key: &str, label: &str, volume: i32) -> Result<()> {
        self.change_volume(|store| store.set_volume(grouping_key, label, volume))
    }

    pub fn toggle_mute(&self, grouping_key: &str, label: &str) -> Result<()> {
        self.change_volume(|store| store.toggle_mute(grouping_key, label))
    }

    fn change_volume<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut VolumeStore<'_>) -> Result<VolumeChange>,
    {
        let mut guard = self.lock();
        let state = &mut *guard;

        let mut store = VolumeStore::new(
            &mut state.config,
            &mut state.library,
            state.sessions.current_mut(),
        );
        let change = change(&mut store)?;
        state.persist();

        debug!(
            "Stem '{}' of '{}' now at {} (muted: {})",
            change.label, change.grouping_key, change.volume, change.muted
        );
        self.shared.events.emit(EngineEvent::StemVolumeChanged {
            label: change.label,
            volume: change.volume,
            muted: change.muted,
        });
        Ok(())
    }

    // ===== Repeat and shuffle =====

    pub fn set_repeat_mode(&self, mode: RepeatMode) {
        self.lock().repeat = mode;
    }

    pub fn cycle_repeat_mode(&self) -> RepeatMode {
        let mut state = self.lock();
        state.repeat = state.repeat.cycle();
        state.repeat
    }

    pub fn set_shuffle(&self, enabled: bool) {
        self.lock().shuffle = enabled;
    }

    pub fn toggle_shuffle(&self) -> bool {
        let mut state = self.lock();
        state.shuffle = !state.shuffle;
        state.shuffle
    }

    // ===== Playlist order =====

    pub fn move_song(&self, from: usize, to: usize) -> bool {
        self.reorder(|library| library.move_song(from, to))
    }

    pub fn sort_library(&self, ascending: bool) {
        self.reorder(|library| {
            library.sort_by_name(ascending);
            true
        });
    }

    pub fn shuffle_library(&self) {
        self.reorder(|library| {
            library.shuffle(&mut rand::thread_rng());
            true
        });
    }

    fn reorder<F>(&self, reorder: F) -> bool
    where
        F: FnOnce(&mut Library) -> bool,
    {
        let mut state = self.lock();
        if !reorder(&mut state.library) {
            return false;
        }
        state.config.playlist_order = state.library.grouping_keys();
        state.refresh_current_index();
        state.persist();
        true
    }

    // ===== Config =====

    pub fn export_config<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let state = self.lock();
        state.config.export_to(path.as_ref())?;
        info!("Exported settings to {:?}", path.as_ref());
        Ok(())
    }

    /// Replace the config with one read from `path` and apply it to the
    /// library and the live session
    pub fn import_config<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let config = Config::import_from(path.as_ref())?;

        let mut guard = self.lock();
        let state = &mut *guard;
        state.config = config;
        state.config_changed();

        apply_saved_volumes(&mut state.library, &state.config.volume_settings);
        state.library.apply_order(&state.config.playlist_order);
        state.refresh_current_index();

        if let Some(session) = state.sessions.current_mut() {
            if let Some(stems) = state.config.volume_settings.get(&session.song().grouping_key) {
                for (label, setting) in stems {
                    session.apply_stem_volume(label, setting.volume, setting.muted);
                }
            }
        }

        state.persist();
        info!("Imported settings from {:?}", path.as_ref());
        Ok(())
    }

    pub fn reset_config(&self) {
        let mut state = self.lock();
        state.config = Config::default();
        state.config_changed();
        state.persist();
        info!("Settings reset to defaults");
    }

    pub fn set_skip_seconds(&self, seconds: f64) -> Result<()> {
        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(EngineError::Config(format!(
                "skip seconds must be positive, got {}",
                seconds
            )));
        }
        self.update_config(|config| config.skip_seconds = seconds);
        Ok(())
    }

    /// New rules apply from the next scan
    pub fn set_filename_rules(&self, rules: Vec<FilenameRule>) {
        self.update_config(|config| config.filename_rules = rules);
    }

    pub fn set_priority_label(&self, label: Option<String>) {
        self.update_config(|config| config.priority_label = label);
    }

    pub fn set_reference_policy(&self, policy: ReferencePolicy) {
        self.update_config(|config| config.reference_policy = policy);
    }

    fn update_config<F: FnOnce(&mut Config)>(&self, update: F) {
        let mut state = self.lock();
        update(&mut state.config);
        state.config_changed();
        state.persist();
    }
}

impl Shared {
    /// Tear down the current session and reserve a token for the next one.
    /// The caller opens the players without holding the lock.
    fn begin_load(
        &self,
        state: &mut EngineState,
        autoplay: bool,
    ) -> (SessionToken, Arc<dyn PlayerFactory>) {
        let was_playing = state.transport_state() == TransportState::Playing;
        state.timers.cancel_all();
        let token = state.sessions.begin_load();
        state.play_after_load = autoplay;
        if was_playing {
            self.events.emit(EngineEvent::PlayStateChanged { is_playing: false });
        }
        (token, state.sessions.factory())
    }

    /// Install players opened for `token`, unless a newer load or a stop
    /// got there first
    fn finish_load(
        self: &Arc<Self>,
        state: &mut EngineState,
        token: SessionToken,
        song: &Song,
        players: Vec<LivePlayer>,
        report: LoadReport,
    ) -> Result<()> {
        let pending = state.sessions.is_pending(token);
        let autoplay = pending && std::mem::take(&mut state.play_after_load);
        if pending {
            for path in report.unavailable {
                self.events.emit(EngineEvent::SourceUnavailable { path });
            }
            state.current_index = state.library.position(&song.grouping_key);
        }
        state.sessions.install(token, song, players)?;

        state.drift.reset();
        self.events.emit(EngineEvent::SongLoaded { song: song.clone() });
        if autoplay {
            self.play_locked(state)?;
        }
        Ok(())
    }

    /// Open the players for `token` on the blocking pool, then install them
    fn load_in_background(
        self: &Arc<Self>,
        token: SessionToken,
        factory: Arc<dyn PlayerFactory>,
        song: Song,
    ) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let opening = song.clone();
            let opened = tokio::task::spawn_blocking(move || {
                let mut report = LoadReport::default();
                let players = open_players(factory.as_ref(), &opening, &mut report);
                (players, report)
            })
            .await;

            let Some(shared) = weak.upgrade() else {
                return;
            };
            let mut guard = shared.state.lock();
            let state = &mut *guard;
            match opened {
                Ok((players, report)) => match shared.finish_load(state, token, &song, players, report) {
                    Ok(()) => {}
                    Err(EngineError::LoadSuperseded { grouping_key }) => {
                        debug!("Dropped stale load of '{}'", grouping_key);
                    }
                    Err(e) => warn!("Could not continue playback: {}", e),
                },
                Err(e) => {
                    warn!("Opening '{}' failed: {}", song.grouping_key, e);
                    if state.sessions.is_pending(token) {
                        state.sessions.teardown();
                        state.play_after_load = false;
                    }
                }
            }
        });
    }

    fn play_locked(self: &Arc<Self>, state: &mut EngineState) -> Result<()> {
        if state.transport_state() == TransportState::Playing {
            return Ok(());
        }

        if let Err(e) = state.sessions.play() {
            match &e {
                EngineError::PlaybackBlocked => self.events.emit(EngineEvent::PlaybackBlocked),
                EngineError::SourceUnavailable { path } => {
                    self.events.emit(EngineEvent::SourceUnavailable { path: path.clone() })
                }
                _ => {}
            }
            return Err(e);
        }

        if let Some(token) = state.sessions.token() {
            self.start_timers(state, token);
        }
        self.events.emit(EngineEvent::PlayStateChanged { is_playing: true });
        Ok(())
    }

    fn pause_locked(&self, state: &mut EngineState) {
        state.timers.cancel_all();
        state.play_after_load = false;
        if state.sessions.pause() {
            self.events.emit(EngineEvent::PlayStateChanged { is_playing: false });
        }
    }

    fn start_timers(self: &Arc<Self>, state: &mut EngineState, token: SessionToken) {
        let drift = *state.drift.settings();

        let weak = Arc::downgrade(self);
        state.timers.drift = Some(PeriodicTask::spawn(
            token,
            millis(drift.initial_delay_ms),
            Some(millis(drift.interval_ms.max(1))),
            move || match weak.upgrade() {
                Some(shared) => shared.drift_tick(token),
                None => TaskControl::Stop,
            },
        ));

        let progress = millis(state.config.progress_interval_ms.max(1));
        let weak = Arc::downgrade(self);
        state.timers.progress = Some(PeriodicTask::spawn(
            token,
            progress,
            Some(progress),
            move || match weak.upgrade() {
                Some(shared) => shared.progress_tick(token),
                None => TaskControl::Stop,
            },
        ));
    }

    fn drift_tick(self: &Arc<Self>, token: SessionToken) -> TaskControl {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.sessions.is_current(token) || state.transport_state() != TransportState::Playing {
            return TaskControl::Stop;
        }
        let Some(session) = state.sessions.current_mut() else {
            return TaskControl::Stop;
        };

        let samples = session.sample_positions();
        let now = Instant::now();
        match state.drift.assess(&samples, now) {
            DriftVerdict::Idle => {}
            DriftVerdict::InSync { max_deviation_ms } => {
                debug!("Stems in sync (max deviation {} ms)", max_deviation_ms);
            }
            DriftVerdict::CoolingDown { max_deviation_ms } => {
                debug!(
                    "Drift of {} ms left alone, last correction too recent",
                    max_deviation_ms
                );
            }
            DriftVerdict::Correct {
                reference_ms,
                max_deviation_ms,
            } => {
                info!(
                    "Correcting drift of {} ms, aligning stems at {} ms",
                    max_deviation_ms, reference_ms
                );
                for failure in session.set_all_positions(reference_ms) {
                    warn!("{}", failure);
                }
                state.drift.record_correction(now);

                let before: Vec<u64> = samples.iter().map(|s| s.position_ms).collect();
                let weak = Arc::downgrade(self);
                state.timers.settle = Some(PeriodicTask::once(
                    token,
                    millis(state.drift.settings().settle_ms),
                    move || {
                        if let Some(shared) = weak.upgrade() {
                            shared.report_correction(token, before);
                        }
                    },
                ));
            }
        }
        TaskControl::Continue
    }

    fn report_correction(&self, token: SessionToken, before: Vec<u64>) {
        let state = self.state.lock();
        if !state.sessions.is_current(token) {
            return;
        }
        if let Some(session) = state.sessions.current() {
            self.events.emit(EngineEvent::CorrectionApplied {
                before,
                after: session.positions(),
            });
        }
    }

    fn progress_tick(self: &Arc<Self>, token: SessionToken) -> TaskControl {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.sessions.is_current(token) || state.transport_state() != TransportState::Playing {
            return TaskControl::Stop;
        }
        if let Some(reference) = state.reference_player() {
            self.events.emit(EngineEvent::Progress {
                position_ms: reference.player.position_ms(),
                duration_ms: reference.player.duration_ms(),
            });
        }

        if state.sessions.current().is_some_and(|s| s.all_ended()) {
            self.handle_song_end(state);
            return TaskControl::Stop;
        }
        TaskControl::Continue
    }

    fn handle_song_end(self: &Arc<Self>, state: &mut EngineState) {
        let action = transport::on_song_end(
            state.current_index,
            state.library.len(),
            state.repeat,
            state.shuffle,
            &mut rand::thread_rng(),
        );
        info!("Song finished: {:?}", action);

        let song = match action {
            EndAction::Stop => {
                self.pause_locked(state);
                if let Some(session) = state.sessions.current_mut() {
                    for failure in session.set_all_positions(0) {
                        warn!("{}", failure);
                    }
                }
                return;
            }
            EndAction::Replay => state.current_song().cloned(),
            EndAction::Advance(index) => state.library.get(index).cloned(),
        };

        let Some(song) = song else {
            self.pause_locked(state);
            return;
        };
        let (token, factory) = self.begin_load(state, true);
        self.load_in_background(token, factory, song);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::ScriptedPlayerFactory;
    use crate::library::FileContent;
    use crate::settings::DriftSettings;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::time::sleep;

    fn raw(path: &str) -> RawFile {
        RawFile::new(path, FileContent::from_bytes(vec![]))
    }

    fn files() -> Vec<RawFile> {
        vec![
            raw("Alpha_(Bass).wav"),
            raw("Alpha_(Drums).wav"),
            raw("Alpha_(Vocals).wav"),
            raw("Beta_(Bass).wav"),
            raw("Beta_(Vocals).wav"),
            raw("Gamma.mp3"),
        ]
    }

    fn engine_with(config: Config) -> (StemEngine, ScriptedPlayerFactory) {
        let factory = ScriptedPlayerFactory::new();
        let engine = StemEngine::new(config, Arc::new(factory.clone()));
        engine.scan_files(&files());
        (engine, factory)
    }

    fn engine() -> (StemEngine, ScriptedPlayerFactory) {
        engine_with(Config::default())
    }

    fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        events
    }

    #[test]
    fn test_scan_groups_songs() {
        let (engine, _factory) = engine();
        let library = engine.library();
        assert_eq!(library.grouping_keys(), vec!["Alpha", "Beta", "Gamma"]);
        let alpha = library.song("Alpha").unwrap();
        let labels: Vec<&str> = alpha.stems.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["Bass", "Drums", "Vocals"]);
        assert_eq!(library.song("Gamma").unwrap().stems[0].label, "Main");
        assert!(alpha.stems.iter().all(|s| s.volume == 85));
    }

    #[test]
    fn test_load_releases_old_players_first() {
        let (engine, factory) = engine();
        engine.load_index(0).unwrap();
        factory.clear_log();

        engine.load_index(1).unwrap();
        let log = factory.log();
        let releases = log.iter().filter(|l| l.starts_with("release:")).count();
        assert_eq!(releases, 3);
        let last_release = log.iter().rposition(|l| l.starts_with("release:")).unwrap();
        let first_open = log.iter().position(|l| l.starts_with("open:")).unwrap();
        assert!(last_release < first_open, "log: {:?}", log);

        assert_eq!(factory.live().len(), 2);
        assert_eq!(engine.current_index(), Some(1));
        assert_eq!(engine.transport_state(), TransportState::Ready);
    }

    #[test]
    fn test_load_index_out_of_range() {
        let (engine, _factory) = engine();
        assert!(matches!(
            engine.load_index(7),
            Err(EngineError::SongIndexOutOfRange { index: 7, len: 3 })
        ));
        assert!(matches!(engine.play(), Err(EngineError::NoSongLoaded)));
    }

    #[test]
    fn test_empty_session() {
        let (engine, factory) = engine();
        factory.set_unavailable("Beta_(Bass).wav");
        factory.set_unavailable("Beta_(Vocals).wav");
        let mut rx = engine.subscribe();

        let result = engine.load_index(1);
        assert!(matches!(result, Err(EngineError::EmptySession { .. })));
        assert_eq!(engine.transport_state(), TransportState::Idle);

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                EngineEvent::SourceUnavailable {
                    path: "Beta_(Bass).wav".into()
                },
                EngineEvent::SourceUnavailable {
                    path: "Beta_(Vocals).wav".into()
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_starts_every_stem() {
        let (engine, factory) = engine();
        let mut rx = engine.subscribe();
        engine.load_index(0).unwrap();
        engine.play().unwrap();

        assert!(engine.is_playing());
        assert!(factory.live().iter().all(|p| p.lock().playing));
        let events = drain(&mut rx);
        assert!(matches!(&events[0], EngineEvent::SongLoaded { song } if song.grouping_key == "Alpha"));
        assert_eq!(events[1], EngineEvent::PlayStateChanged { is_playing: true });

        engine.toggle_play().unwrap();
        assert_eq!(engine.transport_state(), TransportState::Paused);
        assert!(factory.live().iter().all(|p| !p.lock().playing));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_play_reports_and_recovers() {
        let (engine, factory) = engine();
        engine.load_index(0).unwrap();
        factory.set_block_play(true);
        let mut rx = engine.subscribe();

        assert!(matches!(engine.play(), Err(EngineError::PlaybackBlocked)));
        assert_eq!(engine.transport_state(), TransportState::Ready);
        assert_eq!(drain(&mut rx), vec![EngineEvent::PlaybackBlocked]);
        assert!(engine.lock().timers.is_idle());

        factory.set_block_play(false);
        engine.play().unwrap();
        assert!(engine.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drift_is_corrected_after_initial_delay() {
        let (engine, factory) = engine();
        engine.load_index(0).unwrap();
        engine.play().unwrap();
        let mut rx = engine.subscribe();
        factory.set_positions(&[1000, 1020, 1000]);

        sleep(millis(150)).await;
        assert_eq!(factory.positions(), vec![1000, 1020, 1000]);

        sleep(millis(100)).await;
        assert_eq!(factory.positions(), vec![1000, 1000, 1000]);

        sleep(millis(100)).await;
        let corrections: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, EngineEvent::CorrectionApplied { .. }))
            .collect();
        assert_eq!(
            corrections,
            vec![EngineEvent::CorrectionApplied {
                before: vec![1000, 1020, 1000],
                after: vec![1000, 1000, 1000],
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_stem_wins() {
        let (engine, factory) = engine();
        engine.load_index(0).unwrap();
        engine.play().unwrap();
        factory.set_positions(&[1000, 1000, 1020]);

        sleep(millis(250)).await;
        assert_eq!(factory.positions(), vec![1020, 1020, 1020]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_drift_is_left_alone() {
        let (engine, factory) = engine();
        engine.load_index(0).unwrap();
        engine.play().unwrap();
        factory.set_positions(&[1000, 1003, 998]);

        sleep(millis(3500)).await;
        assert_eq!(factory.positions(), vec![1000, 1003, 998]);
        assert!(factory.live().iter().all(|p| p.lock().seeks == vec![0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_between_corrections() {
        let config = Config {
            drift: DriftSettings {
                interval_ms: 300,
                ..DriftSettings::default()
            },
            ..Config::default()
        };
        let (engine, factory) = engine_with(config);
        engine.load_index(0).unwrap();
        engine.play().unwrap();

        factory.set_positions(&[1000, 1020, 1000]);
        sleep(millis(250)).await;
        assert_eq!(factory.positions(), vec![1000, 1000, 1000]);

        // Next tick lands 300 ms after the correction
        factory.set_positions(&[2000, 2040, 2000]);
        sleep(millis(300)).await;
        assert_eq!(factory.positions(), vec![2000, 2040, 2000]);

        // And the one after at 600 ms
        sleep(millis(300)).await;
        assert_eq!(factory.positions(), vec![2000, 2000, 2000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_seek_does_not_stop_the_tick() {
        let (engine, factory) = engine();
        engine.load_index(0).unwrap();
        engine.play().unwrap();
        factory.set_positions(&[1000, 1020, 1000]);
        factory.live()[1].lock().fail_seek = true;

        sleep(millis(250)).await;
        assert_eq!(factory.positions(), vec![1000, 1020, 1000]);
        assert!(engine.is_playing());

        factory.live()[1].lock().fail_seek = false;
        sleep(millis(3000)).await;
        assert_eq!(factory.positions(), vec![1000, 1000, 1000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_is_ignored_after_switch() {
        let (engine, factory) = engine();
        engine.load_index(0).unwrap();
        engine.play().unwrap();
        let old = engine.lock().sessions.token().unwrap();

        engine.next().unwrap();
        assert_eq!(engine.current_index(), Some(1));
        assert!(engine.is_playing());
        factory.set_positions(&[1000, 1500]);

        assert!(matches!(engine.shared.drift_tick(old), TaskControl::Stop));
        assert!(matches!(engine.shared.progress_tick(old), TaskControl::Stop));
        assert_eq!(factory.positions(), vec![1000, 1500]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_stops_timers() {
        let (engine, factory) = engine();
        engine.load_index(0).unwrap();
        engine.play().unwrap();
        engine.pause();
        factory.set_positions(&[1000, 1020, 1000]);

        sleep(millis(3500)).await;
        assert_eq!(factory.positions(), vec![1000, 1020, 1000]);
        assert!(engine.lock().timers.is_idle());
    }

    #[test]
    fn test_seek_and_skip() {
        let (engine, factory) = engine();
        assert!(matches!(engine.seek(0.5), Err(EngineError::NoSongLoaded)));
        engine.load_index(0).unwrap();

        engine.seek(0.5).unwrap();
        assert_eq!(factory.positions(), vec![90_000; 3]);

        engine.skip_forward().unwrap();
        assert_eq!(factory.positions(), vec![95_000; 3]);

        engine.skip_backward().unwrap();
        engine.skip_backward().unwrap();
        assert_eq!(factory.positions(), vec![85_000; 3]);

        engine.skip(-1000.0).unwrap();
        assert_eq!(factory.positions(), vec![0; 3]);

        engine.seek(7.0).unwrap();
        assert_eq!(factory.positions(), vec![180_000; 3]);
        assert_eq!(engine.progress(), Some((180_000, 180_000)));
    }

    #[test]
    fn test_mute_round_trip() {
        let (engine, factory) = engine();
        engine.load_index(0).unwrap();
        let mut rx = engine.subscribe();

        engine.toggle_mute("Alpha", "Vocals").unwrap();
        assert_eq!(factory.gains(), vec![0.85, 0.85, 0.0]);
        engine.toggle_mute("Alpha", "Vocals").unwrap();
        assert_eq!(factory.gains(), vec![0.85, 0.85, 0.85]);

        assert_eq!(
            drain(&mut rx),
            vec![
                EngineEvent::StemVolumeChanged {
                    label: "Vocals".into(),
                    volume: 85,
                    muted: true
                },
                EngineEvent::StemVolumeChanged {
                    label: "Vocals".into(),
                    volume: 85,
                    muted: false
                },
            ]
        );
    }

    #[test]
    fn test_volume_survives_rescan() {
        let (engine, _factory) = engine();
        engine.set_volume("Beta", "Bass", 30).unwrap();
        let library = engine.scan_files(&files());
        assert_eq!(library.song("Beta").unwrap().stem("Bass").unwrap().volume, 30);
        assert!(matches!(
            engine.set_volume("Beta", "Drums", 30),
            Err(EngineError::UnknownStem { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_song_navigation() {
        let factory = ScriptedPlayerFactory::new();
        let engine = StemEngine::new(Config::default(), Arc::new(factory.clone()));
        engine.scan_files(&[raw("Solo_(Bass).wav"), raw("Solo_(Vocals).wav")]);
        engine.set_shuffle(true);
        engine.load_index(0).unwrap();
        engine.play().unwrap();

        engine.next().unwrap();
        assert_eq!(engine.current_index(), Some(0));
        engine.previous().unwrap();
        assert_eq!(engine.current_index(), Some(0));
        assert!(engine.is_playing());
        assert_eq!(factory.opened_count(), 6);
        assert_eq!(factory.live().len(), 2);
    }

    #[test]
    fn test_sequential_navigation_wraps() {
        let (engine, _factory) = engine();
        engine.load_index(2).unwrap();
        engine.next().unwrap();
        assert_eq!(engine.current_index(), Some(0));
        engine.previous().unwrap();
        assert_eq!(engine.current_index(), Some(2));
        assert_eq!(engine.transport_state(), TransportState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_single_replays() {
        let (engine, factory) = engine();
        engine.set_repeat_mode(RepeatMode::Single);
        engine.load_index(1).unwrap();
        engine.play().unwrap();

        factory.finish_all();
        sleep(millis(250)).await;
        assert_eq!(engine.current_index(), Some(1));
        assert!(engine.is_playing());
        assert_eq!(factory.opened_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_all_wraps_at_end() {
        let (engine, factory) = engine();
        assert_eq!(engine.cycle_repeat_mode(), RepeatMode::Single);
        assert_eq!(engine.cycle_repeat_mode(), RepeatMode::All);
        engine.load_index(2).unwrap();
        engine.play().unwrap();

        factory.finish_all();
        sleep(millis(250)).await;
        assert_eq!(engine.current_index(), Some(0));
        assert!(engine.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_off_stops_at_end() {
        let (engine, factory) = engine();
        engine.load_index(2).unwrap();
        engine.play().unwrap();

        factory.finish_all();
        sleep(millis(250)).await;
        assert_eq!(engine.current_index(), Some(2));
        assert_eq!(engine.transport_state(), TransportState::Paused);
        assert_eq!(factory.positions(), vec![0]);
    }

    #[test]
    fn test_reorder_persists_order() {
        let (engine, _factory) = engine();
        engine.load_index(0).unwrap();

        assert!(engine.move_song(0, 2));
        assert!(!engine.move_song(0, 9));
        assert_eq!(engine.library().grouping_keys(), vec!["Beta", "Gamma", "Alpha"]);
        assert_eq!(engine.current_index(), Some(2));
        assert_eq!(engine.config().playlist_order, vec!["Beta", "Gamma", "Alpha"]);

        engine.sort_library(false);
        assert_eq!(engine.library().grouping_keys(), vec!["Gamma", "Beta", "Alpha"]);

        // A rescan keeps the saved order
        let library = engine.scan_files(&files());
        assert_eq!(library.grouping_keys(), vec!["Gamma", "Beta", "Alpha"]);

        engine.shuffle_library();
        let mut keys = engine.library().grouping_keys();
        keys.sort();
        assert_eq!(keys, vec!["Alpha", "Beta", "Gamma"]);
    }

    #[test]
    fn test_config_round_trip_reproduces_library() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");

        let (first, _factory) = engine();
        first.set_volume("Alpha", "Drums", 40).unwrap();
        first.toggle_mute("Beta", "Vocals").unwrap();
        first.move_song(2, 0);
        first.export_config(&path).unwrap();

        let second = StemEngine::new(Config::default(), Arc::new(ScriptedPlayerFactory::new()));
        second.import_config(&path).unwrap();
        second.scan_files(&files());

        assert_eq!(second.library(), first.library());
        assert_eq!(second.config(), first.config());
    }

    #[test]
    fn test_import_applies_to_existing_library() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");

        let (first, _) = engine();
        first.set_volume("Alpha", "Bass", 12).unwrap();
        first.export_config(&path).unwrap();

        let (second, factory) = engine();
        second.load_index(0).unwrap();
        second.import_config(&path).unwrap();
        assert_eq!(second.library().song("Alpha").unwrap().stems[0].volume, 12);
        assert_eq!(factory.gains()[0], 0.12);
    }

    #[test]
    fn test_settings_dir_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let factory: Arc<dyn PlayerFactory> = Arc::new(ScriptedPlayerFactory::new());

        let engine = StemEngine::with_settings_dir(dir.path(), factory.clone()).unwrap();
        engine.scan_files(&files());
        engine.set_volume("Gamma", "Main", 55).unwrap();
        engine.set_skip_seconds(10.0).unwrap();
        assert!(engine.set_skip_seconds(-1.0).is_err());

        let reopened = StemEngine::with_settings_dir(dir.path(), factory).unwrap();
        let library = reopened.scan_files(&files());
        assert_eq!(library.song("Gamma").unwrap().stems[0].volume, 55);
        assert_eq!(reopened.config().skip_seconds, 10.0);

        reopened.reset_config();
        assert_eq!(reopened.config(), Config::default());
    }

    #[test]
    fn test_export_without_reorder_carries_scan_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");

        let (first, _) = engine();
        assert_eq!(first.config().playlist_order, vec!["Alpha", "Beta", "Gamma"]);
        first.export_config(&path).unwrap();

        let (second, _) = engine();
        second.sort_library(false);
        assert_eq!(second.library().grouping_keys(), vec!["Gamma", "Beta", "Alpha"]);

        second.import_config(&path).unwrap();
        assert_eq!(second.library().grouping_keys(), first.library().grouping_keys());
        assert_eq!(second.config().playlist_order, vec!["Alpha", "Beta", "Gamma"]);
    }

    #[test]
    fn test_scan_keeps_saved_order_for_missing_songs() {
        let config = Config {
            playlist_order: vec!["Zeta".into(), "Gamma".into()],
            ..Config::default()
        };
        let (engine, _) = engine_with(config);
        assert_eq!(engine.library().grouping_keys(), vec!["Gamma", "Alpha", "Beta"]);
        assert_eq!(
            engine.config().playlist_order,
            vec!["Gamma", "Alpha", "Beta", "Zeta"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_players_open_without_engine_lock() {
        let (engine, factory) = engine();
        engine.set_repeat_mode(RepeatMode::All);

        let opens = Arc::new(Mutex::new(Vec::new()));
        let seen = opens.clone();
        let weak = Arc::downgrade(&engine.shared);
        factory.on_open(move |stem| {
            let unlocked = weak
                .upgrade()
                .is_some_and(|shared| shared.state.try_lock().is_some());
            seen.lock().push((stem.source_relative_path.clone(), unlocked));
        });

        engine.load_index(0).unwrap();
        engine.play().unwrap();
        factory.finish_all();
        sleep(millis(250)).await;

        assert_eq!(engine.current_index(), Some(1));
        assert!(engine.is_playing());
        assert_eq!(factory.live().len(), 2);
        let opens = opens.lock();
        assert_eq!(opens.len(), 5);
        assert!(opens.iter().all(|(_, unlocked)| *unlocked), "opens: {:?}", opens);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_background_load_leaves_nothing_open() {
        let (engine, factory) = engine();
        engine.set_repeat_mode(RepeatMode::Single);
        engine.load_index(1).unwrap();
        engine.play().unwrap();

        factory.finish_all();
        sleep(millis(200)).await;
        engine.stop();
        sleep(millis(200)).await;

        assert_eq!(engine.transport_state(), TransportState::Idle);
        assert!(factory.live().is_empty());
    }

    fn corrections(rx: &mut broadcast::Receiver<EngineEvent>) -> usize {
        drain(rx)
            .iter()
            .filter(|e| matches!(e, EngineEvent::CorrectionApplied { .. }))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_cancels_settle_report() {
        let (engine, factory) = engine();
        engine.load_index(0).unwrap();
        engine.play().unwrap();
        let mut rx = engine.subscribe();
        factory.set_positions(&[1000, 1020, 1000]);

        // Corrected at 200 ms, report due at 280 ms
        sleep(millis(240)).await;
        assert_eq!(factory.positions(), vec![1000, 1000, 1000]);
        engine.pause();

        sleep(millis(200)).await;
        assert_eq!(corrections(&mut rx), 0);
        assert!(engine.lock().timers.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_songs_cancels_settle_report() {
        let (engine, factory) = engine();
        engine.load_index(0).unwrap();
        engine.play().unwrap();
        let mut rx = engine.subscribe();
        factory.set_positions(&[1000, 1020, 1000]);

        sleep(millis(240)).await;
        engine.next().unwrap();
        assert_eq!(engine.current_index(), Some(1));

        sleep(millis(200)).await;
        assert_eq!(corrections(&mut rx), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_change_keeps_cooldown() {
        let config = Config {
            drift: DriftSettings {
                interval_ms: 300,
                ..DriftSettings::default()
            },
            ..Config::default()
        };
        let (engine, factory) = engine_with(config);
        engine.load_index(0).unwrap();
        engine.play().unwrap();

        factory.set_positions(&[1000, 1020, 1000]);
        sleep(millis(250)).await;
        assert_eq!(factory.positions(), vec![1000, 1000, 1000]);

        engine.set_priority_label(None);
        factory.set_positions(&[2000, 2040, 2000]);
        sleep(millis(300)).await;
        assert_eq!(factory.positions(), vec![2000, 2040, 2000]);

        sleep(millis(300)).await;
        assert_eq!(factory.positions(), vec![2000, 2000, 2000]);
    }

    #[test]
    fn test_progress_follows_reference_policy() {
        let (engine, factory) = engine();
        engine.load_index(0).unwrap();
        factory.set_positions(&[1000, 1000, 1020]);
        assert_eq!(engine.progress(), Some((1020, 180_000)));

        engine.set_reference_policy(ReferencePolicy::FirstStem);
        assert_eq!(engine.progress(), Some((1000, 180_000)));

        factory.set_positions(&[1030, 1000, 1000]);
        assert_eq!(engine.progress(), Some((1030, 180_000)));

        engine.set_reference_policy(ReferencePolicy::Modal);
        assert_eq!(engine.progress(), Some((1000, 180_000)));
    }
}
