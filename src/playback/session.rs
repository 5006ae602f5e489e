// Playback session: the live player set for the current song
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::audio::{PlayerFactory, StemPlayer};
use crate::error::{EngineError, PlayerError, Result};
use crate::library::{Song, Stem};
use crate::playback::drift::DriftSample;

/// Identity of one loaded session. Timers capture it and go quiet once it no
/// longer matches the live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionToken(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportState {
    Idle,
    Loading,
    Ready,
    Playing,
    Paused,
}

pub struct LivePlayer {
    pub stem: Stem,
    pub player: Box<dyn StemPlayer>,
}

pub struct PlaybackSession {
    song: Song,
    players: Vec<LivePlayer>,
    state: TransportState,
    token: SessionToken,
}

impl PlaybackSession {
    pub fn song(&self) -> &Song {
        &self.song
    }

    pub fn token(&self) -> SessionToken {
        self.token
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn players(&self) -> &[LivePlayer] {
        &self.players
    }

    pub fn player(&self, index: usize) -> Option<&LivePlayer> {
        self.players.get(index)
    }

    pub fn sample_positions(&self) -> Vec<DriftSample> {
        self.players
            .iter()
            .map(|p| DriftSample::new(p.stem.label.clone(), p.player.position_ms()))
            .collect()
    }

    pub fn positions(&self) -> Vec<u64> {
        self.players.iter().map(|p| p.player.position_ms()).collect()
    }

    /// Move every player to the same position. A player that refuses is
    /// reported and skipped; the rest are still moved.
    pub fn set_all_positions(&mut self, position_ms: u64) -> Vec<EngineError> {
        let mut failures = Vec::new();
        for live in &mut self.players {
            if let Err(e) = live.player.seek(position_ms) {
                failures.push(EngineError::DriftCorrectionFailure {
                    label: live.stem.label.clone(),
                    reason: e.to_string(),
                });
            }
        }
        failures
    }

    /// Shift each player by `delta_ms`, clamped to that player's own length
    pub fn skip_by(&mut self, delta_ms: i64) -> Vec<EngineError> {
        let mut failures = Vec::new();
        for live in &mut self.players {
            let duration = live.player.duration_ms() as i64;
            let target = (live.player.position_ms() as i64)
                .saturating_add(delta_ms)
                .clamp(0, duration.max(0));
            if let Err(e) = live.player.seek(target as u64) {
                failures.push(EngineError::DriftCorrectionFailure {
                    label: live.stem.label.clone(),
                    reason: e.to_string(),
                });
            }
        }
        failures
    }

    pub fn all_ended(&self) -> bool {
        !self.players.is_empty() && self.players.iter().all(|p| p.player.has_ended())
    }

    /// Push a stem's volume/mute into every player carrying that label
    pub fn apply_stem_volume(&mut self, label: &str, volume: u8, muted: bool) -> bool {
        let mut touched = false;
        for live in self.players.iter_mut().filter(|p| p.stem.label == label) {
            live.stem.volume = volume;
            live.stem.muted = muted;
            live.player.set_gain(live.stem.live_gain());
            touched = true;
        }
        for stem in self.song.stems.iter_mut().filter(|s| s.label == label) {
            stem.volume = volume;
            stem.muted = muted;
        }
        touched
    }
}

/// Owns at most one session and walks it through its states
pub struct SessionManager {
    factory: Arc<dyn PlayerFactory>,
    session: Option<PlaybackSession>,
    /// Token reserved by a load whose players are still being opened
    pending: Option<SessionToken>,
    next_token: u64,
}

/// What a load produced besides the session itself
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Stems whose source could not be opened
    pub unavailable: Vec<String>,
}

/// Open one player per stem, in stem order, at the stem's live gain and
/// position 0. Stems that fail to open are left out.
///
/// Decoding happens here, so callers run it without holding the engine lock.
pub fn open_players(
    factory: &dyn PlayerFactory,
    song: &Song,
    report: &mut LoadReport,
) -> Vec<LivePlayer> {
    let mut players = Vec::with_capacity(song.stems.len());
    for stem in &song.stems {
        match factory.open(stem) {
            Ok(mut player) => {
                player.set_gain(stem.live_gain());
                if let Err(e) = player.seek(0) {
                    debug!("Could not rewind stem '{}': {}", stem.label, e);
                }
                players.push(LivePlayer {
                    stem: stem.clone(),
                    player,
                });
            }
            Err(PlayerError::SourceUnavailable(reason)) => {
                warn!("Stem '{}' unavailable: {}", stem.source_relative_path, reason);
                report.unavailable.push(stem.source_relative_path.clone());
            }
            Err(e) => {
                warn!("Failed to open stem '{}': {}", stem.source_relative_path, e);
            }
        }
    }
    players
}

fn release_all(players: &mut [LivePlayer]) {
    for live in players {
        live.player.pause();
        live.player.release();
    }
}

impl SessionManager {
    pub fn new(factory: Arc<dyn PlayerFactory>) -> Self {
        Self {
            factory,
            session: None,
            pending: None,
            next_token: 1,
        }
    }

    pub fn factory(&self) -> Arc<dyn PlayerFactory> {
        self.factory.clone()
    }

    pub fn current(&self) -> Option<&PlaybackSession> {
        self.session.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut PlaybackSession> {
        self.session.as_mut()
    }

    pub fn state(&self) -> TransportState {
        match (&self.session, self.pending) {
            (Some(session), _) => session.state,
            (None, Some(_)) => TransportState::Loading,
            (None, None) => TransportState::Idle,
        }
    }

    pub fn token(&self) -> Option<SessionToken> {
        self.session.as_ref().map(|s| s.token)
    }

    pub fn is_current(&self, token: SessionToken) -> bool {
        self.token() == Some(token)
    }

    /// Whether `token` belongs to the most recent load still in progress
    pub fn is_pending(&self, token: SessionToken) -> bool {
        self.pending == Some(token)
    }

    /// First half of a load: release the current session and reserve a token
    /// for the next one. Any earlier load still in flight is superseded.
    pub fn begin_load(&mut self) -> SessionToken {
        self.teardown();
        let token = SessionToken(self.next_token);
        self.next_token += 1;
        self.pending = Some(token);
        token
    }

    /// Second half of a load: turn opened players into the live session.
    /// Players for a superseded load are released instead.
    pub fn install(
        &mut self,
        token: SessionToken,
        song: &Song,
        mut players: Vec<LivePlayer>,
    ) -> Result<SessionToken> {
        if !self.is_pending(token) {
            release_all(&mut players);
            return Err(EngineError::LoadSuperseded {
                grouping_key: song.grouping_key.clone(),
            });
        }
        self.pending = None;

        if players.is_empty() {
            return Err(EngineError::EmptySession {
                grouping_key: song.grouping_key.clone(),
            });
        }

        info!(
            "Loaded '{}' with {} of {} stems",
            song.grouping_key,
            players.len(),
            song.stems.len()
        );
        self.session = Some(PlaybackSession {
            song: song.clone(),
            players,
            state: TransportState::Ready,
            token,
        });
        Ok(token)
    }

    /// Replace the current session with one for `song`, all in one go. The
    /// old players are released before any new one is opened.
    pub fn load(&mut self, song: &Song, report: &mut LoadReport) -> Result<SessionToken> {
        let token = self.begin_load();
        let players = open_players(self.factory.as_ref(), song, report);
        self.install(token, song, players)
    }

    /// Start every player, one right after the other. If the first player is
    /// refused nothing else is started and the session keeps its state.
    pub fn play(&mut self) -> Result<()> {
        let session = self.session.as_mut().ok_or(EngineError::NoSongLoaded)?;
        if session.state == TransportState::Playing {
            return Ok(());
        }

        let mut players = session.players.iter_mut();
        if let Some(first) = players.next() {
            first.player.play().map_err(|e| match e {
                PlayerError::SourceUnavailable(_) => EngineError::SourceUnavailable {
                    path: first.stem.source_relative_path.clone(),
                },
                other => {
                    warn!("Playback blocked: {}", other);
                    EngineError::PlaybackBlocked
                }
            })?;
        }
        for live in players {
            if let Err(e) = live.player.play() {
                warn!("Stem '{}' failed to start: {}", live.stem.label, e);
            }
        }

        session.state = TransportState::Playing;
        Ok(())
    }

    /// Returns whether the session was playing
    pub fn pause(&mut self) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        let was_playing = session.state == TransportState::Playing;
        for live in &mut session.players {
            live.player.pause();
        }
        if matches!(
            session.state,
            TransportState::Playing | TransportState::Paused
        ) {
            session.state = TransportState::Paused;
        }
        was_playing
    }

    /// Stop and release every player. Any token handed out so far goes stale.
    pub fn teardown(&mut self) {
        self.pending = None;
        if let Some(mut session) = self.session.take() {
            session.state = TransportState::Loading;
            release_all(&mut session.players);
            debug!("Tore down session for '{}'", session.song.grouping_key);
        }
    }
}
