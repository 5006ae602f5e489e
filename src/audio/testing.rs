// Scripted players for tests: positions only move when a test or the engine moves them
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::audio::player::{PlayerFactory, StemPlayer};
use crate::error::PlayerError;
use crate::library::Stem;

pub const DEFAULT_DURATION_MS: u64 = 180_000;

#[derive(Debug, Clone, Default)]
pub struct MockState {
    pub label: String,
    pub path: String,
    pub position_ms: u64,
    pub duration_ms: u64,
    pub gain: f32,
    pub playing: bool,
    pub ended: bool,
    pub released: bool,
    pub fail_seek: bool,
    pub seeks: Vec<u64>,
}

type OpenHook = Arc<dyn Fn(&Stem) + Send + Sync>;

#[derive(Default)]
struct FactoryState {
    players: Vec<Arc<Mutex<MockState>>>,
    log: Vec<String>,
    durations: HashMap<String, u64>,
    unavailable: HashSet<String>,
    block_play: bool,
    on_open: Option<OpenHook>,
}

#[derive(Clone, Default)]
pub struct ScriptedPlayerFactory {
    inner: Arc<Mutex<FactoryState>>,
}

impl ScriptedPlayerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_duration(&self, path: &str, duration_ms: u64) {
        self.inner.lock().durations.insert(path.to_string(), duration_ms);
    }

    pub fn set_unavailable(&self, path: &str) {
        self.inner.lock().unavailable.insert(path.to_string());
    }

    pub fn set_block_play(&self, block: bool) {
        self.inner.lock().block_play = block;
    }

    /// Run `hook` at the start of every `open`, outside the factory's own lock
    pub fn on_open<F>(&self, hook: F)
    where
        F: Fn(&Stem) + Send + Sync + 'static,
    {
        self.inner.lock().on_open = Some(Arc::new(hook));
    }

    /// open/release/play/pause calls in the order they happened
    pub fn log(&self) -> Vec<String> {
        self.inner.lock().log.clone()
    }

    pub fn clear_log(&self) {
        self.inner.lock().log.clear();
    }

    /// Players not yet released, in open order
    pub fn live(&self) -> Vec<Arc<Mutex<MockState>>> {
        self.inner
            .lock()
            .players
            .iter()
            .filter(|p| !p.lock().released)
            .cloned()
            .collect()
    }

    pub fn opened_count(&self) -> usize {
        self.inner.lock().players.len()
    }

    pub fn set_positions(&self, positions: &[u64]) {
        for (player, position) in self.live().iter().zip(positions) {
            player.lock().position_ms = *position;
        }
    }

    pub fn positions(&self) -> Vec<u64> {
        self.live().iter().map(|p| p.lock().position_ms).collect()
    }

    pub fn gains(&self) -> Vec<f32> {
        self.live().iter().map(|p| p.lock().gain).collect()
    }

    pub fn finish_all(&self) {
        for player in self.live() {
            let mut state = player.lock();
            state.ended = true;
            state.position_ms = state.duration_ms;
        }
    }
}

impl PlayerFactory for ScriptedPlayerFactory {
    fn open(&self, stem: &Stem) -> Result<Box<dyn StemPlayer>, PlayerError> {
        let hook = self.inner.lock().on_open.clone();
        if let Some(hook) = hook {
            hook(stem);
        }

        let mut inner = self.inner.lock();
        if inner.unavailable.contains(&stem.source_relative_path) {
            return Err(PlayerError::SourceUnavailable(stem.source_relative_path.clone()));
        }

        let state = Arc::new(Mutex::new(MockState {
            label: stem.label.clone(),
            path: stem.source_relative_path.clone(),
            duration_ms: inner
                .durations
                .get(&stem.source_relative_path)
                .copied()
                .unwrap_or(DEFAULT_DURATION_MS),
            gain: stem.live_gain(),
            ..MockState::default()
        }));
        inner.players.push(state.clone());
        inner.log.push(format!("open:{}", stem.source_relative_path));

        Ok(Box::new(MockPlayer {
            state,
            factory: self.inner.clone(),
        }))
    }
}

struct MockPlayer {
    state: Arc<Mutex<MockState>>,
    factory: Arc<Mutex<FactoryState>>,
}

impl MockPlayer {
    fn record(&self, action: &str) {
        let path = self.state.lock().path.clone();
        self.factory.lock().log.push(format!("{}:{}", action, path));
    }
}

impl StemPlayer for MockPlayer {
    fn play(&mut self) -> Result<(), PlayerError> {
        if self.factory.lock().block_play {
            return Err(PlayerError::Blocked("autoplay policy".to_string()));
        }
        self.record("play");
        self.state.lock().playing = true;
        Ok(())
    }

    fn pause(&mut self) {
        self.record("pause");
        self.state.lock().playing = false;
    }

    fn position_ms(&self) -> u64 {
        self.state.lock().position_ms
    }

    fn duration_ms(&self) -> u64 {
        self.state.lock().duration_ms
    }

    fn seek(&mut self, position_ms: u64) -> Result<(), PlayerError> {
        let mut state = self.state.lock();
        if state.fail_seek {
            return Err(PlayerError::Seek("stale resource".to_string()));
        }
        state.position_ms = position_ms.min(state.duration_ms);
        state.ended = state.position_ms >= state.duration_ms;
        state.seeks.push(position_ms);
        Ok(())
    }

    fn set_gain(&mut self, gain: f32) {
        self.state.lock().gain = gain;
    }

    fn has_ended(&self) -> bool {
        self.state.lock().ended
    }

    fn release(&mut self) {
        self.record("release");
        let mut state = self.state.lock();
        state.playing = false;
        state.released = true;
    }
}
