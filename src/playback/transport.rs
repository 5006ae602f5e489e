// Song navigation: next/previous, repeat and shuffle
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RepeatMode {
    /// Stop advancing at the end of the library
    #[default]
    Off,
    /// Replay the current song
    Single,
    /// Wrap around to the first song
    All,
}

impl RepeatMode {
    /// off -> single -> all -> off
    pub fn cycle(self) -> Self {
        match self {
            RepeatMode::Off => RepeatMode::Single,
            RepeatMode::Single => RepeatMode::All,
            RepeatMode::All => RepeatMode::Off,
        }
    }
}

/// What to do when every stem of the current song has finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndAction {
    Replay,
    Advance(usize),
    Stop,
}

pub fn next_index<R: Rng + ?Sized>(
    current: Option<usize>,
    len: usize,
    shuffle: bool,
    rng: &mut R,
) -> Option<usize> {
    if len == 0 {
        return None;
    }
    if shuffle {
        return Some(rng.gen_range(0..len));
    }
    Some(match current {
        Some(i) => (i + 1) % len,
        None => 0,
    })
}

pub fn previous_index<R: Rng + ?Sized>(
    current: Option<usize>,
    len: usize,
    shuffle: bool,
    rng: &mut R,
) -> Option<usize> {
    if len == 0 {
        return None;
    }
    if shuffle {
        return Some(rng.gen_range(0..len));
    }
    Some(match current {
        Some(i) => (i + len - 1) % len,
        None => len - 1,
    })
}

pub fn on_song_end<R: Rng + ?Sized>(
    current: Option<usize>,
    len: usize,
    repeat: RepeatMode,
    shuffle: bool,
    rng: &mut R,
) -> EndAction {
    match repeat {
        RepeatMode::Single => EndAction::Replay,
        RepeatMode::All => match next_index(current, len, shuffle, rng) {
            Some(i) => EndAction::Advance(i),
            None => EndAction::Stop,
        },
        RepeatMode::Off => {
            let Some(i) = current else {
                return EndAction::Stop;
            };
            if !shuffle && i + 1 >= len {
                return EndAction::Stop;
            }
            match next_index(current, len, shuffle, rng) {
                Some(next) => EndAction::Advance(next),
                None => EndAction::Stop,
            }
        }
    }
}
