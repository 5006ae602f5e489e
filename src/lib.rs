// StemSync - plays multi-stem songs as one track
// Module declarations
pub mod audio;
pub mod engine;
pub mod error;
pub mod events;
pub mod library;
pub mod playback;
pub mod settings;
mod state;

pub use audio::{DecodedPlayerFactory, PlayerFactory, StemPlayer};
pub use engine::StemEngine;
pub use error::{EngineError, PlayerError, Result};
pub use events::{EngineEvent, EventBus};
pub use library::{FileContent, Library, RawFile, Song, Stem};
pub use playback::{RepeatMode, TransportState};
pub use settings::{Config, FilenameRule, ReferencePolicy, StemVolume};
