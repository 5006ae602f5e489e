// Audio playback module
// Uses Symphonia for decoding and cpal for output

pub mod decoder;
pub mod output;
pub mod player;
pub mod resample;
pub mod stem_player;

#[cfg(test)]
pub(crate) mod testing;

pub use player::{PlayerFactory, StemPlayer};
pub use stem_player::{DecodedPlayer, DecodedPlayerFactory};
