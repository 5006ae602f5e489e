// Player primitives the playback session drives, one per stem
use crate::error::PlayerError;
use crate::library::Stem;

/// A single stem's playback handle. Each player runs on its own clock, which
/// is why positions drift apart and need correcting.
pub trait StemPlayer: Send {
    /// Start (or resume) output. May be refused by the host.
    fn play(&mut self) -> Result<(), PlayerError>;

    fn pause(&mut self);

    /// Current position in whole milliseconds
    fn position_ms(&self) -> u64;

    fn duration_ms(&self) -> u64;

    fn seek(&mut self, position_ms: u64) -> Result<(), PlayerError>;

    /// Output gain, 0.0 to 1.0
    fn set_gain(&mut self, gain: f32);

    fn has_ended(&self) -> bool;

    /// Stop and drop the decode/output resources. The player is unusable afterwards.
    fn release(&mut self);
}

/// Opens players for stems
pub trait PlayerFactory: Send + Sync {
    fn open(&self, stem: &Stem) -> Result<Box<dyn StemPlayer>, PlayerError>;
}
