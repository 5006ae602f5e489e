// Playback: sessions, drift correction, navigation and volume
pub mod drift;
pub mod scheduler;
pub mod session;
pub mod transport;
pub mod volume;

pub use drift::{DriftCorrector, DriftSample, DriftVerdict};
pub use scheduler::{PeriodicTask, SessionTimers, TaskControl};
pub use session::{
    open_players, LivePlayer, LoadReport, PlaybackSession, SessionManager, SessionToken, TransportState,
};
pub use transport::{EndAction, RepeatMode};
pub use volume::{VolumeChange, VolumeStore};
