// Per-stem volume and mute, kept in step across the library, the live
// session and the saved settings
use crate::error::{EngineError, Result};
use crate::library::Library;
use crate::playback::session::PlaybackSession;
use crate::settings::{Config, StemVolume, VolumeSettings};

/// Result of a volume operation, ready to be broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeChange {
    pub grouping_key: String,
    pub label: String,
    pub volume: u8,
    pub muted: bool,
}

pub struct VolumeStore<'a> {
    config: &'a mut Config,
    library: &'a mut Library,
    session: Option<&'a mut PlaybackSession>,
}

impl<'a> VolumeStore<'a> {
    pub fn new(
        config: &'a mut Config,
        library: &'a mut Library,
        session: Option<&'a mut PlaybackSession>,
    ) -> Self {
        Self {
            config,
            library,
            session,
        }
    }

    /// Set a stem's volume (clamped to 0..=100). Moving the volume unmutes.
    pub fn set_volume(&mut self, grouping_key: &str, label: &str, value: i32) -> Result<VolumeChange> {
        self.current(grouping_key, label)?;
        let setting = StemVolume {
            volume: value.clamp(0, 100) as u8,
            muted: false,
        };
        Ok(self.apply(grouping_key, label, setting))
    }

    /// Flip mute; the restore volume is left untouched
    pub fn toggle_mute(&mut self, grouping_key: &str, label: &str) -> Result<VolumeChange> {
        let current = self.current(grouping_key, label)?;
        let setting = StemVolume {
            volume: current.volume,
            muted: !current.muted,
        };
        Ok(self.apply(grouping_key, label, setting))
    }

    fn current(&self, grouping_key: &str, label: &str) -> Result<StemVolume> {
        let from_library = self
            .library
            .song(grouping_key)
            .and_then(|song| song.stem(label));
        let from_session = self
            .session
            .as_deref()
            .filter(|s| s.song().grouping_key == grouping_key)
            .and_then(|s| s.song().stem(label));

        from_library
            .or(from_session)
            .map(|stem| StemVolume {
                volume: stem.volume,
                muted: stem.muted,
            })
            .ok_or_else(|| EngineError::UnknownStem {
                grouping_key: grouping_key.to_string(),
                label: label.to_string(),
            })
    }

    fn apply(&mut self, grouping_key: &str, label: &str, setting: StemVolume) -> VolumeChange {
        if let Some(song) = self.library.song_mut(grouping_key) {
            for stem in song.stems.iter_mut().filter(|s| s.label == label) {
                stem.volume = setting.volume;
                stem.muted = setting.muted;
            }
        }
        if let Some(session) = self.session.as_deref_mut() {
            if session.song().grouping_key == grouping_key {
                session.apply_stem_volume(label, setting.volume, setting.muted);
            }
        }
        self.config.set_stem_volume(grouping_key, label, setting);

        VolumeChange {
            grouping_key: grouping_key.to_string(),
            label: label.to_string(),
            volume: setting.volume,
            muted: setting.muted,
        }
    }
}

/// Overwrite library volumes with saved ones wherever a setting exists
pub fn apply_saved_volumes(library: &mut Library, saved: &VolumeSettings) {
    for song in &mut library.songs {
        let Some(stems) = saved.get(&song.grouping_key) else {
            continue;
        };
        for stem in &mut song.stems {
            if let Some(setting) = stems.get(&stem.label) {
                stem.volume = setting.volume;
                stem.muted = setting.muted;
            }
        }
    }
}
