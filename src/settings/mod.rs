// Engine configuration and its JSON persistence

#[allow(clippy::module_inception)]
pub mod settings;

pub use settings::{
    default_filename_rules, Config, DriftSettings, FilenameRule, ReferencePolicy, StemVolume,
    VolumeSettings,
};
