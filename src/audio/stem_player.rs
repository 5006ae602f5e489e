// Hardware-backed stem player: decode fully, convert to the device rate,
// then play through a dedicated cpal stream
use std::sync::Arc;
use tracing::debug;

use crate::audio::decoder::decode_all;
use crate::audio::output::{default_output_format, SharedPlayback, StemOutput};
use crate::audio::player::{PlayerFactory, StemPlayer};
use crate::audio::resample::resample;
use crate::error::PlayerError;
use crate::library::Stem;

pub struct DecodedPlayer {
    shared: Arc<SharedPlayback>,
    output: Option<StemOutput>,
}

impl StemPlayer for DecodedPlayer {
    fn play(&mut self) -> Result<(), PlayerError> {
        let output = self
            .output
            .as_ref()
            .ok_or_else(|| PlayerError::SourceUnavailable("player was released".to_string()))?;
        output.play()?;
        self.shared.set_playing(true);
        Ok(())
    }

    fn pause(&mut self) {
        self.shared.set_playing(false);
        if let Some(output) = self.output.as_ref() {
            output.pause();
        }
    }

    fn position_ms(&self) -> u64 {
        self.shared.position_ms()
    }

    fn duration_ms(&self) -> u64 {
        self.shared.duration_ms()
    }

    fn seek(&mut self, position_ms: u64) -> Result<(), PlayerError> {
        if self.output.is_none() {
            return Err(PlayerError::Seek("player was released".to_string()));
        }
        self.shared.seek_ms(position_ms);
        Ok(())
    }

    fn set_gain(&mut self, gain: f32) {
        self.shared.set_gain(gain);
    }

    fn has_ended(&self) -> bool {
        self.shared.has_ended()
    }

    fn release(&mut self) {
        self.shared.set_playing(false);
        if let Some(mut output) = self.output.take() {
            output.shutdown();
        }
    }
}

impl Drop for DecodedPlayer {
    fn drop(&mut self) {
        self.release();
    }
}

/// Opens [`DecodedPlayer`]s on the default output device
#[derive(Debug, Default, Clone, Copy)]
pub struct DecodedPlayerFactory;

impl PlayerFactory for DecodedPlayerFactory {
    fn open(&self, stem: &Stem) -> Result<Box<dyn StemPlayer>, PlayerError> {
        let format = default_output_format()?;

        let extension = stem
            .source_relative_path
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .unwrap_or("");
        let decoded = decode_all(&stem.content, extension)?;
        let channels = decoded.channels;
        let samples = resample(
            decoded.samples,
            decoded.sample_rate,
            format.sample_rate,
            channels,
        )?;

        let shared = Arc::new(SharedPlayback::new(samples, channels, format.sample_rate));
        shared.set_gain(stem.live_gain());
        let output = StemOutput::open(shared.clone(), format)?;

        debug!(
            "Opened stem '{}' ({} ms)",
            stem.label,
            shared.duration_ms()
        );
        Ok(Box::new(DecodedPlayer {
            shared,
            output: Some(output),
        }))
    }
}
