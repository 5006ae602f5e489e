// Audio output using cpal
// Every stem gets its own output stream, running on its own device clock.
// cpal streams are not Send, so each one lives on a small owner thread that
// takes play/pause/shutdown commands over a channel.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error};

use crate::error::PlayerError;

/// Device-side format every stem is converted to before playback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

/// Query the default output device
pub fn default_output_format() -> Result<OutputFormat, PlayerError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| PlayerError::Device("No output device available".to_string()))?;
    let config = device
        .default_output_config()
        .map_err(|e| PlayerError::Device(format!("Failed to get default output config: {}", e)))?;

    Ok(OutputFormat {
        sample_rate: config.sample_rate().0,
        channels: config.channels(),
        sample_format: config.sample_format(),
    })
}

/// PCM plus the cursor the output callback advances. Shared between the
/// player handle and the audio thread.
pub struct SharedPlayback {
    samples: Vec<f32>,
    channels: usize,
    sample_rate: u32,
    cursor: AtomicU64,
    playing: AtomicBool,
    gain: AtomicU32,
}

impl SharedPlayback {
    pub fn new(samples: Vec<f32>, channels: usize, sample_rate: u32) -> Self {
        Self {
            samples,
            channels: channels.max(1),
            sample_rate: sample_rate.max(1),
            cursor: AtomicU64::new(0),
            playing: AtomicBool::new(false),
            gain: AtomicU32::new(1.0f32.to_bits()),
        }
    }

    pub fn frames(&self) -> u64 {
        (self.samples.len() / self.channels) as u64
    }

    pub fn position_ms(&self) -> u64 {
        self.cursor.load(Ordering::Acquire) * 1000 / u64::from(self.sample_rate)
    }

    pub fn duration_ms(&self) -> u64 {
        self.frames() * 1000 / u64::from(self.sample_rate)
    }

    pub fn seek_ms(&self, position_ms: u64) {
        let frame = (position_ms * u64::from(self.sample_rate) / 1000).min(self.frames());
        self.cursor.store(frame, Ordering::Release);
    }

    pub fn set_gain(&self, gain: f32) {
        self.gain.store(gain.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn gain(&self) -> f32 {
        f32::from_bits(self.gain.load(Ordering::Relaxed))
    }

    pub fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::Release);
    }

    pub fn has_ended(&self) -> bool {
        self.cursor.load(Ordering::Acquire) >= self.frames()
    }

    /// Fill one device buffer. `out_channels` may differ from the stem's
    /// channel count; extra device channels repeat the stem's channels.
    pub fn render(&self, out: &mut [f32], out_channels: usize) {
        let start = self.cursor.load(Ordering::Acquire);
        if !self.playing.load(Ordering::Acquire) || out_channels == 0 {
            out.fill(0.0);
            return;
        }

        let gain = self.gain();
        let total = self.frames();
        let mut frame = start;
        for out_frame in out.chunks_mut(out_channels) {
            if frame >= total {
                out_frame.fill(0.0);
                continue;
            }
            let base = frame as usize * self.channels;
            for (ch, sample) in out_frame.iter_mut().enumerate() {
                *sample = self.samples[base + ch % self.channels] * gain;
            }
            frame += 1;
        }

        // A seek that landed mid-callback wins over our advance
        let _ = self
            .cursor
            .compare_exchange(start, frame, Ordering::AcqRel, Ordering::Acquire);
    }
}

enum OutputCommand {
    Play(mpsc::Sender<Result<(), PlayerError>>),
    Pause,
    Shutdown,
}

/// One cpal stream bound to one stem
pub struct StemOutput {
    commands: mpsc::Sender<OutputCommand>,
    thread: Option<JoinHandle<()>>,
}

impl StemOutput {
    /// Build the stream on its own thread and wait until it is ready
    pub fn open(shared: Arc<SharedPlayback>, format: OutputFormat) -> Result<Self, PlayerError> {
        let (command_tx, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread = std::thread::Builder::new()
            .name("stem-output".to_string())
            .spawn(move || {
                let stream = match build_stream(shared, format) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                run_stream(stream, command_rx);
            })
            .map_err(|e| PlayerError::Device(format!("Failed to spawn output thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                commands: command_tx,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(PlayerError::Device(
                "Output thread exited before the stream was ready".to_string(),
            )),
        }
    }

    pub fn play(&self) -> Result<(), PlayerError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.commands
            .send(OutputCommand::Play(reply_tx))
            .map_err(|_| PlayerError::Device("Output stream is closed".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| PlayerError::Device("Output stream is closed".to_string()))?
    }

    pub fn pause(&self) {
        let _ = self.commands.send(OutputCommand::Pause);
    }

    pub fn shutdown(&mut self) {
        let _ = self.commands.send(OutputCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Output thread panicked during shutdown");
            }
        }
    }
}

impl Drop for StemOutput {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_stream(stream: Stream, commands: mpsc::Receiver<OutputCommand>) {
    while let Ok(command) = commands.recv() {
        match command {
            OutputCommand::Play(reply) => {
                let result = stream
                    .play()
                    .map_err(|e| PlayerError::Blocked(format!("Failed to start stream: {}", e)));
                let _ = reply.send(result);
            }
            OutputCommand::Pause => {
                if let Err(e) = stream.pause() {
                    debug!("Failed to pause stream: {}", e);
                }
            }
            OutputCommand::Shutdown => break,
        }
    }
    // Dropping the stream releases the device
}

fn build_stream(shared: Arc<SharedPlayback>, format: OutputFormat) -> Result<Stream, PlayerError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| PlayerError::Device("No output device available".to_string()))?;

    let config = StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    match format.sample_format {
        SampleFormat::F32 => build_typed_stream::<f32>(&device, &config, shared),
        SampleFormat::I16 => build_typed_stream::<i16>(&device, &config, shared),
        SampleFormat::U16 => build_typed_stream::<u16>(&device, &config, shared),
        other => Err(PlayerError::Device(format!(
            "Unsupported sample format: {:?}",
            other
        ))),
    }
}

fn build_typed_stream<T: cpal::SizedSample + cpal::FromSample<f32>>(
    device: &cpal::Device,
    config: &StreamConfig,
    shared: Arc<SharedPlayback>,
) -> Result<Stream, PlayerError> {
    let out_channels = config.channels as usize;
    let mut scratch: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0);
                shared.render(&mut scratch, out_channels);
                for (out, sample) in data.iter_mut().zip(scratch.iter()) {
                    *out = T::from_sample(*sample);
                }
            },
            move |err| {
                error!("Audio output error: {}", err);
            },
            None,
        )
        .map_err(|e| PlayerError::Device(format!("Failed to build output stream: {}", e)))
}
