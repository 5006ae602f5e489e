// Plays the first song found in a folder and logs engine events until it ends
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use stemsync_lib::{DecodedPlayerFactory, EngineEvent, StemEngine};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("debug,symphonia=warn")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .ok();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let folder = args
        .next()
        .ok_or_else(|| anyhow::anyhow!("usage: stemsync-play <folder> [settings-dir]"))?;

    let factory = Arc::new(DecodedPlayerFactory);
    let engine = match args.next() {
        Some(settings_dir) => StemEngine::with_settings_dir(settings_dir, factory)?,
        None => StemEngine::new(Default::default(), factory),
    };

    let library = engine.scan_folder(&folder)?;
    if library.is_empty() {
        warn!("No playable files in {}", folder);
        return Ok(());
    }
    for song in &library.songs {
        let labels: Vec<&str> = song.stems.iter().map(|s| s.label.as_str()).collect();
        info!("{}: {}", song.grouping_key, labels.join(", "));
    }

    let mut events = engine.subscribe();
    engine.load_index(0)?;
    engine.play()?;

    loop {
        match events.recv().await {
            Ok(EngineEvent::Progress { .. }) => {}
            // Also sent between songs, when the engine is already playing the next one
            Ok(EngineEvent::PlayStateChanged { is_playing: false }) if !engine.is_playing() => {
                info!("Playback stopped");
                break;
            }
            Ok(event) => info!("{:?}", event),
            Err(RecvError::Lagged(skipped)) => warn!("Missed {} events", skipped),
            Err(RecvError::Closed) => {
                error!("Engine event channel closed");
                break;
            }
        }
    }

    engine.stop();
    Ok(())
}
