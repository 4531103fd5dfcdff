//! Live text-detection preview on the simulated camera

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use textcam::capture::{FlashMode, FocusRegion};
use textcam::{
    CameraSession, CaptureEvent, Config, DetectorError, DetectorSink, Frame, SimulatedCamera,
    SimulatedSettings,
};

#[derive(Debug, Parser)]
#[command(version, about = "Runs the frame pipeline against a simulated camera")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// How long to run before shutting down
    #[arg(long, default_value_t = 10)]
    seconds: u64,
    /// Seconds between still captures
    #[arg(long, default_value_t = 3)]
    picture_every: u64,
    /// Overrides `capture.output_dir`
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Pinch scale applied once at startup
    #[arg(long)]
    zoom: Option<f32>,
}

/// Cheap stand-in for a text recognizer: luma mean and horizontal edge
/// density, which is high on printed text.
#[derive(Default)]
struct LumaDetector {
    frames: u64,
    text_like: u64,
}

impl DetectorSink for LumaDetector {
    fn process(&mut self, frame: &Frame) -> Result<(), DetectorError> {
        let layout = frame.layout();
        let (width, height) = (layout.width as usize, layout.height as usize);
        if width < 2 {
            return Err("frame too narrow".into());
        }
        let luma = frame
            .data()
            .get(..width * height)
            .ok_or("frame shorter than its luma plane")?;

        let mean = luma.iter().map(|&px| px as u64).sum::<u64>() / luma.len().max(1) as u64;
        let edges = luma
            .chunks_exact(width)
            .flat_map(|row| row.windows(2))
            .filter(|pair| pair[0].abs_diff(pair[1]) > 64)
            .count();
        let density = edges as f64 / luma.len().max(1) as f64;

        self.frames += 1;
        if density > 0.05 {
            self.text_like += 1;
        }
        metrics::gauge!("textcam_edge_density").set(density);

        if self.frames % 30 == 0 {
            debug!(
                sequence = frame.sequence(),
                mean,
                density,
                rotation = %layout.rotation,
                "Frame analysed"
            );
        }
        Ok(())
    }

    fn release(self) {
        info!(frames = self.frames, text_like = self.text_like, "Detector released");
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("textcam=info"));

    #[cfg(feature = "profiling")]
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()))
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }

    #[cfg(not(feature = "profiling"))]
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(dir) = args.output_dir {
        config.capture.output_dir = dir;
    }
    info!(?config, "textcam launching");

    let camera = SimulatedCamera::new(SimulatedSettings {
        kind: config.camera.backend,
        needs_precapture: config.camera.flash_mode != FlashMode::Off,
        jpeg_quality: config.capture.jpeg_quality,
        ..SimulatedSettings::default()
    });

    let session = tokio::task::spawn_blocking({
        let config = config.clone();
        move || CameraSession::start(&config, camera, LumaDetector::default())
    })
    .await??;

    tokio::fs::create_dir_all(&config.capture.output_dir).await?;
    let events = session.events();
    let output_dir = config.capture.output_dir.clone();
    let writer = tokio::spawn(async move {
        while let Ok(event) = events.recv_async().await {
            match event {
                CaptureEvent::Shutter => debug!("Shutter"),
                CaptureEvent::Picture(still) => {
                    let path = output_dir.join(format!("still-{:04}.jpg", still.sequence));
                    match tokio::fs::write(&path, &still.jpeg).await {
                        Ok(()) => info!(
                            path = %path.display(),
                            orientation = %still.orientation,
                            "Saved still"
                        ),
                        Err(err) => error!(path = %path.display(), %err, "Failed to save still"),
                    }
                }
                CaptureEvent::FocusFinished { success } => info!(success, "Focus finished"),
                CaptureEvent::CaptureAborted { reason } => warn!(%reason, "Capture aborted"),
            }
        }
    });

    let characteristics = *session.characteristics();
    session.focus_at(FocusRegion::around(
        0.5,
        0.5,
        characteristics.preview_width,
        characteristics.preview_height,
    ));
    if let Some(scale) = args.zoom {
        session.zoom(scale);
    }

    let deadline = tokio::time::sleep(Duration::from_secs(args.seconds));
    tokio::pin!(deadline);
    let mut pictures = tokio::time::interval(Duration::from_secs(args.picture_every.max(1)));
    // The first tick completes immediately.
    pictures.tick().await;

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = pictures.tick() => {
                debug!(state = ?session.capture_state(), stats = ?session.stats(), "Taking picture");
                if !session.take_picture() {
                    warn!("Capture control is gone");
                    break;
                }
            }
        }
    }

    let stopped = tokio::task::spawn_blocking(move || session.stop()).await??;
    let (stats, _camera) = stopped.release();
    writer.await?;

    info!(?stats, "textcam shutting down");
    Ok(())
}
