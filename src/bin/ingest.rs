//! ingest - run one ingestion request and print the response as JSON

use anyhow::{anyhow, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use scene_ingest::{
    factory_from_settings, CancelToken, ContinuousSource, IngestConfig, IngestService,
    PipelineError, SceneMetadata,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the scene database (overrides config and SCENE_INGEST_DB_PATH).
    #[arg(long)]
    db_path: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Detect objects in a single JPEG or PNG image.
    Image {
        path: String,
        #[arg(long)]
        content_type: Option<String>,
        #[command(flatten)]
        meta: MetaArgs,
    },
    /// Detect objects in every frame of a video file.
    Video {
        path: String,
        #[arg(long)]
        content_type: Option<String>,
        #[command(flatten)]
        meta: MetaArgs,
    },
    /// Capture from a local camera for a fixed number of seconds.
    Camera {
        /// Device path, index, or stub:// location (defaults to the configured device).
        #[arg(long)]
        device: Option<String>,
        #[arg(long)]
        duration: u64,
        #[command(flatten)]
        meta: MetaArgs,
    },
    /// Capture from an RTSP or HTTP MJPEG stream for a fixed number of seconds.
    Stream {
        url: String,
        #[arg(long)]
        duration: u64,
        #[command(flatten)]
        meta: MetaArgs,
    },
}

#[derive(ClapArgs, Debug, Default)]
struct MetaArgs {
    #[arg(long)]
    camera_id: Option<String>,
    #[arg(long, allow_hyphen_values = true)]
    latitude: Option<f64>,
    #[arg(long, allow_hyphen_values = true)]
    longitude: Option<f64>,
    /// Override the recorded resolution, e.g. 1920x1080.
    #[arg(long)]
    resolution: Option<String>,
}

impl From<MetaArgs> for SceneMetadata {
    fn from(args: MetaArgs) -> Self {
        SceneMetadata {
            camera_id: args.camera_id,
            latitude: args.latitude,
            longitude: args.longitude,
            resolution: args.resolution,
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = IngestConfig::load()?;
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    if let Command::Camera {
        device: Some(device),
        ..
    } = &args.command
    {
        config.capture.camera.device = device.clone();
    }

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        log::info!("interrupt received, finishing current frame");
        handler_token.cancel();
    })
    .map_err(|e| anyhow!("failed to set Ctrl-C handler: {}", e))?;

    let detectors = factory_from_settings(config.detector.clone());
    let service = IngestService::new(config, detectors).with_cancel(cancel);

    let output = match args.command {
        Command::Image {
            path,
            content_type,
            meta,
        } => service
            .ingest_image(&path, content_type.as_deref(), meta.into())
            .map(|r| serde_json::to_string_pretty(&r)),
        Command::Video {
            path,
            content_type,
            meta,
        } => service
            .ingest_video(&path, content_type.as_deref(), meta.into())
            .map(|r| serde_json::to_string_pretty(&r)),
        Command::Camera { duration, meta, .. } => service
            .ingest_continuous(ContinuousSource::Camera, duration, meta.into())
            .map(|r| serde_json::to_string_pretty(&r)),
        Command::Stream {
            url,
            duration,
            meta,
        } => service
            .ingest_continuous(ContinuousSource::Stream { url }, duration, meta.into())
            .map(|r| serde_json::to_string_pretty(&r)),
    };

    match output {
        Ok(json) => {
            println!("{}", json?);
            Ok(())
        }
        Err(err) => {
            report(&err);
            std::process::exit(if err.is_validation() { 2 } else { 1 });
        }
    }
}

fn report(err: &PipelineError) {
    eprintln!("error [{}] during {}: {}", err.kind(), err.phase, err.source);
    if let Some(scene_id) = err.scene_id {
        eprintln!(
            "scene {} was kept with {} detections",
            scene_id, err.persisted_detections
        );
    }
}
