use clap::Parser;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::{info, warn};
use traffic_capture::{
    api::DetectionMode,
    client::HttpBackend,
    frame::ensure_directory_exists,
    logging::{init_logging, LogLevel},
    render::LogRenderer,
    source::{DirectorySourceProvider, SourceSelector},
    Dispatcher, DispatcherConfig,
};

/// Streams frames from a source to the detection service and logs what comes back.
#[derive(Parser, Debug, Clone)]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Args {
    /// Origin of the detection service.
    #[arg(short, long, default_value = "http://127.0.0.1:5000")]
    pub origin: String,

    /// Directory of still images that stands in for the camera. Frames are sent in name order, looping.
    /// Example: --frames-dir "./frames"
    #[arg(long)]
    pub frames_dir: PathBuf,

    /// Sub directory of --frames-dir to use instead of the directory itself.
    #[arg(long)]
    pub source: Option<String>,

    /// Sampling interval in milliseconds.
    #[arg(long, default_value_t = 500)]
    pub interval: u64,

    /// Detection mode.
    #[arg(long, value_enum, default_value_t = DetectionMode::Plate)]
    pub mode: DetectionMode,

    /// Skip a frame while the previous one is still being processed.
    #[arg(long)]
    pub single_flight: bool,

    /// Archive every frame with a detection through the save endpoint.
    #[arg(long)]
    pub auto_save: bool,

    /// Don't ask the service to draw boxes on the returned frame.
    #[arg(long)]
    pub no_boxes: bool,

    /// Per request timeout in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    pub timeout: u64,

    /// Path to save annotated frames returned by the service.
    /// If not specified, frames are not saved. Example: --output-dir "/path/to/save/images"
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    pub duration: Option<u64>,

    /// Sets a custom file path for logging
    #[clap(short, long, value_parser)]
    log_path: Option<String>,

    /// Sets the level of logging
    #[clap(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _guard = init_logging(args.log_path.as_deref(), "traffic_capture.log", args.log_level);

    info!("Starting traffic capture against {}", args.origin);

    ensure_directory_exists(args.output_dir.as_deref()).await?;

    let timeout = Duration::from_millis(args.timeout);
    let backend = Arc::new(HttpBackend::new(&args.origin, timeout)?);
    let provider = Arc::new(DirectorySourceProvider::new(args.frames_dir.clone()));
    let config = DispatcherConfig {
        single_flight: args.single_flight,
        request_timeout: timeout,
        auto_save: args.auto_save,
        show_boxes: !args.no_boxes,
        default_interval: Duration::from_millis(args.interval),
        ..Default::default()
    };
    let (dispatcher, task) = Dispatcher::spawn(
        config,
        backend,
        provider,
        Box::new(LogRenderer::new(args.output_dir.clone())),
    );

    let selector = match args.source {
        Some(name) => SourceSelector::Named(name),
        None => SourceSelector::Default,
    };
    dispatcher
        .start_session(selector, None, args.mode)
        .await?;

    match args.duration {
        Some(seconds) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
                _ = tokio::signal::ctrl_c() => info!("Ctrl-C received"),
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("Ctrl-C received");
        }
    }

    dispatcher.stop_session().await?;
    let stats = dispatcher.stats().await?;
    let gallery = dispatcher.gallery().await?;
    dispatcher.shutdown();
    if let Err(e) = task.await {
        warn!("Dispatcher task ended abnormally: {:?}", e);
    }

    println!("{:#?}", stats);
    if gallery.is_empty() {
        println!("No captures saved");
    } else {
        println!("Recent captures:");
        for entry in gallery {
            println!(
                "  #{} {} {} (detection {})",
                entry.capture_id,
                entry.captured_at.to_rfc3339(),
                entry.image_ref,
                entry.detection_id
            );
        }
    }

    Ok(())
}
