use clap::Parser;
use std::time::{Duration, Instant};
use traffic_capture::{
    api::{DetectionMode, VideoRequest},
    client::{HttpBackend, InferenceBackend},
    logging::{init_logging, LogLevel},
    render::describe,
    session::DetectionResult,
};

/// Runs an uploaded video through the batch endpoint and prints a summary.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Origin of the detection service.
    #[clap(short, long, default_value = "http://127.0.0.1:5000")]
    origin: String,

    /// Video path relative to the service's static directory, e.g. uploads/road.mp4
    filepath: String,

    /// Detection mode.
    #[arg(long, value_enum, default_value_t = DetectionMode::Plate)]
    mode: DetectionMode,

    /// Request timeout in seconds, videos take a while.
    #[arg(long, default_value_t = 600)]
    timeout: u64,

    /// Sets the level of logging
    #[clap(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = init_logging(None, "process_video.log", args.log_level);

    let backend = HttpBackend::new(&args.origin, Duration::from_secs(args.timeout))?;

    let request_start_time = Instant::now();
    let summary = backend
        .process_video(VideoRequest {
            filepath: args.filepath.clone(),
            mode: args.mode,
        })
        .await?;
    let request_time = Instant::now().duration_since(request_start_time);

    println!(
        "Processed {} of {} frames of {} in {:?}, {} detections",
        summary.processed_frames,
        summary.total_frames,
        args.filepath,
        request_time,
        summary.detections_count
    );

    for frame in summary.results {
        let result = match args.mode {
            DetectionMode::Plate => DetectionResult::Plates {
                detections: frame.detections.unwrap_or_default(),
                rendered_frame: None,
            },
            DetectionMode::LaneIntrusion => DetectionResult::LaneIntrusion {
                intrusions: frame.intrusions.unwrap_or_default(),
                rendered_frame: None,
            },
        };
        if !result.is_positive() {
            continue;
        }
        let path = frame.frame_path.unwrap_or_default();
        for line in describe(&result) {
            println!("Frame {:>6} {}: {}", frame.frame, path, line);
        }
    }

    Ok(())
}
