use clap::ValueEnum;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Which detector the service runs on a frame.
#[derive(Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Hash, ValueEnum, Debug)]
pub enum DetectionMode {
    #[serde(rename = "license_plate")]
    #[value(name = "license_plate")]
    Plate,
    #[serde(rename = "lane_intrusion")]
    #[value(name = "lane_intrusion")]
    LaneIntrusion,
}

impl DetectionMode {
    /// The `detection_type` form value understood by the service.
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMode::Plate => "license_plate",
            DetectionMode::LaneIntrusion => "lane_intrusion",
        }
    }
}

impl fmt::Display for DetectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PlateDetection {
    /// Recognised plate text, empty or missing when the OCR step found nothing.
    #[serde(default)]
    pub license_plate: Option<String>,
    #[serde(default)]
    pub confidence: f32,
    /// x1, y1, x2, y2 in frame pixels.
    #[serde(default)]
    pub bbox: Option<[i32; 4]>,
}

impl PlateDetection {
    pub fn plate(&self) -> Option<&str> {
        self.license_plate.as_deref().filter(|p| !p.is_empty())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Intrusion {
    pub vehicle_id: i64,
    pub from_lane: i32,
    pub to_lane: i32,
    #[serde(default)]
    pub vehicle_bbox: Option<[i32; 4]>,
    #[serde(default)]
    pub timestamp: Option<f64>,
}

/// Response body of `POST /process_realtime`.
#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct RealtimeResponse {
    /// Set when the service failed to process the frame.
    pub error: Option<String>,
    /// Base64 JPEG with boxes drawn, only when `show_boxes` was set.
    pub processed_image: Option<String>,
    pub detections: Option<Vec<PlateDetection>>,
    pub intrusions: Option<Vec<Intrusion>>,
}

/// Response body of `POST /save_capture`.
#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct SaveCaptureResponse {
    pub error: Option<String>,
    #[serde(default)]
    pub image_path: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub detection_id: String,
}

/// Response body of `POST /process_video`.
#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct VideoProcessResponse {
    pub error: Option<String>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub processed_frames: u64,
    #[serde(default)]
    pub total_frames: u64,
    #[serde(default)]
    pub detections_count: u64,
    #[serde(default)]
    pub results: Vec<VideoFrameResult>,
}

#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct VideoFrameResult {
    pub frame: u64,
    #[serde(default)]
    pub frame_path: Option<String>,
    // Percentage of the video processed when this frame was handled.
    #[serde(default)]
    pub progress: Option<u32>,
    pub detections: Option<Vec<PlateDetection>>,
    pub intrusions: Option<Vec<Intrusion>>,
}

/// Request for `POST /save_capture`.
#[derive(Debug, Clone)]
pub struct SaveCaptureRequest {
    /// JPEG bytes, sent as a data URL.
    pub image_data: Vec<u8>,
    pub mode: DetectionMode,
    pub capture_id: u64,
    /// JSON of the realtime response that triggered the save, if any.
    pub detection_data: Option<String>,
}

/// Request for `POST /process_video`.
#[derive(Debug, Clone)]
pub struct VideoRequest {
    /// Path relative to the service's static directory.
    pub filepath: String,
    pub mode: DetectionMode,
}

// The service hands out database ids as integers but older builds used strings.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}
