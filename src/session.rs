use crate::{
    api::{DetectionMode, Intrusion, PlateDetection, RealtimeResponse},
    source::SourceSelector,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Snapshot of the running session handed back by `start_session`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: u64,
    pub selector: SourceSelector,
    pub interval: Duration,
    pub mode: DetectionMode,
}

/// One sampled frame on its way to the service.
#[derive(Debug, Clone)]
pub struct FrameSampleRequest {
    /// Monotonic per dispatcher, never reused across sessions.
    pub sequence_id: u64,
    pub session_id: u64,
    /// JPEG bytes.
    pub payload: Vec<u8>,
    /// Mode at dispatch time. The response is interpreted under this mode.
    pub mode: DetectionMode,
    pub show_boxes: bool,
    pub requested_at: DateTime<Utc>,
}

/// A service response reduced to the fields of the mode it was requested under.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "detection_type", rename_all = "snake_case")]
pub enum DetectionResult {
    #[serde(rename = "license_plate")]
    Plates {
        detections: Vec<PlateDetection>,
        /// Base64 JPEG with boxes drawn.
        rendered_frame: Option<String>,
    },
    LaneIntrusion {
        intrusions: Vec<Intrusion>,
        rendered_frame: Option<String>,
    },
}

impl DetectionResult {
    /// Fields belonging to the other mode are dropped even if the service sent them.
    pub fn from_response(mode: DetectionMode, response: RealtimeResponse) -> Self {
        match mode {
            DetectionMode::Plate => DetectionResult::Plates {
                detections: response.detections.unwrap_or_default(),
                rendered_frame: response.processed_image,
            },
            DetectionMode::LaneIntrusion => DetectionResult::LaneIntrusion {
                intrusions: response.intrusions.unwrap_or_default(),
                rendered_frame: response.processed_image,
            },
        }
    }

    pub fn mode(&self) -> DetectionMode {
        match self {
            DetectionResult::Plates { .. } => DetectionMode::Plate,
            DetectionResult::LaneIntrusion { .. } => DetectionMode::LaneIntrusion,
        }
    }

    /// A plate result counts only when some plate text was read.
    pub fn is_positive(&self) -> bool {
        match self {
            DetectionResult::Plates { detections, .. } => {
                detections.iter().any(|d| d.plate().is_some())
            }
            DetectionResult::LaneIntrusion { intrusions, .. } => !intrusions.is_empty(),
        }
    }

    pub fn rendered_frame(&self) -> Option<&str> {
        match self {
            DetectionResult::Plates { rendered_frame, .. }
            | DetectionResult::LaneIntrusion { rendered_frame, .. } => rendered_frame.as_deref(),
        }
    }
}

/// What the renderer receives for every accepted response.
#[derive(Debug, Clone)]
pub struct TaggedResult {
    pub sequence_id: u64,
    pub session_id: u64,
    pub requested_at: DateTime<Utc>,
    pub round_trip: Duration,
    pub result: DetectionResult,
}

impl TaggedResult {
    pub fn mode(&self) -> DetectionMode {
        self.result.mode()
    }
}

/// A capture the archive endpoint accepted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureArchiveEntry {
    pub capture_id: u64,
    pub image_ref: String,
    pub detection_id: String,
    pub captured_at: DateTime<Utc>,
    pub mode: DetectionMode,
}
